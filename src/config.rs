//! Configuration loading.
//!
//! Loads the nested TOML configuration tree described in SPEC_FULL.md §6
//! from a file or string, then expands `${VAR}` / `${VAR:-default}`
//! references in the `comment` field and any per-test string option.

pub mod schema;

pub use schema::*;

use anyhow::{Context, Result};
use serde_json::Value as Json;
use std::path::Path;

/// Loads configuration from a TOML file.
///
/// # Errors
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// fails to match the [`Config`] schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string. Useful for tests and for
/// programmatically generated configuration.
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    if let Some(comment) = &config.comment {
        config.comment = Some(
            expand_env_value(comment).map_err(|e| anyhow::anyhow!("comment: {e}"))?,
        );
    }
    for (key, value) in config.test_options.iter_mut() {
        expand_env_json(value)
            .map_err(|e| anyhow::anyhow!("Failed to expand env var in option '{key}': {e}"))?;
    }

    Ok(config)
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next(); // consume '{'

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => {
                    result.push('$');
                }
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

/// Recursively expands string leaves of a JSON value in place.
fn expand_env_json(value: &mut Json) -> Result<(), String> {
    match value {
        Json::String(s) => {
            *s = expand_env_value(s)?;
        }
        Json::Array(items) => {
            for item in items {
                expand_env_json(item)?;
            }
        }
        Json::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_json(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_value_no_variables() -> Result<(), String> {
        let result = expand_env_value("hello world")?;
        assert_eq!(result, "hello world");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_escaped_dollar() -> Result<(), String> {
        let result = expand_env_value("price is $$100")?;
        assert_eq!(result, "price is $100");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_empty_var_name() {
        let result = expand_env_value("${}");
        assert!(matches!(&result, Err(e) if e.contains("Empty variable name")));
    }

    #[test]
    fn test_expand_env_value_unclosed_brace() {
        let result = expand_env_value("${VAR");
        assert!(matches!(&result, Err(e) if e.contains("Unclosed variable reference")));
    }

    #[test]
    fn test_expand_env_value_var_set() -> Result<(), String> {
        let result = expand_env_value("${HOME}")?;
        assert!(!result.is_empty());
        Ok(())
    }

    #[test]
    fn test_expand_env_value_var_unset() {
        let result = expand_env_value("${_DEVTEST_RS_TEST_NONEXISTENT_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_value_default_used_when_unset() -> Result<(), String> {
        let result = expand_env_value("${_DEVTEST_RS_TEST_MISSING:-fallback}")?;
        assert_eq!(result, "fallback");
        Ok(())
    }

    #[test]
    fn load_config_str_parses_flags_and_comment() {
        let cfg = load_config_str(
            r#"
            comment = "hello $${HOME} not expanded as var but literal dollar-brace"

            [flags]
            debug = 2
            repeat = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.flags.debug, 2);
        assert_eq!(cfg.flags.repeat, 3);
    }

    #[test]
    fn load_config_str_rejects_bad_toml() {
        assert!(load_config_str("not = [valid").is_err());
    }
}
