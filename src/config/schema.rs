//! Configuration schema: the nested tree the runner consumes (SPEC_FULL.md §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

fn default_repeat() -> u32 {
    1
}

fn default_resultsdir() -> String {
    "results".to_string()
}

fn default_reportname() -> String {
    "default".to_string()
}

/// `flags.*` — runtime flags that gate debugger entry, prerequisite
/// skipping, verbosity, and artifact retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// 0..3. At debug >= 2 the suite stops skipping unmet-prerequisite tests;
    /// at debug >= 3 the suite stops auto-inserting prerequisites at all.
    pub debug: u8,
    /// 0..N, gates info-level signal verbosity in the default reporter.
    pub verbose: u8,
    /// If false (the default), stderr is redirected into the logdir.
    pub stderr: bool,
    /// Preserve temporary artifacts instead of cleaning them up.
    pub keep: bool,
    /// Number of times `runall` repeats its object list.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            debug: 0,
            verbose: 0,
            stderr: false,
            keep: false,
            repeat: 1,
        }
    }
}

/// `database.*` — connection info for the external inventory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flags: Flags,
    /// Name of the testbed to claim from the inventory; must exist there.
    pub testbed: Option<String>,
    /// Comma-separated list from {default, null, database, jupyter, a
    /// fully-qualified report type name}; stacked if more than one.
    #[serde(default = "default_reportname")]
    pub reportname: String,
    /// Parent directory for the per-run logdir.
    #[serde(default = "default_resultsdir")]
    pub resultsdir: String,
    /// Emitted verbatim as `report-comment` if present.
    pub comment: Option<String>,
    pub database: DatabaseConfig,
    /// Per-test options, keyed by implementation path, passed through to
    /// the matching test case's `OptionsOverlay`.
    #[serde(flatten)]
    pub test_options: HashMap<String, Json>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flags: Flags::default(),
            testbed: None,
            reportname: default_reportname(),
            resultsdir: default_resultsdir(),
            comment: None,
            database: DatabaseConfig::default(),
            test_options: HashMap::new(),
        }
    }
}

impl Config {
    /// Strict dotted-path lookup over the resolved configuration tree,
    /// resolved against `self` re-serialized as JSON. Per the Open Question
    /// resolution in SPEC_FULL.md §9, an unknown path is an error rather
    /// than silently yielding an empty table.
    pub fn get_path(&self, path: &str) -> Result<Json, crate::error::ConfigError> {
        let root = serde_json::to_value(self)
            .map_err(|e| crate::error::ConfigError::Other(e.to_string()))?;
        let mut cur = &root;
        for segment in path.split('.') {
            match cur.get(segment) {
                Some(v) => cur = v,
                None => return Err(crate::error::ConfigError::NotFound(path.to_string())),
            }
        }
        Ok(cur.clone())
    }

    /// The list of report type names from `reportname`, in connection order.
    pub fn report_names(&self) -> Vec<String> {
        self.reportname
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.flags.debug, 0);
        assert_eq!(cfg.flags.repeat, 1);
        assert_eq!(cfg.reportname, "default");
    }

    #[test]
    fn get_path_resolves_nested_key() {
        let cfg = Config::default();
        let v = cfg.get_path("flags.repeat").unwrap();
        assert_eq!(v, serde_json::json!(1));
    }

    #[test]
    fn get_path_unknown_key_is_error() {
        let cfg = Config::default();
        let err = cfg.get_path("flags.nonexistent").unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::NotFound(_)));
    }

    #[test]
    fn report_names_splits_and_trims() {
        let mut cfg = Config::default();
        cfg.reportname = "default, database , null".to_string();
        assert_eq!(cfg.report_names(), vec!["default", "database", "null"]);
    }
}
