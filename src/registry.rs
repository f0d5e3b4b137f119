//! Compile-time test registry: the Rust replacement for the source's
//! namespace-package walker (SPEC_FULL.md §4.8, §9).
//!
//! Test authors call `register_testcase!`, `register_suite!`, or
//! `register_scenario!` at module scope. Each expands to an `inventory::submit!`
//! that runs before `main`, so the scanner never has to import or reflect
//! over arbitrary modules — it just iterates what's already collected.

use crate::disposition::Disposition;
use crate::runner::RunContext;
use crate::suite::TestSuite;
use crate::testcase::{DynTestCase, TestOptions};

/// A registered test case: its options (for prerequisite matching) plus a
/// factory that constructs a fresh boxed instance.
pub struct TestCaseRegistration {
    pub implementation: &'static str,
    pub options: fn() -> TestOptions,
    pub construct: fn() -> Box<dyn DynTestCase>,
}

inventory::collect!(TestCaseRegistration);

/// A registered scenario: a factory producing a fully-populated `TestSuite`
/// for a given run context.
pub struct ScenarioRegistration {
    pub implementation: &'static str,
    pub get_suite: fn(&RunContext) -> TestSuite,
}

inventory::collect!(ScenarioRegistration);

/// A registered module-style runnable: a bare function with the signature
/// the source's "module exposing a `run` callable" maps onto.
pub struct ModuleRegistration {
    pub implementation: &'static str,
    pub run: fn(&RunContext) -> Disposition,
}

inventory::collect!(ModuleRegistration);

/// A registered equipment-controller factory, keyed by the role (or
/// initializer/console identifier) it constructs a controller for.
pub struct ControllerRegistration {
    pub role: &'static str,
    pub factory: fn(
        &crate::testbed::EquipmentRuntime,
    ) -> Result<Box<dyn crate::testbed::Controller>, crate::error::ControllerError>,
}

inventory::collect!(ControllerRegistration);

/// Register a `TestCase` type (must also implement `Default`) under the
/// registry, keyed by its declared `TestOptions::implementation`.
#[macro_export]
macro_rules! register_testcase {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::registry::TestCaseRegistration {
                implementation: <$ty as $crate::testcase::TestCase>::options().implementation,
                options: <$ty as $crate::testcase::TestCase>::options,
                construct: || ::std::boxed::Box::new(<$ty as ::std::default::Default>::default())
                    as ::std::boxed::Box<dyn $crate::testcase::DynTestCase>,
            }
        }
    };
}

/// Register a scenario factory function under a given implementation path.
#[macro_export]
macro_rules! register_scenario {
    ($path:expr, $get_suite:expr) => {
        $crate::inventory::submit! {
            $crate::registry::ScenarioRegistration {
                implementation: $path,
                get_suite: $get_suite,
            }
        }
    };
}

/// Register a module-style runnable under a given implementation path.
#[macro_export]
macro_rules! register_module {
    ($path:expr, $run:expr) => {
        $crate::inventory::submit! {
            $crate::registry::ModuleRegistration {
                implementation: $path,
                run: $run,
            }
        }
    };
}

/// Register an equipment-controller factory under a role name.
#[macro_export]
macro_rules! register_controller {
    ($role:expr, $factory:expr) => {
        $crate::inventory::submit! {
            $crate::registry::ControllerRegistration {
                role: $role,
                factory: $factory,
            }
        }
    };
}

/// Resolves a role (or initializer/console identifier) to its registered
/// controller factory.
pub fn lookup_controller(role: &str) -> Option<&'static ControllerRegistration> {
    inventory::iter::<ControllerRegistration>().find(|r| r.role == role)
}

/// Whether `path`'s implementation looks like it lives under an
/// underscore-prefixed segment (the source's `._`-prefixed-submodule skip
/// rule, preserved here as a leading-underscore path-segment check).
fn is_hidden_path(path: &str) -> bool {
    path.split("::").any(|seg| seg.starts_with('_'))
}

/// Enumerates registered test cases whose implementation path starts with
/// `prefix` (the default scan root is the empty prefix: everything).
pub fn scan_testcases(prefix: &str) -> Vec<&'static TestCaseRegistration> {
    inventory::iter::<TestCaseRegistration>()
        .filter(|r| r.implementation.starts_with(prefix) && !is_hidden_path(r.implementation))
        .collect()
}

pub fn scan_scenarios(prefix: &str) -> Vec<&'static ScenarioRegistration> {
    inventory::iter::<ScenarioRegistration>()
        .filter(|r| r.implementation.starts_with(prefix) && !is_hidden_path(r.implementation))
        .collect()
}

pub fn scan_modules(prefix: &str) -> Vec<&'static ModuleRegistration> {
    inventory::iter::<ModuleRegistration>()
        .filter(|r| r.implementation.starts_with(prefix) && !is_hidden_path(r.implementation))
        .collect()
}

/// Resolves a single implementation path to its test-case registration, the
/// lookup `TestSuite::add_test`'s prerequisite insertion needs.
pub fn lookup_testcase(implementation: &str) -> Option<&'static TestCaseRegistration> {
    inventory::iter::<TestCaseRegistration>().find(|r| r.implementation == implementation)
}

/// Resolves an implementation path that may omit its package prefix against
/// the module of the declaring test, mirroring the source's behavior of
/// assuming a bare class name refers to a sibling class in the same module.
pub fn resolve_prerequisite_path(declaring_module: &str, prereq_path: &str) -> String {
    if prereq_path.contains("::") {
        prereq_path.to_string()
    } else {
        format!("{declaring_module}::{prereq_path}")
    }
}

/// Errors encountered while scanning, routed to an `onerror` callback or
/// logged; scanning always continues over the rest of the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to resolve runnable {path}: {message}")]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

/// Resolves a list of (implementation-path, per-invocation options) pairs
/// into registered test-case entries, calling `onerror` for any path that
/// can't be found rather than aborting the whole selection.
pub fn resolve_selection<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    mut onerror: impl FnMut(ScanError),
) -> Vec<&'static TestCaseRegistration> {
    let mut out = Vec::new();
    for path in paths {
        match lookup_testcase(path) {
            Some(reg) => out.push(reg),
            None => onerror(ScanError {
                path: path.to_string(),
                message: "not found in registry".to_string(),
            }),
        }
    }
    out
}
