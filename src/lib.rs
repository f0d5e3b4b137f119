//! # devtest
//!
//! A hardware-in-the-loop test orchestration framework: discovers registered
//! test cases, scenarios, and module-style runnables at compile time, runs
//! them against a claimed testbed of real or virtual equipment, and reports
//! results through pluggable sinks.
//!
//! ## Architecture
//!
//! - [`signals`] — the synchronous publish/subscribe bus every other
//!   subsystem talks through.
//! - [`disposition`] — the terminal-outcome taxonomy and its aggregation rule.
//! - [`testcase`] — the test case contract, its disposition-emission and
//!   assertion API, and the run algorithm.
//! - [`suite`] — ordered containers of tests that resolve prerequisites and
//!   aggregate child dispositions.
//! - [`registry`] — the compile-time `inventory`-backed registry that
//!   replaces dynamic test discovery.
//! - [`testbed`] — the equipment runtime: lazy controller construction per
//!   role, claimed for the duration of a run.
//! - [`service`] — named background providers (serial log capture, power
//!   sampling, ...) requested over the bus rather than wired up directly.
//! - [`coprocess`] — the worker-process protocol backing services that need
//!   isolated, interruptible long-running I/O.
//! - [`report`] — signal sinks that render or persist a run's events.
//! - [`runner`] — the top-level driver: acquires a testbed, starts reports
//!   and services, runs a list of runnables, aggregates, and tears down.
//! - [`config`] — the TOML configuration schema and loader.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use devtest::config::load_config;
//! use devtest::report::resolve_reports;
//! use devtest::runner::{InMemoryTestbedStore, TestRunner, resolve_runnables};
//! use devtest::signals::Bus;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(load_config(std::path::Path::new("devtest.toml"))?);
//!     let bus = Arc::new(Bus::new());
//!     let report = resolve_reports(&config.report_names())?;
//!     let store = Arc::new(InMemoryTestbedStore::default());
//!     let mut runner = TestRunner::new(config, bus, store, report);
//!
//!     let objects = resolve_runnables(&["some::test::Case".to_string()], |e| {
//!         eprintln!("{e}");
//!     });
//!     let disposition = runner.runall(objects).await;
//!     std::process::exit(disposition.exit_code());
//! }
//! ```

pub mod config;
pub mod coprocess;
pub mod disposition;
pub mod error;
pub mod registry;
pub mod report;
pub mod runner;
pub mod service;
pub mod signals;
pub mod suite;
pub mod testbed;
pub mod testcase;

// Re-exported so `register_testcase!`/`register_scenario!`/`register_module!`/
// `register_controller!` can expand to `$crate::inventory::submit!` from a
// downstream crate without it declaring its own `inventory` dependency.
pub use inventory;

pub use config::{load_config, Config};
pub use disposition::{Disposition, TestOutcome};
pub use registry::{ControllerRegistration, ModuleRegistration, ScenarioRegistration, TestCaseRegistration};
pub use report::{resolve_reports, Report, StackedReport};
pub use runner::{InMemoryTestbedStore, RunContext, Runnable, TestRunner, TestbedStore};
pub use signals::{Bus, Payload, Receiver, SenderId};
pub use suite::{SuiteOutcome, TestSuite};
pub use testbed::{EquipmentRuntime, TestbedRuntime};
pub use testcase::{DynTestCase, TestCase, TestContext, TestOptions};
