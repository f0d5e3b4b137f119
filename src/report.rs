//! Report sinks: consumers of the signal bus that render or persist the
//! run's events (SPEC_FULL.md §6 "Reports").
//!
//! Every report is a [`Receiver`] connected to the bus with a strong
//! reference for the lifetime of a run, plus `initialize`/`finalize`
//! lifecycle hooks the runner calls explicitly.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::Config;
use crate::disposition::Disposition;
use crate::error::ReportFindError;
use crate::signals::{signal, Bus, Payload, Receiver, ReceiverReturn, SenderFilter};

/// Implemented by every report sink. `initialize`/`finalize` bracket a run;
/// `receive` (from the [`Receiver`] supertrait) is how events actually arrive.
pub trait Report: Receiver {
    fn initialize(&self, config: &Config, logdir: &Path);
    fn finalize(&self);

    /// Connects this report to every signal in the catalog with a strong
    /// reference: a report that cares about only a handful of signals
    /// simply no-ops the rest in its `receive` body.
    fn attach(self: Arc<Self>, bus: &Bus)
    where
        Self: Sized + 'static,
    {
        for name in ALL_SIGNALS {
            bus.connect_strong(name, self.clone(), SenderFilter::Any);
        }
    }
}

const ALL_SIGNALS: &[&str] = &[
    signal::TEST_START,
    signal::TEST_VERSION,
    signal::TEST_ARGUMENTS,
    signal::TEST_PASSED,
    signal::TEST_FAILURE,
    signal::TEST_EXPECTED_FAILURE,
    signal::TEST_INCOMPLETE,
    signal::TEST_ABORT,
    signal::TEST_INFO,
    signal::TEST_WARNING,
    signal::TEST_DIAGNOSTIC,
    signal::TEST_DATA,
    signal::TEST_END,
    signal::SUITE_START,
    signal::SUITE_END,
    signal::SUITE_SUMMARY,
    signal::SUITE_INFO,
    signal::RUN_START,
    signal::RUN_END,
    signal::RUN_ERROR,
    signal::REPORT_TESTBED,
    signal::REPORT_COMMENT,
    signal::REPORT_FINAL,
    signal::LOGDIR_LOCATION,
    signal::TARGET_BUILD,
    signal::TARGET_MODEL,
];

/// Looks up a report by name from the built-in catalog (`null`, `default`,
/// `database`, `jupyter`), or errors with [`ReportFindError`] — there is no
/// dynamic/fully-qualified path lookup in this crate, only the fixed set.
pub fn lookup(name: &str) -> Result<Arc<dyn Report>, ReportFindError> {
    match name {
        "null" => Ok(Arc::new(NullReport)),
        "default" => Ok(Arc::new(DefaultReport::new())),
        "database" => Ok(Arc::new(DatabaseReport::new())),
        "jupyter" => Ok(Arc::new(JupyterReport::new())),
        other => Err(ReportFindError(other.to_string())),
    }
}

/// Connects a run's selected, possibly comma-separated, report names into
/// one [`StackedReport`] that forwards every signal to each.
pub fn resolve_reports(names: &[String]) -> Result<Arc<StackedReport>, ReportFindError> {
    let mut stacked = StackedReport::new();
    for name in names {
        stacked = stacked.with_report(lookup(name)?);
    }
    Ok(Arc::new(stacked))
}

/// A report that discards every signal. Used as the default for tests and
/// when a config explicitly asks for `null`.
pub struct NullReport;

impl Receiver for NullReport {
    fn receive(&self, _sender: crate::signals::SenderId, _payload: &Payload) -> ReceiverReturn {
        ReceiverReturn::None
    }

    fn receiver_name(&self) -> &str {
        "null-report"
    }
}

impl Report for NullReport {
    fn initialize(&self, _config: &Config, _logdir: &Path) {}
    fn finalize(&self) {}
}

/// Forwards every signal to each of its sub-reports, in the order they were
/// added, and initializes/finalizes each independently.
pub struct StackedReport {
    reports: Vec<Arc<dyn Report>>,
}

impl StackedReport {
    pub fn new() -> Self {
        StackedReport { reports: Vec::new() }
    }

    pub fn with_report(mut self, report: Arc<dyn Report>) -> Self {
        self.reports.push(report);
        self
    }
}

impl Default for StackedReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver for StackedReport {
    fn receive(&self, sender: crate::signals::SenderId, payload: &Payload) -> ReceiverReturn {
        let mut last = ReceiverReturn::None;
        for report in &self.reports {
            last = report.receive(sender, payload);
        }
        last
    }

    fn receiver_name(&self) -> &str {
        "stacked-report"
    }
}

impl Report for StackedReport {
    fn initialize(&self, config: &Config, logdir: &Path) {
        for report in &self.reports {
            report.initialize(config, logdir);
        }
    }

    fn finalize(&self) {
        for report in &self.reports {
            report.finalize();
        }
    }
}

/// Writes colorized, human-readable events to stdout, using `indicatif` for
/// a live progress bar and `console` for colored status text.
pub struct DefaultReport {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    tests_seen: AtomicU32,
    failures: Mutex<Vec<String>>,
}

impl DefaultReport {
    pub fn new() -> Self {
        DefaultReport {
            progress: Mutex::new(None),
            tests_seen: AtomicU32::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn style(disposition: Disposition) -> console::StyledObject<&'static str> {
        match disposition {
            Disposition::Passed => console::style("PASS").green(),
            Disposition::Failed => console::style("FAIL").red(),
            Disposition::ExpectedFail => console::style("XFAIL").yellow(),
            Disposition::Incomplete => console::style("INCOMPLETE").yellow(),
            Disposition::Aborted => console::style("ABORT").red().bold(),
            Disposition::NotApplicable => console::style("N/A").dim(),
        }
    }
}

impl Default for DefaultReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver for DefaultReport {
    fn receive(&self, _sender: crate::signals::SenderId, payload: &Payload) -> ReceiverReturn {
        match payload {
            Payload::RunStart { .. } => {
                println!("{}", console::style("devtest run starting").bold());
            }
            Payload::ReportTestbed { testbed } => {
                println!("testbed: {testbed}");
            }
            Payload::ReportComment { message } => {
                println!("comment: {message}");
            }
            Payload::LogdirLocation { path } => {
                println!("logdir: {path}");
            }
            Payload::TestStart { .. } => {
                self.tests_seen.fetch_add(1, Ordering::Relaxed);
                if let Some(pb) = self.progress.lock().unwrap().as_ref() {
                    pb.inc(1);
                }
            }
            Payload::TestFailure { message } => {
                self.failures.lock().unwrap().push(message.clone());
            }
            Payload::SuiteSummary { disposition } => {
                println!("{} suite complete", Self::style(*disposition));
            }
            Payload::RunEnd { .. } => {
                if let Some(pb) = self.progress.lock().unwrap().take() {
                    pb.finish_and_clear();
                }
                let failures = self.failures.lock().unwrap();
                println!();
                println!(
                    "{} tests observed, {} failure(s)",
                    self.tests_seen.load(Ordering::Relaxed),
                    failures.len()
                );
                for msg in failures.iter() {
                    println!("  - {}", console::style(msg).dim());
                }
            }
            _ => {}
        }
        ReceiverReturn::None
    }

    fn receiver_name(&self) -> &str {
        "default-report"
    }
}

impl Report for DefaultReport {
    fn initialize(&self, _config: &Config, _logdir: &Path) {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_style(
            indicatif::ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} tests run")
                .unwrap(),
        );
        *self.progress.lock().unwrap() = Some(pb);
    }

    fn finalize(&self) {
        if let Some(pb) = self.progress.lock().unwrap().take() {
            pb.finish_and_clear();
        }
    }
}

/// A single result row the database report would persist: one per runner,
/// suite, or test case, linked by an optional parent pointer.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRow {
    pub name: String,
    pub parent: Option<u64>,
    pub disposition: Option<Disposition>,
    pub diagnostics: String,
    pub data: Vec<serde_json::Value>,
    pub version: Option<String>,
    pub arguments: String,
}

/// External-interface stub for the persistent inventory store's result
/// tree. This crate defines the shape and an in-memory fake; a real
/// SQL-backed implementation is out of scope.
pub struct DatabaseReport {
    rows: Mutex<Vec<ResultRow>>,
    next_id: AtomicU32,
}

impl DatabaseReport {
    pub fn new() -> Self {
        DatabaseReport {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn rows(&self) -> Vec<ResultRow> {
        self.rows.lock().unwrap().clone()
    }

    fn push(&self, name: &str, disposition: Option<Disposition>) {
        self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rows.lock().unwrap().push(ResultRow {
            name: name.to_string(),
            parent: None,
            disposition,
            diagnostics: String::new(),
            data: Vec::new(),
            version: None,
            arguments: String::new(),
        });
    }
}

impl Default for DatabaseReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver for DatabaseReport {
    fn receive(&self, _sender: crate::signals::SenderId, payload: &Payload) -> ReceiverReturn {
        match payload {
            Payload::TestStart { .. } => self.push("test", None),
            Payload::SuiteSummary { disposition } => self.push("suite", Some(*disposition)),
            _ => {}
        }
        ReceiverReturn::None
    }

    fn receiver_name(&self) -> &str {
        "database-report"
    }
}

impl Report for DatabaseReport {
    fn initialize(&self, _config: &Config, _logdir: &Path) {}
    fn finalize(&self) {}
}

/// External-interface stub for the notebook-frontend's HTML rendering.
/// Collects rendered fragments in memory; a real notebook integration is
/// out of scope.
pub struct JupyterReport {
    fragments: Mutex<Vec<String>>,
}

impl JupyterReport {
    pub fn new() -> Self {
        JupyterReport {
            fragments: Mutex::new(Vec::new()),
        }
    }

    pub fn fragments(&self) -> Vec<String> {
        self.fragments.lock().unwrap().clone()
    }
}

impl Default for JupyterReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver for JupyterReport {
    fn receive(&self, _sender: crate::signals::SenderId, payload: &Payload) -> ReceiverReturn {
        if let Payload::SuiteSummary { disposition } = payload {
            self.fragments
                .lock()
                .unwrap()
                .push(format!("<div class=\"suite-summary\">{disposition}</div>"));
        }
        ReceiverReturn::None
    }

    fn receiver_name(&self) -> &str {
        "jupyter-report"
    }
}

impl Report for JupyterReport {
    fn initialize(&self, _config: &Config, _logdir: &Path) {}
    fn finalize(&self) {}
}

/// The names of reports this crate ships with, for `list-reports`.
pub fn available_report_names() -> &'static [&'static str] {
    &["null", "default", "database", "jupyter"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SenderId;

    #[test]
    fn lookup_unknown_report_errors() {
        assert!(lookup("nonexistent").is_err());
    }

    #[test]
    fn lookup_known_reports_succeed() {
        for name in available_report_names() {
            assert!(lookup(name).is_ok());
        }
    }

    #[test]
    fn stacked_report_forwards_to_every_child() {
        let db = Arc::new(DatabaseReport::new());
        let stacked = StackedReport::new().with_report(db.clone());
        stacked.receive(
            SenderId::new(),
            &Payload::SuiteSummary {
                disposition: Disposition::Passed,
            },
        );
        assert_eq!(db.rows().len(), 1);
    }

    #[test]
    fn database_report_records_test_and_suite_rows() {
        let db = DatabaseReport::new();
        db.receive(SenderId::new(), &Payload::TestStart { time: chrono::Utc::now() });
        db.receive(
            SenderId::new(),
            &Payload::SuiteSummary {
                disposition: Disposition::Failed,
            },
        );
        assert_eq!(db.rows().len(), 2);
    }
}
