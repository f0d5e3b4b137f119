//! Top-level test runner: acquires a testbed, starts reports and services,
//! drives a list of runnable objects, aggregates their dispositions, and
//! tears everything down on every exit path (SPEC_FULL.md §4.4).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::disposition::Disposition;
use crate::error::{AbortError, RunError};
use crate::registry::{self, ModuleRegistration, ScenarioRegistration, TestCaseRegistration};
use crate::report::{Report, StackedReport};
use crate::service::ServiceManager;
use crate::signals::{Bus, Payload, SenderId};
use crate::suite::{SuiteOutcome, TestSuite};
use crate::testbed::TestbedRuntime;

/// Anything the runner accepts in its object list: a bare registered test
/// case, a scenario factory, a fully-built suite, or a module-style
/// `run(context)` function. Registrations are `'static` so they can be run
/// again on every `repeat` iteration; a bare [`TestSuite`] can only be run
/// once, since its entries record a disposition the first time through.
pub enum Runnable {
    TestCase(&'static TestCaseRegistration),
    Scenario(&'static ScenarioRegistration),
    Module(&'static ModuleRegistration),
    Suite(TestSuite),
}

/// The shared handle passed to scenario factories and module-style
/// runnables: everything they need to build a suite or run standalone.
pub struct RunContext {
    pub config: Arc<Config>,
    pub bus: Arc<Bus>,
    pub testbed: Arc<TestbedRuntime>,
    pub logdir: PathBuf,
}

impl RunContext {
    pub fn new_suite(&self, name: impl Into<String>) -> TestSuite {
        TestSuite::new(
            self.config.clone(),
            self.bus.clone(),
            self.logdir.clone(),
            0,
            name,
            None,
        )
    }
}

/// Stub for the persistent equipment inventory this crate treats as an
/// external collaborator. A real deployment backs this with a SQL-backed
/// store; this crate ships only the trait and an in-memory fake so the
/// runner and tests have something to drive against.
pub trait TestbedStore: Send + Sync {
    fn load(&self, name: &str, bus: Arc<Bus>) -> Result<TestbedRuntime, crate::error::ConfigError>;
    fn list_names(&self) -> Vec<String>;
}

/// An in-memory stand-in for the inventory store: returns an empty testbed
/// (no roles, no attributes) for any name it's been told about, and a
/// [`crate::error::ConfigError::NotFound`] otherwise.
pub struct InMemoryTestbedStore {
    names: Vec<String>,
}

impl InMemoryTestbedStore {
    pub fn new(names: Vec<String>) -> Self {
        InMemoryTestbedStore { names }
    }
}

impl Default for InMemoryTestbedStore {
    fn default() -> Self {
        InMemoryTestbedStore::new(vec!["default".to_string()])
    }
}

impl TestbedStore for InMemoryTestbedStore {
    fn load(&self, name: &str, bus: Arc<Bus>) -> Result<TestbedRuntime, crate::error::ConfigError> {
        if !self.names.iter().any(|n| n == name) {
            return Err(crate::error::ConfigError::NotFound(format!(
                "bad testbed name {name:?}"
            )));
        }
        Ok(TestbedRuntime::new(
            name,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            None,
            bus,
            0,
        ))
    }

    fn list_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// Runs objects against a testbed: initializes reports/services/logdir,
/// drives each runnable, aggregates dispositions, finalizes on every exit
/// path.
pub struct TestRunner {
    config: Arc<Config>,
    bus: Arc<Bus>,
    store: Arc<dyn TestbedStore>,
    report: Arc<StackedReport>,
    services: Arc<ServiceManager>,
    sender: SenderId,
    testbed: Option<Arc<TestbedRuntime>>,
    logdir: Option<PathBuf>,
    stderr_redirect: Option<StderrRedirect>,
    /// Set by the SIGTERM/SIGHUP listener spawned in `initialize`; checked
    /// between runnables in `run_objects` so either signal unwinds the run
    /// as a graceful abort rather than killing the process mid-suite.
    cancel: tokio_util::sync::CancellationToken,
    signal_task: Option<tokio::task::JoinHandle<()>>,
}

impl TestRunner {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<Bus>,
        store: Arc<dyn TestbedStore>,
        report: Arc<StackedReport>,
    ) -> Self {
        TestRunner {
            config,
            bus,
            store,
            report,
            services: ServiceManager::new(),
            sender: SenderId::new(),
            testbed: None,
            logdir: None,
            stderr_redirect: None,
            cancel: tokio_util::sync::CancellationToken::new(),
            signal_task: None,
        }
    }

    fn emit(&self, payload: Payload) {
        self.bus.send(self.sender, payload);
    }

    /// Lazily acquires the configured testbed, claiming it and emitting
    /// `report-testbed`. Released by `finalize`.
    fn acquire_testbed(&mut self) -> Result<Arc<TestbedRuntime>, RunError> {
        if let Some(tb) = &self.testbed {
            return Ok(tb.clone());
        }
        let name = self
            .config
            .testbed
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let tb = self.store.load(&name, self.bus.clone()).map_err(RunError::Config)?;
        tb.claim()?;
        self.emit(Payload::ReportTestbed { testbed: name });
        let tb = Arc::new(tb);
        self.testbed = Some(tb.clone());
        Ok(tb)
    }

    fn release_testbed(&mut self) {
        if let Some(tb) = self.testbed.take() {
            tb.finalize();
            tb.release();
        }
    }

    /// Main entry point: runs `objects` `config.flags.repeat` times,
    /// aggregating every iteration's result.
    pub async fn runall(&mut self, mut objects: Vec<Runnable>) -> Disposition {
        if let Err(e) = self.initialize() {
            tracing::error!(error = %e, "TestRunner.initialize failed");
            return Disposition::Incomplete;
        }

        let repeat = self.config.flags.repeat.max(1);
        let mut results = Vec::with_capacity(repeat as usize);
        let mut aborted = false;

        for _ in 0..repeat {
            match self.run_objects(&mut objects) {
                Ok(d) => results.push(d),
                Err(err) => {
                    tracing::error!(error = %err, "TestRunner.runall");
                    self.emit(Payload::RunError {
                        message: err.to_string(),
                    });
                    aborted = true;
                    break;
                }
            }
        }

        self.finalize();

        if aborted {
            Disposition::Aborted
        } else {
            Disposition::aggregate(results)
        }
    }

    /// Invokes the `run` method on a list of mixed runnable objects: a bare
    /// registered test case is grouped with any other contiguous bare test
    /// cases into a single synthetic suite.
    fn run_objects(&mut self, objects: &mut [Runnable]) -> Result<Disposition, AbortError> {
        let testbed = self
            .acquire_testbed()
            .map_err(|e| AbortError::Run(e.to_string()))?;
        let ctx = RunContext {
            config: self.config.clone(),
            bus: self.bus.clone(),
            testbed,
            logdir: self.logdir.clone().unwrap_or_default(),
        };

        let mut results = Vec::new();
        let mut pending_cases: Vec<&'static TestCaseRegistration> = Vec::new();

        for obj in objects.iter_mut() {
            if self.cancel.is_cancelled() {
                flush_pending(&mut pending_cases, &mut results, &ctx);
                return Err(AbortError::Run(
                    "terminated by SIGTERM/SIGHUP".to_string(),
                ));
            }
            match obj {
                Runnable::TestCase(reg) => pending_cases.push(reg),
                Runnable::Scenario(reg) => {
                    flush_pending(&mut pending_cases, &mut results, &ctx);
                    let mut suite = (reg.get_suite)(&ctx);
                    results.push(match suite.run() {
                        SuiteOutcome::Completed(d) => d,
                        SuiteOutcome::Aborted(abort) => return Err(abort),
                    });
                }
                Runnable::Module(reg) => {
                    flush_pending(&mut pending_cases, &mut results, &ctx);
                    results.push((reg.run)(&ctx));
                }
                Runnable::Suite(suite) => {
                    flush_pending(&mut pending_cases, &mut results, &ctx);
                    results.push(match suite.run() {
                        SuiteOutcome::Completed(d) => d,
                        SuiteOutcome::Aborted(abort) => return Err(abort),
                    });
                }
            }
        }
        flush_pending(&mut pending_cases, &mut results, &ctx);

        Ok(Disposition::aggregate(results))
    }

    fn initialize(&mut self) -> Result<(), RunError> {
        self.install_signal_handlers();

        let start_time = Utc::now();
        let ts = start_time.format("%Y%m%d_%H%M%S").to_string();
        let resultsdir = shellexpand::full(&self.config.resultsdir)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.config.resultsdir.clone());
        let logdir = PathBuf::from(resultsdir).join(ts);
        std::fs::create_dir_all(&logdir)
            .map_err(|e| RunError::Runner(crate::error::TestRunnerError::Message(e.to_string())))?;
        self.logdir = Some(logdir.clone());

        if !self.config.flags.stderr {
            match StderrRedirect::install(&logdir.join("runner-stderr.txt")) {
                Ok(guard) => self.stderr_redirect = Some(guard),
                Err(e) => tracing::warn!(error = %e, "failed to redirect stderr into logdir"),
            }
        }

        self.report.initialize(&self.config, &logdir);
        self.report.clone().attach(&self.bus);
        self.services.attach(&self.bus);
        crate::service::initialize(
            &self.services,
            std::env::current_exe().unwrap_or_default(),
            logdir.clone(),
        );

        self.emit(Payload::RunStart { time: start_time });
        if let Some(comment) = &self.config.comment {
            self.emit(Payload::ReportComment {
                message: comment.clone(),
            });
        }
        self.emit(Payload::LogdirLocation {
            path: logdir.display().to_string(),
        });

        Ok(())
    }

    fn finalize(&mut self) {
        self.remove_signal_handlers();
        self.emit(Payload::RunEnd { time: Utc::now() });
        if let Some(guard) = self.stderr_redirect.take() {
            guard.restore();
        }
        self.report.finalize();
        self.emit(Payload::ReportFinal);
        self.services.close();
        self.release_testbed();
    }

    /// Spawns a listener that converts SIGTERM or SIGHUP into a cancellation
    /// checked between runnables in `run_objects`, so either signal unwinds
    /// the current run and still reaches `finalize` rather than killing the
    /// process outright.
    #[cfg(unix)]
    fn install_signal_handlers(&mut self) {
        let cancel = self.cancel.clone();
        self.signal_task = Some(tokio::spawn(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
            let mut sighup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
            tokio::select! {
                _ = sigterm.recv() => tracing::warn!("received SIGTERM, finishing current runnable then exiting"),
                _ = sighup.recv() => tracing::warn!("received SIGHUP, finishing current runnable then exiting"),
            }
            cancel.cancel();
        }));
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&mut self) {}

    /// Stops reacting to SIGTERM/SIGHUP and resets both to their default
    /// disposition, mirroring the original runner's `SIG_DFL` reset.
    #[cfg(unix)]
    fn remove_signal_handlers(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            libc::signal(libc::SIGHUP, libc::SIG_DFL);
        }
    }

    #[cfg(not(unix))]
    fn remove_signal_handlers(&mut self) {}
}

/// Redirects the process's stderr file descriptor to a logdir file for the
/// duration of a run, restoring the original fd afterward. There is no
/// portable std API for this; `libc::dup`/`dup2` is the corpus's way of
/// reaching into raw fds when a crate doesn't already cover it.
#[cfg(unix)]
struct StderrRedirect {
    saved_fd: std::os::raw::c_int,
}

#[cfg(unix)]
impl StderrRedirect {
    fn install(path: &std::path::Path) -> std::io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let saved_fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if saved_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let rc = unsafe { libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(saved_fd) };
            return Err(err);
        }
        Ok(StderrRedirect { saved_fd })
    }

    fn restore(self) {
        unsafe {
            libc::dup2(self.saved_fd, libc::STDERR_FILENO);
            libc::close(self.saved_fd);
        }
    }
}

#[cfg(not(unix))]
struct StderrRedirect;

#[cfg(not(unix))]
impl StderrRedirect {
    fn install(_path: &std::path::Path) -> std::io::Result<Self> {
        Ok(StderrRedirect)
    }

    fn restore(self) {}
}

fn flush_pending(
    pending: &mut Vec<&'static TestCaseRegistration>,
    results: &mut Vec<Disposition>,
    ctx: &RunContext,
) {
    if pending.is_empty() {
        return;
    }
    let mut suite = ctx.new_suite("RunTestsTempSuite");
    for reg in pending.drain(..) {
        let _ = suite.add_test(reg.implementation, json!([]), json!({}));
    }
    results.push(match suite.run() {
        SuiteOutcome::Completed(d) => d,
        SuiteOutcome::Aborted(_) => Disposition::Aborted,
    });
}

/// Resolves selected implementation paths into a runnable object list, the
/// way a CLI invocation turns its positional arguments into `runall` input.
pub fn resolve_runnables(
    paths: &[String],
    mut onerror: impl FnMut(registry::ScanError),
) -> Vec<Runnable> {
    let mut out = Vec::new();
    for path in paths {
        if let Some(reg) = registry::lookup_testcase(path) {
            out.push(Runnable::TestCase(reg));
            continue;
        }
        if let Some(reg) = registry::scan_scenarios("").into_iter().find(|r| r.implementation == path) {
            out.push(Runnable::Scenario(reg));
            continue;
        }
        if let Some(reg) = registry::scan_modules("").into_iter().find(|r| r.implementation == path) {
            out.push(Runnable::Module(reg));
            continue;
        }
        onerror(registry::ScanError {
            path: path.clone(),
            message: "not found in registry".to_string(),
        });
    }
    out
}
