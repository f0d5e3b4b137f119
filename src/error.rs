//! Error taxonomy for the test orchestration core.
//!
//! Mirrors the distinction the framework draws between *dispositions*
//! (expected outcomes, recovered locally by the test case runner),
//! *aborts* (propagate past the current scope), and *framework/config/report*
//! errors (contract violations, fatal to the run).

/// Raised by test code to record a terminal disposition. Always caught by
/// [`crate::testcase::run_test`]; never escapes a test case's `run`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TestDisposition {
    #[error("{0}")]
    Failure(String),
    #[error("{0}")]
    Incomplete(String),
    #[error("{0}")]
    ExpectedFail(String),
    #[error("critical failure: {0}")]
    CriticalFailed(String),
}

/// Propagates past the current suite or run. Never rewritten to a disposition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AbortError {
    #[error("suite aborted: {0}")]
    Suite(String),
    #[error("run aborted: {0}")]
    Run(String),
}

/// Framework contract violations: double-emission of a disposition, a test
/// that returned without recording one, a malformed prerequisite reference.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TestImplementationError {
    #[error("disposition already set to {previous:?} when attempting to set {attempted:?}")]
    DoubleDisposition {
        previous: String,
        attempted: String,
    },
    #[error("test case \"{0}\" ended without setting a disposition")]
    NoDispositionSet(String),
    #[error("{0}")]
    Other(String),
}

/// Raised by the top-level runner for contract violations that are not a
/// disposition or an abort but still need to be reported distinctly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TestRunnerError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Implementation(#[from] TestImplementationError),
}

/// Configuration errors: missing/invalid inventory or config values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration key not found: {0}")]
    NotFound(String),
    #[error("invalid value for configuration key {key}: {message}")]
    ValueError { key: String, message: String },
    #[error("{0}")]
    Other(String),
}

/// Raised at runner init if the requested report name cannot be resolved.
#[derive(Debug, Clone, thiserror::Error)]
#[error("report not found: {0}")]
pub struct ReportFindError(pub String);

/// Controller/device errors. Recoverable by the test case; it decides
/// whether to convert these into an Incomplete disposition or a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("device transport error: {0}")]
    Transport(String),
    #[error("device did not respond within the timeout")]
    Timeout,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by a [`crate::service::Service`] provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("service {0:?} is not registered")]
    NotRegistered(String),
    #[error("{needer} wants {service:?} but it is not provided")]
    NotProvided { needer: String, service: String },
    #[error("coprocess worker for service {0:?} exited without replying")]
    WorkerLost(String),
    #[error("{0}")]
    Other(String),
}

/// Top-level error a [`crate::runner::TestRunner::runall`] call can surface
/// at the outermost level, distinct from the aggregate [`crate::disposition::Disposition`]
/// it otherwise returns.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Abort(#[from] AbortError),
    #[error(transparent)]
    Runner(#[from] TestRunnerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ReportNotFound(#[from] ReportFindError),
}

/// Walks an error's `source()` chain into a flat list of diagnostic lines,
/// the Rust analogue of walking `__context__`/`__cause__` on a Python
/// exception.
pub fn diagnostic_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut lines = vec![err.to_string()];
    let mut cur = err.source();
    while let Some(e) = cur {
        lines.push(e.to_string());
        cur = e.source();
    }
    lines
}
