//! The test case contract: lifecycle hooks, disposition emission API,
//! assertion helpers, and the run algorithm (SPEC_FULL.md §4.2).

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::disposition::{Disposition, TestOutcome};
use crate::error::{diagnostic_chain, AbortError, TestDisposition, TestImplementationError};
use crate::signals::{signal, Bus, Payload, SenderId};

/// A prerequisite reference: an implementation path plus the arguments the
/// prerequisite must have been run with for a match.
#[derive(Debug, Clone)]
pub struct PrerequisiteSpec {
    pub implementation: &'static str,
    pub args: Json,
    pub kwargs: Json,
}

impl PrerequisiteSpec {
    pub fn new(implementation: &'static str) -> Self {
        PrerequisiteSpec {
            implementation,
            args: Json::Array(Vec::new()),
            kwargs: Json::Object(Default::default()),
        }
    }
}

/// Per-test-case immutable configuration, published by the implementing
/// type rather than staged on an instance (SPEC_FULL.md §9).
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub implementation: &'static str,
    pub name: &'static str,
    pub repeat: u32,
    pub prerequisites: &'static [PrerequisiteSpec],
    pub bugid: Option<&'static str>,
    pub version: Option<&'static str>,
}

impl TestOptions {
    pub const fn new(implementation: &'static str, name: &'static str) -> Self {
        TestOptions {
            implementation,
            name,
            repeat: 1,
            prerequisites: &[],
            bugid: None,
            version: None,
        }
    }
}

/// Per-invocation overlay merged into a test case's options at construction
/// time (e.g. parameterized replays of the same implementation, or a bug id
/// supplied at the call site rather than declared on the type).
#[derive(Debug, Clone, Default)]
pub struct OptionsOverlay {
    pub bugid: Option<String>,
    pub extra: std::collections::HashMap<String, Json>,
}

/// Errors a `procedure` body can return. Test authors build these up with
/// `?` from the assertion helpers, the disposition-emission API, and
/// ordinary `anyhow`-wrapped device errors.
#[derive(Debug)]
pub enum ProcedureError {
    Disposition(TestDisposition),
    Abort(AbortError),
    Implementation(TestImplementationError),
    /// The cooperative-cancellation analogue of `KeyboardInterrupt`.
    Cancelled,
    Other(anyhow::Error),
}

impl From<TestDisposition> for ProcedureError {
    fn from(d: TestDisposition) -> Self {
        ProcedureError::Disposition(d)
    }
}

impl From<AbortError> for ProcedureError {
    fn from(a: AbortError) -> Self {
        ProcedureError::Abort(a)
    }
}

impl From<TestImplementationError> for ProcedureError {
    fn from(e: TestImplementationError) -> Self {
        ProcedureError::Implementation(e)
    }
}

impl From<anyhow::Error> for ProcedureError {
    fn from(e: anyhow::Error) -> Self {
        ProcedureError::Other(e)
    }
}

pub type ProcedureResult = Result<(), ProcedureError>;

/// The per-invocation handle test code uses to emit signals, record a
/// disposition, and reach filesystem/data helpers. Constructed fresh for
/// every `run_test` call.
pub struct TestContext {
    bus: std::sync::Arc<Bus>,
    sender: SenderId,
    test_name: String,
    bugid: Option<String>,
    logdir: PathBuf,
    start_time: Mutex<Option<DateTime<Utc>>>,
    outcome: Mutex<Option<TestOutcome>>,
}

impl TestContext {
    pub fn new(
        bus: std::sync::Arc<Bus>,
        test_name: String,
        bugid: Option<String>,
        logdir: PathBuf,
    ) -> Self {
        TestContext {
            bus,
            sender: SenderId::new(),
            test_name,
            bugid,
            logdir,
            start_time: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> SenderId {
        self.sender
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    fn emit(&self, payload: Payload) {
        self.bus.send(self.sender, payload);
    }

    fn start(&self) {
        let now = Utc::now();
        *self.start_time.lock().unwrap() = Some(now);
        self.emit(Payload::TestStart { time: now });
    }

    pub fn emit_version(&self, version: &str) {
        self.emit(Payload::TestVersion {
            version: version.to_string(),
        });
    }

    pub fn emit_arguments(&self, repr: impl Into<String>) {
        self.emit(Payload::TestArguments {
            arguments: repr.into(),
        });
    }

    fn emit_test_end(&self) {
        self.emit(Payload::TestEnd { time: Utc::now() });
    }

    fn set_outcome(&self, outcome: TestOutcome) -> Result<(), TestImplementationError> {
        let mut slot = self.outcome.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            return Err(TestImplementationError::DoubleDisposition {
                previous: format!("{:?}", existing.disposition()),
                attempted: format!("{:?}", outcome.disposition()),
            });
        }
        let payload = match &outcome {
            TestOutcome::Passed(m) => Payload::TestPassed { message: m.clone() },
            TestOutcome::Failed(m) => Payload::TestFailure { message: m.clone() },
            TestOutcome::Incomplete(m) => Payload::TestIncomplete { message: m.clone() },
            TestOutcome::ExpectedFail(m) => {
                Payload::TestExpectedFailure { message: m.clone() }
            }
        };
        self.emit(payload);
        *slot = Some(outcome);
        Ok(())
    }

    /// Records a disposition that arrived via a propagated `ProcedureError`
    /// (assertion helper, or a returned `TestDisposition`) rather than a
    /// direct `passed`/`failed` call. Leaves an already-recorded outcome
    /// untouched — the slot belongs to whichever call won the race.
    fn record_from_procedure_error(&self, outcome: TestOutcome) {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let payload = match &outcome {
            TestOutcome::Passed(m) => Payload::TestPassed { message: m.clone() },
            TestOutcome::Failed(m) => Payload::TestFailure { message: m.clone() },
            TestOutcome::Incomplete(m) => Payload::TestIncomplete { message: m.clone() },
            TestOutcome::ExpectedFail(m) => {
                Payload::TestExpectedFailure { message: m.clone() }
            }
        };
        self.emit(payload);
        *slot = Some(outcome);
    }

    fn recorded_disposition(&self) -> Option<Disposition> {
        self.outcome.lock().unwrap().as_ref().map(|o| o.disposition())
    }

    // --- Disposition emission API -----------------------------------

    pub fn passed(&self, message: impl Into<String>) -> Result<(), TestImplementationError> {
        self.set_outcome(TestOutcome::Passed(message.into()))
    }

    /// Rewritten to `test-expected-failure` if this test has a bug id set,
    /// with a diagnostic naming the bug emitted first.
    pub fn failed(&self, message: impl Into<String>) -> Result<(), TestImplementationError> {
        let message = message.into();
        if let Some(bugid) = &self.bugid {
            self.diagnostic(format!("Failure expected due to bug {bugid}"));
            self.set_outcome(TestOutcome::ExpectedFail(message))
        } else {
            self.set_outcome(TestOutcome::Failed(message))
        }
    }

    pub fn expectedfail(&self, message: impl Into<String>) -> Result<(), TestImplementationError> {
        self.set_outcome(TestOutcome::ExpectedFail(message.into()))
    }

    pub fn incomplete(&self, message: impl Into<String>) -> Result<(), TestImplementationError> {
        self.set_outcome(TestOutcome::Incomplete(message.into()))
    }

    /// Emits `test-abort` and returns an `AbortError` for the caller to
    /// propagate with `?`; does not touch the disposition slot.
    pub fn abort(&self, message: impl Into<String>) -> AbortError {
        let message = message.into();
        self.emit(Payload::TestAbort {
            message: message.clone(),
        });
        AbortError::Suite(message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Payload::TestInfo {
            message: message.into(),
        });
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Payload::TestWarning {
            message: message.into(),
        });
    }

    pub fn diagnostic(&self, message: impl Into<String>) {
        self.emit(Payload::TestDiagnostic {
            message: message.into(),
        });
    }

    pub fn record_data(&self, data: Json) {
        self.emit(Payload::TestData { data });
    }

    // --- Assertion helpers --------------------------------------------
    // Pure; never emit signals themselves. A `TestFailure` they return
    // propagates through `procedure`'s `?` and is recorded by `run_test`.

    pub fn assert_equal<T: PartialEq + std::fmt::Debug>(
        &self,
        a: &T,
        b: &T,
        message: Option<&str>,
    ) -> Result<(), TestDisposition> {
        if a == b {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{a:?} != {b:?}")),
            ))
        }
    }

    pub fn assert_not_equal<T: PartialEq + std::fmt::Debug>(
        &self,
        a: &T,
        b: &T,
        message: Option<&str>,
    ) -> Result<(), TestDisposition> {
        if a != b {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{a:?} == {b:?}")),
            ))
        }
    }

    pub fn assert_greater_than<T: PartialOrd + std::fmt::Debug>(
        &self,
        a: &T,
        b: &T,
        message: Option<&str>,
    ) -> Result<(), TestDisposition> {
        if a >= b {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{a:?} < {b:?}")),
            ))
        }
    }

    pub fn assert_less_than<T: PartialOrd + std::fmt::Debug>(
        &self,
        a: &T,
        b: &T,
        message: Option<&str>,
    ) -> Result<(), TestDisposition> {
        if a <= b {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{a:?} > {b:?}")),
            ))
        }
    }

    pub fn assert_true(&self, value: bool, message: Option<&str>) -> Result<(), TestDisposition> {
        if value {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message.map(str::to_string).unwrap_or_else(|| "not true".into()),
            ))
        }
    }

    pub fn assert_false(&self, value: bool, message: Option<&str>) -> Result<(), TestDisposition> {
        if !value {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| "not false".into()),
            ))
        }
    }

    /// Relative-tolerance approximate equality; the default 5% tolerance is
    /// applied relative to the larger magnitude of the two arguments.
    pub fn assert_approximately_equal(
        &self,
        a: f64,
        b: f64,
        tolerance: f64,
        message: Option<&str>,
    ) -> Result<(), TestDisposition> {
        let scale = a.abs().max(b.abs());
        let close = if scale == 0.0 {
            (a - b).abs() == 0.0
        } else {
            ((a - b).abs() / scale) <= tolerance
        };
        if close {
            Ok(())
        } else {
            Err(TestDisposition::Failure(message.map(str::to_string).unwrap_or_else(|| {
                format!("{a} and {b} not within {}% of each other", tolerance * 100.0)
            })))
        }
    }

    pub fn assert_raises<F, T, E>(
        &self,
        f: F,
        message: Option<&str>,
    ) -> Result<(), TestDisposition>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match f() {
            Err(_) => Ok(()),
            Ok(_) => Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| "expected call did not raise".into()),
            )),
        }
    }

    pub fn assert_passed(&self, disposition: Disposition, message: Option<&str>) -> Result<(), TestDisposition> {
        if disposition == Disposition::Passed {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("expected Passed, got {disposition}")),
            ))
        }
    }

    pub fn assert_failed(&self, disposition: Disposition, message: Option<&str>) -> Result<(), TestDisposition> {
        if disposition == Disposition::Failed {
            Ok(())
        } else {
            Err(TestDisposition::Failure(
                message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("expected Failed, got {disposition}")),
            ))
        }
    }

    // --- Data & filesystem helpers --------------------------------------

    /// `{base}-{startTS:YYYYmmddHHMMSS.ffffff}.{ext}`, relative to the logdir.
    /// The start timestamp is the time `test-start` was emitted, so repeated
    /// calls for the same test instance return the same path.
    pub fn get_filename(&self, basename: Option<&str>, ext: &str) -> PathBuf {
        let base = basename
            .map(str::to_string)
            .unwrap_or_else(|| self.test_name.replace('.', "_"));
        let start = self
            .start_time
            .lock()
            .unwrap()
            .unwrap_or_else(Utc::now);
        let filename = format!("{base}-{}.{ext}", start.format("%Y%m%d%H%M%S%.6f"));
        self.logdir.join(filename)
    }

    pub fn open_file(&self, basename: Option<&str>, ext: &str) -> std::io::Result<std::fs::File> {
        std::fs::File::create(self.get_filename(basename, ext))
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A test case implementation. `run` (driven by [`run_test`]) is not part of
/// this trait: authors implement the three lifecycle hooks and the
/// associated `options()`, and the framework is solely responsible for
/// invoking them in the right order with the right error handling.
pub trait TestCase: Send {
    fn options() -> TestOptions
    where
        Self: Sized;

    fn initialize(&mut self, _ctx: &TestContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn procedure(&mut self, ctx: &TestContext, args: Json, kwargs: Json) -> ProcedureResult;

    fn finalize(&mut self, _ctx: &TestContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Object-safe counterpart of [`TestCase`] (the associated `options()`
/// function can't be called through a trait object), implemented for every
/// `T: TestCase` so suites can hold heterogeneous boxed test cases.
pub trait DynTestCase: Send {
    fn initialize(&mut self, ctx: &TestContext) -> anyhow::Result<()>;
    fn procedure(&mut self, ctx: &TestContext, args: Json, kwargs: Json) -> ProcedureResult;
    fn finalize(&mut self, ctx: &TestContext) -> anyhow::Result<()>;
}

impl<T: TestCase> DynTestCase for T {
    fn initialize(&mut self, ctx: &TestContext) -> anyhow::Result<()> {
        TestCase::initialize(self, ctx)
    }
    fn procedure(&mut self, ctx: &TestContext, args: Json, kwargs: Json) -> ProcedureResult {
        TestCase::procedure(self, ctx, args, kwargs)
    }
    fn finalize(&mut self, ctx: &TestContext) -> anyhow::Result<()> {
        TestCase::finalize(self, ctx)
    }
}

/// The outcome of a single `run_test` invocation, from the suite's point of
/// view: a normal terminal disposition, an abort that must propagate, or a
/// cooperative cancellation the suite decides whether to tolerate.
#[derive(Debug)]
pub enum TestRunOutcome {
    Completed(Disposition),
    Aborted(AbortError),
    Cancelled,
}

/// Executes the run algorithm of SPEC_FULL.md §4.2 against `test`, using
/// `ctx` for signal emission and disposition bookkeeping.
pub fn run_test(
    test: &mut dyn DynTestCase,
    ctx: &TestContext,
    version: Option<&str>,
    arguments_repr: String,
    args: Json,
    kwargs: Json,
) -> TestRunOutcome {
    if let Err(e) = test.initialize(ctx) {
        for line in diagnostic_chain(e.as_ref()) {
            ctx.diagnostic(line);
        }
        return TestRunOutcome::Aborted(AbortError::Suite(format!(
            "initialize() failed for {}: {e}",
            ctx.test_name()
        )));
    }

    ctx.start();
    if let Some(v) = version {
        ctx.emit_version(v);
    }
    ctx.emit_arguments(arguments_repr);

    let disposition = match test.procedure(ctx, args, kwargs) {
        Ok(()) => match ctx.recorded_disposition() {
            Some(d) => d,
            None => {
                let _ = ctx.incomplete("procedure returned without recording a disposition");
                Disposition::Incomplete
            }
        },
        Err(ProcedureError::Disposition(disp)) => {
            let outcome = match disp {
                TestDisposition::Failure(m) => TestOutcome::Failed(m),
                TestDisposition::Incomplete(m) => TestOutcome::Incomplete(m),
                TestDisposition::ExpectedFail(m) => TestOutcome::ExpectedFail(m),
                TestDisposition::CriticalFailed(m) => TestOutcome::Failed(m),
            };
            ctx.record_from_procedure_error(outcome);
            ctx.recorded_disposition().unwrap_or(Disposition::Incomplete)
        }
        Err(ProcedureError::Abort(abort)) => {
            ctx.emit_test_end();
            return TestRunOutcome::Aborted(abort);
        }
        Err(ProcedureError::Cancelled) => {
            if ctx.recorded_disposition().is_none() {
                ctx.record_from_procedure_error(TestOutcome::Incomplete(
                    "cancelled".to_string(),
                ));
            }
            ctx.emit_test_end();
            return TestRunOutcome::Cancelled;
        }
        Err(ProcedureError::Implementation(e)) => {
            ctx.diagnostic(format!("test implementation error: {e}"));
            Disposition::Incomplete
        }
        Err(ProcedureError::Other(err)) => {
            for line in diagnostic_chain(err.as_ref()) {
                ctx.diagnostic(line);
            }
            if ctx.recorded_disposition().is_none() {
                ctx.record_from_procedure_error(TestOutcome::Incomplete(format!(
                    "unhandled error: {err}"
                )));
            }
            ctx.recorded_disposition().unwrap_or(Disposition::Incomplete)
        }
    };

    ctx.emit_test_end();

    if let Err(e) = test.finalize(ctx) {
        for line in diagnostic_chain(e.as_ref()) {
            ctx.diagnostic(line);
        }
        return TestRunOutcome::Aborted(AbortError::Suite(format!(
            "finalize() failed for {}: {e}",
            ctx.test_name()
        )));
    }

    TestRunOutcome::Completed(disposition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct PassingTest;
    impl TestCase for PassingTest {
        fn options() -> TestOptions {
            TestOptions::new("tests::PassingTest", "passing")
        }
        fn procedure(&mut self, ctx: &TestContext, _args: Json, _kwargs: Json) -> ProcedureResult {
            ctx.passed("ok")?;
            Ok(())
        }
    }

    struct SilentTest;
    impl TestCase for SilentTest {
        fn options() -> TestOptions {
            TestOptions::new("tests::SilentTest", "silent")
        }
        fn procedure(&mut self, _ctx: &TestContext, _args: Json, _kwargs: Json) -> ProcedureResult {
            Ok(())
        }
    }

    struct DoubleEmitTest;
    impl TestCase for DoubleEmitTest {
        fn options() -> TestOptions {
            TestOptions::new("tests::DoubleEmitTest", "double")
        }
        fn procedure(&mut self, ctx: &TestContext, _args: Json, _kwargs: Json) -> ProcedureResult {
            ctx.passed("first")?;
            ctx.failed("second")?;
            Ok(())
        }
    }

    fn ctx() -> TestContext {
        TestContext::new(
            Arc::new(Bus::new()),
            "test".to_string(),
            None,
            std::env::temp_dir(),
        )
    }

    #[test]
    fn passing_test_yields_passed() {
        let c = ctx();
        let mut t = PassingTest;
        let outcome = run_test(&mut t, &c, None, "()".into(), Json::Null, Json::Null);
        assert!(matches!(outcome, TestRunOutcome::Completed(Disposition::Passed)));
    }

    #[test]
    fn silent_procedure_is_incomplete() {
        let c = ctx();
        let mut t = SilentTest;
        let outcome = run_test(&mut t, &c, None, "()".into(), Json::Null, Json::Null);
        assert!(matches!(
            outcome,
            TestRunOutcome::Completed(Disposition::Incomplete)
        ));
    }

    #[test]
    fn double_emission_is_incomplete_but_keeps_first_recorded() {
        let c = ctx();
        let mut t = DoubleEmitTest;
        let outcome = run_test(&mut t, &c, None, "()".into(), Json::Null, Json::Null);
        assert!(matches!(
            outcome,
            TestRunOutcome::Completed(Disposition::Incomplete)
        ));
        // The slot itself still holds the first (Passed) outcome.
        assert_eq!(c.recorded_disposition(), Some(Disposition::Passed));
    }

    #[test]
    fn bugid_rewrites_failed_to_expected_fail() {
        let c = TestContext::new(
            Arc::new(Bus::new()),
            "test".to_string(),
            Some("BUG-123".to_string()),
            std::env::temp_dir(),
        );
        c.failed("known issue").unwrap();
        assert_eq!(c.recorded_disposition(), Some(Disposition::ExpectedFail));
    }

    #[test]
    fn get_filename_is_stable_across_calls() {
        let c = ctx();
        c.start();
        let f1 = c.get_filename(None, "log");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let f2 = c.get_filename(None, "log");
        assert_eq!(f1, f2);
    }

    #[test]
    fn open_file_creates_file_under_the_logdir() {
        let dir = tempfile::tempdir().unwrap();
        let c = TestContext::new(
            Arc::new(Bus::new()),
            "test".to_string(),
            None,
            dir.path().to_path_buf(),
        );
        c.start();
        let path = c.get_filename(Some("vectors"), "txt");
        assert!(path.starts_with(dir.path()));
        let mut f = c.open_file(Some("vectors"), "txt").unwrap();
        use std::io::Write;
        writeln!(f, "hello").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn approximately_equal_uses_relative_tolerance() {
        let c = ctx();
        assert!(c.assert_approximately_equal(100.0, 104.0, 0.05, None).is_ok());
        assert!(c.assert_approximately_equal(100.0, 110.0, 0.05, None).is_err());
    }
}
