//! The test suite: an ordered container of tests and sub-suites that
//! resolves prerequisites, deduplicates auto-added entries, propagates
//! abort, and aggregates child dispositions (SPEC_FULL.md §4.3).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use crate::config::Config;
use crate::disposition::Disposition;
use crate::error::AbortError;
use crate::registry::{self, TestCaseRegistration};
use crate::signals::{Bus, Payload, SenderId};
use crate::testcase::{run_test, OptionsOverlay, TestContext, TestOptions, TestRunOutcome};

/// A scheduled test-case invocation within a suite.
pub struct TestEntry {
    test: Box<dyn crate::testcase::DynTestCase>,
    options: TestOptions,
    overlay: OptionsOverlay,
    args: Json,
    kwargs: Json,
    auto_added: bool,
    disposition: Mutex<Option<Disposition>>,
}

impl TestEntry {
    fn new(
        reg: &TestCaseRegistration,
        args: Json,
        kwargs: Json,
        auto_added: bool,
        overlay: OptionsOverlay,
    ) -> Self {
        TestEntry {
            test: (reg.construct)(),
            options: (reg.options)(),
            overlay,
            args,
            kwargs,
            auto_added,
            disposition: Mutex::new(None),
        }
    }

    /// The effective bug id: a per-run overlay (from configuration) takes
    /// precedence over the bug id declared on the test case's own options.
    fn effective_bugid(&self) -> Option<String> {
        self.overlay
            .bugid
            .clone()
            .or_else(|| self.options.bugid.map(str::to_string))
    }

    fn signature(&self) -> (String, String) {
        (
            self.options.implementation.to_string(),
            format!("{}|{}", self.args, self.kwargs),
        )
    }

    pub fn disposition(&self) -> Option<Disposition> {
        *self.disposition.lock().unwrap()
    }

    pub fn name(&self) -> &str {
        self.options.name
    }

    /// Whether this entry was inserted automatically to satisfy a
    /// prerequisite, rather than added directly by the suite's author.
    pub fn auto_added(&self) -> bool {
        self.auto_added
    }
}

enum Entry {
    Test(TestEntry),
    Suite(TestSuite),
}

impl Entry {
    fn disposition(&self) -> Option<Disposition> {
        match self {
            Entry::Test(e) => e.disposition(),
            Entry::Suite(s) => s.final_disposition(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Entry::Test(e) => e.name(),
            Entry::Suite(s) => &s.name,
        }
    }
}

/// Result of running a suite to completion or to an abort.
#[derive(Debug)]
pub enum SuiteOutcome {
    Completed(Disposition),
    Aborted(AbortError),
}

pub struct TestSuite {
    config: Arc<Config>,
    bus: Arc<Bus>,
    sender: SenderId,
    logdir: PathBuf,
    name: String,
    #[allow(dead_code)]
    doc: Option<String>,
    nested: u32,
    debug: u8,
    entries: Vec<Entry>,
    auto_signatures: HashSet<(String, String)>,
    final_disposition: Mutex<Option<Disposition>>,
}

impl TestSuite {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<Bus>,
        logdir: PathBuf,
        nested: u32,
        name: impl Into<String>,
        doc: Option<String>,
    ) -> Self {
        let debug = config.flags.debug;
        TestSuite {
            config,
            bus,
            sender: SenderId::new(),
            logdir,
            name: name.into(),
            doc,
            nested,
            debug,
            entries: Vec::new(),
            auto_signatures: HashSet::new(),
            final_disposition: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn final_disposition(&self) -> Option<Disposition> {
        *self.final_disposition.lock().unwrap()
    }

    /// Adds a test case by its registered implementation path. Recursively
    /// inserts any declared prerequisites (deduplicated by signature among
    /// auto-added entries) before this entry, unless `debug >= 3`.
    pub fn add_test(
        &mut self,
        implementation: &str,
        args: Json,
        kwargs: Json,
    ) -> Result<(), registry::ScanError> {
        let reg = registry::lookup_testcase(implementation).ok_or_else(|| registry::ScanError {
            path: implementation.to_string(),
            message: "not found in registry".to_string(),
        })?;
        let overlay = self.overlay_for(implementation);
        let entry = TestEntry::new(reg, args, kwargs, false, overlay);
        self.insert_with_prereqs(entry, false);
        Ok(())
    }

    /// Builds the per-test overlay from the `test_options` table of the
    /// suite's configuration, keyed by implementation path.
    fn overlay_for(&self, implementation: &str) -> OptionsOverlay {
        let mut overlay = OptionsOverlay::default();
        if let Some(Json::Object(map)) = self.config.test_options.get(implementation) {
            if let Some(Json::String(bugid)) = map.get("bugid") {
                overlay.bugid = Some(bugid.clone());
            }
            overlay.extra = map
                .iter()
                .filter(|(k, _)| k.as_str() != "bugid")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        overlay
    }

    /// Adds the same implementation once per (args, kwargs) pair — the
    /// Rust analogue of `add_test_combinations`, with the cartesian product
    /// already expanded by the caller.
    pub fn add_test_combinations(
        &mut self,
        implementation: &str,
        combinations: Vec<(Json, Json)>,
    ) -> Result<(), registry::ScanError> {
        for (args, kwargs) in combinations {
            self.add_test(implementation, args, kwargs)?;
        }
        Ok(())
    }

    pub fn add_suite(&mut self, suite: TestSuite) {
        self.entries.push(Entry::Suite(suite));
    }

    fn insert_with_prereqs(&mut self, entry: TestEntry, auto: bool) {
        if self.debug < 3 {
            let declaring_module = module_of(entry.options.implementation);
            for prereq in entry.options.prerequisites {
                let resolved = registry::resolve_prerequisite_path(declaring_module, prereq.implementation);
                if let Some(reg) = registry::lookup_testcase(&resolved) {
                    let overlay = self.overlay_for(&resolved);
                    let pre_entry =
                        TestEntry::new(reg, prereq.args.clone(), prereq.kwargs.clone(), true, overlay);
                    let sig = pre_entry.signature();
                    if !self.auto_signatures.contains(&sig) {
                        self.insert_with_prereqs(pre_entry, true);
                    }
                }
                // Unresolvable prerequisites are left unsatisfied: the
                // dependent entry simply finds no matching prior Passed
                // entry at execution time and is recorded Incomplete.
            }
        }
        let sig = entry.signature();
        if !auto {
            self.entries.push(Entry::Test(entry));
        } else if !self.auto_signatures.contains(&sig) {
            self.entries.push(Entry::Test(entry));
        }
        self.auto_signatures.insert(sig);
    }

    fn emit(&self, payload: Payload) {
        self.bus.send(self.sender, payload);
    }

    /// Runs every entry in insertion order, aggregates their dispositions,
    /// and reports the result. See SPEC_FULL.md §4.3 for the full algorithm.
    pub fn run(&mut self) -> SuiteOutcome {
        self.emit(Payload::SuiteStart {
            time: chrono::Utc::now(),
        });

        let mut abort_signal: Option<AbortError> = None;
        let mut tolerated_cancel = false;

        for i in 0..self.entries.len() {
            let prior_passed: Vec<(String, Json, Json)> = self.entries[..i]
                .iter()
                .filter_map(|e| match e {
                    Entry::Test(t) if t.disposition() == Some(Disposition::Passed) => Some((
                        t.options.implementation.to_string(),
                        t.args.clone(),
                        t.kwargs.clone(),
                    )),
                    _ => None,
                })
                .collect();

            match &mut self.entries[i] {
                Entry::Test(entry) => {
                    let unmet = if self.debug < 2 {
                        let declaring_module = module_of(entry.options.implementation);
                        entry
                            .options
                            .prerequisites
                            .iter()
                            .map(|p| {
                                let resolved = registry::resolve_prerequisite_path(
                                    declaring_module,
                                    p.implementation,
                                );
                                (resolved, p.args.clone(), p.kwargs.clone())
                            })
                            .find(|(implementation, args, kwargs)| {
                                !prior_passed.iter().any(|(i2, a2, k2)| {
                                    i2 == implementation && a2 == args && k2 == kwargs
                                })
                            })
                    } else {
                        None
                    };

                    let ctx = TestContext::new(
                        self.bus.clone(),
                        entry.options.name.to_string(),
                        entry.effective_bugid(),
                        self.logdir.clone(),
                    );

                    if let Some((unmet_path, _, _)) = unmet {
                        self.bus.send(
                            ctx.sender(),
                            Payload::TestStart {
                                time: chrono::Utc::now(),
                            },
                        );
                        ctx.diagnostic(format!("Prerequisite: {unmet_path}"));
                        let _ = ctx.incomplete(format!("Prerequisite not satisfied: {unmet_path}"));
                        self.bus.send(
                            ctx.sender(),
                            Payload::TestEnd {
                                time: chrono::Utc::now(),
                            },
                        );
                        *entry.disposition.lock().unwrap() = Some(Disposition::Incomplete);
                        continue;
                    }

                    let version = entry.options.version;
                    let args = entry.args.clone();
                    let kwargs = entry.kwargs.clone();
                    let repr = format!("{args}, {kwargs}");
                    let outcome = run_test(&mut *entry.test, &ctx, version, repr, args, kwargs);
                    match outcome {
                        TestRunOutcome::Completed(d) => {
                            *entry.disposition.lock().unwrap() = Some(d);
                        }
                        TestRunOutcome::Aborted(e) => {
                            *entry.disposition.lock().unwrap() = Some(Disposition::Aborted);
                            abort_signal = Some(e);
                            break;
                        }
                        TestRunOutcome::Cancelled => {
                            *entry.disposition.lock().unwrap() = Some(Disposition::Incomplete);
                            if self.nested > 0 || tolerated_cancel {
                                abort_signal =
                                    Some(AbortError::Suite("interrupted".to_string()));
                                break;
                            }
                            tolerated_cancel = true;
                            tracing::warn!(suite = %self.name, "tolerating one interrupt");
                            break;
                        }
                    }
                }
                Entry::Suite(nested) => match nested.run() {
                    SuiteOutcome::Completed(_) => {}
                    SuiteOutcome::Aborted(e) => {
                        abort_signal = Some(e);
                        break;
                    }
                },
            }
        }

        let dispositions: Vec<Disposition> = self
            .entries
            .iter()
            .filter_map(|e| e.disposition())
            .collect();
        let aggregate = if self.entries.is_empty() {
            Disposition::NotApplicable
        } else {
            Disposition::aggregate(dispositions)
        };
        *self.final_disposition.lock().unwrap() = Some(aggregate);

        self.emit(Payload::SuiteEnd {
            time: chrono::Utc::now(),
        });
        self.emit(Payload::SuiteSummary {
            disposition: aggregate,
        });

        match abort_signal {
            Some(e) => SuiteOutcome::Aborted(e),
            None => SuiteOutcome::Completed(aggregate),
        }
    }
}

fn module_of(implementation: &str) -> &str {
    implementation.rsplit_once("::").map(|(m, _)| m).unwrap_or(implementation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_testcase;
    use crate::testcase::{PrerequisiteSpec, ProcedureResult, TestCase, TestContext as Ctx};

    #[derive(Default)]
    struct SuiteUnitPass;
    impl TestCase for SuiteUnitPass {
        fn options() -> TestOptions {
            TestOptions::new("suite_tests::SuiteUnitPass", "suite_unit_pass")
        }
        fn procedure(&mut self, ctx: &Ctx, _a: Json, _k: Json) -> ProcedureResult {
            ctx.passed("ok")?;
            Ok(())
        }
    }
    register_testcase!(SuiteUnitPass);

    #[derive(Default)]
    struct SuiteUnitFail;
    impl TestCase for SuiteUnitFail {
        fn options() -> TestOptions {
            TestOptions::new("suite_tests::SuiteUnitFail", "suite_unit_fail")
        }
        fn procedure(&mut self, ctx: &Ctx, _a: Json, _k: Json) -> ProcedureResult {
            ctx.failed("nope")?;
            Ok(())
        }
    }
    register_testcase!(SuiteUnitFail);

    static PREREQS: [PrerequisiteSpec; 1] = [PrerequisiteSpec {
        implementation: "SuiteUnitFail",
        args: Json::Array(vec![]),
        kwargs: Json::Null,
    }];

    #[derive(Default)]
    struct SuiteUnitDependent;
    impl TestCase for SuiteUnitDependent {
        fn options() -> TestOptions {
            TestOptions {
                prerequisites: &PREREQS,
                ..TestOptions::new("suite_tests::SuiteUnitDependent", "suite_unit_dependent")
            }
        }
        fn procedure(&mut self, ctx: &Ctx, _a: Json, _k: Json) -> ProcedureResult {
            ctx.passed("ok")?;
            Ok(())
        }
    }
    register_testcase!(SuiteUnitDependent);

    fn new_suite() -> TestSuite {
        TestSuite::new(
            Arc::new(Config::default()),
            Arc::new(Bus::new()),
            std::env::temp_dir(),
            0,
            "suite",
            None,
        )
    }

    #[test]
    fn empty_suite_is_not_applicable() {
        let mut suite = new_suite();
        let outcome = suite.run();
        assert!(matches!(
            outcome,
            SuiteOutcome::Completed(Disposition::NotApplicable)
        ));
    }

    #[test]
    fn suite_aggregates_failed_over_passed() {
        let mut suite = new_suite();
        suite
            .add_test("suite_tests::SuiteUnitPass", Json::Array(vec![]), Json::Null)
            .unwrap();
        suite
            .add_test("suite_tests::SuiteUnitFail", Json::Array(vec![]), Json::Null)
            .unwrap();
        let outcome = suite.run();
        assert!(matches!(
            outcome,
            SuiteOutcome::Completed(Disposition::Failed)
        ));
    }

    #[test]
    fn unmet_prerequisite_marks_dependent_incomplete() {
        let mut suite = new_suite();
        // Dependent added alone: its prerequisite (SuiteUnitFail) gets
        // auto-inserted but will fail, so the dependent should be skipped
        // as Incomplete rather than crash.
        suite
            .add_test(
                "suite_tests::SuiteUnitDependent",
                Json::Array(vec![]),
                Json::Null,
            )
            .unwrap();
        let outcome = suite.run();
        // aggregate: prereq Failed, dependent Incomplete -> Failed wins
        assert!(matches!(
            outcome,
            SuiteOutcome::Completed(Disposition::Failed)
        ));
    }
}
