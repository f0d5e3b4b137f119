//! The synchronous publish/subscribe signal bus.
//!
//! Every other subsystem — reports, the service manager, the testbed runtime
//! — talks to the rest of the framework exclusively through named signals.
//! Delivery is synchronous, single-threaded, and happens in the sender's own
//! call context: `send` walks the receiver list for that signal name in
//! registration order and invokes each one, in order, right there.
//!
//! A receiver that panics does not stop delivery to the receivers after it;
//! the panic is caught, logged, and swallowed. This mirrors the source's
//! "exception in a receiver is logged and the sender never sees it" rule.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

/// Opaque, cheaply-comparable identity for a signal sender (or the `sender`
/// argument to `connect`). Every object that can send or be filtered on
/// (test cases, suites, the runner, reports, controllers...) owns one,
/// minted once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(u64);

static NEXT_SENDER_ID: AtomicU64 = AtomicU64::new(1);

impl SenderId {
    pub fn new() -> Self {
        SenderId(NEXT_SENDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender filter for a subscription: match everything, or match a single
/// sender identity exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderFilter {
    Any,
    Only(SenderId),
}

impl SenderFilter {
    fn matches(self, sender: SenderId) -> bool {
        match self {
            SenderFilter::Any => true,
            SenderFilter::Only(id) => id == sender,
        }
    }
}

/// The fixed-schema payload carried by each signal in the catalog (§4.1).
/// One variant per signal; the field set is the signal's contract.
#[derive(Debug, Clone)]
pub enum Payload {
    TestStart { time: DateTime<Utc> },
    TestVersion { version: String },
    TestArguments { arguments: String },
    TestPassed { message: String },
    TestFailure { message: String },
    TestExpectedFailure { message: String },
    TestIncomplete { message: String },
    TestAbort { message: String },
    TestInfo { message: String },
    TestWarning { message: String },
    TestDiagnostic { message: String },
    TestData { data: Json },
    TestEnd { time: DateTime<Utc> },
    SuiteStart { time: DateTime<Utc> },
    SuiteEnd { time: DateTime<Utc> },
    SuiteSummary { disposition: crate::disposition::Disposition },
    SuiteInfo { message: String },
    RunStart { time: DateTime<Utc> },
    RunEnd { time: DateTime<Utc> },
    RunError { message: String },
    ReportTestbed { testbed: String },
    ReportComment { message: String },
    ReportFinal,
    LogdirLocation { path: String },
    TargetBuild { build: String, variant: String },
    TargetModel { model: String },
    ServiceWant { service: String, kwargs: Json },
    ServiceDontwant { service: String, kwargs: Json },
    ServiceProvide { name: String },
    ServiceStart { name: String },
    ServiceStop { name: String },
    DeviceChange { new_state: Json },
    DataConvert { data: Json, config: Json },
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::TestStart { .. } => signal::TEST_START,
            Payload::TestVersion { .. } => signal::TEST_VERSION,
            Payload::TestArguments { .. } => signal::TEST_ARGUMENTS,
            Payload::TestPassed { .. } => signal::TEST_PASSED,
            Payload::TestFailure { .. } => signal::TEST_FAILURE,
            Payload::TestExpectedFailure { .. } => signal::TEST_EXPECTED_FAILURE,
            Payload::TestIncomplete { .. } => signal::TEST_INCOMPLETE,
            Payload::TestAbort { .. } => signal::TEST_ABORT,
            Payload::TestInfo { .. } => signal::TEST_INFO,
            Payload::TestWarning { .. } => signal::TEST_WARNING,
            Payload::TestDiagnostic { .. } => signal::TEST_DIAGNOSTIC,
            Payload::TestData { .. } => signal::TEST_DATA,
            Payload::TestEnd { .. } => signal::TEST_END,
            Payload::SuiteStart { .. } => signal::SUITE_START,
            Payload::SuiteEnd { .. } => signal::SUITE_END,
            Payload::SuiteSummary { .. } => signal::SUITE_SUMMARY,
            Payload::SuiteInfo { .. } => signal::SUITE_INFO,
            Payload::RunStart { .. } => signal::RUN_START,
            Payload::RunEnd { .. } => signal::RUN_END,
            Payload::RunError { .. } => signal::RUN_ERROR,
            Payload::ReportTestbed { .. } => signal::REPORT_TESTBED,
            Payload::ReportComment { .. } => signal::REPORT_COMMENT,
            Payload::ReportFinal => signal::REPORT_FINAL,
            Payload::LogdirLocation { .. } => signal::LOGDIR_LOCATION,
            Payload::TargetBuild { .. } => signal::TARGET_BUILD,
            Payload::TargetModel { .. } => signal::TARGET_MODEL,
            Payload::ServiceWant { .. } => signal::SERVICE_WANT,
            Payload::ServiceDontwant { .. } => signal::SERVICE_DONTWANT,
            Payload::ServiceProvide { .. } => signal::SERVICE_PROVIDE,
            Payload::ServiceStart { .. } => signal::SERVICE_START,
            Payload::ServiceStop { .. } => signal::SERVICE_STOP,
            Payload::DeviceChange { .. } => signal::DEVICE_CHANGE,
            Payload::DataConvert { .. } => signal::DATA_CONVERT,
        }
    }
}

/// Signal name constants (the catalog from SPEC_FULL.md §4.1).
pub mod signal {
    pub const TEST_START: &str = "test-start";
    pub const TEST_VERSION: &str = "test-version";
    pub const TEST_ARGUMENTS: &str = "test-arguments";
    pub const TEST_PASSED: &str = "test-passed";
    pub const TEST_FAILURE: &str = "test-failure";
    pub const TEST_EXPECTED_FAILURE: &str = "test-expected-failure";
    pub const TEST_INCOMPLETE: &str = "test-incomplete";
    pub const TEST_ABORT: &str = "test-abort";
    pub const TEST_INFO: &str = "test-info";
    pub const TEST_WARNING: &str = "test-warning";
    pub const TEST_DIAGNOSTIC: &str = "test-diagnostic";
    pub const TEST_DATA: &str = "test-data";
    pub const TEST_END: &str = "test-end";
    pub const SUITE_START: &str = "suite-start";
    pub const SUITE_END: &str = "suite-end";
    pub const SUITE_SUMMARY: &str = "suite-summary";
    pub const SUITE_INFO: &str = "suite-info";
    pub const RUN_START: &str = "run-start";
    pub const RUN_END: &str = "run-end";
    pub const RUN_ERROR: &str = "run-error";
    pub const REPORT_TESTBED: &str = "report-testbed";
    pub const REPORT_COMMENT: &str = "report-comment";
    pub const REPORT_FINAL: &str = "report-final";
    pub const LOGDIR_LOCATION: &str = "logdir-location";
    pub const TARGET_BUILD: &str = "target-build";
    pub const TARGET_MODEL: &str = "target-model";
    pub const SERVICE_WANT: &str = "service-want";
    pub const SERVICE_DONTWANT: &str = "service-dontwant";
    pub const SERVICE_PROVIDE: &str = "service-provide";
    pub const SERVICE_START: &str = "service-start";
    pub const SERVICE_STOP: &str = "service-stop";
    pub const DEVICE_CHANGE: &str = "device-change";
    pub const DATA_CONVERT: &str = "data-convert";
}

/// A value a receiver may hand back to `send`. Almost every signal's return
/// values are ignored by the bus's callers; `service-want` and `data-convert`
/// are the two signals whose return values are actually inspected.
#[derive(Debug, Clone)]
pub enum ReceiverReturn {
    None,
    Json(Json),
}

/// Implemented by anything that wants to receive signal deliveries. Kept as
/// a trait object (rather than a bare closure) so receivers can be held
/// weakly: a `Weak<dyn Receiver>` can be constructed from any `Arc<T: Receiver>`.
pub trait Receiver: Send + Sync {
    fn receive(&self, sender: SenderId, payload: &Payload) -> ReceiverReturn;

    /// A short name used in logging when this receiver panics.
    fn receiver_name(&self) -> &str {
        "<receiver>"
    }
}

enum Subscriber {
    Strong(Arc<dyn Receiver>),
    Weak(Weak<dyn Receiver>),
}

struct Subscription {
    subscriber: Subscriber,
    sender_filter: SenderFilter,
    id: u64,
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// A handle returned by `connect`, used to `disconnect` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The bus itself: one ordered subscriber list per signal name.
#[derive(Default)]
pub struct Bus {
    channels: Mutex<HashMap<&'static str, Vec<Subscription>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strong (`Arc`-owning) subscription. Used by subscribers
    /// that outlive any single sender: report sinks, the service manager.
    pub fn connect_strong(
        &self,
        signal_name: &'static str,
        receiver: Arc<dyn Receiver>,
        sender_filter: SenderFilter,
    ) -> SubscriptionId {
        self.insert(
            signal_name,
            Subscriber::Strong(receiver),
            sender_filter,
        )
    }

    /// Registers a weak subscription. Once the referenced `Arc` is dropped
    /// elsewhere, the entry is skipped on delivery and pruned lazily.
    pub fn connect_weak(
        &self,
        signal_name: &'static str,
        receiver: &Arc<dyn Receiver>,
        sender_filter: SenderFilter,
    ) -> SubscriptionId {
        self.insert(
            signal_name,
            Subscriber::Weak(Arc::downgrade(receiver)),
            sender_filter,
        )
    }

    fn insert(
        &self,
        signal_name: &'static str,
        subscriber: Subscriber,
        sender_filter: SenderFilter,
    ) -> SubscriptionId {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(signal_name)
            .or_default()
            .push(Subscription {
                subscriber,
                sender_filter,
                id,
            });
        SubscriptionId(id)
    }

    /// Removes a single subscription by the handle `connect_*` returned.
    pub fn disconnect(&self, signal_name: &'static str, subscription: SubscriptionId) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subs) = channels.get_mut(signal_name) {
            subs.retain(|s| s.id != subscription.0);
        }
    }

    /// Delivers `payload` (sent by `sender`) to every matching receiver for
    /// `payload.name()`, in registration order. Returns each receiver's
    /// return value alongside nothing else — the bus has no notion of
    /// "receiver identity" beyond the sender filter it matched.
    pub fn send(&self, sender: SenderId, payload: Payload) -> Vec<ReceiverReturn> {
        let signal_name = payload.name();
        // Snapshot the subscriber list under the lock, then invoke outside
        // of it: a receiver may itself call connect/disconnect/send.
        let snapshot: Vec<(Subscriber, SenderFilter)> = {
            let mut channels = self.channels.lock().unwrap();
            let Some(subs) = channels.get_mut(signal_name) else {
                return Vec::new();
            };
            // Prune dead weak entries lazily.
            subs.retain(|s| match &s.subscriber {
                Subscriber::Weak(w) => w.strong_count() > 0,
                Subscriber::Strong(_) => true,
            });
            subs.iter()
                .map(|s| {
                    let sub = match &s.subscriber {
                        Subscriber::Strong(arc) => Subscriber::Strong(arc.clone()),
                        Subscriber::Weak(weak) => Subscriber::Weak(weak.clone()),
                    };
                    (sub, s.sender_filter)
                })
                .collect()
        };

        let mut results = Vec::with_capacity(snapshot.len());
        for (subscriber, filter) in snapshot {
            if !filter.matches(sender) {
                continue;
            }
            let receiver: Arc<dyn Receiver> = match subscriber {
                Subscriber::Strong(arc) => arc,
                Subscriber::Weak(weak) => match weak.upgrade() {
                    Some(arc) => arc,
                    None => continue,
                },
            };
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                receiver.receive(sender, &payload)
            }));
            match outcome {
                Ok(ret) => results.push(ret),
                Err(panic) => {
                    let msg = panic_message(&panic);
                    tracing::error!(
                        signal = signal_name,
                        receiver = receiver.receiver_name(),
                        "signal receiver panicked: {msg}"
                    );
                }
            }
        }
        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Receiver for Recorder {
        fn receive(&self, _sender: SenderId, payload: &Payload) -> ReceiverReturn {
            self.calls.lock().unwrap().push(payload.name().to_string());
            ReceiverReturn::None
        }
    }

    struct Panicker;
    impl Receiver for Panicker {
        fn receive(&self, _sender: SenderId, _payload: &Payload) -> ReceiverReturn {
            panic!("boom");
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = Bus::new();
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        struct Tagged(u32, Arc<Mutex<Vec<u32>>>);
        impl Receiver for Tagged {
            fn receive(&self, _sender: SenderId, _payload: &Payload) -> ReceiverReturn {
                self.1.lock().unwrap().push(self.0);
                ReceiverReturn::None
            }
        }

        let a: Arc<dyn Receiver> = Arc::new(Tagged(1, order.clone()));
        let b: Arc<dyn Receiver> = Arc::new(Tagged(2, order.clone()));
        bus.connect_strong(signal::TEST_INFO, a, SenderFilter::Any);
        bus.connect_strong(signal::TEST_INFO, b, SenderFilter::Any);

        let sender = SenderId::new();
        bus.send(
            sender,
            Payload::TestInfo {
                message: "hi".into(),
            },
        );
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_receiver_does_not_block_later_receivers() {
        let bus = Bus::new();
        let panicker: Arc<dyn Receiver> = Arc::new(Panicker);
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let recorder_dyn: Arc<dyn Receiver> = recorder.clone();
        bus.connect_strong(signal::TEST_INFO, panicker, SenderFilter::Any);
        bus.connect_strong(signal::TEST_INFO, recorder_dyn, SenderFilter::Any);

        let sender = SenderId::new();
        bus.send(
            sender,
            Payload::TestInfo {
                message: "hi".into(),
            },
        );
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn sender_filter_restricts_delivery() {
        let bus = Bus::new();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let recorder_dyn: Arc<dyn Receiver> = recorder.clone();
        let target = SenderId::new();
        bus.connect_strong(
            signal::TEST_INFO,
            recorder_dyn,
            SenderFilter::Only(target),
        );

        let other = SenderId::new();
        bus.send(
            other,
            Payload::TestInfo {
                message: "skip me".into(),
            },
        );
        assert_eq!(recorder.calls.lock().unwrap().len(), 0);

        bus.send(
            target,
            Payload::TestInfo {
                message: "deliver me".into(),
            },
        );
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn weak_subscription_is_pruned_after_drop() {
        let bus = Bus::new();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let dyn_recorder: Arc<dyn Receiver> = recorder.clone();
        bus.connect_weak(signal::TEST_INFO, &dyn_recorder, SenderFilter::Any);
        drop(dyn_recorder);
        drop(recorder);

        let sender = SenderId::new();
        // Should not panic even though the receiver is gone.
        let results = bus.send(
            sender,
            Payload::TestInfo {
                message: "nobody home".into(),
            },
        );
        assert!(results.is_empty());
    }

    #[test]
    fn disconnect_removes_only_that_subscription() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);
        impl Receiver for Counting {
            fn receive(&self, _sender: SenderId, _payload: &Payload) -> ReceiverReturn {
                self.0.fetch_add(1, Ordering::SeqCst);
                ReceiverReturn::None
            }
        }

        let r1: Arc<dyn Receiver> = Arc::new(Counting(counter.clone()));
        let r2: Arc<dyn Receiver> = Arc::new(Counting(counter.clone()));
        let sub1 = bus.connect_strong(signal::TEST_INFO, r1, SenderFilter::Any);
        bus.connect_strong(signal::TEST_INFO, r2, SenderFilter::Any);

        bus.disconnect(signal::TEST_INFO, sub1);

        let sender = SenderId::new();
        bus.send(
            sender,
            Payload::TestInfo {
                message: "x".into(),
            },
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
