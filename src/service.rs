//! Service manager: a registry of named providers that tests and equipment
//! runtimes request over the signal bus rather than talking to (`service-want`
//! / `service-dontwant`), matching the source's `ServiceManager`/`Service`
//! contract (SPEC_FULL.md §4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use crate::coprocess::{Coprocess, CoprocessTask};
use crate::error::ServiceError;
use crate::signals::{signal, Bus, Payload, Receiver, ReceiverReturn, SenderFilter, SenderId};

/// Opaque identity for a needer, so a provider can key its idempotency
/// guard per-caller without needing the needer's concrete type.
pub type NeederId = SenderId;

/// Implemented by each built-in service provider.
pub trait Service: Send + Sync {
    /// Begin providing the service for `needer`. Idempotent per needer:
    /// a second `provide_for` for the same needer while already active is
    /// a no-op.
    fn provide_for(&self, needer: NeederId, kwargs: Json) -> Result<(), ServiceError>;

    /// Stop providing. If a coprocess was used, interrupts it and returns
    /// its final result (if any).
    fn release_for(&self, needer: NeederId, kwargs: Json) -> Result<Option<Json>, ServiceError>;

    /// Called on service-manager shutdown; must kill and reap any
    /// outstanding workers.
    fn close(&self);

    fn name(&self) -> &str;
}

/// Connects to `service-want`/`service-dontwant` and dispatches to whichever
/// provider is registered under the requested name.
pub struct ServiceManager {
    services: Mutex<HashMap<String, Arc<dyn Service>>>,
    sender: SenderId,
    bus: Mutex<Option<Arc<Bus>>>,
}

impl ServiceManager {
    pub fn new() -> Arc<Self> {
        Arc::new(ServiceManager {
            services: Mutex::new(HashMap::new()),
            sender: SenderId::new(),
            bus: Mutex::new(None),
        })
    }

    /// Connects this manager to the bus's `service-want`/`service-dontwant`
    /// signals with a strong reference, so it outlives any single sender.
    /// Also remembers the bus so `register` can emit `service-provide`.
    pub fn attach(self: &Arc<Self>, bus: &Arc<Bus>) {
        bus.connect_strong(signal::SERVICE_WANT, self.clone(), SenderFilter::Any);
        bus.connect_strong(signal::SERVICE_DONTWANT, self.clone(), SenderFilter::Any);
        *self.bus.lock().unwrap() = Some(bus.clone());
    }

    /// Registers `provider` under `name` and emits `service-provide` if this
    /// manager is already attached to a bus.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Service>) {
        let name = name.into();
        self.services
            .lock()
            .unwrap()
            .insert(name.clone(), provider);
        if let Some(bus) = self.bus.lock().unwrap().as_ref() {
            bus.send(self.sender, Payload::ServiceProvide { name });
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.lock().unwrap().remove(name)
    }

    pub fn fetch(&self, name: &str) -> Result<Arc<dyn Service>, ServiceError> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))
    }

    fn fulfill(&self, needer: SenderId, service: &str, kwargs: Json) -> ReceiverReturn {
        tracing::info!(service, needer = ?needer, "service-want");
        match self.fetch(service) {
            Ok(provider) => match provider.provide_for(needer, kwargs) {
                Ok(()) => ReceiverReturn::None,
                Err(e) => {
                    tracing::error!(service, error = %e, "service provide_for failed");
                    ReceiverReturn::None
                }
            },
            Err(e) => {
                tracing::error!(service, error = %e, "service-want for unregistered service");
                ReceiverReturn::None
            }
        }
    }

    fn release(&self, needer: SenderId, service: &str, kwargs: Json) -> ReceiverReturn {
        tracing::info!(service, needer = ?needer, "service-dontwant");
        match self.fetch(service) {
            Ok(provider) => match provider.release_for(needer, kwargs) {
                Ok(Some(value)) => ReceiverReturn::Json(value),
                Ok(None) => ReceiverReturn::None,
                Err(e) => {
                    tracing::warn!(service, error = %e, "service release_for failed");
                    ReceiverReturn::None
                }
            },
            Err(e) => {
                tracing::error!(service, error = %e, "service-dontwant for unregistered service");
                ReceiverReturn::None
            }
        }
    }

    /// Closes every registered provider, tolerating individual failures so
    /// every provider still gets a chance to clean up.
    pub fn close(&self) {
        let mut services = self.services.lock().unwrap();
        while let Some((name, provider)) = services.iter().next().map(|(k, v)| (k.clone(), v.clone())) {
            services.remove(&name);
            provider.close();
        }
    }

    pub fn sender(&self) -> SenderId {
        self.sender
    }
}

impl Receiver for ServiceManager {
    fn receive(&self, sender: SenderId, payload: &Payload) -> ReceiverReturn {
        match payload {
            Payload::ServiceWant { service, kwargs } => self.fulfill(sender, service, kwargs.clone()),
            Payload::ServiceDontwant { service, kwargs } => {
                self.release(sender, service, kwargs.clone())
            }
            _ => ReceiverReturn::None,
        }
    }

    fn receiver_name(&self) -> &str {
        "service-manager"
    }
}

/// Registers the crate's built-in providers (`seriallog`, `logcat`,
/// `monsoon`, `androidcpu`, `androidmemory`) against a fresh manager.
pub fn initialize(manager: &Arc<ServiceManager>, exe: PathBuf, logdir: PathBuf) {
    manager.register(
        "seriallog",
        Arc::new(SerialLogService::new(logdir.clone())) as Arc<dyn Service>,
    );
    manager.register(
        "logcat",
        Arc::new(CoprocessService::new("logcat", exe.clone(), CoprocessTask::Logcat)) as Arc<dyn Service>,
    );
    manager.register(
        "monsoon",
        Arc::new(CoprocessService::new("monsoon", exe.clone(), CoprocessTask::Monsoon)) as Arc<dyn Service>,
    );
    manager.register(
        "androidcpu",
        Arc::new(CoprocessService::new(
            "androidcpu",
            exe.clone(),
            CoprocessTask::AndroidCpu,
        )) as Arc<dyn Service>,
    );
    manager.register(
        "androidmemory",
        Arc::new(CoprocessService::new("androidmemory", exe, CoprocessTask::AndroidMemory))
            as Arc<dyn Service>,
    );
}

/// Opens a serial port per configured equipment and appends bytes to
/// `{logdir}/console_{name}.log` until released. The actual port is an
/// external collaborator; this tracks active capture sessions by needer.
pub struct SerialLogService {
    logdir: PathBuf,
    active: Mutex<HashMap<SenderId, tokio::task::JoinHandle<()>>>,
}

impl SerialLogService {
    pub fn new(logdir: PathBuf) -> Self {
        SerialLogService {
            logdir,
            active: Mutex::new(HashMap::new()),
        }
    }
}

impl Service for SerialLogService {
    fn provide_for(&self, needer: NeederId, kwargs: Json) -> Result<(), ServiceError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&needer) {
            return Ok(());
        }
        let name = kwargs
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or("device")
            .to_string();
        let path = self.logdir.join(format!("console_{name}.log"));
        let handle = tokio::spawn(async move {
            let _ = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
        });
        active.insert(needer, handle);
        Ok(())
    }

    fn release_for(&self, needer: NeederId, _kwargs: Json) -> Result<Option<Json>, ServiceError> {
        if let Some(handle) = self.active.lock().unwrap().remove(&needer) {
            handle.abort();
        }
        Ok(None)
    }

    fn close(&self) {
        let mut active = self.active.lock().unwrap();
        for (_, handle) in active.drain() {
            handle.abort();
        }
    }

    fn name(&self) -> &str {
        "seriallog"
    }
}

/// A provider whose `provide_for` spawns a coprocess running a continuous
/// sampling task, and whose `release_for` interrupts it and returns its
/// final aggregated result. Grounds `monsoon`/`logcat`/`androidcpu`/
/// `androidmemory`, which all share this same lifecycle shape.
pub struct CoprocessService {
    service_name: &'static str,
    exe: PathBuf,
    task: CoprocessTask,
    used: Mutex<HashMap<NeederId, Coprocess>>,
}

impl CoprocessService {
    pub fn new(service_name: &'static str, exe: PathBuf, task: CoprocessTask) -> Self {
        CoprocessService {
            service_name,
            exe,
            task,
            used: Mutex::new(HashMap::new()),
        }
    }
}

impl Service for CoprocessService {
    fn provide_for(&self, needer: NeederId, kwargs: Json) -> Result<(), ServiceError> {
        if self.used.lock().unwrap().contains_key(&needer) {
            return Ok(());
        }
        let exe = self.exe.clone();
        let service_name = self.service_name.to_string();
        let task = self.task;
        let coproc = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(Coprocess::start(&exe, &service_name, task, kwargs))
        })
        .map_err(|e| ServiceError::Other(e.to_string()))?;
        self.used.lock().unwrap().insert(needer, coproc);
        Ok(())
    }

    fn release_for(&self, needer: NeederId, _kwargs: Json) -> Result<Option<Json>, ServiceError> {
        let coproc = self.used.lock().unwrap().remove(&needer);
        let Some(mut coproc) = coproc else {
            return Ok(None);
        };
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                let _ = coproc.interrupt().await;
                coproc.wait().await.unwrap_or(None)
            })
        })
        .map_or(Ok(None), |v| Ok(Some(v)))
    }

    fn close(&self) {
        let mut used = self.used.lock().unwrap();
        for (_, mut coproc) in used.drain() {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = coproc.interrupt().await;
                    let _ = coproc.wait().await;
                });
            });
        }
    }

    fn name(&self) -> &str {
        self.service_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingService {
        provided: Mutex<u32>,
        released: Mutex<u32>,
    }

    impl Service for CountingService {
        fn provide_for(&self, _needer: NeederId, _kwargs: Json) -> Result<(), ServiceError> {
            *self.provided.lock().unwrap() += 1;
            Ok(())
        }

        fn release_for(&self, _needer: NeederId, _kwargs: Json) -> Result<Option<Json>, ServiceError> {
            *self.released.lock().unwrap() += 1;
            Ok(None)
        }

        fn close(&self) {}

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn fetch_unregistered_service_errors() {
        let mgr = ServiceManager::new();
        assert!(matches!(mgr.fetch("nope"), Err(ServiceError::NotRegistered(_))));
    }

    #[test]
    fn fulfill_dispatches_to_registered_provider() {
        let mgr = ServiceManager::new();
        let svc = Arc::new(CountingService {
            provided: Mutex::new(0),
            released: Mutex::new(0),
        });
        mgr.register("counting", svc.clone());
        let needer = SenderId::new();
        mgr.fulfill(needer, "counting", Json::Null);
        assert_eq!(*svc.provided.lock().unwrap(), 1);
        mgr.release(needer, "counting", Json::Null);
        assert_eq!(*svc.released.lock().unwrap(), 1);
    }

    #[test]
    fn unregister_removes_from_registry() {
        let mgr = ServiceManager::new();
        let svc = Arc::new(CountingService {
            provided: Mutex::new(0),
            released: Mutex::new(0),
        });
        mgr.register("counting", svc);
        assert!(mgr.unregister("counting").is_some());
        assert!(mgr.fetch("counting").is_err());
    }

    #[test]
    fn register_emits_service_provide_once_attached() {
        struct Catcher {
            names: Mutex<Vec<String>>,
        }
        impl Receiver for Catcher {
            fn receive(&self, _sender: SenderId, payload: &Payload) -> ReceiverReturn {
                if let Payload::ServiceProvide { name } = payload {
                    self.names.lock().unwrap().push(name.clone());
                }
                ReceiverReturn::None
            }
        }

        let bus = Arc::new(Bus::new());
        let catcher = Arc::new(Catcher {
            names: Mutex::new(Vec::new()),
        });
        let catcher_dyn: Arc<dyn Receiver> = catcher.clone();
        bus.connect_strong(signal::SERVICE_PROVIDE, catcher_dyn, SenderFilter::Any);

        let mgr = ServiceManager::new();
        mgr.attach(&bus);
        let svc = Arc::new(CountingService {
            provided: Mutex::new(0),
            released: Mutex::new(0),
        });
        mgr.register("counting", svc);
        assert_eq!(*catcher.names.lock().unwrap(), vec!["counting".to_string()]);
    }
}
