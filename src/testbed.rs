//! Testbed and equipment runtime: a lazy-loading view over the persistent
//! equipment inventory that resolves role names to device controller
//! instances on demand (SPEC_FULL.md §4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use crate::error::ConfigError;
use crate::registry;
use crate::signals::{Bus, Payload, SenderId};

/// A single row of the equipment inventory, as loaded from the testbed's
/// backing store. This crate treats the inventory as an external collaborator;
/// `InventoryRow` is the flat shape a real inventory lookup is expected to
/// hand back.
#[derive(Debug, Clone)]
pub struct InventoryRow {
    pub name: String,
    pub serno: Option<String>,
    pub model_name: String,
    pub manufacturer: String,
    pub role: String,
    pub attributes: HashMap<String, Json>,
    pub login: Option<String>,
    pub password: Option<String>,
}

/// A flat attribute view of an equipment model row (manufacturer, model
/// name, plus whatever the model's own attributes carry).
#[derive(Debug, Clone)]
pub struct EquipmentModelRuntime {
    attributes: HashMap<String, Json>,
}

impl EquipmentModelRuntime {
    pub fn new(name: &str, manufacturer: &str, attributes: HashMap<String, Json>) -> Self {
        let mut d = attributes;
        d.insert("name".to_string(), Json::String(name.to_string()));
        d.insert(
            "manufacturer".to_string(),
            Json::String(manufacturer.to_string()),
        );
        EquipmentModelRuntime { attributes: d }
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.attributes.get(key)
    }

    pub fn name(&self) -> &str {
        self.attributes
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or_default()
    }
}

/// Implemented by anything that can drive a single piece of equipment
/// through its protocol. Owns its I/O resources; `close` releases them.
pub trait Controller: Send {
    fn close(&mut self);
}

/// A live controller slot: closed when replaced or dropped.
struct ControllerSlot<T: ?Sized> {
    value: Option<Box<T>>,
}

impl<T: ?Sized + Controller> ControllerSlot<T> {
    fn empty() -> Self {
        ControllerSlot { value: None }
    }

    fn clear(&mut self) {
        if let Some(mut v) = self.value.take() {
            v.close();
        }
    }
}

/// Runtime container of information about a single device in a testbed.
///
/// Lazily constructs controllers (the "device", an optional "initializer",
/// and an optional "console") on first access and tears them down when
/// cleared or finalized. Also provides mapping-style access to the
/// attributes the inventory defines for this equipment.
pub struct EquipmentRuntime {
    pub name: String,
    row: InventoryRow,
    debug: u8,
    attributes: Mutex<HashMap<String, Json>>,
    model: EquipmentModelRuntime,
    device: Mutex<ControllerSlot<dyn Controller>>,
    initializer: Mutex<ControllerSlot<dyn Controller>>,
    console: Mutex<ControllerSlot<dyn Controller>>,
    parent: Option<Box<EquipmentRuntime>>,
    components: Vec<EquipmentRuntime>,
    bus: Arc<Bus>,
    sender: SenderId,
}

impl EquipmentRuntime {
    pub fn new(row: InventoryRow, model: EquipmentModelRuntime, bus: Arc<Bus>, debug: u8) -> Self {
        let mut attrs = row.attributes.clone();
        attrs
            .entry("hostname".to_string())
            .or_insert_with(|| Json::String(row.name.clone()));
        attrs
            .entry("role".to_string())
            .or_insert_with(|| Json::String(row.role.clone()));
        if let Some(login) = &row.login {
            attrs.insert("login".to_string(), Json::String(login.clone()));
        }
        if let Some(password) = &row.password {
            attrs.insert("password".to_string(), Json::String(password.clone()));
        }
        EquipmentRuntime {
            name: row.name.clone(),
            row,
            debug,
            attributes: Mutex::new(attrs),
            model,
            device: Mutex::new(ControllerSlot::empty()),
            initializer: Mutex::new(ControllerSlot::empty()),
            console: Mutex::new(ControllerSlot::empty()),
            parent: None,
            components: Vec::new(),
            bus,
            sender: SenderId::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Json> {
        self.attributes.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Json) {
        self.attributes.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn model(&self) -> &EquipmentModelRuntime {
        &self.model
    }

    pub fn parent(&self) -> Option<&EquipmentRuntime> {
        self.parent.as_deref()
    }

    pub fn components(&self) -> &[EquipmentRuntime] {
        &self.components
    }

    pub fn primary_interface(&self) -> String {
        let admin = self
            .get("admin_interface")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "en0".to_string());
        admin
    }

    /// Composes a URL reachable from equipment attributes and, optionally,
    /// login credentials.
    pub fn url(
        &self,
        scheme: Option<&str>,
        port: Option<u16>,
        path: Option<&str>,
        with_account: bool,
    ) -> String {
        let attrs = self.attributes.lock().unwrap();
        let mut s = String::new();
        s.push_str(
            scheme
                .map(str::to_string)
                .or_else(|| attrs.get("serviceprotocol").and_then(Json::as_str).map(str::to_string))
                .unwrap_or_else(|| "http".to_string())
                .as_str(),
        );
        s.push_str("://");
        if with_account {
            if let Some(login) = attrs.get("login").and_then(Json::as_str) {
                s.push_str(login);
                if let Some(pwd) = attrs.get("password").and_then(Json::as_str) {
                    s.push(':');
                    s.push_str(pwd);
                }
                s.push('@');
            }
        }
        s.push_str(
            attrs
                .get("hostname")
                .and_then(Json::as_str)
                .unwrap_or(&self.name),
        );
        let port = port.or_else(|| {
            attrs
                .get("serviceport")
                .and_then(Json::as_u64)
                .map(|p| p as u16)
        });
        if let Some(port) = port {
            s.push(':');
            s.push_str(&port.to_string());
        }
        s.push_str(
            path.or_else(|| attrs.get("servicepath").and_then(Json::as_str))
                .unwrap_or("/"),
        );
        s
    }

    /// Role's controller, constructed on first access via the factory
    /// registered under this equipment's role.
    pub fn device(&self) -> Result<(), ConfigError> {
        let mut slot = self.device.lock().unwrap();
        if slot.value.is_none() {
            let reg = registry::lookup_controller(&self.row.role).ok_or_else(|| {
                ConfigError::NotFound(format!(
                    "no controller registered for role {:?}",
                    self.row.role
                ))
            })?;
            let ctrl = (reg.factory)(self).map_err(|e| {
                ConfigError::Other(format!(
                    "controller for {:?} could not be created: {e}",
                    self.row.role
                ))
            })?;
            slot.value = Some(ctrl);
        }
        Ok(())
    }

    pub fn clear_device(&self) {
        self.device.lock().unwrap().clear();
    }

    /// An auxiliary controller used to bring the real device up, selected
    /// by an `initializer` attribute on the equipment or its model.
    pub fn initializer(&self) -> Result<(), ConfigError> {
        let mut slot = self.initializer.lock().unwrap();
        if slot.value.is_none() {
            let iobjname = self
                .get("initializer")
                .and_then(|v| v.as_str().map(str::to_string))
                .or_else(|| self.model.get("initializer").and_then(Json::as_str).map(str::to_string))
                .ok_or_else(|| {
                    ConfigError::Other("'initializer' is not defined in properties".to_string())
                })?;
            let reg = registry::lookup_controller(&iobjname).ok_or_else(|| {
                ConfigError::NotFound(format!("initializer {iobjname:?} could not be created"))
            })?;
            let ctrl = (reg.factory)(self)
                .map_err(|e| ConfigError::Other(format!("initializer {iobjname:?}: {e}")))?;
            slot.value = Some(ctrl);
        }
        Ok(())
    }

    pub fn clear_initializer(&self) {
        self.initializer.lock().unwrap().clear();
    }

    /// Console transport (serial port or terminal-server proxy), built
    /// from this equipment's `console` attribute. Requests the `seriallog`
    /// service be relinquished while we hold the port ourselves.
    pub fn console(&self) -> Result<(), ConfigError> {
        let mut slot = self.console.lock().unwrap();
        if slot.value.is_none() {
            if self.get("console").is_none() {
                return Err(ConfigError::Other(
                    "equipment has no console config".to_string(),
                ));
            }
            self.service_dontwant("seriallog", Json::Null);
            let reg = registry::lookup_controller("console").ok_or_else(|| {
                ConfigError::NotFound("no console controller registered".to_string())
            })?;
            let ctrl = (reg.factory)(self)
                .map_err(|e| ConfigError::Other(format!("console could not be created: {e}")))?;
            slot.value = Some(ctrl);
        }
        Ok(())
    }

    pub fn clear_console(&self) {
        self.console.lock().unwrap().clear();
        self.service_want("seriallog", Json::Null);
    }

    pub fn service_want(&self, name: &str, kwargs: Json) {
        self.bus.send(
            self.sender,
            Payload::ServiceWant {
                service: name.to_string(),
                kwargs,
            },
        );
    }

    pub fn service_dontwant(&self, name: &str, kwargs: Json) {
        self.bus.send(
            self.sender,
            Payload::ServiceDontwant {
                service: name.to_string(),
                kwargs,
            },
        );
    }

    /// Invalidates the cached device controller in response to a
    /// `device-change` signal and records the new state in-memory.
    pub fn on_device_change(&self, new_state: &Json) {
        self.device.lock().unwrap().clear();
        self.set("state", new_state.clone());
    }

    pub fn finalize(&self) {
        self.device.lock().unwrap().clear();
        self.initializer.lock().unwrap().clear();
        self.console.lock().unwrap().clear();
    }
}

/// Runtime container of information about software defined in the testbed
/// under the `SUT` role.
pub struct SoftwareRuntime {
    pub name: String,
    pub version: String,
    attributes: HashMap<String, Json>,
}

impl SoftwareRuntime {
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.attributes.get(key)
    }
}

/// Top-level runtime container of a testbed: factory functions for roles,
/// plus a mapping interface over attributes the inventory defines.
pub struct TestbedRuntime {
    pub name: String,
    debug: u8,
    attributes: Mutex<HashMap<String, Json>>,
    roles: HashMap<String, InventoryRow>,
    models: HashMap<String, EquipmentModelRuntime>,
    sut: Option<SoftwareRuntime>,
    supported_roles: Vec<String>,
    cache: Mutex<HashMap<String, Arc<EquipmentRuntime>>>,
    bus: Arc<Bus>,
    claimed: Mutex<bool>,
}

impl TestbedRuntime {
    pub fn new(
        name: impl Into<String>,
        attributes: HashMap<String, Json>,
        roles: HashMap<String, InventoryRow>,
        models: HashMap<String, EquipmentModelRuntime>,
        sut: Option<SoftwareRuntime>,
        bus: Arc<Bus>,
        debug: u8,
    ) -> Self {
        let supported_roles = roles.keys().cloned().collect();
        TestbedRuntime {
            name: name.into(),
            debug,
            attributes: Mutex::new(attributes),
            roles,
            models,
            sut,
            supported_roles,
            cache: Mutex::new(HashMap::new()),
            bus,
            claimed: Mutex::new(false),
        }
    }

    pub fn get(&self, key: &str) -> Option<Json> {
        self.attributes.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Json) {
        self.attributes.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn supported_roles(&self) -> &[String] {
        &self.supported_roles
    }

    /// Marks this testbed as claimed for the duration of a run. A testbed
    /// already claimed by another run refuses a second claim.
    pub fn claim(&self) -> Result<(), crate::error::AbortError> {
        let mut claimed = self.claimed.lock().unwrap();
        if *claimed {
            return Err(crate::error::AbortError::Run(format!(
                "testbed {:?} is already claimed",
                self.name
            )));
        }
        *claimed = true;
        Ok(())
    }

    pub fn release(&self) {
        *self.claimed.lock().unwrap() = false;
    }

    fn get_or_build(&self, rolename: &str) -> Result<Arc<EquipmentRuntime>, ConfigError> {
        if let Some(eq) = self.cache.lock().unwrap().get(rolename) {
            return Ok(eq.clone());
        }
        let row = self.roles.get(rolename).cloned().ok_or_else(|| {
            ConfigError::NotFound(format!("no equipment fills role {rolename:?}"))
        })?;
        let model = self
            .models
            .get(&row.model_name)
            .cloned()
            .unwrap_or_else(|| {
                EquipmentModelRuntime::new(&row.model_name, &row.manufacturer, HashMap::new())
            });
        let eq = Arc::new(EquipmentRuntime::new(row, model, self.bus.clone(), self.debug));
        self.cache
            .lock()
            .unwrap()
            .insert(rolename.to_string(), eq.clone());
        Ok(eq)
    }

    pub fn dut(&self) -> Result<Arc<EquipmentRuntime>, ConfigError> {
        self.get_role("DUT")
    }

    pub fn sut(&self) -> Result<&SoftwareRuntime, ConfigError> {
        self.sut
            .as_ref()
            .ok_or_else(|| ConfigError::NotFound("no SUT defined for this testbed".to_string()))
    }

    pub fn get_role(&self, rolename: &str) -> Result<Arc<EquipmentRuntime>, ConfigError> {
        self.get_or_build(rolename)
    }

    pub fn get_equipment(&self, name: &str, role: &str) -> Result<Arc<EquipmentRuntime>, ConfigError> {
        if let Some(eq) = self.cache.lock().unwrap().get(name) {
            return Ok(eq.clone());
        }
        let row = self
            .roles
            .values()
            .find(|r| r.name.contains(name))
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(format!("bad equipment name {name:?}")))?;
        let model = self
            .models
            .get(&row.model_name)
            .cloned()
            .unwrap_or_else(|| {
                EquipmentModelRuntime::new(&row.model_name, &row.manufacturer, HashMap::new())
            });
        let eq = Arc::new(EquipmentRuntime::new(row, model, self.bus.clone(), self.debug));
        let _ = role;
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), eq.clone());
        Ok(eq)
    }

    pub fn finalize(&self) {
        let mut cache = self.cache.lock().unwrap();
        for (_, eq) in cache.drain() {
            eq.finalize();
        }
    }
}

impl Clone for EquipmentModelRuntime {
    fn clone(&self) -> Self {
        EquipmentModelRuntime {
            attributes: self.attributes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, role: &str) -> InventoryRow {
        InventoryRow {
            name: name.to_string(),
            serno: None,
            model_name: "generic".to_string(),
            manufacturer: "acme".to_string(),
            role: role.to_string(),
            attributes: HashMap::new(),
            login: None,
            password: None,
        }
    }

    #[test]
    fn get_role_caches_equipment_runtime() {
        let mut roles = HashMap::new();
        roles.insert("DUT".to_string(), row("dut0", "DUT"));
        let tb = TestbedRuntime::new(
            "t1",
            HashMap::new(),
            roles,
            HashMap::new(),
            None,
            Arc::new(Bus::new()),
            0,
        );
        let a = tb.get_role("DUT").unwrap();
        let b = tb.get_role("DUT").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_role_missing_is_config_error() {
        let tb = TestbedRuntime::new(
            "t1",
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            None,
            Arc::new(Bus::new()),
            0,
        );
        assert!(matches!(tb.get_role("DUT"), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn claim_twice_aborts() {
        let tb = TestbedRuntime::new(
            "t1",
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            None,
            Arc::new(Bus::new()),
            0,
        );
        tb.claim().unwrap();
        assert!(tb.claim().is_err());
        tb.release();
        assert!(tb.claim().is_ok());
    }

    #[test]
    fn url_composes_scheme_host_port_path() {
        let mut roles = HashMap::new();
        let mut r = row("dut0", "DUT");
        r.attributes
            .insert("hostname".to_string(), Json::String("dut0.lan".to_string()));
        roles.insert("DUT".to_string(), r);
        let tb = TestbedRuntime::new(
            "t1",
            HashMap::new(),
            roles,
            HashMap::new(),
            None,
            Arc::new(Bus::new()),
            0,
        );
        let eq = tb.dut().unwrap();
        assert_eq!(eq.url(Some("http"), Some(8080), Some("/x"), false), "http://dut0.lan:8080/x");
    }
}
