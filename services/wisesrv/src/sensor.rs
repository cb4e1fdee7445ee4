//! Sensor resources and their registry
//!
//! Both WISE-4050 variants implement [`Sensor`]. Hosts build sensors through
//! an explicitly constructed [`SensorRegistry`]; nothing is registered
//! through global state.
//!
//! ## Usage
//!
//! Adding a variant requires only 2 changes:
//! 1. Implement `SensorFactory` for it
//! 2. Register it in `default_registry()`

pub mod modbus;
pub mod rest;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Result, WiseError};

pub use modbus::ModbusSensor;
pub use rest::RestSensor;

/// Marketing name shared by both variants
pub const PRETTY_NAME: &str = "WISE-4050 4DI/4DO 2.4G WiFi IoT Wireless I/O Module";

pub const DESCRIPTION: &str = "WISE-4000 series Ethernet-based IoT I/O module with integrated \
                               data acquisition, processing and publishing functions";

/// Capabilities a host sees on every sensor
#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> ModelName;

    /// Fresh reading from the device
    async fn readings(&self) -> Result<Value>;

    async fn do_command(&self, command: &Map<String, Value>) -> Result<Value>;

    /// Replace the configuration from a raw config object
    async fn reconfigure(&self, config: &Value) -> Result<()>;

    /// Stop background work; later operations fail with `Closed`
    async fn close(&self) -> Result<()>;
}

/// Three-part model identifier, `namespace:family:name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelName {
    pub namespace: String,
    pub family: String,
    pub name: String,
}

impl ModelName {
    pub fn new(namespace: &str, family: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            family: family.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.family, self.name)
    }
}

impl FromStr for ModelName {
    type Err = WiseError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [namespace, family, name]
                if !namespace.is_empty() && !family.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(namespace, family, name))
            },
            _ => Err(WiseError::config(format!(
                "model '{}' must have the form namespace:family:name",
                s
            ))),
        }
    }
}

/// Builds sensors of one model from raw config
#[async_trait]
pub trait SensorFactory: Send + Sync {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Sensor>>;
}

/// Registration descriptor of one sensor model
#[derive(Clone)]
pub struct Registration {
    pub model: ModelName,
    pub pretty_name: &'static str,
    pub description: &'static str,
    pub factory: Arc<dyn SensorFactory>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("model", &self.model)
            .field("pretty_name", &self.pretty_name)
            .finish()
    }
}

/// Sensor models known to a host
#[derive(Debug, Default)]
pub struct SensorRegistry {
    registrations: HashMap<ModelName, Registration>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, replacing an earlier registration of the same name
    pub fn register(&mut self, registration: Registration) {
        self.registrations
            .insert(registration.model.clone(), registration);
    }

    pub fn get(&self, model: &ModelName) -> Option<&Registration> {
        self.registrations.get(model)
    }

    pub fn is_registered(&self, model: &ModelName) -> bool {
        self.registrations.contains_key(model)
    }

    /// Registered model names, sorted
    pub fn models(&self) -> Vec<ModelName> {
        let mut models: Vec<ModelName> = self.registrations.keys().cloned().collect();
        models.sort_by_key(|m| m.to_string());
        models
    }

    /// Construct a sensor of `model` named `name`
    pub async fn build(
        &self,
        model: &ModelName,
        name: &str,
        config: &Value,
    ) -> Result<Box<dyn Sensor>> {
        let registration = self
            .registrations
            .get(model)
            .ok_or_else(|| WiseError::unsupported(format!("unknown sensor model {}", model)))?;
        registration.factory.create(name, config).await
    }
}

/// Registry with the Modbus/TCP and REST variants
pub fn default_registry() -> SensorRegistry {
    let mut registry = SensorRegistry::new();
    registry.register(modbus::registration());
    registry.register(rest::registration());
    registry
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_name_parse() {
        let model: ModelName = "advantech:wise-4050:modbus".parse().unwrap();
        assert_eq!(model, ModelName::new("advantech", "wise-4050", "modbus"));
        assert_eq!(model.to_string(), "advantech:wise-4050:modbus");

        assert!("advantech:wise-4050".parse::<ModelName>().is_err());
        assert!("a::b".parse::<ModelName>().is_err());
    }

    #[test]
    fn test_default_registry_models() {
        let registry = default_registry();
        assert_eq!(
            registry.models(),
            vec![
                ModelName::new("advantech", "wise-4050", "modbus"),
                ModelName::new("advantech", "wise-4050", "restapi"),
            ]
        );
        let registration = registry.get(&modbus::model()).unwrap();
        assert_eq!(registration.pretty_name, PRETTY_NAME);
    }

    #[tokio::test]
    async fn test_build_unknown_model() {
        let registry = default_registry();
        let err = registry
            .build(&ModelName::new("acme", "x", "y"), "s1", &json!({}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WiseError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let registry = default_registry();
        let err = registry
            .build(&modbus::model(), "s1", &json!({"device_address": "10.1.14.38"}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WiseError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rest_sensor() {
        let registry = default_registry();
        let sensor = registry
            .build(
                &rest::model(),
                "wise-rest",
                &json!({"device_ip": "10.1.14.38", "username": "root", "password": "00000000"}),
            )
            .await
            .unwrap();
        assert_eq!(sensor.name(), "wise-rest");
        assert_eq!(sensor.model(), rest::model());
        sensor.close().await.unwrap();
    }
}
