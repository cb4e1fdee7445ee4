//! REST sensor variant
//!
//! Stateless apart from its config: every reading is one authenticated GET.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ModelName, Registration, Sensor, SensorFactory, DESCRIPTION, PRETTY_NAME};
use crate::config::RestSensorConfig;
use crate::error::{Result, WiseError};
use crate::protocols::rest::{DiValueResponse, RestClient};

pub fn model() -> ModelName {
    ModelName::new("advantech", "wise-4050", "restapi")
}

struct State {
    closed: bool,
    config: Arc<RestSensorConfig>,
    client: RestClient,
}

/// WISE-4050 sensor read over the vendor REST interface
pub struct RestSensor {
    name: String,
    state: RwLock<State>,
}

impl RestSensor {
    pub fn new(name: &str, config: &RestSensorConfig) -> Result<Self> {
        info!("Starting {} {}", PRETTY_NAME, name);
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            state: RwLock::new(State {
                closed: false,
                client: RestClient::new(config.timeout())?,
                config: Arc::new(config.clone()),
            }),
        })
    }

    /// Fetch the digital input table
    pub async fn read(&self) -> Result<DiValueResponse> {
        let (client, config) = {
            let state = self.state.read().await;
            if state.closed {
                return Err(WiseError::closed(&self.name));
            }
            (state.client.clone(), Arc::clone(&state.config))
        };
        client.fetch_di_values(&config).await
    }

    pub async fn reconfigure(&self, config: &RestSensorConfig) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(WiseError::closed(&self.name));
        }
        config.validate()?;
        debug!("Reconfiguring {} {}", PRETTY_NAME, self.name);
        state.client = RestClient::new(config.timeout())?;
        state.config = Arc::new(config.clone());
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.closed {
            state.closed = true;
            info!("Closed {} {}", PRETTY_NAME, self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl Sensor for RestSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> ModelName {
        model()
    }

    async fn readings(&self) -> Result<Value> {
        Ok(self.read().await?.to_json())
    }

    async fn do_command(&self, _command: &Map<String, Value>) -> Result<Value> {
        if self.state.read().await.closed {
            return Err(WiseError::closed(&self.name));
        }
        Err(WiseError::unsupported(format!(
            "{} does not accept commands",
            model()
        )))
    }

    async fn reconfigure(&self, config: &Value) -> Result<()> {
        let config = RestSensorConfig::from_value(config)?;
        RestSensor::reconfigure(self, &config).await
    }

    async fn close(&self) -> Result<()> {
        RestSensor::close(self).await
    }
}

struct RestSensorFactory;

#[async_trait]
impl SensorFactory for RestSensorFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Sensor>> {
        let config = RestSensorConfig::from_value(config)?;
        Ok(Box::new(RestSensor::new(name, &config)?))
    }
}

pub fn registration() -> Registration {
    Registration {
        model: model(),
        pretty_name: PRETTY_NAME,
        description: DESCRIPTION,
        factory: Arc::new(RestSensorFactory),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn config() -> RestSensorConfig {
        RestSensorConfig {
            device_ip: "10.1.14.38".to_string(),
            username: "root".to_string(),
            password: "00000000".to_string(),
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_do_command_unsupported() {
        let sensor = RestSensor::new("wise-rest", &config()).unwrap();
        let err = sensor.do_command(&Map::new()).await.unwrap_err();
        assert!(matches!(err, WiseError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_missing_password_rejected() {
        let mut bad = config();
        bad.password.clear();
        assert!(matches!(
            RestSensor::new("wise-rest", &bad).err().unwrap(),
            WiseError::Config(_)
        ));

        let sensor = RestSensor::new("wise-rest", &config()).unwrap();
        assert!(sensor.reconfigure(&bad).await.is_err());
        assert_eq!(sensor.state.read().await.config.password, "00000000");
    }

    #[tokio::test]
    async fn test_closed_sensor_rejects_operations() {
        let sensor = RestSensor::new("wise-rest", &config()).unwrap();
        sensor.close().await.unwrap();
        sensor.close().await.unwrap();
        assert!(matches!(sensor.read().await, Err(WiseError::Closed(_))));
        assert!(matches!(
            sensor.do_command(&Map::new()).await,
            Err(WiseError::Closed(_))
        ));
    }
}
