//! WISE-4050 REST interface
//!
//! A single authenticated GET of the digital input table.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::RestSensorConfig;
use crate::error::{Result, WiseError};

/// Path of the digital input table on slot 0
pub const DI_VALUE_PATH: &str = "/di_value/slot_0";

/// One digital input channel as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiValue {
    #[serde(rename = "Ch")]
    pub channel: i64,
    #[serde(rename = "Md")]
    pub mode: i64,
    #[serde(rename = "Stat")]
    pub status: i64,
    #[serde(rename = "Val")]
    pub value: i64,
    #[serde(rename = "Cnting")]
    pub counting: i64,
    #[serde(rename = "ClrCnt")]
    pub clear_count: i64,
    #[serde(rename = "OvLch")]
    pub over_latch: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiValueResponse {
    #[serde(rename = "DIVal", default)]
    pub di_val: Vec<DiValue>,
}

impl DiValueResponse {
    /// `{"channel0": {"mode": .., "status": .., ...}, ...}`
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .di_val
            .iter()
            .map(|di| {
                (
                    format!("channel{}", di.channel),
                    json!({
                        "mode": di.mode,
                        "status": di.status,
                        "value": di.value,
                        "counting": di.counting,
                        "clear_count": di.clear_count,
                        "over_latch": di.over_latch,
                    }),
                )
            })
            .collect();
        Value::Object(map)
    }
}

/// HTTP client for the device's REST interface
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
}

impl RestClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn url(config: &RestSensorConfig) -> String {
        format!("http://{}{}", config.device_ip.trim(), DI_VALUE_PATH)
    }

    /// Fetch and decode the digital input table
    pub async fn fetch_di_values(&self, config: &RestSensorConfig) -> Result<DiValueResponse> {
        let url = Self::url(config);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .basic_auth(&config.username, Some(&config.password))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(WiseError::http(format!("GET {} returned status {}", url, status)));
        }

        let body = response.json::<DiValueResponse>().await?;
        debug!("Received {} DI channels from {}", body.di_val.len(), url);
        Ok(body)
    }
}
