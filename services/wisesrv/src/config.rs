//! Sensor configuration
//!
//! Raw configs mirror the inbound JSON/YAML objects. `validate()` turns a raw
//! Modbus config into an immutable [`DeviceConfig`] snapshot; nothing is
//! silently defaulted except the optional tuning fields.

use std::net::Ipv6Addr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, WiseError};
use crate::protocols::modbus::constants::{
    DEFAULT_SLAVE_ID, DEFAULT_TIMEOUT_MS, MODBUS_MAX_READ_COILS,
};

/// Accepts `"502"` as well as `502`
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

fn default_slave_id() -> u8 {
    DEFAULT_SLAVE_ID
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Coil block as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoilBlockConfig {
    pub base_address: i64,
    pub length: i64,
}

impl CoilBlockConfig {
    fn validate(&self, field: &str) -> Result<CoilBlock> {
        if self.base_address < 0 || self.base_address > i64::from(u16::MAX) {
            return Err(WiseError::config(format!(
                "{}.base_address {} is outside 0..=65535",
                field, self.base_address
            )));
        }
        if self.length < 0 {
            return Err(WiseError::config(format!(
                "{}.length must not be negative (got {})",
                field, self.length
            )));
        }
        if self.length > MODBUS_MAX_READ_COILS as i64 {
            return Err(WiseError::config(format!(
                "{}.length {} exceeds the Modbus read limit of {} coils",
                field, self.length, MODBUS_MAX_READ_COILS
            )));
        }
        if self.base_address + self.length > i64::from(u16::MAX) + 1 {
            return Err(WiseError::config(format!(
                "{}: base_address {} + length {} runs past coil address 65535",
                field, self.base_address, self.length
            )));
        }
        Ok(CoilBlock {
            base_address: self.base_address as u16,
            length: self.length as u16,
        })
    }
}

/// Modbus/TCP sensor config as received from the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModbusSensorConfig {
    #[serde(default)]
    pub device_address: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    #[serde(default)]
    pub digital_inputs: Option<CoilBlockConfig>,
    #[serde(default)]
    pub digital_outputs: Option<CoilBlockConfig>,
    /// Modbus unit identifier
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Per-operation deadline for connect, read and write
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Background monitor interval; no monitor when absent
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl ModbusSensorConfig {
    /// Parse from a raw JSON value
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Validate every required field and produce a config snapshot
    pub fn validate(&self) -> Result<DeviceConfig> {
        let di = self
            .digital_inputs
            .as_ref()
            .ok_or_else(|| WiseError::config("digital_inputs are required"))?;
        let dout = self
            .digital_outputs
            .as_ref()
            .ok_or_else(|| WiseError::config("digital_outputs are required"))?;

        if self.port.trim().is_empty() {
            return Err(WiseError::config("port is required"));
        }
        if self.device_address.trim().is_empty() {
            return Err(WiseError::config("device_address is required"));
        }

        let port: u16 = self
            .port
            .trim()
            .parse()
            .map_err(|_| WiseError::config(format!("port '{}' is not a TCP port", self.port)))?;
        if port == 0 {
            return Err(WiseError::config("port must be between 1 and 65535"));
        }
        if self.timeout_ms == 0 {
            return Err(WiseError::config("timeout_ms must be greater than zero"));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(WiseError::config(
                "poll_interval_ms must be greater than zero when set",
            ));
        }

        Ok(DeviceConfig {
            host: self.device_address.trim().to_string(),
            port,
            digital_inputs: di.validate("digital_inputs")?,
            digital_outputs: dout.validate("digital_outputs")?,
            slave_id: self.slave_id,
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
        })
    }
}

/// Contiguous coil range on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilBlock {
    pub base_address: u16,
    pub length: u16,
}

impl CoilBlock {
    pub fn new(base_address: u16, length: u16) -> Self {
        Self {
            base_address,
            length,
        }
    }

    /// Absolute address of the 1-based logical coil `index`
    pub fn address_of(&self, index: u16) -> Option<u16> {
        if index == 0 || index > self.length {
            return None;
        }
        self.base_address.checked_add(index - 1)
    }
}

/// Validated, immutable Modbus sensor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub digital_inputs: CoilBlock,
    pub digital_outputs: CoilBlock,
    pub slave_id: u8,
    pub timeout: Duration,
    pub poll_interval: Option<Duration>,
}

impl DeviceConfig {
    /// `host:port` used to open sessions; IPv6 literals are bracketed
    pub fn endpoint(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// REST sensor config as received from the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestSensorConfig {
    #[serde(default)]
    pub device_ip: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RestSensorConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_ip.trim().is_empty() {
            return Err(WiseError::config("device_ip is required"));
        }
        if self.username.is_empty() {
            return Err(WiseError::config("username is required"));
        }
        if self.password.is_empty() {
            return Err(WiseError::config("password is required"));
        }
        if self.timeout_ms == 0 {
            return Err(WiseError::config("timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
