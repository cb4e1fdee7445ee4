//! Error handling for the WISE sensor service
//!
//! One error type for every layer. Lower layers return it unchanged; nothing
//! above the session re-wraps an I/O failure into a plain string.

use thiserror::Error;

use crate::protocols::modbus::constants::exception_description;

/// Sensor service error type
#[derive(Error, Debug)]
pub enum WiseError {
    /// Missing or invalid configuration field
    #[error("Configuration error: {0}")]
    Config(String),

    /// TCP connect to the device failed; no session was created
    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Request rejected by the device, malformed response, or wire-level I/O failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered with fewer coil states than requested
    #[error("Short read on {block}: requested {requested} coils, decoded {decoded}")]
    ShortRead {
        block: &'static str,
        requested: usize,
        decoded: usize,
    },

    /// A connect, read, write or shutdown exceeded its deadline
    #[error("Timeout: {operation} did not complete within {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation attempted on a closed sensor
    #[error("Sensor {0} is closed")]
    Closed(String),

    /// Command payload could not be applied
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Operation not offered by this sensor model
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// REST request failed or returned a non-success status
    #[error("HTTP error: {0}")]
    Http(String),

    /// Input/Output operation errors outside a device session
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the sensor service
pub type Result<T> = std::result::Result<T, WiseError>;

impl WiseError {
    pub fn config(msg: impl Into<String>) -> Self {
        WiseError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        WiseError::Protocol(msg.into())
    }

    pub fn invalid_command(msg: impl Into<String>) -> Self {
        WiseError::InvalidCommand(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        WiseError::Unsupported(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        WiseError::Http(msg.into())
    }

    pub fn closed(name: impl Into<String>) -> Self {
        WiseError::Closed(name.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        WiseError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// True for failures that mean the device could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, WiseError::Connect { .. })
    }
}

impl From<common::Error> for WiseError {
    fn from(err: common::Error) -> Self {
        WiseError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WiseError {
    fn from(err: serde_json::Error) -> Self {
        WiseError::Config(format!("Invalid config payload: {}", err))
    }
}

impl From<voltage_modbus::ModbusError> for WiseError {
    fn from(err: voltage_modbus::ModbusError) -> Self {
        use voltage_modbus::ModbusError;
        match err {
            ModbusError::Timeout {
                operation,
                timeout_ms,
            } => WiseError::Timeout {
                operation,
                timeout_ms,
            },
            ModbusError::Exception { function, code, .. } => WiseError::Protocol(format!(
                "Modbus exception response to FC{:02X}: code {:02X} ({})",
                function,
                code,
                exception_description(code)
            )),
            other => WiseError::Protocol(format!("Modbus: {}", other)),
        }
    }
}

impl From<reqwest::Error> for WiseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WiseError::Http(format!("request timed out: {}", err))
        } else {
            WiseError::Http(err.to_string())
        }
    }
}
