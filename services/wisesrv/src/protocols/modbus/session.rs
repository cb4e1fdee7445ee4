//! Modbus/TCP session
//!
//! A session owns one `voltage_modbus` TCP client for one logical operation.
//! Connect, every request and close are bounded by the configured timeout.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, trace};
use voltage_modbus::{ModbusClient, ModbusFunction, ModbusRequest, ModbusResponse, ModbusTcpClient};

use super::codec::coil_value;
use super::constants::MODBUS_MAX_READ_COILS;
use crate::config::DeviceConfig;
use crate::error::{Result, WiseError};

/// Coil operations available on an open session
#[async_trait]
pub trait ModbusSession: Send {
    /// FC01; returns the packed coil bytes as sent by the device
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>>;

    /// FC05 with the ON/OFF sentinel
    async fn write_single_coil(&mut self, address: u16, on: bool) -> Result<()>;

    /// Release the connection. Later calls on the session fail.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions against a configured device
#[async_trait]
pub trait SessionConnector: Send + Sync {
    type Session: ModbusSession + 'static;

    async fn open(&self, config: &DeviceConfig) -> Result<Self::Session>;
}

/// Connector producing plain TCP sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl SessionConnector for TcpConnector {
    type Session = TcpModbusSession;

    async fn open(&self, config: &DeviceConfig) -> Result<TcpModbusSession> {
        TcpModbusSession::connect(&config.endpoint(), config.slave_id, config.timeout).await
    }
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn connect_error(endpoint: &str, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> WiseError {
    WiseError::Connect {
        endpoint: endpoint.to_string(),
        source: std::io::Error::other(err),
    }
}

/// Packed coil bytes of an FC01 response body (`byte count` + data)
///
/// A byte count larger than the bytes present yields what is there; the
/// gateway reports the resulting short decode.
fn coil_payload(response: &ModbusResponse) -> Result<Vec<u8>> {
    let body = response.data();
    let Some((&byte_count, data)) = body.split_first() else {
        return Err(WiseError::protocol("FC01 response without byte count"));
    };
    let present = (byte_count as usize).min(data.len());
    Ok(data[..present].to_vec())
}

/// FC05 request carrying the ON/OFF sentinel for `on`
fn write_coil_request(unit_id: u8, address: u16, on: bool) -> ModbusRequest {
    ModbusRequest {
        slave_id: unit_id,
        function: ModbusFunction::WriteSingleCoil,
        address,
        quantity: 1,
        data: coil_value(on).to_be_bytes().to_vec(),
    }
}

/// Check the FC05 echo of address and value
fn check_write_echo(response: &ModbusResponse, address: u16, on: bool) -> Result<()> {
    let body = response.data();
    if body.len() < 4 {
        return Err(WiseError::protocol(format!(
            "FC05 response too short: {} bytes",
            body.len()
        )));
    }
    let echoed_address = u16::from_be_bytes([body[0], body[1]]);
    let echoed_value = u16::from_be_bytes([body[2], body[3]]);
    let expected_value = coil_value(on);
    if echoed_address != address || echoed_value != expected_value {
        return Err(WiseError::protocol(format!(
            "FC05 echo mismatch: sent {}={:04X}, device answered {}={:04X}",
            address, expected_value, echoed_address, echoed_value
        )));
    }
    Ok(())
}

/// Modbus/TCP client session
pub struct TcpModbusSession {
    client: Option<ModbusTcpClient>,
    endpoint: String,
    unit_id: u8,
    timeout: Duration,
}

impl std::fmt::Debug for TcpModbusSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpModbusSession")
            .field("endpoint", &self.endpoint)
            .field("unit_id", &self.unit_id)
            .field("timeout", &self.timeout)
            .field("open", &self.client.is_some())
            .finish()
    }
}

impl TcpModbusSession {
    /// Resolve `endpoint` and connect within `op_timeout`
    pub async fn connect(endpoint: &str, unit_id: u8, op_timeout: Duration) -> Result<Self> {
        debug!("Connecting to Modbus device {}", endpoint);
        let timeout_ms = op_timeout.as_millis() as u64;

        let connecting = async {
            let addr: SocketAddr = tokio::net::lookup_host(endpoint)
                .await
                .map_err(|source| WiseError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })?
                .next()
                .ok_or_else(|| connect_error(endpoint, "no address resolved"))?;
            ModbusTcpClient::new(addr, op_timeout)
                .await
                .map_err(|e| match WiseError::from(e) {
                    timeout @ WiseError::Timeout { .. } => timeout,
                    other => connect_error(endpoint, other.to_string()),
                })
        };

        let client = match timeout(op_timeout, connecting).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(WiseError::timeout(
                    format!("connect to {}", endpoint),
                    timeout_ms,
                ));
            },
        };

        debug!("Connected to {}", endpoint);
        Ok(Self {
            client: Some(client),
            endpoint: endpoint.to_string(),
            unit_id,
            timeout: op_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.client.is_some()
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Send one request and wait for its response
    async fn execute(&mut self, request: ModbusRequest, operation: &str) -> Result<ModbusResponse> {
        let op_timeout = self.timeout;
        let timeout_ms = self.timeout_ms();
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| WiseError::protocol(format!("session to {} is closed", self.endpoint)))?;

        let response = timeout(op_timeout, client.execute_request(request))
            .await
            .map_err(|_| WiseError::timeout(operation, timeout_ms))??;
        trace!("[{}] RX {}: {}", self.endpoint, operation, hex(response.data()));
        Ok(response)
    }
}

#[async_trait]
impl ModbusSession for TcpModbusSession {
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        debug!(
            "[{}] Read coils: address={}, quantity={}",
            self.endpoint, address, quantity
        );
        if quantity == 0 || quantity as usize > MODBUS_MAX_READ_COILS {
            return Err(WiseError::protocol(format!(
                "FC01 quantity {} outside 1..={}",
                quantity, MODBUS_MAX_READ_COILS
            )));
        }
        let request = ModbusRequest::new_read(self.unit_id, ModbusFunction::ReadCoils, address, quantity);
        let response = self.execute(request, "read coils").await?;
        coil_payload(&response)
    }

    async fn write_single_coil(&mut self, address: u16, on: bool) -> Result<()> {
        debug!(
            "[{}] Write single coil: address={}, on={}",
            self.endpoint, address, on
        );
        let request = write_coil_request(self.unit_id, address, on);
        let response = self.execute(request, "write single coil").await?;
        check_write_echo(&response, address, on)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut client) = self.client.take() else {
            return Ok(());
        };
        debug!("Closing session to {}", self.endpoint);
        match timeout(self.timeout, client.close()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WiseError::timeout("close session", self.timeout_ms())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_coil_payload_strips_byte_count() {
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![0x01, 0b0000_1011]);
        assert_eq!(coil_payload(&response).unwrap(), vec![0b0000_1011]);

        // byte count promises more than was sent
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![0x02, 0xFF]);
        assert_eq!(coil_payload(&response).unwrap(), vec![0xFF]);

        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![0x00]);
        assert!(coil_payload(&response).unwrap().is_empty());

        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![]);
        assert!(matches!(coil_payload(&response), Err(WiseError::Protocol(_))));
    }

    #[test]
    fn test_write_echo_checked() {
        let echo = ModbusResponse::new_success(
            1,
            ModbusFunction::WriteSingleCoil,
            vec![0x00, 0x11, 0xFF, 0x00],
        );
        assert!(check_write_echo(&echo, 17, true).is_ok());
        assert!(check_write_echo(&echo, 17, false).is_err());
        assert!(check_write_echo(&echo, 18, true).is_err());

        let short = ModbusResponse::new_success(1, ModbusFunction::WriteSingleCoil, vec![0x00]);
        assert!(check_write_echo(&short, 17, true).is_err());
    }

    #[test]
    fn test_write_request_uses_coil_sentinels() {
        let on = write_coil_request(1, 17, true);
        assert_eq!(on.address, 17);
        assert_eq!(on.data, vec![0xFF, 0x00]);
        assert_eq!(on.data, coil_value(true).to_be_bytes().to_vec());

        let off = write_coil_request(1, 17, false);
        assert_eq!(off.data, vec![0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpModbusSession::connect(&addr.to_string(), 1, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_connect(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // hold the socket open without answering
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut session =
            TcpModbusSession::connect(&addr.to_string(), 1, Duration::from_millis(200))
                .await
                .unwrap();
        let err = session.read_coils(0, 4).await.unwrap_err();
        assert!(matches!(err, WiseError::Timeout { timeout_ms: 200, .. }), "{err}");

        session.close().await.ok();
        server.abort();
    }

    #[tokio::test]
    async fn test_close_twice_then_operations_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let mut session = TcpModbusSession::connect(&addr.to_string(), 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(session.is_open());

        session.close().await.unwrap();
        assert!(!session.is_open());
        session.close().await.unwrap();
        let err = session.read_coils(0, 1).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        accept.await.unwrap().ok();
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected_locally() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let mut session = TcpModbusSession::connect(&addr.to_string(), 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            session.read_coils(0, 0).await,
            Err(WiseError::Protocol(_))
        ));
        session.close().await.unwrap();
        accept.await.unwrap().ok();
    }
}
