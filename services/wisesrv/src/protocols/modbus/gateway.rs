//! Device gateway
//!
//! Combines a config snapshot, one session per call and the coil codec:
//! `poll_all` reads both coil blocks, `write_coils` applies a `coil<N>`
//! command to the output block. The session is closed on every exit path.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::codec::{decode_coils, ReadingSet};
use super::session::{ModbusSession, SessionConnector, TcpConnector};
use crate::config::{CoilBlock, DeviceConfig};
use crate::error::{Result, WiseError};

/// Both coil blocks from one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorReadings {
    pub input_coils: ReadingSet,
    pub output_coils: ReadingSet,
}

impl SensorReadings {
    /// `{"inputCoils": {"coil1": bool, ...}, "outputCoils": {...}}`
    pub fn to_json(&self) -> Value {
        json!({
            "inputCoils": self.input_coils.to_json(),
            "outputCoils": self.output_coils.to_json(),
        })
    }
}

/// Result of a fully applied command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandStatus {
    pub status: String,
}

impl CommandStatus {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "status": self.status })
    }
}

/// Coil writes extracted from a command, as `(address, on)` in ascending coil order
///
/// Only `coil1..=coil<length>` are considered; any other key is ignored.
/// A considered key whose value is not a boolean rejects the whole command.
pub fn parse_coil_command(command: &Map<String, Value>, block: CoilBlock) -> Result<Vec<(u16, bool)>> {
    let mut writes = Vec::new();
    for index in 1..=block.length {
        let key = format!("coil{}", index);
        let Some(value) = command.get(&key) else {
            continue;
        };
        let on = value.as_bool().ok_or_else(|| {
            WiseError::invalid_command(format!("{} must be a boolean, got {}", key, value))
        })?;
        let address = block.address_of(index).ok_or_else(|| {
            WiseError::invalid_command(format!("{} has no address in the output block", key))
        })?;
        writes.push((address, on));
    }

    let ignored: Vec<&String> = command
        .keys()
        .filter(|k| {
            k.strip_prefix("coil")
                .and_then(|n| n.parse::<u16>().ok())
                .map_or(true, |n| n == 0 || n > block.length || format!("coil{}", n) != **k)
        })
        .collect();
    if !ignored.is_empty() {
        debug!("Ignoring command keys outside coil1..coil{}: {:?}", block.length, ignored);
    }

    Ok(writes)
}

/// Read one block and require a full reading set
async fn read_block<S: ModbusSession>(
    session: &mut S,
    block: CoilBlock,
    name: &'static str,
) -> Result<ReadingSet> {
    // FC01 with quantity zero is illegal on the wire
    if block.length == 0 {
        return Ok(ReadingSet::default());
    }
    let raw = session.read_coils(block.base_address, block.length).await?;
    let readings = decode_coils(&raw, block.length as usize);
    if readings.len() < block.length as usize {
        return Err(WiseError::ShortRead {
            block: name,
            requested: block.length as usize,
            decoded: readings.len(),
        });
    }
    Ok(ReadingSet::new(readings))
}

/// Gateway over an exchangeable session connector
#[derive(Debug, Clone, Default)]
pub struct DeviceGateway<C = TcpConnector> {
    connector: C,
}

impl DeviceGateway<TcpConnector> {
    pub fn tcp() -> Self {
        Self::new(TcpConnector)
    }
}

impl<C: SessionConnector> DeviceGateway<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Read both coil blocks over one session
    pub async fn poll_all(&self, config: &DeviceConfig) -> Result<SensorReadings> {
        let mut session = self.connector.open(config).await?;

        let result = async {
            let input_coils =
                read_block(&mut session, config.digital_inputs, "digital_inputs").await?;
            let output_coils =
                read_block(&mut session, config.digital_outputs, "digital_outputs").await?;
            Ok::<_, WiseError>(SensorReadings {
                input_coils,
                output_coils,
            })
        }
        .await;

        Self::finish(&mut session, config, result).await
    }

    /// Apply `coil<N>` writes to the output block over one session
    pub async fn write_coils(
        &self,
        config: &DeviceConfig,
        command: &Map<String, Value>,
    ) -> Result<CommandStatus> {
        let writes = parse_coil_command(command, config.digital_outputs)?;
        let mut session = self.connector.open(config).await?;

        let result = async {
            for (address, on) in &writes {
                session.write_single_coil(*address, *on).await?;
            }
            Ok::<_, WiseError>(CommandStatus::success())
        }
        .await;

        Self::finish(&mut session, config, result).await
    }

    /// Close the session, keeping the operation's own error if it failed
    async fn finish<T>(
        session: &mut C::Session,
        config: &DeviceConfig,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = session.close().await {
            warn!("Closing session to {} failed: {}", config.endpoint(), e);
        }
        result
    }
}
