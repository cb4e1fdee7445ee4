//! WISE-4050 I/O module sensor
//!
//! Polls and controls an Advantech WISE-4050 (4 digital inputs, 4 digital
//! outputs) over Modbus/TCP or its REST interface and exposes it as a
//! reconfigurable sensor resource.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusSensor   │───►│  DeviceGateway  │───►│  ModbusSession  │
//! │  (lifecycle)    │    │ (poll / write)  │    │  (one per call) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                                             │
//!          ▼                                             ▼
//! ┌─────────────────┐                          ┌─────────────────┐
//! │  Monitor task   │                          │   Coil codec    │
//! │ (cancellable)   │                          │  (FC01 / FC05)  │
//! └─────────────────┘                          └─────────────────┘
//! ```
//!
//! Sensors are built through an explicit [`SensorRegistry`]; see
//! [`default_registry`].

pub mod cli;
pub mod config;
pub mod error;
pub mod probe;
pub mod protocols;
pub mod sensor;

pub use config::{CoilBlock, DeviceConfig, ModbusSensorConfig, RestSensorConfig};
pub use error::{Result, WiseError};
pub use protocols::modbus::{CommandStatus, DeviceGateway, ReadingSet, SensorReadings};
pub use sensor::{
    default_registry, ModbusSensor, ModelName, Registration, RestSensor, Sensor, SensorRegistry,
};
