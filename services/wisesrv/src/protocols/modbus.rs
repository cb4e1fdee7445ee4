//! Modbus/TCP coil protocol
//!
//! Only FC01 (Read Coils) and FC05 (Write Single Coil) are issued.

pub mod codec;
pub mod constants;
pub mod gateway;
pub mod session;
pub mod simulator;

// Re-export commonly used types
pub use codec::{coil_value, decode_coils, parse_coil_value, CoilReading, ReadingSet};
pub use gateway::{parse_coil_command, CommandStatus, DeviceGateway, SensorReadings};
pub use session::{ModbusSession, SessionConnector, TcpConnector, TcpModbusSession};
pub use simulator::{ModbusSimulator, SimulatorFault, SimulatorHandle};
