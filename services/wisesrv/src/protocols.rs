//! Protocol implementations
//!
//! Wire protocols spoken to the WISE-4050: Modbus/TCP coils and the vendor
//! REST interface.

pub mod modbus;
pub mod rest;
