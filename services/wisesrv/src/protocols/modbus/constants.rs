//! Modbus/TCP constants for the coil subset used by the WISE-4050
//!
//! Frame limits follow the Modbus application protocol: a PDU never exceeds
//! 253 bytes, and the MBAP header in front of it is 7 bytes including the
//! unit identifier.

// ============================================================================
// Frame layout
// ============================================================================

/// MBAP bytes before the unit id: transaction(2) + protocol(2) + length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Full MBAP header including the unit identifier
pub const MBAP_FULL_LEN: usize = MBAP_HEADER_LEN + 1;

/// Maximum PDU size (RS485 ADU 256 - address 1 - CRC 2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Modbus/TCP protocol identifier, always zero
pub const MODBUS_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SLAVE_DEVICE_FAILURE: u8 = 0x04;

// ============================================================================
// Coil encoding
// ============================================================================

/// FC05 value that switches a coil ON
pub const COIL_ON: u16 = 0xFF00;

/// FC05 value that switches a coil OFF
pub const COIL_OFF: u16 = 0x0000;

/// Maximum coils for FC01 (Read Coils)
///
/// Response PDU: fc(1) + byte count(1) + ceil(N / 8) <= 253, so N <= 2008;
/// the protocol caps it at 2000.
pub const MODBUS_MAX_READ_COILS: usize = 2000;

// ============================================================================
// Device defaults
// ============================================================================

/// Unit identifier the WISE-4050 answers on
pub const DEFAULT_SLAVE_ID: u8 = 1;

/// Connect/read/write deadline
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Read deadline of the raw TCP probe
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

/// Number of data bytes needed to carry `coils` packed coil states
#[inline]
pub const fn coil_byte_count(coils: usize) -> usize {
    coils.div_ceil(8)
}

/// Human-readable exception name
pub fn exception_description(code: u8) -> &'static str {
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SLAVE_DEVICE_FAILURE => "Slave Device Failure",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_FULL_LEN, 7);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_read_coil_limit_fits_pdu() {
        let pdu = 1 + 1 + coil_byte_count(MODBUS_MAX_READ_COILS);
        assert!(pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_byte_count() {
        assert_eq!(coil_byte_count(0), 0);
        assert_eq!(coil_byte_count(1), 1);
        assert_eq!(coil_byte_count(8), 1);
        assert_eq!(coil_byte_count(9), 2);
    }
}
