//! Coil codec
//!
//! Turns packed FC01 payload bytes into 1-based coil readings and maps
//! booleans to the FC05 ON/OFF sentinels.

use serde_json::{Map, Value};

use super::constants::{COIL_OFF, COIL_ON};

/// State of one logical coil; `index` is 1-based within its block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilReading {
    pub index: u16,
    pub state: bool,
}

impl CoilReading {
    /// Payload key, e.g. `coil3`
    pub fn key(&self) -> String {
        format!("coil{}", self.index)
    }
}

/// Decode packed coil bits, least significant bit first within each byte
///
/// Returns at most `num_coils` readings numbered from 1. Padding bits past
/// `num_coils` are dropped. When `raw` carries fewer bits than requested
/// the result is shorter than `num_coils`; callers decide whether that is
/// an error.
pub fn decode_coils(raw: &[u8], num_coils: usize) -> Vec<CoilReading> {
    raw.iter()
        .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 0x01 == 0x01))
        .take(num_coils)
        .enumerate()
        .map(|(i, state)| CoilReading {
            index: (i + 1) as u16,
            state,
        })
        .collect()
}

/// Pack coil states into FC01 payload bytes (inverse of [`decode_coils`])
pub fn encode_coils(states: &[bool]) -> Vec<u8> {
    states
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, &on)| if on { acc | (1 << bit) } else { acc })
        })
        .collect()
}

/// FC05 wire value for a coil state
#[inline]
pub const fn coil_value(on: bool) -> u16 {
    if on {
        COIL_ON
    } else {
        COIL_OFF
    }
}

/// Inverse of [`coil_value`]; any other value is invalid for FC05
#[inline]
pub const fn parse_coil_value(value: u16) -> Option<bool> {
    match value {
        COIL_ON => Some(true),
        COIL_OFF => Some(false),
        _ => None,
    }
}

/// Ordered readings of one coil block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingSet(Vec<CoilReading>);

impl ReadingSet {
    pub fn new(readings: Vec<CoilReading>) -> Self {
        Self(readings)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoilReading> {
        self.0.iter()
    }

    /// State of the 1-based coil `index`
    pub fn get(&self, index: u16) -> Option<bool> {
        self.0.iter().find(|r| r.index == index).map(|r| r.state)
    }

    /// `{"coil1": true, ...}`
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|r| (r.key(), Value::Bool(r.state)))
            .collect();
        Value::Object(map)
    }

    /// Operator display form: `Coil 1: True, Coil 2: False`
    pub fn display(&self) -> String {
        self.0
            .iter()
            .map(|r| {
                format!(
                    "Coil {}: {}",
                    r.index,
                    if r.state { "True" } else { "False" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for ReadingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::modbus::constants::coil_byte_count;

    fn states(readings: &[CoilReading]) -> Vec<bool> {
        readings.iter().map(|r| r.state).collect()
    }

    #[test]
    fn test_decode_worked_example() {
        let readings = decode_coils(&[0b0000_1011], 4);
        assert_eq!(states(&readings), vec![true, true, false, true]);
        assert_eq!(readings[0].index, 1);
        assert_eq!(readings[3].index, 4);
    }

    #[test]
    fn test_decode_spans_bytes() {
        let readings = decode_coils(&[0xFF, 0x01], 10);
        let expected = [vec![true; 9], vec![false]].concat();
        assert_eq!(states(&readings), expected);
    }

    #[test]
    fn test_decode_zero_coils() {
        assert!(decode_coils(&[0xFF], 0).is_empty());
        assert!(decode_coils(&[], 0).is_empty());
    }

    #[test]
    fn test_decode_short_input() {
        assert!(decode_coils(&[], 4).is_empty());
        assert_eq!(decode_coils(&[0x0F], 12).len(), 8);
    }

    #[test]
    fn test_decode_property_over_lengths() {
        // pseudo-random but deterministic bit patterns
        for num_coils in 0..=64usize {
            let bytes: Vec<u8> = (0..coil_byte_count(num_coils))
                .map(|i| (i as u8).wrapping_mul(37).wrapping_add(num_coils as u8))
                .collect();
            let readings = decode_coils(&bytes, num_coils);

            assert_eq!(readings.len(), num_coils);
            for (i, reading) in readings.iter().enumerate() {
                assert_eq!(reading.index as usize, i + 1);
                assert_eq!(reading.state, (bytes[i / 8] >> (i % 8)) & 1 == 1);
            }
        }
    }

    #[test]
    fn test_encode_matches_decode() {
        let input = [true, false, true, true, false, false, false, true, true];
        let bytes = encode_coils(&input);
        assert_eq!(bytes, vec![0b1000_1101, 0b0000_0001]);
        assert_eq!(states(&decode_coils(&bytes, input.len())), input);
    }

    #[test]
    fn test_coil_value_sentinels() {
        assert_eq!(coil_value(true), 0xFF00);
        assert_eq!(coil_value(false), 0x0000);
        assert_eq!(parse_coil_value(0xFF00), Some(true));
        assert_eq!(parse_coil_value(0x0000), Some(false));
        assert_eq!(parse_coil_value(0x0001), None);
    }

    #[test]
    fn test_reading_set_display_and_json() {
        let set = ReadingSet::new(decode_coils(&[0b0000_0101], 3));
        assert_eq!(set.display(), "Coil 1: True, Coil 2: False, Coil 3: True");
        assert_eq!(
            set.to_json(),
            serde_json::json!({"coil1": true, "coil2": false, "coil3": true})
        );
        assert_eq!(set.get(2), Some(false));
        assert_eq!(set.get(4), None);
    }
}
