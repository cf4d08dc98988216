//! Decoding of buffer-read job answers.
//!
//! A buffer read answers with two positionally aligned arrays, `Items` (buffer
//! offsets) and `Values` (the word at that offset). Registers are then
//! extracted from the resulting offset map with their mask.

use crate::formula::Number;
use crate::{Error, Result};
use log::debug;
use std::collections::HashMap;

/// Masked raw value the wifi module reports for a failed reading.
pub const READING_ERROR_SENTINEL: i64 = 32768;
/// Air temperatures above this are bogus on stoves that reuse the register.
pub const AIR_TEMPERATURE_LIMIT: i64 = 100;
/// Register key suffix the air temperature fix applies to.
pub const AIR_TEMPERATURE_SUFFIX: &str = "air_get";

/// Snapshot of a device's value buffer, offset to raw word.
///
/// Replaced as a whole by every successful buffer read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferState {
    values: HashMap<u32, i64>,
}

impl BufferState {
    /// Zips `items` with `values`.
    ///
    /// Both arrays must be non-empty and of equal length.
    pub fn decode(items: &[u32], values: &[i64]) -> Result<Self> {
        if items.len() != values.len() {
            return Err(Error::Protocol(format!(
                "buffer answer has {} items but {} values",
                items.len(),
                values.len()
            )));
        }
        if items.is_empty() {
            return Err(Error::Protocol("buffer answer holds no registers".into()));
        }
        Ok(Self {
            values: items.iter().copied().zip(values.iter().copied()).collect(),
        })
    }

    /// Masked raw value of the register at `offset`, if the buffer holds it.
    pub fn raw(&self, offset: u32, mask: i64) -> Option<i64> {
        self.values.get(&offset).map(|word| word & mask)
    }

    /// Copy of this snapshot with the `mask` bits at `offset` replaced by `raw`.
    ///
    /// Offsets the snapshot does not hold stay absent.
    pub fn with_written(&self, offset: u32, mask: i64, raw: i64) -> Self {
        let mut values = self.values.clone();
        if let Some(word) = values.get_mut(&offset) {
            *word = (*word & !mask) | (raw & mask);
        }
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Device specific workarounds, each toggled independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Drop readings whose masked raw value is [`READING_ERROR_SENTINEL`].
    pub reading_error_fix: bool,
    /// Drop values whose integer part is above [`AIR_TEMPERATURE_LIMIT`] for
    /// `*air_get` registers.
    pub air_temp_fix: bool,
}

impl Quirks {
    /// Returns `value` unless one of the enabled fixes rejects the reading.
    pub fn filter(&self, key: &str, raw: i64, value: Number) -> Option<Number> {
        if self.reading_error_fix && raw == READING_ERROR_SENTINEL {
            debug!("Applied reading_error_fix. Dropped value {value} for register {key}");
            return None;
        }
        if self.air_temp_fix
            && key.ends_with(AIR_TEMPERATURE_SUFFIX)
            && value.trunc().is_ok_and(|v| v > AIR_TEMPERATURE_LIMIT)
        {
            debug!("Applied air_temp_fix. Dropped value {value} for register {key}");
            return None;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decode_zips_positionally() {
        let state = BufferState::decode(&[5, 1, 9], &[3, 0x1234, 0xFF01]).unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.raw(5, 0xFF), Some(3));
        assert_eq!(state.raw(1, 0xFF), Some(0x34));
        assert_eq!(state.raw(1, 0xFF00), Some(0x1200));
        assert_eq!(state.raw(9, 0xFFFF), Some(0xFF01));
        assert_eq!(state.raw(2, 0xFFFF), None);
    }

    #[test]
    fn decode_rejects_mismatched_lengths() {
        assert_matches!(BufferState::decode(&[1, 2], &[1]), Err(Error::Protocol(..)));
        assert_matches!(BufferState::decode(&[1], &[1, 2]), Err(Error::Protocol(..)));
        assert_matches!(BufferState::decode(&[], &[]), Err(Error::Protocol(..)));
    }

    #[test]
    fn written_bits_are_merged() {
        let state = BufferState::decode(&[1, 2], &[0x1234, 7]).unwrap();
        let written = state.with_written(1, 0xFF, 0x56);
        assert_eq!(written.raw(1, 0xFFFF), Some(0x1256));
        assert_eq!(written.raw(2, 0xFFFF), Some(7));
        assert_eq!(state.raw(1, 0xFFFF), Some(0x1234));
        assert_eq!(state.with_written(9, 0xFF, 1).raw(9, 0xFF), None);
    }

    #[test]
    fn reading_error_fix() {
        let fixed = Quirks {
            reading_error_fix: true,
            ..Default::default()
        };
        let value = Number::Int(READING_ERROR_SENTINEL);
        assert_eq!(fixed.filter("temp_gas_flue_get", READING_ERROR_SENTINEL, value), None);
        assert_eq!(
            Quirks::default().filter("temp_gas_flue_get", READING_ERROR_SENTINEL, value),
            Some(value)
        );
        assert_eq!(
            fixed.filter("temp_gas_flue_get", 120, Number::Int(120)),
            Some(Number::Int(120))
        );
    }

    #[test]
    fn air_temp_fix() {
        let fixed = Quirks {
            air_temp_fix: true,
            ..Default::default()
        };
        assert_eq!(fixed.filter("temp_air_get", 250, Number::Float(125.0)), None);
        assert_eq!(fixed.filter("temp_air_get", 202, Number::Float(101.0)), None);
        assert_eq!(
            fixed.filter("temp_air_get", 201, Number::Float(100.5)),
            Some(Number::Float(100.5))
        );
        assert_eq!(
            fixed.filter("temp_air_get", 42, Number::Float(21.0)),
            Some(Number::Float(21.0))
        );
        assert_eq!(
            fixed.filter("temp_gas_flue_get", 250, Number::Int(250)),
            Some(Number::Int(250))
        );
        assert_eq!(
            Quirks::default().filter("temp_air_get", 250, Number::Float(125.0)),
            Some(Number::Float(125.0))
        );
    }
}
