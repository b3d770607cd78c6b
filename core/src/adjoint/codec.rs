//! Wire format of AD values.
//!
//! A [`WireValue`] is 12 bytes: the primal as little-endian `f64` followed by
//! the tape index as little-endian `i32`. Located values append the location
//! as another little-endian `i32` (16 bytes). Adjoint and tangent buffers are
//! plain little-endian `f64` arrays.

use crate::error::{AdError, Result};
use crate::tape::{AReal, TapeIndex};

pub const WIRE_VALUE_BYTES: usize = 12;
pub const LOCATED_WIRE_BYTES: usize = 16;

/// The serialized form of one AD-tracked scalar.
///
/// `index == 0` means the receiver must treat the value as a plain number.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WireValue {
    pub primal: f64,
    pub index: TapeIndex,
}

impl WireValue {
    /// Reads primal and index without touching the tape.
    pub fn encode(value: &AReal) -> Self {
        Self {
            primal: value.value,
            index: value.index,
        }
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.primal.to_le_bytes());
        out.extend_from_slice(&self.index.raw().to_le_bytes());
    }

    /// `bytes` must hold at least [`WIRE_VALUE_BYTES`].
    pub(crate) fn read_from(bytes: &[u8]) -> Self {
        Self {
            primal: read_f64(&bytes[..8]),
            index: TapeIndex::new(read_i32(&bytes[8..12])),
        }
    }
}

/// An AD value paired with a non-differentiable location, for the
/// min-loc / max-loc reductions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocReal {
    pub value: AReal,
    pub loc: i32,
}

impl LocReal {
    pub fn new(value: AReal, loc: i32) -> Self {
        Self { value, loc }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocatedWire {
    pub value: WireValue,
    pub loc: i32,
}

impl LocatedWire {
    pub fn encode(value: &LocReal) -> Self {
        Self {
            value: WireValue::encode(&value.value),
            loc: value.loc,
        }
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        self.value.write_to(out);
        out.extend_from_slice(&self.loc.to_le_bytes());
    }

    /// `bytes` must hold at least [`LOCATED_WIRE_BYTES`].
    pub(crate) fn read_from(bytes: &[u8]) -> Self {
        Self {
            value: WireValue::read_from(bytes),
            loc: read_i32(&bytes[12..16]),
        }
    }
}

pub(crate) fn read_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

pub(crate) fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(raw)
}

fn check_stride(bytes: &[u8], stride: usize, what: &str) -> Result<()> {
    if bytes.len() % stride != 0 {
        return Err(AdError::Protocol(format!(
            "{} bytes do not decode as {what} ({stride} bytes each)",
            bytes.len()
        )));
    }
    Ok(())
}

pub fn encode_values(values: &[AReal]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * WIRE_VALUE_BYTES);
    for value in values {
        WireValue::encode(value).write_to(&mut out);
    }
    out
}

pub fn decode_values(bytes: &[u8]) -> Result<Vec<WireValue>> {
    check_stride(bytes, WIRE_VALUE_BYTES, "wire values")?;
    Ok(bytes.chunks_exact(WIRE_VALUE_BYTES).map(WireValue::read_from).collect())
}

pub fn encode_located(values: &[LocReal]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * LOCATED_WIRE_BYTES);
    for value in values {
        LocatedWire::encode(value).write_to(&mut out);
    }
    out
}

pub fn decode_located(bytes: &[u8]) -> Result<Vec<LocatedWire>> {
    check_stride(bytes, LOCATED_WIRE_BYTES, "located wire values")?;
    Ok(bytes
        .chunks_exact(LOCATED_WIRE_BYTES)
        .map(LocatedWire::read_from)
        .collect())
}

/// Adjoint or tangent reals to wire bytes.
pub fn encode_reals(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_reals(bytes: &[u8]) -> Result<Vec<f64>> {
    check_stride(bytes, 8, "reals")?;
    Ok(bytes.chunks_exact(8).map(read_f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let value = AReal {
            value: 1.5,
            index: TapeIndex::new(-1),
        };
        let bytes = encode_values(&[value]);
        assert_eq!(bytes.len(), WIRE_VALUE_BYTES);
        assert_eq!(&bytes[..8], &1.5f64.to_le_bytes());
        assert_eq!(&bytes[8..], &(-1i32).to_le_bytes());
    }

    #[test]
    fn test_decode_preserves_primal_and_index() {
        let values = [
            AReal {
                value: f64::MIN_POSITIVE,
                index: TapeIndex::new(42),
            },
            AReal::new(-0.0),
        ];
        let wires = decode_values(&encode_values(&values)).unwrap();
        assert_eq!(wires[0].primal.to_bits(), f64::MIN_POSITIVE.to_bits());
        assert_eq!(wires[0].index, TapeIndex::new(42));
        assert_eq!(wires[1].primal.to_bits(), (-0.0f64).to_bits());
        assert_eq!(wires[1].index, TapeIndex::PASSIVE);
    }

    #[test]
    fn test_located_layout() {
        let value = LocReal::new(AReal::new(2.0), 9);
        let bytes = encode_located(&[value]);
        assert_eq!(bytes.len(), LOCATED_WIRE_BYTES);
        let wires = decode_located(&bytes).unwrap();
        assert_eq!(wires[0].loc, 9);
        assert_eq!(wires[0].value.primal, 2.0);
    }

    #[test]
    fn test_truncated_bytes_are_a_protocol_error() {
        assert!(matches!(decode_values(&[0u8; 13]), Err(AdError::Protocol(_))));
        assert!(matches!(decode_located(&[0u8; 12]), Err(AdError::Protocol(_))));
        assert!(matches!(decode_reals(&[0u8; 7]), Err(AdError::Protocol(_))));
    }
}
