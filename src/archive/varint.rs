//! Variable-Length Integer Primitives
//!
//! LEB128-style unsigned varints, zigzag for signed values, and
//! fixed-precision floats packed into zigzag varints.
//!
//! ```text
//! value 300 = 0b1_0010_1100
//!   byte 0: 1010_1100  (low 7 bits, continuation set)
//!   byte 1: 0000_0010  (next 7 bits, continuation clear)
//! ```

use super::ArchiveError;

/// Longest legal encoding of a u64 (ceil(64 / 7)).
pub const MAX_VARINT_LEN: usize = 10;

/// Append an unsigned varint.
pub fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buffer.push((value as u8) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

/// Read an unsigned varint at `pos`, advancing it.
pub fn read_varint(buffer: &[u8], pos: &mut usize) -> Result<u64, ArchiveError> {
    let mut result: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buffer.get(*pos).ok_or(ArchiveError::UnexpectedEof { offset: *pos })?;
        *pos += 1;

        let bits = (byte & 0x7F) as u64;
        // Tenth byte may only carry the single remaining bit.
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ArchiveError::VarintOverflow { offset: *pos - 1 });
        }
        result |= bits << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ArchiveError::VarintOverflow { offset: *pos })
}

/// Map a signed value onto unsigned so small magnitudes stay short.
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Quantize a float to `precision` fractional bits.
#[inline]
pub fn float_to_fixed(value: f32, precision: u32) -> i64 {
    (value as f64 * (1u64 << precision) as f64).round() as i64
}

/// Inverse of [`float_to_fixed`].
#[inline]
pub fn fixed_to_float(value: i64, precision: u32) -> f32 {
    (value as f64 / (1u64 << precision) as f64) as f32
}
