//! Payload field encoding
//!
//! All multi-byte fields are big-endian. Fixed point values are sent as
//! integers scaled by a per-field factor (`double16` / `double32`), and
//! configuration floats may use the compact `double32_auto` encoding, which
//! packs a normalized fraction and exponent into 32 bits.

use crate::error::{LinkError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Builder for outgoing payloads
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a payload with its opcode byte
    pub fn with_opcode(opcode: u8) -> Self {
        let mut writer = Self::new();
        writer.put_u8(opcode);
        writer
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    /// Fixed point value scaled into an i16
    pub fn put_double16(&mut self, v: f64, scale: f64) -> &mut Self {
        self.buf.put_i16((v * scale).round() as i16);
        self
    }

    /// Fixed point value scaled into an i32
    pub fn put_double32(&mut self, v: f64, scale: f64) -> &mut Self {
        self.buf.put_i32((v * scale).round() as i32);
        self
    }

    /// Float packed with [`encode_double32_auto`]
    pub fn put_double32_auto(&mut self, v: f64) -> &mut Self {
        self.buf.put_u32(encode_double32_auto(v as f32));
        self
    }

    /// NUL terminated string
    pub fn put_cstring(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn put_slice(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over an incoming payload
///
/// Required fields fail with [`LinkError::Decode`] when the payload is short;
/// optional trailing fields are read after checking [`PayloadReader::remaining`].
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(LinkError::Decode(format!(
                "payload too short for {} ({} of {} bytes)",
                what,
                self.buf.remaining(),
                n
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        self.need(1, "i8")?;
        Ok(self.buf.get_i8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.need(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_double16(&mut self, scale: f64) -> Result<f64> {
        Ok(self.get_i16()? as f64 / scale)
    }

    pub fn get_double32(&mut self, scale: f64) -> Result<f64> {
        Ok(self.get_i32()? as f64 / scale)
    }

    pub fn get_double32_auto(&mut self) -> Result<f64> {
        Ok(decode_double32_auto(self.get_u32()?) as f64)
    }

    /// NUL terminated string; a missing terminator consumes the rest
    pub fn get_cstring(&mut self) -> String {
        let end = self.buf.iter().position(|&b| b == 0);
        let text_len = end.unwrap_or(self.buf.len());
        let text = String::from_utf8_lossy(&self.buf[..text_len]).into_owned();
        let consumed = end.map(|i| i + 1).unwrap_or(text_len);
        self.buf.advance(consumed);
        text
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "byte block")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Remaining bytes, consuming the reader
    pub fn rest(self) -> &'a [u8] {
        self.buf
    }
}

/// Pack a float into the 32-bit auto format used by configuration objects
///
/// For normal floats the result matches the IEEE-754 bit pattern; zero and
/// subnormals encode as 0.
pub fn encode_double32_auto(v: f32) -> u32 {
    if v == 0.0 || !v.is_normal() {
        return 0;
    }
    let bits = v.to_bits();
    let exponent = (bits >> 23) & 0xFF;
    let fraction = bits & 0x7F_FFFF;
    let sign = bits & 0x8000_0000;
    sign | (exponent << 23) | fraction
}

/// Inverse of [`encode_double32_auto`]
pub fn decode_double32_auto(res: u32) -> f32 {
    let exponent = ((res >> 23) & 0xFF) as i32;
    let fraction = res & 0x7F_FFFF;
    let negative = res & 0x8000_0000 != 0;

    let magnitude = if exponent == 0 && fraction == 0 {
        0.0
    } else {
        let f = fraction as f64 / (8_388_608.0 * 2.0) + 0.5;
        (f * 2f64.powi(exponent - 126)) as f32
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_fields_round_half_away_from_zero() {
        let mut w = PayloadWriter::new();
        w.put_double32(-1.00005, 1e4).put_double16(2.45, 1e1);
        let bytes = w.into_vec();
        let mut r = PayloadReader::new(&bytes);
        assert_eq!(r.get_i32().unwrap(), -10001);
        assert_eq!(r.get_i16().unwrap(), 25);
        assert!(r.is_empty());
    }

    #[test]
    fn test_short_payload_is_decode_error() {
        let mut r = PayloadReader::new(&[0x01, 0x02]);
        assert!(matches!(r.get_u32(), Err(LinkError::Decode(_))));
        // a failed read consumes nothing
        assert_eq!(r.get_u16().unwrap(), 0x0102);
    }

    #[test]
    fn test_cstring_with_and_without_terminator() {
        let data = b"410\0tail";
        let mut r = PayloadReader::new(data);
        assert_eq!(r.get_cstring(), "410");
        assert_eq!(r.rest(), b"tail");

        let mut r = PayloadReader::new(b"no-nul");
        assert_eq!(r.get_cstring(), "no-nul");
        assert!(r.is_empty());
    }

    #[test]
    fn test_double32_auto_matches_float_bits() {
        for v in [1.0f32, -2.5, 0.001, 12345.678, -1.0e-20] {
            assert_eq!(encode_double32_auto(v), v.to_bits());
            assert_eq!(decode_double32_auto(encode_double32_auto(v)), v);
        }
        assert_eq!(encode_double32_auto(0.0), 0);
        assert_eq!(decode_double32_auto(0), 0.0);
    }
}
