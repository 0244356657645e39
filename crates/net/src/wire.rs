//! Bounds-checked field access for frame payloads.
//!
//! All integers are big-endian. Reads past the end of the available bytes
//! yield [`DecodeError::Incomplete`], never a partial value.

use crate::error::{DecodeError, EncodeError};
use byteorder::{BigEndian, ByteOrder};

/// Allowed byte length of a string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Minimum length; 1 marks a mandatory field.
    pub min: usize,
    /// Maximum length.
    pub max: usize,
}

impl Bounds {
    /// Mandatory `str8`.
    pub const REQUIRED: Bounds = Bounds { min: 1, max: 0xff };
    /// `str8` that may be empty.
    pub const OPTIONAL: Bounds = Bounds { min: 0, max: 0xff };
    /// Mandatory `str16`.
    pub const REQUIRED_LONG: Bounds = Bounds {
        min: 1,
        max: 0xffff,
    };

    /// Mandatory, capped below the length-prefix range.
    pub const fn required(max: usize) -> Bounds {
        Bounds { min: 1, max }
    }
}

/// Read cursor over received bytes.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take exactly `len` bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// One byte.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    /// Big-endian u16.
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.bytes(2)?))
    }

    /// Big-endian u32.
    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.bytes(4)?))
    }

    /// Big-endian IEEE-754 single; NaN and infinities are malformed.
    pub fn f32(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        let value = BigEndian::read_f32(self.bytes(4)?);
        if !value.is_finite() {
            return Err(DecodeError::malformed(field, "not a finite number"));
        }
        Ok(value)
    }

    /// `[len: u8][bytes]` UTF-8 string.
    pub fn str8(&mut self, field: &'static str, bounds: Bounds) -> Result<String, DecodeError> {
        let len = usize::from(self.u8()?);
        self.text(field, len, bounds)
    }

    /// `[len: u16][bytes]` UTF-8 string.
    pub fn str16(&mut self, field: &'static str, bounds: Bounds) -> Result<String, DecodeError> {
        let len = usize::from(self.u16()?);
        self.text(field, len, bounds)
    }

    fn text(
        &mut self,
        field: &'static str,
        len: usize,
        bounds: Bounds,
    ) -> Result<String, DecodeError> {
        // Length violations are detectable before the body arrives.
        if len < bounds.min {
            return Err(DecodeError::malformed(field, "empty"));
        }
        if len > bounds.max {
            return Err(DecodeError::malformed(field, "too long"));
        }
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::malformed(field, "not valid UTF-8"))
    }
}

/// Append-only writer over an outbound buffer.
#[derive(Debug)]
pub struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    /// Append to `out`.
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    /// One byte.
    pub fn put_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    /// Big-endian u16.
    pub fn put_u16(&mut self, value: u16) {
        let mut raw = [0; 2];
        BigEndian::write_u16(&mut raw, value);
        self.out.extend_from_slice(&raw);
    }

    /// Big-endian u32.
    pub fn put_u32(&mut self, value: u32) {
        let mut raw = [0; 4];
        BigEndian::write_u32(&mut raw, value);
        self.out.extend_from_slice(&raw);
    }

    /// Big-endian IEEE-754 single.
    pub fn put_f32(&mut self, field: &'static str, value: f32) -> Result<(), EncodeError> {
        if !value.is_finite() {
            return Err(EncodeError::new(field, "not a finite number"));
        }
        let mut raw = [0; 4];
        BigEndian::write_f32(&mut raw, value);
        self.out.extend_from_slice(&raw);
        Ok(())
    }

    /// `[len: u8][bytes]`.
    pub fn put_str8(
        &mut self,
        field: &'static str,
        value: &str,
        bounds: Bounds,
    ) -> Result<(), EncodeError> {
        let bounds = Bounds {
            max: bounds.max.min(0xff),
            ..bounds
        };
        check_len(field, value, bounds)?;
        self.put_u8(value.len() as u8);
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// `[len: u16][bytes]`.
    pub fn put_str16(
        &mut self,
        field: &'static str,
        value: &str,
        bounds: Bounds,
    ) -> Result<(), EncodeError> {
        let bounds = Bounds {
            max: bounds.max.min(0xffff),
            ..bounds
        };
        check_len(field, value, bounds)?;
        self.put_u16(value.len() as u16);
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

fn check_len(field: &'static str, value: &str, bounds: Bounds) -> Result<(), EncodeError> {
    if value.len() < bounds.min {
        return Err(EncodeError::new(field, "empty"));
    }
    if value.len() > bounds.max {
        return Err(EncodeError::new(field, "too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        writer.put_u16(0x0102);
        writer.put_u32(0x0304_0506);
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.u16(), Ok(0x0102));
        assert_eq!(reader.u32(), Ok(0x0304_0506));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_reads_are_incomplete_and_do_not_advance() {
        let mut reader = Reader::new(&[0xaa, 0xbb, 0xcc]);
        assert_eq!(reader.u32(), Err(DecodeError::Incomplete));
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.u16(), Ok(0xaabb));
    }

    #[test]
    fn empty_mandatory_string_is_malformed_before_body() {
        let mut reader = Reader::new(&[0]);
        assert_eq!(
            reader.str8("username", Bounds::REQUIRED),
            Err(DecodeError::malformed("username", "empty"))
        );
    }

    #[test]
    fn optional_string_may_be_empty() {
        let mut reader = Reader::new(&[0]);
        assert_eq!(reader.str8("channel", Bounds::OPTIONAL), Ok(String::new()));
    }

    #[test]
    fn declared_length_beyond_buffer_is_incomplete() {
        let mut reader = Reader::new(&[5, b'a', b'b']);
        assert_eq!(
            reader.str8("class", Bounds::REQUIRED),
            Err(DecodeError::Incomplete)
        );
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut reader = Reader::new(&[2, 0xff, 0xfe]);
        assert!(matches!(
            reader.str8("class", Bounds::REQUIRED),
            Err(DecodeError::Malformed { field: "class", .. })
        ));
    }

    #[test]
    fn writer_rejects_oversized_and_non_finite_values() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        let long = "x".repeat(25);
        assert_eq!(
            writer.put_str8("username", &long, Bounds::required(24)),
            Err(EncodeError::new("username", "too long"))
        );
        assert_eq!(
            writer.put_f32("offset", f32::NAN),
            Err(EncodeError::new("offset", "not a finite number"))
        );
        assert!(out.is_empty());
    }
}
