//! Fixed-width and length-prefixed primitive encoding.
//!
//! All integers and floats are little-endian. Strings are a 7-bit
//! variable-length byte count followed by UTF-8; a `char` is its UTF-8
//! encoding (1 to 4 bytes). Readers never consume past what the matching
//! writer produced and report truncation as [`NetError::UnexpectedEof`].

use crate::error::{NetError, Result};
use crate::types::{Decimal, Vec2, Vec3};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Upper bounds applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecLimits {
    pub max_collection_len: usize,
    pub max_string_len: usize,
    /// Deepest list or composite nesting a decode may enter.
    pub max_depth: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_collection_len: 64 * 1024,
            max_string_len: 64 * 1024,
            max_depth: 64,
        }
    }
}

impl CodecLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_collection_len(mut self, max: usize) -> Self {
        self.max_collection_len = max;
        self
    }

    pub fn with_max_string_len(mut self, max: usize) -> Self {
        self.max_string_len = max;
        self
    }

    pub fn with_max_depth(mut self, max: usize) -> Self {
        self.max_depth = max;
        self
    }
}

macro_rules! impl_write_le {
    ($name:ident, $type:ty, $put:ident) => {
        pub fn $name(&mut self, value: $type) {
            self.buffer.$put(value);
        }
    };
}

macro_rules! impl_read_le {
    ($name:ident, $type:ty, $get:ident, $size:expr) => {
        pub fn $name(&mut self) -> Result<$type> {
            self.require($size)?;
            Ok(self.buf.$get())
        }
    };
}

pub struct NetWriter {
    buffer: BytesMut,
}

impl NetWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.put_u8(value as u8);
    }

    impl_write_le!(write_u8, u8, put_u8);
    impl_write_le!(write_i8, i8, put_i8);
    impl_write_le!(write_u16, u16, put_u16_le);
    impl_write_le!(write_i16, i16, put_i16_le);
    impl_write_le!(write_u32, u32, put_u32_le);
    impl_write_le!(write_i32, i32, put_i32_le);
    impl_write_le!(write_u64, u64, put_u64_le);
    impl_write_le!(write_i64, i64, put_i64_le);
    impl_write_le!(write_f32, f32, put_f32_le);
    impl_write_le!(write_f64, f64, put_f64_le);

    pub fn write_decimal(&mut self, value: Decimal) {
        for word in value.to_words() {
            self.buffer.put_u32_le(word);
        }
    }

    pub fn write_char(&mut self, value: char) {
        let mut utf8 = [0u8; 4];
        self.buffer.put_slice(value.encode_utf8(&mut utf8).as_bytes());
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| NetError::ValueOutOfRange {
            value: value.len() as u64,
            width: 4,
        })?;
        self.write_var_u32(len);
        self.buffer.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_vec2(&mut self, value: Vec2) {
        self.write_f32(value.x);
        self.write_f32(value.y);
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    /// Writes a collection element count as a 32-bit integer.
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| NetError::ValueOutOfRange {
            value: len as u64,
            width: 4,
        })?;
        self.write_u32(len);
        Ok(())
    }

    /// Writes `value` as an unsigned integer of exactly `width` bytes.
    /// A value that does not fit is rejected, never truncated.
    pub fn write_uint(&mut self, value: u64, width: usize) -> Result<()> {
        match width {
            1 => self.write_u8(narrow(value, width)?),
            2 => self.write_u16(narrow(value, width)?),
            4 => self.write_u32(narrow(value, width)?),
            8 => self.write_u64(value),
            _ => {
                return Err(NetError::InvalidValue(format!(
                    "unsupported integer width {}",
                    width
                )))
            }
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    fn write_var_u32(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.buffer.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buffer.put_u8(value as u8);
    }
}

impl Default for NetWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn narrow<T: TryFrom<u64>>(value: u64, width: usize) -> Result<T> {
    T::try_from(value).map_err(|_| NetError::ValueOutOfRange { value, width })
}

pub struct NetReader<'a> {
    buf: &'a [u8],
    len: usize,
    depth: usize,
    limits: CodecLimits,
}

impl<'a> NetReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_limits(data, CodecLimits::default())
    }

    pub fn with_limits(data: &'a [u8], limits: CodecLimits) -> Self {
        Self {
            buf: data,
            len: data.len(),
            depth: 0,
            limits,
        }
    }

    pub fn limits(&self) -> &CodecLimits {
        &self.limits
    }

    /// Steps one level into a list or composite. Pair with [`leave`](Self::leave).
    pub fn enter(&mut self) -> Result<()> {
        if self.depth >= self.limits.max_depth {
            return Err(NetError::NestingTooDeep {
                depth: self.depth + 1,
                limit: self.limits.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.len - self.buf.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Fails if any bytes are left unread.
    pub fn expect_end(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(NetError::InvalidMessage(format!(
                "{} trailing byte(s) after offset {}",
                self.remaining(),
                self.position()
            )));
        }
        Ok(())
    }

    fn require(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(NetError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(NetError::InvalidMessage(format!(
                "invalid boolean byte {:#04x} at offset {}",
                other,
                self.position() - 1
            ))),
        }
    }

    impl_read_le!(read_u8, u8, get_u8, 1);
    impl_read_le!(read_i8, i8, get_i8, 1);
    impl_read_le!(read_u16, u16, get_u16_le, 2);
    impl_read_le!(read_i16, i16, get_i16_le, 2);
    impl_read_le!(read_u32, u32, get_u32_le, 4);
    impl_read_le!(read_i32, i32, get_i32_le, 4);
    impl_read_le!(read_u64, u64, get_u64_le, 8);
    impl_read_le!(read_i64, i64, get_i64_le, 8);
    impl_read_le!(read_f32, f32, get_f32_le, 4);
    impl_read_le!(read_f64, f64, get_f64_le, 8);

    pub fn read_decimal(&mut self) -> Result<Decimal> {
        self.require(16)?;
        let words = [
            self.buf.get_u32_le(),
            self.buf.get_u32_le(),
            self.buf.get_u32_le(),
            self.buf.get_u32_le(),
        ];
        Decimal::from_words(words)
    }

    pub fn read_char(&mut self) -> Result<char> {
        self.require(1)?;
        let width = match self.buf[0] {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            other => {
                return Err(NetError::InvalidMessage(format!(
                    "invalid UTF-8 lead byte {:#04x}",
                    other
                )))
            }
        };
        let bytes = self.take(width)?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| NetError::InvalidMessage("invalid UTF-8 character".to_string()))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        if len > self.limits.max_string_len {
            return Err(NetError::LengthLimitExceeded {
                length: len,
                limit: self.limits.max_string_len,
            });
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| NetError::InvalidMessage(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn read_vec2(&mut self) -> Result<Vec2> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Reads a 32-bit collection element count, bounded by the collection limit.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > self.limits.max_collection_len {
            return Err(NetError::LengthLimitExceeded {
                length: len,
                limit: self.limits.max_collection_len,
            });
        }
        Ok(len)
    }

    pub fn read_uint(&mut self, width: usize) -> Result<u64> {
        match width {
            1 => self.read_u8().map(u64::from),
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => Err(NetError::InvalidValue(format!(
                "unsupported integer width {}",
                width
            ))),
        }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.require(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn read_var_u32(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            if shift == 28 && byte > 0x0F {
                return Err(NetError::InvalidMessage(
                    "variable-length integer overflows 32 bits".to_string(),
                ));
            }
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(NetError::InvalidMessage(
            "variable-length integer overflows 32 bits".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_widths() {
        let mut writer = NetWriter::new();
        writer.write_bool(true);
        writer.write_i16(-2);
        writer.write_u32(7);
        writer.write_f64(1.5);
        writer.write_vec2(Vec2::new(1.0, 2.0));
        writer.write_vec3(Vec3::new(1.0, 2.0, 3.0));
        writer.write_decimal(Decimal::from_i64(-1999, 2).unwrap());
        assert_eq!(writer.len(), 1 + 2 + 4 + 8 + 8 + 12 + 16);

        let bytes = writer.freeze();
        let mut reader = NetReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert_eq!(reader.read_vec2().unwrap(), Vec2::new(1.0, 2.0));
        assert_eq!(reader.read_vec3().unwrap(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(
            reader.read_decimal().unwrap(),
            Decimal::from_i64(-1999, 2).unwrap()
        );
        assert!(reader.expect_end().is_ok());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = NetWriter::new();
        writer.write_u32(0x0403_0201);
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_string_length_prefix() {
        let long = "x".repeat(200);
        let mut writer = NetWriter::new();
        writer.write_string("hi").unwrap();
        writer.write_string(&long).unwrap();
        let bytes = writer.freeze();

        assert_eq!(&bytes[..3], &[2, b'h', b'i']);
        // 200 needs two 7-bit groups
        assert_eq!(&bytes[3..5], &[0xC8, 0x01]);

        let mut reader = NetReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "hi");
        assert_eq!(reader.read_string().unwrap(), long);
    }

    #[test]
    fn test_char_is_utf8() {
        let mut writer = NetWriter::new();
        writer.write_char('a');
        writer.write_char('é');
        writer.write_char('🎯');
        assert_eq!(writer.len(), 1 + 2 + 4);

        let bytes = writer.freeze();
        let mut reader = NetReader::new(&bytes);
        assert_eq!(reader.read_char().unwrap(), 'a');
        assert_eq!(reader.read_char().unwrap(), 'é');
        assert_eq!(reader.read_char().unwrap(), '🎯');
    }

    #[test]
    fn test_truncated_read() {
        let mut reader = NetReader::new(&[1, 2]);
        match reader.read_u32() {
            Err(NetError::UnexpectedEof { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_bool_byte() {
        let mut reader = NetReader::new(&[2]);
        assert!(matches!(reader.read_bool(), Err(NetError::InvalidMessage(_))));
    }

    #[test]
    fn test_write_uint_rejects_overflow() {
        let mut writer = NetWriter::new();
        assert!(writer.write_uint(255, 1).is_ok());
        assert!(matches!(
            writer.write_uint(256, 1),
            Err(NetError::ValueOutOfRange { value: 256, width: 1 })
        ));
        assert!(writer.write_uint(70_000, 4).is_ok());
        assert_eq!(writer.len(), 5);
    }

    #[test]
    fn test_length_limits() {
        let limits = CodecLimits::new()
            .with_max_collection_len(4)
            .with_max_string_len(2);

        let mut writer = NetWriter::new();
        writer.write_len(5).unwrap();
        writer.write_string("abc").unwrap();
        let bytes = writer.freeze();

        let mut reader = NetReader::with_limits(&bytes, limits);
        assert!(matches!(
            reader.read_len(),
            Err(NetError::LengthLimitExceeded { length: 5, limit: 4 })
        ));
        assert!(matches!(
            reader.read_string(),
            Err(NetError::LengthLimitExceeded { length: 3, limit: 2 })
        ));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let reader = NetReader::new(&[0]);
        assert!(reader.expect_end().is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_i64(v in any::<i64>()) {
            let mut writer = NetWriter::new();
            writer.write_i64(v);
            let bytes = writer.freeze();
            prop_assert_eq!(NetReader::new(&bytes).read_i64().unwrap(), v);
        }

        #[test]
        fn roundtrip_string(s in ".*") {
            let mut writer = NetWriter::new();
            writer.write_string(&s).unwrap();
            let bytes = writer.freeze();
            let mut reader = NetReader::new(&bytes);
            prop_assert_eq!(reader.read_string().unwrap(), s);
            prop_assert!(reader.is_empty());
        }

        #[test]
        fn roundtrip_f32_bits(bits in any::<u32>()) {
            let mut writer = NetWriter::new();
            writer.write_f32(f32::from_bits(bits));
            let bytes = writer.freeze();
            prop_assert_eq!(NetReader::new(&bytes).read_f32().unwrap().to_bits(), bits);
        }
    }
}
