//! Primitive big-endian codec shared by every message payload.

use mdn_common::error::{MdnError, MdnResult};

/// Appends a u8.
pub fn put_u8(output: &mut Vec<u8>, value: u8) {
    output.push(value);
}

/// Appends a big-endian u16.
pub fn put_u16(output: &mut Vec<u8>, value: u16) {
    output.extend_from_slice(&value.to_be_bytes());
}

/// Appends a big-endian u32.
pub fn put_u32(output: &mut Vec<u8>, value: u32) {
    output.extend_from_slice(&value.to_be_bytes());
}

/// Appends a big-endian u64.
pub fn put_u64(output: &mut Vec<u8>, value: u64) {
    output.extend_from_slice(&value.to_be_bytes());
}

/// Appends a length-prefixed byte slice.
///
/// # Errors
///
/// Returns `MdnError::Protocol` when the slice exceeds the u32 length
/// prefix.
pub fn put_slice(output: &mut Vec<u8>, payload: &[u8]) -> MdnResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| wire_error("slice length exceeds u32::MAX".to_owned()))?;
    put_u32(output, len);
    output.extend_from_slice(payload);
    Ok(())
}

pub(crate) fn wire_error(message: impl Into<String>) -> MdnError {
    MdnError::Protocol(format!("wire payload error: {}", message.into()))
}

/// Stateful byte reader that tracks decoding position for robust error
/// messages.
#[derive(Debug)]
pub struct WireCursor<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> WireCursor<'a> {
    /// Wraps one payload for decoding.
    #[must_use]
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    /// Reads a u8.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_u8(&mut self) -> MdnResult<u8> {
        let bytes = self.read_slice(1)?;
        Ok(bytes[0])
    }

    /// Reads a big-endian u16.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_u16(&mut self) -> MdnResult<u16> {
        let bytes = self.read_slice(2)?;
        let mut array = [0_u8; 2];
        array.copy_from_slice(bytes);
        Ok(u16::from_be_bytes(array))
    }

    /// Reads a big-endian u32.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_u32(&mut self) -> MdnResult<u32> {
        let bytes = self.read_slice(4)?;
        let mut array = [0_u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(array))
    }

    /// Reads a big-endian u64.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_u64(&mut self) -> MdnResult<u64> {
        let bytes = self.read_slice(8)?;
        let mut array = [0_u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    /// Reads a length-prefixed byte vector.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_vec(&mut self) -> MdnResult<Vec<u8>> {
        let len = usize::try_from(self.read_u32()?)
            .map_err(|_| wire_error("slice length exceeds platform limits"))?;
        Ok(self.read_slice(len)?.to_vec())
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` on truncated payloads.
    pub fn read_slice(&mut self, len: usize) -> MdnResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| wire_error("offset overflow while decoding"))?;
        if end > self.payload.len() {
            return Err(wire_error(format!(
                "unexpected end of payload at byte offset {} while reading {len} bytes",
                self.offset
            )));
        }
        let bytes = &self.payload[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Number of bytes left to decode.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len().saturating_sub(self.offset)
    }

    /// Rejects trailing garbage after a fully decoded payload.
    ///
    /// # Errors
    ///
    /// Returns `MdnError::Protocol` when bytes remain.
    pub fn ensure_fully_consumed(&self) -> MdnResult<()> {
        if self.offset == self.payload.len() {
            return Ok(());
        }
        Err(wire_error(format!(
            "trailing bytes after payload body: consumed {}, total {}",
            self.offset,
            self.payload.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{put_slice, put_u16, put_u32, put_u64, put_u8, WireCursor};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn integers_round_trip_big_endian() {
        let mut payload = Vec::new();
        put_u8(&mut payload, 0x7f);
        put_u16(&mut payload, 0x0102);
        put_u32(&mut payload, 0x0304_0506);
        put_u64(&mut payload, 0x0708_090a_0b0c_0d0e);

        // Spot-check byte order at the u16 boundary.
        assert_that!(payload[1], eq(0x01_u8));
        assert_that!(payload[2], eq(0x02_u8));

        let mut cursor = WireCursor::new(&payload);
        assert_that!(cursor.read_u8().expect("u8"), eq(0x7f_u8));
        assert_that!(cursor.read_u16().expect("u16"), eq(0x0102_u16));
        assert_that!(cursor.read_u32().expect("u32"), eq(0x0304_0506_u32));
        assert_that!(
            cursor.read_u64().expect("u64"),
            eq(0x0708_090a_0b0c_0d0e_u64)
        );
        assert_that!(cursor.ensure_fully_consumed().is_ok(), eq(true));
    }

    #[rstest]
    fn slices_carry_length_prefix() {
        let mut payload = Vec::new();
        put_slice(&mut payload, b"meridian").expect("slice should fit");
        let mut cursor = WireCursor::new(&payload);
        assert_that!(&cursor.read_vec().expect("vec"), eq(&b"meridian".to_vec()));
    }

    #[rstest]
    fn truncated_payload_is_rejected() {
        let mut payload = Vec::new();
        put_u64(&mut payload, 42);
        let _ = payload.pop();
        let mut cursor = WireCursor::new(&payload);
        assert_that!(cursor.read_u64().is_err(), eq(true));
    }

    #[rstest]
    fn trailing_bytes_are_rejected() {
        let payload = vec![0_u8; 3];
        let mut cursor = WireCursor::new(&payload);
        let _ = cursor.read_u8().expect("u8");
        assert_that!(cursor.ensure_fully_consumed().is_err(), eq(true));
    }
}
