//! Variable Byte Integer encoding/decoding for the MQTT remaining length.
//!
//! The encoding uses 7 bits per byte for the value, with the high bit
//! indicating whether more bytes follow. At most 4 bytes are allowed:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value representable in 4 bytes.
pub const MAX_VALUE: u32 = 268_435_455;

/// Maximum number of bytes in an encoded value.
pub const MAX_LEN: usize = 4;

/// Incremental decoder fed one byte at a time.
///
/// Used by the frame reader so it never reads past the length field before
/// knowing how large the body is.
#[derive(Debug, Default, Clone)]
pub struct VarIntDecoder {
    value: u32,
    consumed: usize,
}

impl VarIntDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next byte.
    ///
    /// Returns `Ok(Some(value))` once the terminating byte (MSB clear) has
    /// been seen, `Ok(None)` if more bytes are needed, and `MalformedLength`
    /// if a fifth byte would be required.
    pub fn push(&mut self, byte: u8) -> Result<Option<u32>> {
        if self.consumed == MAX_LEN {
            return Err(ProtocolError::MalformedLength.into());
        }
        self.value |= ((byte & 0x7F) as u32) << (7 * self.consumed);
        self.consumed += 1;

        if byte & 0x80 == 0 {
            return Ok(Some(self.value));
        }
        if self.consumed == MAX_LEN {
            return Err(ProtocolError::MalformedLength.into());
        }
        Ok(None)
    }

    /// Number of bytes fed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

/// Decode a variable byte integer from the start of a buffer.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if more data is needed, or `Err` if the encoding is invalid.
///
/// # Example
/// ```
/// use mqgate_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut decoder = VarIntDecoder::new();
    for &byte in buf {
        if let Some(value) = decoder.push(byte)? {
            return Ok(Some((value, decoder.consumed())));
        }
    }
    Ok(None)
}

/// Encode a value as a variable byte integer, appending to a Vec.
///
/// Always produces the minimal encoding. Returns the number of bytes written.
///
/// # Example
/// ```
/// use mqgate_core::varint::encode;
/// let mut buf = Vec::new();
/// let written = encode(300, &mut buf).unwrap();
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode(value: usize, buf: &mut Vec<u8>) -> Result<usize> {
    if value > MAX_VALUE as usize {
        return Err(ProtocolError::LengthOutOfRange(value).into());
    }
    let mut value = value as u32;
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Calculate the number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use mqgate_core::varint::encoded_len;
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// ```
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
