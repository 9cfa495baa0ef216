//! Frame reader: reconstructs control packet boundaries from a byte stream.
//!
//! A frame is `1 (type + flags) + len(remaining length) + remaining length`
//! bytes. The reader pulls the length field one byte at a time so it never
//! consumes bytes belonging to the next frame, then reads the body with as
//! many underlying reads as it takes.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, ProtocolError, Result};
use crate::transport::Connection;
use crate::varint::{VarIntDecoder, MAX_LEN, MAX_VALUE};

/// Largest possible frame: header byte + 4 length bytes + maximum body.
pub const MAX_FRAME_SIZE: usize = 1 + MAX_LEN + MAX_VALUE as usize;

/// Reads one complete control packet frame per call.
#[derive(Debug)]
pub struct FrameReader {
    max_frame_size: usize,
    buf: BytesMut,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameReader {
    /// Create a reader that rejects frames larger than `max_frame_size` bytes
    /// (0 = no limit beyond what the length field can express).
    pub fn new(max_frame_size: usize) -> Self {
        let max_frame_size = if max_frame_size == 0 {
            MAX_FRAME_SIZE
        } else {
            max_frame_size.min(MAX_FRAME_SIZE)
        };
        Self {
            max_frame_size,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Block until exactly one frame has been read from `conn`.
    ///
    /// Returns the header byte, the length bytes and the body, concatenated.
    /// Errors:
    /// - `ConnectionClosed` if the peer closed before the first byte,
    /// - `IncompleteFrame` if the stream failed or closed mid-frame,
    /// - `MalformedLength` if the length field runs past 4 bytes,
    /// - `PacketTooLarge` if the declared frame exceeds the limit.
    ///
    /// After any error the stream alignment is lost and the caller must
    /// drop the connection.
    pub fn read_frame<C: Connection + ?Sized>(&mut self, conn: &mut C) -> Result<Bytes> {
        self.buf.clear();

        let header = match read_byte(conn) {
            Ok(Some(b)) => b,
            Ok(None) => return Err(Error::ConnectionClosed),
            Err(e) => return Err(Error::IncompleteFrame(e)),
        };
        self.buf.extend_from_slice(&[header]);

        let mut decoder = VarIntDecoder::new();
        let remaining = loop {
            let byte = read_byte(conn)
                .and_then(|b| b.ok_or_else(eof))
                .map_err(Error::IncompleteFrame)?;
            self.buf.extend_from_slice(&[byte]);
            if let Some(len) = decoder.push(byte)? {
                break len as usize;
            }
        };

        let header_len = self.buf.len();
        let total = header_len + remaining;
        if total > self.max_frame_size {
            return Err(ProtocolError::PacketTooLarge {
                size: total,
                max: self.max_frame_size,
            }
            .into());
        }

        self.buf.resize(total, 0);
        let mut filled = header_len;
        while filled < total {
            match conn.read_some(&mut self.buf[filled..total]) {
                Ok(0) => return Err(Error::IncompleteFrame(eof())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IncompleteFrame(e)),
            }
        }

        Ok(self.buf.split().freeze())
    }
}

fn read_byte<C: Connection + ?Sized>(conn: &mut C) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match conn.read_some(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-frame")
}
