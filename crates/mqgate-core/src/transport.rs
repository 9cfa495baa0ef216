//! Transport abstraction.
//!
//! The codec and the connection state machine only ever need three things
//! from a socket, so they depend on this trait rather than a concrete stream.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Byte-stream capabilities required by the protocol core.
pub trait Connection: Send {
    /// Read at most `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer, returning only once it has been handed off.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Close the connection. Must be idempotent.
    fn close(&mut self);
}

impl Connection for TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)?;
        self.flush()
    }

    fn close(&mut self) {
        // NotConnected is expected when the peer already went away.
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_some(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
