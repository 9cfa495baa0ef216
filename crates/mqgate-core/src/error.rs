//! Error types for mqgate.

use std::io;

use thiserror::Error;

/// Main error type for mqgate.
///
/// Every variant is local to one connection: the caller's only recovery is to
/// close that connection.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream ended, or a read failed, before a full frame was assembled.
    #[error("Incomplete frame: {0}")]
    IncompleteFrame(#[source] io::Error),

    /// The peer closed the stream cleanly between two frames.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Writing to the connection failed.
    #[error("Connection I/O error: {0}")]
    ConnectionIo(#[source] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker collaborator violated its contract.
    #[error("Broker error: {0}")]
    Broker(String),
}

/// MQTT protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Remaining length field exceeds 4 bytes")]
    MalformedLength,

    #[error("Remaining length {0} exceeds 268435455")]
    LengthOutOfRange(usize),

    #[error("Unsupported packet type: {0}")]
    UnsupportedPacketType(u8),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,
}

pub type Result<T> = std::result::Result<T, Error>;
