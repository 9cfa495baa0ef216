//! mqgate-core - MQTT framing and packet codec.
//!
//! This crate turns an arbitrarily segmented byte stream into control packet
//! frames, decodes those frames into typed packets and encodes replies. It
//! depends on nothing but the [`Connection`](transport::Connection) trait for
//! I/O, so the server crate can drive it over TCP and tests over memory.

pub mod error;
pub mod frame;
pub mod packet;
pub mod transport;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use frame::FrameReader;
pub use packet::*;
pub use transport::Connection;
