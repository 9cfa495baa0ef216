//! mqgate - minimal MQTT broker front end.
//!
//! Accepts TCP connections, performs the CONNECT/CONNACK handshake and
//! answers SUBSCRIBE with SUBACK. Decisions are delegated to a
//! [`BrokerCore`](broker::BrokerCore).

pub mod broker;
pub mod config;
pub mod connection;
pub mod server;

pub use broker::{BrokerCore, GrantAll};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionHandler, State};
pub use server::{Server, ShutdownHandle};
