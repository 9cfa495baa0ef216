//! Per-connection protocol state machine.
//!
//! ```text
//! AwaitingConnect --CONNECT/CONNACK(accepted)--> Connected --EOF/error--> Closed
//!        |                                         |  ^
//!        +--anything else--> Closed                +--+ SUBSCRIBE/SUBACK, PINGREQ/PINGRESP
//! ```
//!
//! Every frame, including the first, goes through [`FrameReader`], so
//! packets may span reads and a read may carry several packets. The
//! connection is closed on every exit path, including panics, by `Drop`.

use std::sync::Arc;

use log::{debug, info, trace, warn};

use mqgate_core::packet::{
    decode_packet, encode_packet, Connack, ConnackCode, Connect, Packet, Suback, Subscribe,
};
use mqgate_core::{Connection, Error, FrameReader, ProtocolError, Result};

use crate::broker::BrokerCore;

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingConnect,
    Connected,
    Closed,
}

/// Owns one accepted connection and drives it to completion.
pub struct ConnectionHandler<C: Connection> {
    conn: C,
    broker: Arc<dyn BrokerCore>,
    reader: FrameReader,
    state: State,
    client_id: Option<String>,
    peer: String,
    write_buf: Vec<u8>,
}

impl<C: Connection> ConnectionHandler<C> {
    /// `max_packet_size` bounds incoming frames (0 = protocol maximum).
    /// `peer` is only used in log lines.
    pub fn new(
        conn: C,
        broker: Arc<dyn BrokerCore>,
        max_packet_size: usize,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            broker,
            reader: FrameReader::new(max_packet_size),
            state: State::AwaitingConnect,
            client_id: None,
            peer: peer.into(),
            write_buf: Vec::with_capacity(64),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Run the connection until it ends, then close it.
    ///
    /// `Ok(())` means the session ended normally (peer closed, DISCONNECT,
    /// or a refused CONNECT that was answered). `Err` carries the reason the
    /// connection was dropped.
    pub fn run(mut self) -> Result<()> {
        let result = self.handshake().and_then(|accepted| {
            if accepted {
                self.serve()
            } else {
                Ok(())
            }
        });

        match &result {
            Ok(()) => debug!("[{}] Connection closed", self.label()),
            Err(e) => info!("[{}] Closing connection: {}", self.label(), e),
        }

        self.close();
        result
    }

    /// `AwaitingConnect`: the first frame must be a CONNECT. Nothing is sent
    /// back unless a CONNECT was decoded. Returns whether it was accepted.
    fn handshake(&mut self) -> Result<bool> {
        let frame = self.reader.read_frame(&mut self.conn)?;
        let connect = match decode_packet(&frame)? {
            Packet::Connect(connect) => connect,
            other => {
                debug!(
                    "[{}] First packet was {:?}, expected CONNECT",
                    self.peer,
                    other.packet_type()
                );
                return Err(ProtocolError::FirstPacketNotConnect.into());
            }
        };

        let code = self.broker.connect(&connect);
        // Every session is a clean start here, so there is never one to resume.
        self.send(&Packet::Connack(Connack {
            session_present: false,
            code,
        }))?;

        if code != ConnackCode::Accepted {
            info!(
                "[{}] Refused client '{}': {:?}",
                self.peer, connect.client_id, code
            );
            return Ok(false);
        }

        self.on_connected(connect);
        Ok(true)
    }

    fn on_connected(&mut self, connect: Connect) {
        info!(
            "[{}] Client '{}' connected (clean_session={}, keep_alive={}s)",
            self.peer, connect.client_id, connect.clean_session, connect.keep_alive
        );
        self.client_id = Some(connect.client_id);
        self.state = State::Connected;
    }

    /// `Connected`: answer packets until the peer leaves or misbehaves.
    fn serve(&mut self) -> Result<()> {
        loop {
            let frame = match self.reader.read_frame(&mut self.conn) {
                Ok(frame) => frame,
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(Error::IncompleteFrame(e)) => {
                    debug!("[{}] Read ended session: {}", self.label(), e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let packet = match decode_packet(&frame) {
                Ok(packet) => packet,
                // The whole frame was consumed, so the stream is still aligned.
                Err(Error::Protocol(ProtocolError::UnsupportedPacketType(t))) => {
                    debug!(
                        "[{}] Ignoring unsupported packet type {} ({} bytes)",
                        self.label(),
                        t,
                        frame.len()
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match packet {
                Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe)?,
                Packet::Pingreq => {
                    trace!("[{}] PINGREQ", self.label());
                    self.send(&Packet::Pingresp)?;
                }
                Packet::Disconnect => {
                    debug!("[{}] DISCONNECT", self.label());
                    return Ok(());
                }
                Packet::Connect(_) => {
                    // MQTT-3.1.0-2: a second CONNECT is a protocol violation
                    return Err(ProtocolError::MalformedPacket(
                        "CONNECT received on an established connection".into(),
                    )
                    .into());
                }
                other => {
                    debug!(
                        "[{}] Ignoring {:?} from client",
                        self.label(),
                        other.packet_type()
                    );
                }
            }
        }
    }

    fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<()> {
        let client_id = self.client_id.as_deref().unwrap_or_default();
        let return_codes = self.broker.subscribe(client_id, &subscribe.topics);
        if return_codes.len() != subscribe.topics.len() {
            return Err(Error::Broker(format!(
                "{} return codes for {} topic filters",
                return_codes.len(),
                subscribe.topics.len()
            )));
        }

        debug!(
            "[{}] SUBSCRIBE id={} filters={}",
            self.label(),
            subscribe.packet_id,
            subscribe.topics.len()
        );
        self.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
    }

    /// Encode and write one packet. A failed write ends the connection.
    fn send(&mut self, packet: &Packet) -> Result<()> {
        self.write_buf.clear();
        encode_packet(packet, &mut self.write_buf)?;
        self.conn
            .write_all(&self.write_buf)
            .map_err(Error::ConnectionIo)
    }

    fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if self.state == State::Connected {
            if let Some(ref client_id) = self.client_id {
                self.broker.disconnect(client_id);
            }
        }
        self.state = State::Closed;
        self.conn.close();
    }

    fn label(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.peer)
    }
}

impl<C: Connection> Drop for ConnectionHandler<C> {
    fn drop(&mut self) {
        if self.state != State::Closed {
            warn!("[{}] Connection dropped without clean shutdown", self.label());
            self.close();
        }
    }
}
