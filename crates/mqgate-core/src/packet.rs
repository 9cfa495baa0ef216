//! MQTT 3.1.1 control packet types and codec.
//!
//! The codec works on complete frames as produced by
//! [`FrameReader`](crate::frame::FrameReader): the first byte carries the
//! packet type and flags, followed by the remaining length and exactly that
//! many body bytes.

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::UnsupportedPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags mandated for this packet type.
    fn required_flags(self) -> u8 {
        match self {
            PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => 0x02,
            _ => 0x00,
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT protocol names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// Per-filter SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubackReturnCode {
    Granted(QoS),
    Failure,
}

impl SubackReturnCode {
    pub const FAILURE: u8 = 0x80;

    pub fn to_byte(self) -> u8 {
        match self {
            SubackReturnCode::Granted(qos) => qos as u8,
            SubackReturnCode::Failure => Self::FAILURE,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte == Self::FAILURE {
            return Ok(SubackReturnCode::Failure);
        }
        QoS::try_from(byte)
            .map(SubackReturnCode::Granted)
            .map_err(|_| {
                ProtocolError::MalformedPacket(format!("Invalid SUBACK return code: {:#04x}", byte))
                    .into()
            })
    }
}

/// CONNECT flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectFlags {
    pub clean_session: bool,
    pub will_flag: bool,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub password_flag: bool,
    pub username_flag: bool,
}

impl ConnectFlags {
    /// Parse and validate the flags byte.
    pub fn from_byte(flags: u8) -> Result<Self> {
        // Reserved bit must be 0
        if flags & 0x01 != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Reserved connect flag set: {:#04x}",
                flags
            ))
            .into());
        }

        let parsed = Self {
            clean_session: flags & 0x02 != 0,
            will_flag: flags & 0x04 != 0,
            will_qos: QoS::try_from((flags >> 3) & 0x03)?,
            will_retain: flags & 0x20 != 0,
            password_flag: flags & 0x40 != 0,
            username_flag: flags & 0x80 != 0,
        };

        if !parsed.will_flag && (parsed.will_qos != QoS::AtMostOnce || parsed.will_retain) {
            return Err(ProtocolError::MalformedPacket(
                "Will QoS and Will Retain must be 0 when Will Flag is 0".into(),
            )
            .into());
        }
        if parsed.password_flag && !parsed.username_flag {
            return Err(ProtocolError::MalformedPacket(
                "Password Flag must be 0 when Username Flag is 0".into(),
            )
            .into());
        }

        Ok(parsed)
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if self.will_flag {
            flags |= 0x04;
        }
        flags |= (self.will_qos as u8) << 3;
        if self.will_retain {
            flags |= 0x20;
        }
        if self.password_flag {
            flags |= 0x40;
        }
        if self.username_flag {
            flags |= 0x80;
        }
        flags
    }
}

/// Fixed header of a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl Header {
    /// Parse the fixed header at the start of `frame`.
    ///
    /// Returns the header and the number of bytes it occupies.
    pub fn decode(frame: &[u8]) -> Result<(Header, usize)> {
        let Some(&first) = frame.first() else {
            return Err(ProtocolError::MalformedPacket("Empty frame".into()).into());
        };
        let packet_type = PacketType::try_from(first >> 4)?;
        let Some((remaining_length, len_bytes)) = varint::decode(&frame[1..])? else {
            return Err(
                ProtocolError::MalformedPacket("Truncated remaining length".into()).into(),
            );
        };
        Ok((
            Header {
                packet_type,
                flags: first & 0x0F,
                remaining_length,
            },
            1 + len_bytes,
        ))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        varint::encode(self.remaining_length as usize, buf)?;
        Ok(())
    }
}

/// MQTT Packets handled by this codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Subscribe(Subscribe),
    Suback(Suback),
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// Flags byte implied by this packet's fields.
    pub fn flags(&self) -> ConnectFlags {
        ConnectFlags {
            clean_session: self.clean_session,
            will_flag: self.will.is_some(),
            will_qos: self.will.as_ref().map(|w| w.qos).unwrap_or_default(),
            will_retain: self.will.as_ref().is_some_and(|w| w.retain),
            password_flag: self.password.is_some(),
            username_flag: self.username.is_some(),
        }
    }
}

/// Will message configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS, in request order.
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One code per requested filter, in request order.
    pub return_codes: Vec<SubackReturnCode>,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Fixed header this packet encodes with.
    pub fn header(&self) -> Result<Header> {
        let mut body = Vec::new();
        self.encode_body(&mut body)?;
        header_for(self.packet_type(), body.len())
    }

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Packet::Connect(connect) => encode_connect_body(connect, buf)?,
            Packet::Connack(connack) => {
                buf.push(connack.session_present as u8);
                buf.push(connack.code as u8);
            }
            Packet::Subscribe(subscribe) => {
                buf.extend_from_slice(&subscribe.packet_id.to_be_bytes());
                for (topic, qos) in &subscribe.topics {
                    write_string(topic, buf)?;
                    buf.push(*qos as u8);
                }
            }
            Packet::Suback(suback) => {
                buf.extend_from_slice(&suback.packet_id.to_be_bytes());
                buf.extend(suback.return_codes.iter().map(|c| c.to_byte()));
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
        }
        Ok(())
    }
}

fn header_for(packet_type: PacketType, body_len: usize) -> Result<Header> {
    if body_len > varint::MAX_VALUE as usize {
        return Err(ProtocolError::LengthOutOfRange(body_len).into());
    }
    Ok(Header {
        packet_type,
        flags: packet_type.required_flags(),
        remaining_length: body_len as u32,
    })
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn truncated(&self, needed: usize) -> ProtocolError {
        ProtocolError::MalformedPacket(format!(
            "Truncated packet: need {} bytes at offset {}, have {}",
            needed,
            self.pos,
            self.remaining()
        ))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.truncated(1))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.truncated(len).into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::MalformedPacket("Invalid UTF-8 string".into()).into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn finish(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} has {} trailing bytes",
                what,
                self.remaining()
            ))
            .into());
        }
        Ok(())
    }
}

/// Decode one complete frame into a packet.
///
/// The frame's declared remaining length must match the number of body bytes
/// exactly. Packet types this codec does not implement fail with
/// `UnsupportedPacketType`; everything else that doesn't parse is
/// `MalformedPacket`.
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    let (header, header_len) = Header::decode(frame)?;
    let body = &frame[header_len..];
    if body.len() != header.remaining_length as usize {
        return Err(ProtocolError::MalformedPacket(format!(
            "Remaining length {} does not match body of {} bytes",
            header.remaining_length,
            body.len()
        ))
        .into());
    }

    let packet_type = header.packet_type;
    let supported = matches!(
        packet_type,
        PacketType::Connect
            | PacketType::Connack
            | PacketType::Subscribe
            | PacketType::Suback
            | PacketType::Pingreq
            | PacketType::Pingresp
            | PacketType::Disconnect
    );
    if !supported {
        return Err(ProtocolError::UnsupportedPacketType(packet_type as u8).into());
    }

    // MQTT-3.8.1-1 and friends: reserved flag values are fixed per type
    if header.flags != packet_type.required_flags() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{:?} fixed header flags must be {:#04x}, got {:#04x}",
            packet_type,
            packet_type.required_flags(),
            header.flags
        ))
        .into());
    }

    let mut dec = Decoder::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut dec)?),
        PacketType::Connack => Packet::Connack(decode_connack(&mut dec)?),
        PacketType::Subscribe => Packet::Subscribe(decode_subscribe(&mut dec)?),
        PacketType::Suback => Packet::Suback(decode_suback(&mut dec)?),
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
        other => return Err(ProtocolError::UnsupportedPacketType(other as u8).into()),
    };
    dec.finish(&format!("{:?}", packet_type))?;

    Ok(packet)
}

fn decode_connect(dec: &mut Decoder<'_>) -> Result<Connect> {
    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid protocol name: '{}'",
            protocol_name
        ))
        .into());
    }

    let protocol_level = dec.read_u8()?;
    let flags = ConnectFlags::from_byte(dec.read_u8()?)?;
    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if flags.will_flag {
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: flags.will_qos,
            retain: flags.will_retain,
        })
    } else {
        None
    };

    let username = if flags.username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if flags.password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags.clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connack(dec: &mut Decoder<'_>) -> Result<Connack> {
    let ack_flags = dec.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Reserved CONNACK flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    })
}

fn decode_subscribe(dec: &mut Decoder<'_>) -> Result<Subscribe> {
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;

        // MQTT-4.7.3-1: Topic Filter must be at least 1 character
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }

        let options = dec.read_u8()?;
        // MQTT-3.8.3-4: upper 6 bits of the requested QoS byte are reserved
        if options & 0xFC != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Reserved bits set in requested QoS: {:#04x}",
                options
            ))
            .into());
        }
        topics.push((topic, QoS::try_from(options)?));
    }

    // MQTT-3.8.3-3: at least one topic filter
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Subscribe { packet_id, topics })
}

fn decode_suback(dec: &mut Decoder<'_>) -> Result<Suback> {
    let packet_id = dec.read_u16()?;
    let return_codes = dec
        .read_bytes(dec.remaining())?
        .iter()
        .map(|&b| SubackReturnCode::from_byte(b))
        .collect::<Result<Vec<_>>>()?;
    Ok(Suback {
        packet_id,
        return_codes,
    })
}

/// Encode a packet, appending the complete frame to `buf`.
///
/// The remaining length is computed from the encoded body. Bodies too large
/// for the length field fail with `LengthOutOfRange`, string or binary
/// fields longer than 65,535 bytes with `MalformedPacket`; either way `buf`
/// is left untouched.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    packet.encode_body(&mut body)?;
    let header = header_for(packet.packet_type(), body.len())?;
    buf.reserve(1 + varint::encoded_len(header.remaining_length) + body.len());
    header.encode(buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

fn encode_connect_body(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    write_string(&connect.protocol_name, buf)?;
    buf.push(connect.protocol_level);
    buf.push(connect.flags().to_byte());
    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, buf)?;

    if let Some(ref will) = connect.will {
        write_string(&will.topic, buf)?;
        write_binary(&will.message, buf)?;
    }
    if let Some(ref username) = connect.username {
        write_string(username, buf)?;
    }
    if let Some(ref password) = connect.password {
        write_binary(password, buf)?;
    }
    Ok(())
}

fn write_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    write_binary(s.as_bytes(), buf)
}

/// Two-byte length prefix followed by the bytes.
fn write_binary(bytes: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        ProtocolError::MalformedPacket(format!(
            "Field of {} bytes exceeds the 65535-byte limit",
            bytes.len()
        ))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}
