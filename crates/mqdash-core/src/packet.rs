//! MQTT 3.1.1 packet types and the client-side codec.
//!
//! Only the packets a subscribing/publishing client exchanges with a broker
//! are modelled: outbound packets are encoded, inbound packets are decoded.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
/// SUBACK return code signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

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
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
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
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
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
            _ => Err(ProtocolError::InvalidConnackCode(value)),
        }
    }
}

/// Packets a client receives from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Suback(Suback),
    Unsuback { packet_id: u16 },
    Pingresp,
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One code per requested filter: granted QoS or `SUBACK_FAILURE`.
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Cursor over the variable header and payload of one packet.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Decode the remaining length field (variable length encoding).
/// Returns (length, bytes_consumed) or None if incomplete.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }
        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Append a remaining length field to `buf`.
pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Try to decode one complete broker-to-client packet from the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` when
/// more data is needed, or `Err` on protocol errors. `max_packet_size` of 0
/// disables the size check.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let expected_flags = match packet_type {
        PacketType::Publish => flags,
        PacketType::Pubrel => 0x02,
        _ => 0x00,
    };
    if flags != expected_flags {
        return Err(ProtocolError::InvalidFlags {
            packet: packet_type,
            flags,
        }
        .into());
    }

    let mut decoder = Decoder::new(&buf[header_len..total_len]);
    let packet = match packet_type {
        PacketType::Connack => {
            let ack_flags = decoder.read_u8()?;
            let code = ConnackCode::try_from(decoder.read_u8()?)?;
            Packet::Connack(Connack {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PacketType::Publish => {
            let qos = QoS::try_from((flags >> 1) & 0x03)?;
            let topic = decoder.read_string()?;
            let packet_id = if qos == QoS::AtMostOnce {
                None
            } else {
                Some(decoder.read_u16()?)
            };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: Bytes::copy_from_slice(decoder.rest()),
            })
        }
        PacketType::Puback => Packet::Puback {
            packet_id: decoder.read_u16()?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decoder.read_u16()?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decoder.read_u16()?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decoder.read_u16()?,
        },
        PacketType::Suback => {
            let packet_id = decoder.read_u16()?;
            let return_codes = decoder.rest().to_vec();
            if return_codes.is_empty() {
                return Err(
                    ProtocolError::MalformedPacket("SUBACK without return codes".into()).into(),
                );
            }
            Packet::Suback(Suback {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decoder.read_u16()?,
        },
        PacketType::Pingresp => Packet::Pingresp,
        other => return Err(ProtocolError::UnexpectedPacket(other).into()),
    };

    Ok(Some((packet, total_len)))
}

fn push_string(value: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

/// Encode a CONNECT packet.
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();

    push_string(PROTOCOL_NAME.as_bytes(), &mut payload);
    payload.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    payload.push(flags);
    payload.extend_from_slice(&connect.keep_alive.to_be_bytes());

    push_string(connect.client_id.as_bytes(), &mut payload);
    if let Some(ref username) = connect.username {
        push_string(username.as_bytes(), &mut payload);
    }
    if let Some(ref password) = connect.password {
        push_string(password, &mut payload);
    }

    buf.push((PacketType::Connect as u8) << 4);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let packet_id_len = if publish.packet_id.is_some() { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + packet_id_len + publish.payload.len();
    encode_remaining_length(remaining, buf);

    push_string(publish.topic.as_bytes(), buf);
    if let Some(id) = publish.packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(&publish.payload);
}

/// Encode a SUBSCRIBE packet.
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&subscribe.packet_id.to_be_bytes());

    for (topic, qos) in &subscribe.topics {
        push_string(topic.as_bytes(), &mut payload);
        payload.push(*qos as u8);
    }

    // Fixed header (flags must be 0x02)
    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

/// Encode an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());

    for topic in &unsubscribe.topics {
        push_string(topic.as_bytes(), &mut payload);
    }

    // Fixed header (flags must be 0x02)
    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

/// Encode one of the two-byte acknowledgement packets
/// (PUBACK, PUBREC, PUBREL, PUBCOMP).
pub fn encode_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    let flags = if packet_type == PacketType::Pubrel {
        0x02
    } else {
        0x00
    };
    buf.push(((packet_type as u8) << 4) | flags);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

/// Encode a PINGREQ packet.
pub fn encode_pingreq(buf: &mut Vec<u8>) {
    buf.push((PacketType::Pingreq as u8) << 4);
    buf.push(0);
}

/// Encode a DISCONNECT packet.
pub fn encode_disconnect(buf: &mut Vec<u8>) {
    buf.push((PacketType::Disconnect as u8) << 4);
    buf.push(0);
}
