//! Client events and state types.

use bytes::Bytes;
use mqdash_core::packet::QoS;

/// Events returned by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// CONNACK accepted.
    Connected {
        /// Whether a previous session was restored.
        session_present: bool,
    },
    /// Connection closed, refused or timed out.
    Disconnected {
        /// Reason for disconnection, if known.
        reason: Option<String>,
    },
    /// Received a publish message.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Subscribe acknowledgment.
    SubAck {
        /// Packet ID of the SUBSCRIBE.
        packet_id: u16,
        /// Return codes for each topic (0x00-0x02 = granted QoS, 0x80 = failure).
        return_codes: Vec<u8>,
    },
    /// Unsubscribe acknowledgment.
    UnsubAck { packet_id: u16 },
    /// Publish acknowledgment (QoS 1).
    PubAck { packet_id: u16 },
    /// Publish complete (QoS 2).
    PubComp { packet_id: u16 },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    /// Socket open, CONNACK not yet received.
    Connecting,
    Connected,
}
