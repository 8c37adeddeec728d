//! Error types for the codec.

use std::io;

use thiserror::Error;

/// Main error type for mqdash-core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Unexpected packet from server: {0:?}")]
    UnexpectedPacket(crate::packet::PacketType),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid CONNACK return code: {0}")]
    InvalidConnackCode(u8),

    #[error("Invalid fixed header flags {flags:#04x} for {packet:?}")]
    InvalidFlags {
        packet: crate::packet::PacketType,
        flags: u8,
    },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
