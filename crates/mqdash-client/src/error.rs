//! Client error types.

use std::io;

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] mqdash_core::ProtocolError),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<mqdash_core::Error> for ClientError {
    fn from(e: mqdash_core::Error) -> Self {
        match e {
            mqdash_core::Error::Io(e) => ClientError::Io(e),
            mqdash_core::Error::Protocol(e) => ClientError::Protocol(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
