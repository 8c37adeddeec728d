//! mqdash-core - MQTT wire types and topic matching.
//!
//! This crate provides the client-side MQTT 3.1.1 packet codec and the topic
//! matcher shared by the client and bridge crates.

pub mod error;
pub mod packet;
pub mod topic;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
