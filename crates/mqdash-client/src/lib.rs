//! mqdash-client - Non-blocking MQTT client.
//!
//! A small MQTT 3.1.1 client built on mio. The caller drives it by calling
//! [`Client::poll`] and draining [`Client::next_event`]; nothing runs in the
//! background.
//!
//! # Example
//!
//! ```ignore
//! use mqdash_client::{Client, ClientConfig, ClientEvent, QoS};
//!
//! let config = ClientConfig::new("localhost:1883").client_id("dashboard");
//! let mut client = Client::new(config)?;
//! client.connect()?;
//!
//! loop {
//!     client.poll(Some(Duration::from_millis(100)))?;
//!     while let Some(event) = client.next_event() {
//!         if let ClientEvent::Connected { .. } = event {
//!             client.subscribe(&[("$SYS/#", QoS::AtMostOnce)])?;
//!         }
//!     }
//! }
//! ```

mod client;
mod config;
mod error;
mod events;
mod tls;

pub use client::Client;
pub use config::{ClientConfig, TlsConfig};
pub use error::{ClientError, Result};
pub use events::ClientEvent;

// Re-export useful types from core
pub use mqdash_core::packet::QoS;
