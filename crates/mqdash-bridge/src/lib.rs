//! mqdash-bridge - MQTT broker connectivity for the monitoring dashboard.
//!
//! One [`BrokerConnection`] per process feeds every service: the
//! [`MetricsCache`] (`$SYS/#`), the [`TopicTracker`] (`#`) and the
//! [`Multiplexer`] that fans broker subscriptions out to client sessions.
//! A [`Bridge`] mirrors broker state onto a secondary pub/sub bus
//! ([`RedisBus`]) and takes commands from it, so processes without a broker
//! connection can still answer through a [`BridgeView`].

pub mod bridge;
pub mod bus;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod metrics;
pub mod multiplexer;
pub mod redis;
pub mod tracker;
mod util;

#[cfg(test)]
mod test_support;

pub use bridge::Bridge;
pub use bus::{channels, BusEvent, Command, EventBus, MemoryBus};
pub use clock::{Clock, SystemClock};
pub use config::{Config, ConfigError};
pub use connection::{
    BrokerConnection, CallbackId, ConnectionOptions, ConnectionState, Message, Transport,
};
pub use dashboard::{BridgeView, Dashboard};
pub use error::{BusError, CommandError, ServiceError};
pub use metrics::{BrokerStats, ClientStats, ConnectionRate, MetricsCache, StatsSummary};
pub use multiplexer::{ForwardedMessage, Multiplexer};
pub use redis::RedisBus;
pub use tracker::{TopicInfo, TopicList, TopicQuery, TopicTracker};
pub use util::ListenerId;

pub use mqdash_client::QoS;
