//! Secondary pub/sub bus: channels, wire messages and an in-process bus.
//!
//! Messages are JSON objects with a `type` discriminator. The bridge
//! publishes [`BusEvent`]s and consumes [`Command`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use mqdash_client::QoS;

use crate::connection::ConnectionState;
use crate::error::{BusError, CommandError};
use crate::metrics::BrokerStats;
use crate::util::guarded;

/// Channel names.
pub mod channels {
    /// Metrics snapshots from the bridge.
    pub const BROKER_STATS: &str = "mqtt:broker:stats";
    /// Broker connection status changes.
    pub const BROKER_STATUS: &str = "mqtt:broker:status";
    /// Commands for the bridge.
    pub const COMMANDS: &str = "mqtt:commands";
    /// Messages on topics subscribed through commands.
    pub const MQTT_MESSAGES: &str = "mqtt:messages";
}

/// Handler for raw channel payloads.
pub type BusHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A pub/sub bus carrying JSON text.
pub trait EventBus: Send + Sync {
    /// Publish to a channel. Returns the number of receivers, if known.
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError>;

    /// Add a handler for a channel.
    fn subscribe(&self, channel: &str, handler: BusHandler) -> Result<(), BusError>;

    /// Remove every handler for a channel.
    fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Release connections. Later calls fail with [`BusError::Closed`].
    fn close(&self) -> Result<(), BusError>;
}

/// Serialize and publish an event.
pub fn publish_event(
    bus: &dyn EventBus,
    channel: &str,
    event: &BusEvent,
) -> Result<usize, BusError> {
    let payload = serde_json::to_string(event)?;
    bus.publish(channel, &payload)
}

/// Events published by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    StatsUpdate {
        data: BrokerStats,
        timestamp: DateTime<Utc>,
    },
    StatusChange {
        connected: bool,
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
    MessageReceived {
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
        timestamp: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn status(state: ConnectionState, timestamp: DateTime<Utc>) -> Self {
        BusEvent::StatusChange {
            connected: state == ConnectionState::Connected,
            state,
            timestamp,
        }
    }
}

/// Commands accepted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "cmd_publish")]
    Publish {
        topic: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
    #[serde(rename = "cmd_subscribe")]
    Subscribe {
        topic: String,
        #[serde(default)]
        qos: u8,
    },
    #[serde(rename = "cmd_unsubscribe")]
    Unsubscribe { topic: String },
}

impl Command {
    /// Decode and validate a command from JSON.
    pub fn parse(json: &str) -> Result<Self, CommandError> {
        let command: Command =
            serde_json::from_str(json).map_err(|e| CommandError::Malformed(e.to_string()))?;
        command.validate()?;
        Ok(command)
    }

    pub fn topic(&self) -> &str {
        match self {
            Command::Publish { topic, .. }
            | Command::Subscribe { topic, .. }
            | Command::Unsubscribe { topic } => topic,
        }
    }

    /// Requested QoS, for commands that carry one.
    pub fn qos(&self) -> Result<QoS, CommandError> {
        match self {
            Command::Publish { qos, .. } | Command::Subscribe { qos, .. } => {
                QoS::try_from(*qos).map_err(|_| CommandError::InvalidQos(*qos))
            }
            Command::Unsubscribe { .. } => Ok(QoS::AtMostOnce),
        }
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.topic().is_empty() {
            return Err(CommandError::EmptyTopic);
        }
        self.qos().map(|_| ())
    }
}

/// In-process bus with synchronous delivery.
#[derive(Default)]
pub struct MemoryBus {
    handlers: RwLock<HashMap<String, Vec<BusHandler>>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError> {
        self.check_open()?;
        let handlers = self
            .handlers
            .read()
            .get(channel)
            .cloned()
            .unwrap_or_default();

        trace!("{} -> {} handler(s)", channel, handlers.len());
        for handler in &handlers {
            guarded("Bus handler", || handler(payload));
        }
        Ok(handlers.len())
    }

    fn subscribe(&self, channel: &str, handler: BusHandler) -> Result<(), BusError> {
        self.check_open()?;
        self.handlers
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(handler);
        debug!("Subscribed to bus channel {}", channel);
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.check_open()?;
        self.handlers.write().remove(channel);
        Ok(())
    }

    fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        self.handlers.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn test_parse_commands() {
        let cmd = Command::parse(r#"{"type":"cmd_publish","topic":"a/b","payload":"on","qos":1,"retain":true}"#)
            .unwrap();
        assert_eq!(
            cmd,
            Command::Publish {
                topic: "a/b".into(),
                payload: "on".into(),
                qos: 1,
                retain: true
            }
        );
        assert_eq!(cmd.qos(), Ok(QoS::AtLeastOnce));

        let cmd = Command::parse(r#"{"type":"cmd_publish","topic":"a"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Publish {
                topic: "a".into(),
                payload: String::new(),
                qos: 0,
                retain: false
            }
        );

        let cmd = Command::parse(r#"{"type":"cmd_subscribe","topic":"x/#"}"#).unwrap();
        assert_eq!(cmd.topic(), "x/#");

        let cmd = Command::parse(r#"{"type":"cmd_unsubscribe","topic":"x/#"}"#).unwrap();
        assert_eq!(cmd, Command::Unsubscribe { topic: "x/#".into() });
    }

    #[test]
    fn test_parse_rejects_bad_commands() {
        assert_eq!(
            Command::parse(r#"{"type":"cmd_publish","topic":"a","qos":5}"#),
            Err(CommandError::InvalidQos(5))
        );
        assert_eq!(
            Command::parse(r#"{"type":"cmd_publish","topic":""}"#),
            Err(CommandError::EmptyTopic)
        );
        assert!(matches!(
            Command::parse(r#"{"type":"cmd_reboot"}"#),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            Command::parse(r#"{"type":"cmd_subscribe"}"#),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            Command::parse("not json"),
            Err(CommandError::Malformed(_))
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let timestamp = Utc::now();
        let event = BusEvent::status(ConnectionState::Reconnecting, timestamp);
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status_change");
        assert_eq!(value["connected"], false);
        assert_eq!(value["state"], "reconnecting");

        let event = BusEvent::MessageReceived {
            topic: "t".into(),
            payload: "p".into(),
            qos: 0,
            retain: false,
            timestamp,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message_received");
        assert_eq!(value["topic"], json!("t"));

        let event = BusEvent::StatsUpdate {
            data: BrokerStats::default(),
            timestamp,
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: BusEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_memory_bus_fan_out() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let sink = Arc::clone(&seen);
            bus.subscribe(
                "chan",
                Arc::new(move |payload: &str| sink.lock().push(format!("{}:{}", id, payload))),
            )
            .unwrap();
        }

        assert_eq!(bus.publish("chan", "hello").unwrap(), 2);
        assert_eq!(bus.publish("other", "ignored").unwrap(), 0);
        assert_eq!(*seen.lock(), vec!["0:hello", "1:hello"]);

        bus.unsubscribe("chan").unwrap();
        assert_eq!(bus.publish("chan", "again").unwrap(), 0);
    }

    #[test]
    fn test_memory_bus_closed() {
        let bus = MemoryBus::new();
        bus.close().unwrap();
        assert!(matches!(bus.publish("chan", "x"), Err(BusError::Closed)));
        assert!(matches!(
            bus.subscribe("chan", Arc::new(|_: &str| {})),
            Err(BusError::Closed)
        ));
    }

    #[test]
    fn test_publish_event() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            channels::BROKER_STATUS,
            Arc::new(move |payload: &str| *sink.lock() = Some(payload.to_string())),
        )
        .unwrap();

        publish_event(
            &bus,
            channels::BROKER_STATUS,
            &BusEvent::status(ConnectionState::Connected, Utc::now()),
        )
        .unwrap();
        let payload = seen.lock().clone().unwrap();
        assert!(payload.contains(r#""connected":true"#));
    }
}
