//! Broker statistics gathered from `$SYS` topics.
//!
//! The broker periodically publishes its counters under `$SYS/broker/`.
//! [`MetricsCache`] keeps one [`BrokerStats`] record and updates it one
//! field per message. Readers always get a copy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mqdash_client::QoS;

use crate::clock::{Clock, SystemClock};
use crate::connection::{BrokerConnection, CallbackId};
use crate::util::{guarded, ListenerId, Listeners};

/// Metric topic names.
pub mod topics {
    /// Subscription pattern covering every metric topic.
    pub const SYS_ALL: &str = "$SYS/#";
    /// Prefix of broker-internal topics.
    pub const SYS_PREFIX: &str = "$SYS/";

    pub const VERSION: &str = "$SYS/broker/version";
    pub const UPTIME: &str = "$SYS/broker/uptime";
    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const LOAD_MESSAGES_RECEIVED_1MIN: &str = "$SYS/broker/load/messages/received/1min";
}

/// Snapshot of broker statistics. Every field stays `None` until its
/// topic has been seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub version: Option<String>,
    /// Seconds.
    pub uptime: Option<u64>,

    pub clients_connected: Option<u64>,
    pub clients_disconnected: Option<u64>,
    pub clients_total: Option<u64>,
    pub clients_maximum: Option<u64>,
    pub clients_expired: Option<u64>,

    pub messages_received: Option<u64>,
    pub messages_sent: Option<u64>,
    pub messages_stored: Option<u64>,
    pub messages_inflight: Option<u64>,
    pub messages_dropped: Option<u64>,

    pub publish_messages_received: Option<u64>,
    pub publish_messages_sent: Option<u64>,
    pub publish_messages_dropped: Option<u64>,

    pub bytes_received: Option<u64>,
    pub bytes_sent: Option<u64>,

    pub subscriptions_count: Option<u64>,
    pub retained_messages_count: Option<u64>,

    pub load_messages_received_1min: Option<f64>,
    pub load_messages_received_5min: Option<f64>,
    pub load_messages_received_15min: Option<f64>,
    pub load_messages_sent_1min: Option<f64>,
    pub load_messages_sent_5min: Option<f64>,
    pub load_messages_sent_15min: Option<f64>,
    pub load_bytes_received_1min: Option<f64>,
    pub load_bytes_received_5min: Option<f64>,
    pub load_bytes_received_15min: Option<f64>,
    pub load_bytes_sent_1min: Option<f64>,
    pub load_bytes_sent_5min: Option<f64>,
    pub load_bytes_sent_15min: Option<f64>,
    pub load_connections_1min: Option<f64>,
    pub load_connections_5min: Option<f64>,
    pub load_connections_15min: Option<f64>,
    pub load_publish_received_1min: Option<f64>,
    pub load_publish_received_5min: Option<f64>,
    pub load_publish_received_15min: Option<f64>,
    pub load_publish_sent_1min: Option<f64>,
    pub load_publish_sent_5min: Option<f64>,
    pub load_publish_sent_15min: Option<f64>,
    pub load_sockets_1min: Option<f64>,
    pub load_sockets_5min: Option<f64>,
    pub load_sockets_15min: Option<f64>,

    pub heap_current: Option<u64>,
    pub heap_maximum: Option<u64>,

    /// Time of the last successful field write.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Headline numbers for overview displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub version: Option<String>,
    pub uptime: Option<u64>,
    pub clients_connected: Option<u64>,
    pub messages_received: Option<u64>,
    pub messages_sent: Option<u64>,
    pub load_messages_received_1min: Option<f64>,
    pub load_messages_sent_1min: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BrokerStats {
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            version: self.version.clone(),
            uptime: self.uptime,
            clients_connected: self.clients_connected,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            load_messages_received_1min: self.load_messages_received_1min,
            load_messages_sent_1min: self.load_messages_sent_1min,
            last_updated: self.last_updated,
        }
    }

    /// The client-connection subset of the statistics.
    pub fn client_stats(&self) -> ClientStats {
        ClientStats {
            connected: self.clients_connected,
            disconnected: self.clients_disconnected,
            total: self.clients_total,
            maximum: self.clients_maximum,
            expired: self.clients_expired,
            connection_rate: ConnectionRate {
                one_min: self.load_connections_1min,
                five_min: self.load_connections_5min,
                fifteen_min: self.load_connections_15min,
            },
            last_updated: self.last_updated,
        }
    }
}

/// Client connection counts as reported by the broker.
///
/// `disconnected` counts persistent sessions whose client is offline;
/// `total` is connected plus disconnected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    pub connected: Option<u64>,
    pub disconnected: Option<u64>,
    pub total: Option<u64>,
    pub maximum: Option<u64>,
    pub expired: Option<u64>,
    pub connection_rate: ConnectionRate,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Connections per minute, averaged over three windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRate {
    #[serde(rename = "1min")]
    pub one_min: Option<f64>,
    #[serde(rename = "5min")]
    pub five_min: Option<f64>,
    #[serde(rename = "15min")]
    pub fifteen_min: Option<f64>,
}

type Slot<T> = fn(&mut BrokerStats) -> &mut Option<T>;

/// Where a metric topic is stored and how its payload parses.
#[derive(Clone, Copy)]
enum Field {
    Text(Slot<String>),
    Count(Slot<u64>),
    Load(Slot<f64>),
}

/// Look up the field for a metric topic.
fn field_for(topic: &str) -> Option<Field> {
    use Field::{Count, Load, Text};

    let field = match topic {
        topics::VERSION => Text(|s| &mut s.version),
        topics::UPTIME => Count(|s| &mut s.uptime),

        topics::CLIENTS_CONNECTED => Count(|s| &mut s.clients_connected),
        "$SYS/broker/clients/disconnected" => Count(|s| &mut s.clients_disconnected),
        "$SYS/broker/clients/total" => Count(|s| &mut s.clients_total),
        "$SYS/broker/clients/maximum" => Count(|s| &mut s.clients_maximum),
        "$SYS/broker/clients/expired" => Count(|s| &mut s.clients_expired),

        topics::MESSAGES_RECEIVED => Count(|s| &mut s.messages_received),
        topics::MESSAGES_SENT => Count(|s| &mut s.messages_sent),
        "$SYS/broker/messages/stored" | "$SYS/broker/store/messages/count" => {
            Count(|s| &mut s.messages_stored)
        }
        "$SYS/broker/messages/inflight" => Count(|s| &mut s.messages_inflight),
        "$SYS/broker/messages/dropped" => Count(|s| &mut s.messages_dropped),

        "$SYS/broker/publish/messages/received" => Count(|s| &mut s.publish_messages_received),
        "$SYS/broker/publish/messages/sent" => Count(|s| &mut s.publish_messages_sent),
        "$SYS/broker/publish/messages/dropped" => Count(|s| &mut s.publish_messages_dropped),

        // Some brokers only publish the `publish/bytes` variants.
        "$SYS/broker/bytes/received" | "$SYS/broker/publish/bytes/received" => {
            Count(|s| &mut s.bytes_received)
        }
        "$SYS/broker/bytes/sent" | "$SYS/broker/publish/bytes/sent" => {
            Count(|s| &mut s.bytes_sent)
        }

        "$SYS/broker/subscriptions/count" => Count(|s| &mut s.subscriptions_count),
        "$SYS/broker/retained messages/count" => Count(|s| &mut s.retained_messages_count),

        topics::LOAD_MESSAGES_RECEIVED_1MIN => Load(|s| &mut s.load_messages_received_1min),
        "$SYS/broker/load/messages/received/5min" => {
            Load(|s| &mut s.load_messages_received_5min)
        }
        "$SYS/broker/load/messages/received/15min" => {
            Load(|s| &mut s.load_messages_received_15min)
        }
        "$SYS/broker/load/messages/sent/1min" => Load(|s| &mut s.load_messages_sent_1min),
        "$SYS/broker/load/messages/sent/5min" => Load(|s| &mut s.load_messages_sent_5min),
        "$SYS/broker/load/messages/sent/15min" => Load(|s| &mut s.load_messages_sent_15min),
        "$SYS/broker/load/bytes/received/1min" => Load(|s| &mut s.load_bytes_received_1min),
        "$SYS/broker/load/bytes/received/5min" => Load(|s| &mut s.load_bytes_received_5min),
        "$SYS/broker/load/bytes/received/15min" => Load(|s| &mut s.load_bytes_received_15min),
        "$SYS/broker/load/bytes/sent/1min" => Load(|s| &mut s.load_bytes_sent_1min),
        "$SYS/broker/load/bytes/sent/5min" => Load(|s| &mut s.load_bytes_sent_5min),
        "$SYS/broker/load/bytes/sent/15min" => Load(|s| &mut s.load_bytes_sent_15min),
        "$SYS/broker/load/connections/1min" => Load(|s| &mut s.load_connections_1min),
        "$SYS/broker/load/connections/5min" => Load(|s| &mut s.load_connections_5min),
        "$SYS/broker/load/connections/15min" => Load(|s| &mut s.load_connections_15min),
        "$SYS/broker/load/publish/received/1min" => {
            Load(|s| &mut s.load_publish_received_1min)
        }
        "$SYS/broker/load/publish/received/5min" => {
            Load(|s| &mut s.load_publish_received_5min)
        }
        "$SYS/broker/load/publish/received/15min" => {
            Load(|s| &mut s.load_publish_received_15min)
        }
        "$SYS/broker/load/publish/sent/1min" => Load(|s| &mut s.load_publish_sent_1min),
        "$SYS/broker/load/publish/sent/5min" => Load(|s| &mut s.load_publish_sent_5min),
        "$SYS/broker/load/publish/sent/15min" => Load(|s| &mut s.load_publish_sent_15min),
        "$SYS/broker/load/sockets/1min" => Load(|s| &mut s.load_sockets_1min),
        "$SYS/broker/load/sockets/5min" => Load(|s| &mut s.load_sockets_5min),
        "$SYS/broker/load/sockets/15min" => Load(|s| &mut s.load_sockets_15min),

        "$SYS/broker/heap/current" => Count(|s| &mut s.heap_current),
        "$SYS/broker/heap/maximum" => Count(|s| &mut s.heap_maximum),

        _ => return None,
    };
    Some(field)
}

/// The leading token of a payload such as `"12345 seconds"`.
fn leading_token(payload: &str) -> Option<&str> {
    payload.split_whitespace().next()
}

fn parse_count(payload: &str) -> Option<u64> {
    leading_token(payload)?.parse().ok()
}

fn parse_load(payload: &str) -> Option<f64> {
    leading_token(payload)?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn parse_text(payload: &str) -> Option<String> {
    let text = payload.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Callback receiving the snapshot after every successful update.
pub type StatsCallback = dyn Fn(&BrokerStats) + Send + Sync;

struct Shared {
    stats: Mutex<BrokerStats>,
    callbacks: Listeners<StatsCallback>,
    /// Our callback on the broker's `$SYS/#` registration.
    handle: Mutex<Option<CallbackId>>,
    clock: Arc<dyn Clock>,
}

/// Live broker statistics. Clones share the same record.
#[derive(Clone)]
pub struct MetricsCache {
    shared: Arc<Shared>,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MetricsCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                stats: Mutex::new(BrokerStats::default()),
                callbacks: Listeners::new(),
                handle: Mutex::new(None),
                clock,
            }),
        }
    }

    /// A copy of the current statistics.
    pub fn get_stats(&self) -> BrokerStats {
        self.shared.stats.lock().clone()
    }

    /// Apply one metric message.
    ///
    /// Returns true if a field was written. Unknown topics and payloads
    /// that fail to parse leave the record untouched.
    pub fn update(&self, topic: &str, payload: &str) -> bool {
        let Some(field) = field_for(topic) else {
            trace!("Ignoring unmapped metric topic '{}'", topic);
            return false;
        };

        let snapshot = {
            let mut guard = self.shared.stats.lock();
            let stats: &mut BrokerStats = &mut guard;
            let written = match field {
                Field::Text(slot) => parse_text(payload).map(|v| *slot(stats) = Some(v)),
                Field::Count(slot) => parse_count(payload).map(|v| *slot(stats) = Some(v)),
                Field::Load(slot) => parse_load(payload).map(|v| *slot(stats) = Some(v)),
            };
            if written.is_none() {
                warn!("Failed to parse metric '{}' from payload {:?}", topic, payload);
                return false;
            }
            stats.last_updated = Some(self.shared.clock.now());
            stats.clone()
        };

        for callback in self.shared.callbacks.snapshot() {
            guarded("Metrics update callback", || callback(&snapshot));
        }
        true
    }

    /// Register a callback for every successful update.
    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&BrokerStats) + Send + Sync + 'static,
    {
        self.shared.callbacks.add(Arc::new(callback))
    }

    /// Register a callback that receives the client subset of each update.
    pub fn on_client_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ClientStats) + Send + Sync + 'static,
    {
        self.on_update(move |stats| callback(&stats.client_stats()))
    }

    /// Remove a callback added with [`on_update`](Self::on_update) or
    /// [`on_client_update`](Self::on_client_update).
    pub fn remove_update_callback(&self, id: ListenerId) -> bool {
        self.shared.callbacks.remove(id)
    }

    pub fn client_stats(&self) -> ClientStats {
        self.shared.stats.lock().client_stats()
    }

    pub fn connected_count(&self) -> Option<u64> {
        self.shared.stats.lock().clients_connected
    }

    /// Clients currently online. The broker does not report idle clients
    /// separately, so this equals [`connected_count`](Self::connected_count).
    pub fn active_count(&self) -> Option<u64> {
        self.connected_count()
    }

    /// Connected plus disconnected persistent clients.
    pub fn total_count(&self) -> Option<u64> {
        self.shared.stats.lock().clients_total
    }

    /// Subscribe to the metric namespace on `broker`.
    ///
    /// Other components may register their own callbacks on the same
    /// pattern; they never remove this one.
    pub fn attach(&self, broker: &BrokerConnection) -> bool {
        let mut handle = self.shared.handle.lock();
        if let Some(id) = *handle {
            if broker.is_registered(topics::SYS_ALL, id) {
                return true;
            }
            // Someone dropped the whole pattern from under us.
            debug!("Metrics subscription was removed, subscribing again");
            *handle = None;
        }

        let cache = self.clone();
        let registered = broker.register(topics::SYS_ALL, QoS::AtMostOnce, move |message| {
            cache.update(&message.topic, &message.payload);
        });

        match registered {
            Some(id) => {
                *handle = Some(id);
                info!("Subscribed to broker metrics ({})", topics::SYS_ALL);
                true
            }
            None => {
                warn!("Failed to subscribe to broker metrics");
                false
            }
        }
    }

    /// Unsubscribe from the metric namespace.
    pub fn detach(&self, broker: &BrokerConnection) {
        if let Some(id) = self.shared.handle.lock().take() {
            broker.release(topics::SYS_ALL, id);
            debug!("Unsubscribed from broker metrics");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.handle.lock().is_some()
    }

    /// True while our callback is still registered on `broker`.
    pub fn is_attached(&self, broker: &BrokerConnection) -> bool {
        self.shared
            .handle
            .lock()
            .is_some_and(|id| broker.is_registered(topics::SYS_ALL, id))
    }
}
