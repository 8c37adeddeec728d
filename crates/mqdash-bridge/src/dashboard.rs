//! Query surface for request-serving processes.
//!
//! [`Dashboard`] answers from a local broker connection. [`BridgeView`]
//! answers from what a [`Bridge`](crate::bridge::Bridge) publishes on the
//! bus. Both report "service unavailable" as a [`ServiceError`] rather than
//! as empty data.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;

use mqdash_client::{ClientError, QoS};
use mqdash_core::topic;

use crate::bus::{channels, BusEvent, Command, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, TrackerConfig};
use crate::connection::{BrokerConnection, ConnectionState};
use crate::error::{BusError, ServiceError};
use crate::metrics::{BrokerStats, ClientStats, MetricsCache};
use crate::multiplexer::{ForwardedMessage, Multiplexer};
use crate::tracker::{TopicInfo, TopicList, TopicQuery, TopicTracker};

/// Dashboard core over a directly owned broker connection.
pub struct Dashboard {
    broker: Arc<BrokerConnection>,
    metrics: MetricsCache,
    tracker: TopicTracker,
    multiplexer: Multiplexer,
    /// Serializes re-attachment of the metric and tracker subscriptions.
    attach_lock: Mutex<()>,
}

impl Dashboard {
    pub fn new(broker: Arc<BrokerConnection>, tracker: TrackerConfig) -> Arc<Self> {
        Self::with_clock(broker, tracker, Arc::new(SystemClock))
    }

    pub fn with_clock(
        broker: Arc<BrokerConnection>,
        tracker: TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let dashboard = Arc::new(Self {
            metrics: MetricsCache::new(Arc::clone(&clock)),
            tracker: TopicTracker::with_clock(tracker, Arc::clone(&clock)),
            multiplexer: Multiplexer::with_clock(Arc::clone(&broker), clock),
            broker,
            attach_lock: Mutex::new(()),
        });

        let weak: Weak<Self> = Arc::downgrade(&dashboard);
        dashboard.broker.on_state_change(move |state| {
            if state != ConnectionState::Connected {
                return;
            }
            if let Some(dashboard) = weak.upgrade() {
                dashboard.attach_services();
            }
        });

        dashboard
    }

    /// Build from configuration. The broker is not contacted until `start`.
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ClientError> {
        let broker = BrokerConnection::from_config(&config.broker, &config.broker.client_id)?;
        Ok(Self::new(Arc::new(broker), config.tracker.clone()))
    }

    /// Connect and subscribe the metric and tracker services.
    pub fn start(&self) -> bool {
        if !self.broker.connect() {
            warn!("Dashboard started without a broker connection");
            return false;
        }
        self.attach_services()
    }

    fn attach_services(&self) -> bool {
        let _guard = self.attach_lock.lock();
        // Both are no-ops while our callbacks are still registered.
        let metrics = self.metrics.attach(&self.broker);
        let tracker = self.tracker.attach(&self.broker);
        if metrics && tracker {
            debug!("Dashboard services attached");
        }
        metrics && tracker
    }

    fn require_connected(&self) -> Result<(), ServiceError> {
        if self.broker.is_connected() {
            Ok(())
        } else {
            Err(ServiceError::BrokerDisconnected)
        }
    }

    /// Current broker statistics.
    pub fn metrics(&self) -> Result<BrokerStats, ServiceError> {
        self.require_metrics()?;
        Ok(self.metrics.get_stats())
    }

    /// Client connection counts and rates.
    pub fn client_stats(&self) -> Result<ClientStats, ServiceError> {
        self.require_metrics()?;
        Ok(self.metrics.client_stats())
    }

    fn require_metrics(&self) -> Result<(), ServiceError> {
        self.require_connected()?;
        if !self.metrics.is_attached(&self.broker) {
            return Err(ServiceError::MetricsUnavailable);
        }
        Ok(())
    }

    /// Always answerable.
    pub fn connection_state(&self) -> ConnectionState {
        self.broker.state()
    }

    pub fn list_topics(&self, query: &TopicQuery) -> Result<TopicList, ServiceError> {
        self.require_tracker()?;
        Ok(self.tracker.list(query))
    }

    /// `Ok(None)` means the topic has not been seen.
    pub fn get_topic(&self, name: &str) -> Result<Option<TopicInfo>, ServiceError> {
        self.require_tracker()?;
        Ok(self.tracker.get_topic(name))
    }

    fn require_tracker(&self) -> Result<(), ServiceError> {
        self.require_connected()?;
        if !self.tracker.is_attached(&self.broker) {
            return Err(ServiceError::TrackerUnavailable);
        }
        Ok(())
    }

    pub fn subscribe_session(&self, session_id: &str, pattern: &str) -> Result<(), ServiceError> {
        if session_id.is_empty() {
            return Err(ServiceError::InvalidRequest("session id is empty".into()));
        }
        if pattern.is_empty() {
            return Err(ServiceError::InvalidRequest("topic pattern is empty".into()));
        }
        self.require_connected()?;

        if self.multiplexer.subscribe_session(session_id, pattern) {
            Ok(())
        } else {
            Err(ServiceError::Rejected(format!("subscription to '{}'", pattern)))
        }
    }

    pub fn unsubscribe_session(&self, session_id: &str, pattern: &str) -> Result<(), ServiceError> {
        if pattern.is_empty() {
            return Err(ServiceError::InvalidRequest("topic pattern is empty".into()));
        }
        self.multiplexer.unsubscribe_session(session_id, pattern);
        Ok(())
    }

    /// Drop every subscription of a session that went away.
    pub fn unsubscribe_session_all(&self, session_id: &str) -> usize {
        self.multiplexer.unsubscribe_session_all(session_id)
    }

    /// Patterns the session is subscribed to.
    pub fn session_patterns(&self, session_id: &str) -> Vec<String> {
        self.multiplexer.session_patterns(session_id)
    }

    /// Publish a message to a concrete topic.
    pub fn publish(
        &self,
        topic_name: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ServiceError> {
        if topic_name.is_empty() {
            return Err(ServiceError::InvalidRequest("topic is empty".into()));
        }
        if topic::is_wildcard(topic_name) {
            return Err(ServiceError::InvalidRequest(format!(
                "cannot publish to wildcard topic '{}'",
                topic_name
            )));
        }
        self.require_connected()?;

        if self.broker.publish(topic_name, payload, qos, retain) {
            Ok(())
        } else {
            Err(ServiceError::Rejected(format!("publish to '{}'", topic_name)))
        }
    }

    /// Set where session messages are delivered.
    pub fn set_forwarder<F>(&self, forward: F)
    where
        F: Fn(&ForwardedMessage) + Send + Sync + 'static,
    {
        self.multiplexer.set_forwarder(forward);
    }

    pub fn shutdown(&self) {
        self.metrics.detach(&self.broker);
        self.tracker.detach(&self.broker);
        self.broker.disconnect();
        info!("Dashboard stopped");
    }
}

#[derive(Debug, Default)]
struct ViewState {
    connected: Option<bool>,
    state: Option<ConnectionState>,
    stats: Option<BrokerStats>,
    stats_at: Option<DateTime<Utc>>,
}

impl ViewState {
    fn apply(&mut self, event: BusEvent) {
        match event {
            BusEvent::StatusChange {
                connected, state, ..
            } => {
                self.connected = Some(connected);
                self.state = Some(state);
            }
            BusEvent::StatsUpdate { data, timestamp } => {
                self.stats = Some(data);
                self.stats_at = Some(timestamp);
            }
            BusEvent::MessageReceived { .. } => {}
        }
    }
}

/// Dashboard answers derived from a bridge's bus traffic.
pub struct BridgeView {
    bus: Arc<dyn EventBus>,
    state: Arc<Mutex<ViewState>>,
}

impl BridgeView {
    /// Start listening to the bridge's status and stats channels.
    pub fn new(bus: Arc<dyn EventBus>) -> Result<Self, BusError> {
        let state = Arc::new(Mutex::new(ViewState::default()));

        for channel in [channels::BROKER_STATUS, channels::BROKER_STATS] {
            let sink = Arc::clone(&state);
            bus.subscribe(
                channel,
                Arc::new(move |payload: &str| match serde_json::from_str::<BusEvent>(payload) {
                    Ok(event) => sink.lock().apply(event),
                    Err(e) => warn!("Ignoring malformed event on {}: {}", channel, e),
                }),
            )?;
        }

        Ok(Self { bus, state })
    }

    /// Latest broker statistics reported by the bridge.
    pub fn metrics(&self) -> Result<BrokerStats, ServiceError> {
        let state = self.state.lock();
        if state.connected != Some(true) {
            return Err(ServiceError::BrokerDisconnected);
        }
        state.stats.clone().ok_or(ServiceError::MetricsUnavailable)
    }

    pub fn client_stats(&self) -> Result<ClientStats, ServiceError> {
        self.metrics().map(|stats| stats.client_stats())
    }

    /// When the bridge last published statistics.
    pub fn stats_updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().stats_at
    }

    /// Last state reported by the bridge; `Disconnected` before any report.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .state
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Validate and send a command to the bridge.
    pub fn send_command(&self, command: &Command) -> Result<usize, BusError> {
        command
            .validate()
            .map_err(|e| BusError::Protocol(e.to_string()))?;
        let payload = serde_json::to_string(command)?;
        self.bus.publish(channels::COMMANDS, &payload)
    }
}
