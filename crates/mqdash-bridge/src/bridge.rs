//! The bridge process role.
//!
//! Holds the deployment's broker connection and relays between it and the
//! secondary bus:
//!
//! - `$SYS` metrics are folded into a [`MetricsCache`] and published as
//!   `stats_update` at most once per interval
//! - connection changes are published as `status_change`
//! - commands from the bus publish, subscribe and unsubscribe on the broker;
//!   messages on commanded subscriptions are relayed as `message_received`
//!
//! Relayed messages go through a bounded queue drained by a worker thread,
//! so a slow bus never holds up the broker's network thread. When the
//! queue is full new messages are dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::bus::{channels, publish_event, BusEvent, Command, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::connection::{BrokerConnection, CallbackId, ConnectionState, Message};
use crate::metrics::MetricsCache;
use crate::util::guarded;

/// Messages waiting for the relay worker.
pub const RELAY_QUEUE: usize = 1024;

type Worker = Mutex<Option<(JoinHandle<()>, Sender<()>)>>;

pub struct Bridge {
    broker: Arc<BrokerConnection>,
    bus: Arc<dyn EventBus>,
    stats: MetricsCache,
    /// Metrics changed since the last `stats_update`.
    dirty: AtomicBool,
    /// Topics subscribed through commands, with our broker callback.
    dynamic: Mutex<HashMap<String, CallbackId>>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    ticker: Worker,
    relay: Worker,
    relay_tx: Sender<BusEvent>,
    relay_rx: Receiver<BusEvent>,
    /// Messages dropped because the relay queue was full.
    relay_dropped: AtomicU64,
    /// Last state announced on the status channel.
    last_status: Mutex<Option<ConnectionState>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl Bridge {
    pub fn new(
        broker: Arc<BrokerConnection>,
        bus: Arc<dyn EventBus>,
        stats_interval: Duration,
    ) -> Arc<Self> {
        Self::with_clock(broker, bus, stats_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(
        broker: Arc<BrokerConnection>,
        bus: Arc<dyn EventBus>,
        stats_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (relay_tx, relay_rx) = bounded(RELAY_QUEUE);
        let bridge = Arc::new(Self {
            broker,
            bus,
            stats: MetricsCache::new(Arc::clone(&clock)),
            dirty: AtomicBool::new(false),
            dynamic: Mutex::new(HashMap::new()),
            interval: stats_interval,
            clock,
            ticker: Mutex::new(None),
            relay: Mutex::new(None),
            relay_tx,
            relay_rx,
            relay_dropped: AtomicU64::new(0),
            last_status: Mutex::new(None),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&bridge);
        bridge.stats.on_update(move |_| {
            if let Some(bridge) = weak.upgrade() {
                bridge.dirty.store(true, Ordering::SeqCst);
            }
        });

        let weak = Arc::downgrade(&bridge);
        bridge.broker.on_state_change(move |state| {
            if let Some(bridge) = weak.upgrade() {
                bridge.on_state_change(state);
            }
        });

        bridge
    }

    /// Connect and begin relaying. Returns false if the broker or the bus
    /// could not be reached.
    pub fn start(self: &Arc<Self>) -> bool {
        info!("Starting MQTT bridge...");

        if !self.broker.connect() {
            error!("Failed to connect to MQTT broker");
            return false;
        }

        if !self.stats.attach(&self.broker) {
            warn!("Broker metrics unavailable; stats will not be published");
        }

        if let Err(e) = self.spawn_relay() {
            error!("Failed to start message relay: {}", e);
            return false;
        }

        let weak = Arc::downgrade(self);
        let handler = Arc::new(move |payload: &str| {
            if let Some(bridge) = weak.upgrade() {
                bridge.handle_command(payload);
            }
        });
        if let Err(e) = self.bus.subscribe(channels::COMMANDS, handler) {
            error!("Failed to subscribe to {}: {}", channels::COMMANDS, e);
            return false;
        }
        info!("Listening for commands on {}", channels::COMMANDS);

        if let Err(e) = self.spawn_ticker() {
            error!("Failed to start stats publisher: {}", e);
            return false;
        }

        self.started.store(true, Ordering::SeqCst);
        self.announce(self.broker.state());
        info!("MQTT bridge started");
        true
    }

    fn spawn_ticker(self: &Arc<Self>) -> std::io::Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let weak: Weak<Self> = Arc::downgrade(self);
        let ticks = tick(self.interval);

        let handle = thread::Builder::new()
            .name("mqdash-stats".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticks) -> _ => match weak.upgrade() {
                        Some(bridge) => {
                            bridge.flush_stats();
                        }
                        None => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })?;

        *self.ticker.lock() = Some((handle, stop_tx));
        debug!("Publishing stats every {:?}", self.interval);
        Ok(())
    }

    fn spawn_relay(&self) -> std::io::Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let events = self.relay_rx.clone();
        let bus = Arc::clone(&self.bus);

        let handle = thread::Builder::new()
            .name("mqdash-relay".to_string())
            .spawn(move || loop {
                select! {
                    recv(events) -> event => match event {
                        Ok(event) => {
                            if let Err(e) =
                                publish_event(bus.as_ref(), channels::MQTT_MESSAGES, &event)
                            {
                                warn!("Failed to relay message: {}", e);
                            }
                        }
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })?;

        *self.relay.lock() = Some((handle, stop_tx));
        Ok(())
    }

    fn on_state_change(&self, state: ConnectionState) {
        if !self.started.load(Ordering::SeqCst) || self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.announce(state);
    }

    /// Publish `state` unless it was the last state published.
    fn announce(&self, state: ConnectionState) {
        let mut last = self.last_status.lock();
        if *last != Some(state) && self.publish_status(state) {
            *last = Some(state);
        }
    }

    fn publish_status(&self, state: ConnectionState) -> bool {
        let event = BusEvent::status(state, self.clock.now());
        match publish_event(self.bus.as_ref(), channels::BROKER_STATUS, &event) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to publish status {:?}: {}", state, e);
                false
            }
        }
    }

    /// The bridge's own metrics snapshot.
    pub fn stats(&self) -> &MetricsCache {
        &self.stats
    }

    /// Publish a `stats_update` if metrics changed since the last one.
    ///
    /// Runs once per interval on the ticker thread; returns true if
    /// something was published.
    pub fn flush_stats(&self) -> bool {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return false;
        }

        let event = BusEvent::StatsUpdate {
            data: self.stats.get_stats(),
            timestamp: self.clock.now(),
        };
        match publish_event(self.bus.as_ref(), channels::BROKER_STATS, &event) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to publish stats: {}", e);
                // Retry on the next tick.
                self.dirty.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Run one command received from the bus.
    pub fn handle_command(self: &Arc<Self>, payload: &str) {
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping bus command: {}", e);
                return;
            }
        };
        // Validated by parse
        let Ok(qos) = command.qos() else {
            return;
        };

        match command {
            Command::Publish {
                topic,
                payload,
                retain,
                ..
            } => {
                if self.broker.publish(&topic, payload.as_bytes(), qos, retain) {
                    info!("Published to {}", topic);
                } else {
                    error!("Failed to publish to {}", topic);
                }
            }
            Command::Subscribe { topic, .. } => self.subscribe_dynamic(&topic, qos),
            Command::Unsubscribe { topic } => self.unsubscribe_dynamic(&topic),
        }
    }

    fn subscribe_dynamic(self: &Arc<Self>, topic: &str, qos: mqdash_client::QoS) {
        let mut dynamic = self.dynamic.lock();
        if dynamic.contains_key(topic) {
            warn!("Already subscribed to {}", topic);
            return;
        }

        let weak = Arc::downgrade(self);
        let registered = self.broker.register(topic, qos, move |message| {
            if let Some(bridge) = weak.upgrade() {
                bridge.forward_message(message);
            }
        });

        match registered {
            Some(id) => {
                dynamic.insert(topic.to_string(), id);
                info!("Subscribed to {}", topic);
            }
            None => error!("Failed to subscribe to {}", topic),
        }
    }

    fn unsubscribe_dynamic(&self, topic: &str) {
        let Some(id) = self.dynamic.lock().remove(topic) else {
            warn!("Not subscribed to {}", topic);
            return;
        };
        if self.broker.release(topic, id) {
            info!("Unsubscribed from {}", topic);
        } else {
            warn!("Failed to unsubscribe from {}", topic);
        }
    }

    /// Runs on the broker's network thread; only queues the event.
    fn forward_message(&self, message: &Message) {
        let event = BusEvent::MessageReceived {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos.into(),
            retain: message.retain,
            timestamp: self.clock.now(),
        };
        match self.relay_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.relay_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "Relay queue full, dropped message on {} ({} dropped so far)",
                        message.topic, dropped
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Relay stopped, dropping message on {}", message.topic);
            }
        }
    }

    /// Messages dropped because the bus could not keep up.
    pub fn relay_dropped(&self) -> u64 {
        self.relay_dropped.load(Ordering::Relaxed)
    }

    /// Topics subscribed through commands, sorted.
    pub fn dynamic_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.dynamic.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Stop relaying and release both connections. Each step runs even if
    /// an earlier one failed. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping MQTT bridge...");

        let ticker = self.ticker.lock().take();
        if let Some((handle, stop)) = ticker {
            let _ = stop.try_send(());
            if handle.join().is_err() {
                error!("Stats publisher thread panicked");
            }
        }

        if !self.publish_status(ConnectionState::Disconnected) {
            warn!("Final status was not published");
        }

        let topics: Vec<(String, CallbackId)> = self.dynamic.lock().drain().collect();
        for (topic, id) in topics {
            guarded("Unsubscribing dynamic topic", || {
                if !self.broker.release(&topic, id) {
                    warn!("Failed to unsubscribe from {}", topic);
                }
            });
        }

        guarded("Disconnecting MQTT broker", || self.broker.disconnect());

        let relay = self.relay.lock().take();
        if let Some((handle, stop)) = relay {
            let _ = stop.try_send(());
            if handle.join().is_err() {
                error!("Message relay thread panicked");
            }
        }
        let pending = self.relay_rx.try_iter().count();
        if pending > 0 {
            warn!("Discarded {} queued message(s) on shutdown", pending);
        }

        if let Err(e) = self.bus.close() {
            error!("Error closing bus connection: {}", e);
        }

        info!("Bridge stopped");
    }
}
