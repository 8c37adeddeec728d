//! Broker connection with reconnection and topic-pattern dispatch.
//!
//! A [`BrokerConnection`] owns one transport (normally an MQTT [`Client`])
//! and a background network thread that pumps it. Inbound messages are
//! matched against the registered patterns and handed to every callback
//! registered under a matching pattern.
//!
//! State machine:
//! - `Disconnected` → `Connecting` on [`BrokerConnection::connect`]
//! - `Connecting` → `Connected` on CONNACK, or back to `Disconnected` on
//!   error or timeout
//! - `Connected` → `Reconnecting` when the broker drops the connection
//!   (unless auto-reconnect is off, then `Disconnected`)
//! - `Reconnecting` → `Connected` after a successful retry; retries run at a
//!   fixed delay until [`BrokerConnection::disconnect`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use mqdash_client::{Client, ClientConfig, ClientError, ClientEvent, QoS, TlsConfig};
use mqdash_core::packet::SUBACK_FAILURE;
use mqdash_core::topic;

use crate::config::BrokerConfig;
use crate::util::guarded;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A message delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    /// UTF-8 payload, or lowercase hex when the payload is not valid UTF-8.
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: &[u8], qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: decode_payload(payload),
            qos,
            retain,
        }
    }
}

/// Render a payload as text: UTF-8 if valid, otherwise lowercase hex.
pub fn decode_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_owned(),
        Err(_) => hex::encode(payload),
    }
}

/// Callback invoked for each message on a matching pattern.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;
/// Callback invoked on every connection state transition.
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// The network side of a broker connection.
///
/// Implemented by [`Client`]; tests substitute an in-memory transport.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), ClientError>;
    fn disconnect(&mut self) -> Result<(), ClientError>;
    /// True while a socket is open, whether or not CONNACK has arrived.
    fn is_open(&self) -> bool;
    fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), ClientError>;
    fn unsubscribe(&mut self, pattern: &str) -> Result<(), ClientError>;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool)
        -> Result<(), ClientError>;
    fn poll(&mut self, timeout: Duration) -> Result<(), ClientError>;
    fn next_event(&mut self) -> Option<ClientEvent>;
}

impl Transport for Client {
    fn connect(&mut self) -> Result<(), ClientError> {
        Client::connect(self)
    }

    fn disconnect(&mut self) -> Result<(), ClientError> {
        Client::disconnect(self)
    }

    fn is_open(&self) -> bool {
        Client::is_open(self)
    }

    fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), ClientError> {
        Client::subscribe(self, &[(pattern, qos)]).map(|_| ())
    }

    fn unsubscribe(&mut self, pattern: &str) -> Result<(), ClientError> {
        Client::unsubscribe(self, &[pattern]).map(|_| ())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        Client::publish(self, topic, payload, qos, retain).map(|_| ())
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), ClientError> {
        Client::poll(self, Some(timeout)).map(|_| ())
    }

    fn next_event(&mut self) -> Option<ClientEvent> {
        Client::next_event(self)
    }
}

/// Timing and retry behaviour of a [`BrokerConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long `connect()` waits for the broker to accept.
    pub connect_timeout: Duration,
    /// How often `connect()` checks for acceptance.
    pub connect_poll_interval: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Reconnect after a broker-initiated disconnect.
    pub auto_reconnect: bool,
    /// Transport poll timeout of the network thread.
    pub io_poll_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_poll_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            auto_reconnect: true,
            io_poll_timeout: Duration::from_millis(20),
        }
    }
}

impl From<&BrokerConfig> for ConnectionOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            reconnect_delay: Duration::from_secs(config.reconnect_delay),
            auto_reconnect: config.auto_reconnect,
            ..Default::default()
        }
    }
}

/// Handle for one callback added with [`BrokerConnection::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct Registration {
    qos: QoS,
    callbacks: Vec<(CallbackId, MessageCallback)>,
}

struct Inner {
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    transport: Mutex<Box<dyn Transport>>,
    registry: Mutex<HashMap<String, Registration>>,
    next_callback: AtomicU64,
    listeners: Mutex<Vec<StateListener>>,
    /// Network thread alive. Only changed under the `state` lock.
    running: AtomicBool,
    stop: Mutex<bool>,
    wakeup: Condvar,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn stopped(&self) -> bool {
        *self.stop.lock()
    }

    fn signal_stop(&self) {
        *self.stop.lock() = true;
        self.wakeup.notify_all();
    }

    /// Sleep for `timeout` unless stopped first. Returns true if stopped.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stop.lock();
        while !*stopped {
            if self.wakeup.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    /// Move to `to` from any state; listeners run only if it changed.
    fn set_state(&self, to: ConnectionState) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != to;
            *state = to;
            changed
        };
        if changed {
            self.notify(to);
        }
        changed
    }

    fn notify(&self, state: ConnectionState) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            guarded("Connection state listener", || listener(state));
        }
    }

    fn run_network(&self) {
        let mut attempt_started: Option<Instant> = None;

        loop {
            let current = {
                let state = self.state.lock();
                if *state == ConnectionState::Disconnected || self.stopped() {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
                *state
            };

            match current {
                ConnectionState::Reconnecting => {
                    if self.transport.lock().is_open() {
                        let started = *attempt_started.get_or_insert_with(Instant::now);
                        if started.elapsed() >= self.options.connect_timeout {
                            warn!("Reconnect attempt timed out waiting for CONNACK");
                            let _ = self.transport.lock().disconnect();
                            attempt_started = None;
                            continue;
                        }
                        self.pump();
                    } else {
                        attempt_started = None;
                        if self.wait_for_stop(self.options.reconnect_delay) {
                            continue;
                        }
                        if self.state() != ConnectionState::Reconnecting {
                            continue;
                        }
                        info!("Attempting to reconnect to MQTT broker...");
                        match self.transport.lock().connect() {
                            Ok(()) => attempt_started = Some(Instant::now()),
                            Err(e) => warn!("Reconnect failed: {}", e),
                        }
                    }
                }
                _ => self.pump(),
            }
        }

        debug!("Network thread exiting");
    }

    /// Poll the transport once and handle what it produced.
    fn pump(&self) {
        let events: Vec<ClientEvent> = {
            let mut transport = self.transport.lock();
            match transport.poll(self.options.io_poll_timeout) {
                Ok(()) => std::iter::from_fn(|| transport.next_event()).collect(),
                Err(e) => {
                    let _ = transport.disconnect();
                    vec![ClientEvent::Disconnected {
                        reason: Some(e.to_string()),
                    }]
                }
            }
        };

        for event in events {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { session_present } => self.on_connected(session_present),
            ClientEvent::Disconnected { reason } => self.on_connection_lost(reason),
            ClientEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => self.dispatch(&Message::new(topic, &payload, qos, retain)),
            ClientEvent::SubAck {
                packet_id,
                return_codes,
            } => {
                if return_codes.contains(&SUBACK_FAILURE) {
                    warn!("Broker rejected subscription (packet {})", packet_id);
                } else {
                    trace!("SUBACK packet_id={} codes={:?}", packet_id, return_codes);
                }
            }
            other => trace!("Transport event {:?}", other),
        }
    }

    fn on_connected(&self, session_present: bool) {
        let patterns: Vec<(String, QoS)> = self
            .registry
            .lock()
            .iter()
            .map(|(pattern, reg)| (pattern.clone(), reg.qos))
            .collect();

        let previous = {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    let previous = *state;
                    *state = ConnectionState::Connected;
                    previous
                }
                other => {
                    debug!("Ignoring CONNACK while {:?}", other);
                    return;
                }
            }
        };

        info!(
            "Connected to MQTT broker (session_present={})",
            session_present
        );

        if !patterns.is_empty() {
            let mut transport = self.transport.lock();
            for (pattern, qos) in &patterns {
                if let Err(e) = transport.subscribe(pattern, *qos) {
                    warn!("Failed to restore subscription '{}': {}", pattern, e);
                }
            }
            drop(transport);
            if previous == ConnectionState::Reconnecting {
                info!("Restored {} subscription(s) after reconnect", patterns.len());
            }
        }

        self.notify(ConnectionState::Connected);
    }

    fn on_connection_lost(&self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "connection closed".to_string());
        let reconnect = self.options.auto_reconnect && !self.stopped();

        let next = {
            let mut state = self.state.lock();
            let next = match *state {
                ConnectionState::Connected if reconnect => ConnectionState::Reconnecting,
                ConnectionState::Connected | ConnectionState::Connecting => {
                    ConnectionState::Disconnected
                }
                other => {
                    debug!("Transport closed while {:?}: {}", other, reason);
                    return;
                }
            };
            *state = next;
            next
        };

        if next == ConnectionState::Reconnecting {
            warn!(
                "Disconnected from MQTT broker ({}), retrying every {:?}",
                reason, self.options.reconnect_delay
            );
        } else {
            warn!("Disconnected from MQTT broker ({})", reason);
        }
        self.notify(next);
    }

    fn dispatch(&self, message: &Message) {
        let handlers: Vec<(String, MessageCallback)> = {
            let registry = self.registry.lock();
            registry
                .iter()
                .filter(|(pattern, _)| topic::matches(pattern, &message.topic))
                .flat_map(|(pattern, reg)| {
                    reg.callbacks
                        .iter()
                        .map(move |(_, callback)| (pattern.clone(), Arc::clone(callback)))
                })
                .collect()
        };

        if handlers.is_empty() {
            trace!("No subscription matches '{}'", message.topic);
            return;
        }

        for (pattern, handler) in handlers {
            let what = format!("Callback for '{}' on '{}'", pattern, message.topic);
            guarded(&what, || handler(message));
        }
    }
}

/// The single broker connection of a process role.
pub struct BrokerConnection {
    inner: Arc<Inner>,
    network: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    /// Create a connection over an arbitrary transport.
    pub fn new(transport: Box<dyn Transport>, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(ConnectionState::Disconnected),
                transport: Mutex::new(transport),
                registry: Mutex::new(HashMap::new()),
                next_callback: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stop: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            network: Mutex::new(None),
        }
    }

    /// Create an MQTT connection from configuration.
    pub fn from_config(config: &BrokerConfig, client_id: &str) -> Result<Self, ClientError> {
        let mut client_config = ClientConfig::new(config.address())
            .client_id(client_id)
            .keep_alive(config.keepalive)
            .connect_timeout(Duration::from_secs(config.connect_timeout));

        if let Some(ref username) = config.username {
            client_config = client_config.credentials(username.clone(), config.password.clone());
        }

        if config.tls.enabled {
            client_config = client_config.tls(TlsConfig {
                ca_cert: config.tls.ca_cert.clone(),
                server_name: config.tls.server_name.clone(),
                accept_invalid_certs: config.tls.accept_invalid_certs,
            });
        }

        let client = Client::new(client_config)?;
        Ok(Self::new(Box::new(client), ConnectionOptions::from(config)))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a listener for state transitions.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    /// Connect and wait until the broker accepts or the timeout elapses.
    ///
    /// Never fails loudly: transport errors are logged and reported as
    /// `false` with the state back at `Disconnected`.
    pub fn connect(&self) -> bool {
        *self.inner.stop.lock() = false;

        let spawn = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Connected => return true,
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    warn!("connect() called while {:?}", *state);
                    return false;
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
            !self.inner.running.swap(true, Ordering::SeqCst)
        };
        self.inner.notify(ConnectionState::Connecting);

        if spawn {
            self.spawn_network_thread();
        }

        info!("Connecting to MQTT broker...");
        if let Err(e) = self.inner.transport.lock().connect() {
            error!("Failed to connect to MQTT broker: {}", e);
            self.inner.set_state(ConnectionState::Disconnected);
            return false;
        }

        let timeout = self.inner.options.connect_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                ConnectionState::Connected => return true,
                ConnectionState::Disconnected => return false,
                _ => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.inner.options.connect_poll_interval);
        }

        let timed_out = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if !timed_out {
            return self.is_connected();
        }

        error!("Timed out connecting to MQTT broker after {:?}", timeout);
        let _ = self.inner.transport.lock().disconnect();
        self.inner.notify(ConnectionState::Disconnected);
        false
    }

    fn spawn_network_thread(&self) {
        let mut network = self.network.lock();
        if let Some(previous) = network.take() {
            // Already marked not running, so it is exiting.
            let _ = previous.join();
        }

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("mqdash-network".to_string())
            .spawn(move || inner.run_network())
        {
            Ok(handle) => *network = Some(handle),
            Err(e) => {
                error!("Failed to spawn network thread: {}", e);
                self.inner.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop reconnecting and close the connection. Idempotent.
    pub fn disconnect(&self) {
        self.inner.signal_stop();

        let handle = self.network.lock().take();
        if let Some(handle) = handle {
            // A callback on the network thread may call this; it exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if let Err(e) = self.inner.transport.lock().disconnect() {
            warn!("Error closing broker connection: {}", e);
        }

        if self.inner.set_state(ConnectionState::Disconnected) {
            info!("Disconnected from MQTT broker");
        }
    }

    /// Publish a message. Returns false if not connected or the send failed.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> bool {
        if !self.is_connected() {
            debug!("Cannot publish to '{}': not connected", topic);
            return false;
        }

        match self
            .inner
            .transport
            .lock()
            .publish(topic, payload, qos, retain)
        {
            Ok(()) => {
                trace!("Published {} bytes to '{}'", payload.len(), topic);
                true
            }
            Err(e) => {
                warn!("Failed to publish to '{}': {}", topic, e);
                false
            }
        }
    }

    /// Register `callback` under `pattern` and subscribe on the network.
    ///
    /// Callbacks are additive. Registration happens before the network call,
    /// so on a `false` return the callback may remain registered; callers
    /// that keep their own bookkeeping must roll it back. Returns false
    /// without registering anything when not connected.
    pub fn subscribe<F>(&self, pattern: &str, qos: QoS, callback: F) -> bool
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            warn!("Cannot subscribe to '{}': not connected", pattern);
            return false;
        }
        let (_, qos) = self.add_callback(pattern, qos, Arc::new(callback));
        self.send_subscribe(pattern, qos)
    }

    /// Like [`subscribe`](Self::subscribe), but returns a handle that
    /// [`release`](Self::release) uses to remove exactly this callback.
    ///
    /// When the network subscribe fails the callback is removed again and
    /// `None` is returned, leaving other callbacks on `pattern` untouched.
    pub fn register<F>(&self, pattern: &str, qos: QoS, callback: F) -> Option<CallbackId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            warn!("Cannot subscribe to '{}': not connected", pattern);
            return None;
        }
        let (id, qos) = self.add_callback(pattern, qos, Arc::new(callback));
        if self.send_subscribe(pattern, qos) {
            Some(id)
        } else {
            self.remove_callback(pattern, id);
            None
        }
    }

    /// Remove one callback added with [`register`](Self::register).
    ///
    /// The network unsubscribe is only sent once no callbacks remain under
    /// `pattern`. Returns false when the handle is unknown, or when a
    /// required network unsubscribe could not be sent.
    pub fn release(&self, pattern: &str, id: CallbackId) -> bool {
        match self.remove_callback(pattern, id) {
            None => {
                debug!("Callback {:?} is not registered under '{}'", id, pattern);
                false
            }
            Some(0) => self.send_unsubscribe(pattern),
            Some(remaining) => {
                debug!(
                    "Released callback on '{}', {} remain subscribed",
                    pattern, remaining
                );
                true
            }
        }
    }

    /// True while the callback behind `id` is still registered.
    pub fn is_registered(&self, pattern: &str, id: CallbackId) -> bool {
        self.inner
            .registry
            .lock()
            .get(pattern)
            .is_some_and(|reg| reg.callbacks.iter().any(|(cid, _)| *cid == id))
    }

    /// Remove every callback for `pattern` and unsubscribe on the network.
    ///
    /// Callbacks are removed even when not connected, in which case this
    /// returns false. Handles issued by [`register`](Self::register) for
    /// `pattern` become stale.
    pub fn unsubscribe(&self, pattern: &str) -> bool {
        let removed = self.inner.registry.lock().remove(pattern);
        if removed.is_none() {
            debug!("Unsubscribing from unregistered pattern '{}'", pattern);
        }
        self.send_unsubscribe(pattern)
    }

    fn add_callback(&self, pattern: &str, qos: QoS, callback: MessageCallback) -> (CallbackId, QoS) {
        let id = CallbackId(self.inner.next_callback.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.inner.registry.lock();
        let reg = registry
            .entry(pattern.to_string())
            .or_insert_with(|| Registration {
                qos,
                callbacks: Vec::new(),
            });
        reg.qos = reg.qos.max(qos);
        reg.callbacks.push((id, callback));
        (id, reg.qos)
    }

    /// Number of callbacks left under `pattern`, or `None` if `id` was not
    /// found. Drops the pattern once it is empty.
    fn remove_callback(&self, pattern: &str, id: CallbackId) -> Option<usize> {
        let mut registry = self.inner.registry.lock();
        let reg = registry.get_mut(pattern)?;
        let index = reg.callbacks.iter().position(|(cid, _)| *cid == id)?;
        reg.callbacks.remove(index);
        let remaining = reg.callbacks.len();
        if remaining == 0 {
            registry.remove(pattern);
        }
        Some(remaining)
    }

    fn send_subscribe(&self, pattern: &str, qos: QoS) -> bool {
        match self.inner.transport.lock().subscribe(pattern, qos) {
            Ok(()) => {
                debug!("Subscribed to '{}' (qos {:?})", pattern, qos);
                true
            }
            Err(e) => {
                warn!("Failed to subscribe to '{}': {}", pattern, e);
                false
            }
        }
    }

    fn send_unsubscribe(&self, pattern: &str) -> bool {
        if !self.is_connected() {
            debug!("Cannot unsubscribe from '{}': not connected", pattern);
            return false;
        }

        match self.inner.transport.lock().unsubscribe(pattern) {
            Ok(()) => {
                debug!("Unsubscribed from '{}'", pattern);
                true
            }
            Err(e) => {
                warn!("Failed to unsubscribe from '{}': {}", pattern, e);
                false
            }
        }
    }

    /// Patterns with at least one registered callback.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.inner.registry.lock().keys().cloned().collect();
        patterns.sort();
        patterns
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
