//! Per-session subscriptions sharing one broker connection.
//!
//! Many dashboard sessions may ask for the same pattern; the broker sees a
//! single subscription per pattern, held for as long as at least one
//! session references it. Two indices are kept in step under one lock:
//!
//! - session → patterns
//! - pattern → sessions
//!
//! A pattern is present in the second index exactly when the multiplexer
//! holds a broker callback for it. Other components may register callbacks
//! on the same pattern; releasing ours leaves theirs in place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use mqdash_client::QoS;

use crate::clock::{Clock, SystemClock};
use crate::connection::{BrokerConnection, CallbackId, Message};
use crate::util::guarded;

/// A broker message routed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedMessage {
    pub session_id: String,
    /// Concrete topic the message was published on.
    pub topic: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    /// The session's pattern that matched.
    pub pattern: String,
}

/// Receives every forwarded message.
pub type ForwardCallback = Arc<dyn Fn(&ForwardedMessage) + Send + Sync>;

#[derive(Debug, Default)]
struct Indices {
    by_session: HashMap<String, HashSet<String>>,
    by_pattern: HashMap<String, HashSet<String>>,
    /// Our broker callback per pattern in `by_pattern`.
    handles: HashMap<String, CallbackId>,
}

impl Indices {
    fn contains(&self, session_id: &str, pattern: &str) -> bool {
        self.by_session
            .get(session_id)
            .is_some_and(|patterns| patterns.contains(pattern))
    }

    fn insert(&mut self, session_id: &str, pattern: &str) {
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(pattern.to_string());
        self.by_pattern
            .entry(pattern.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Remove one pair. Returns true if it was the pattern's last session.
    fn remove(&mut self, session_id: &str, pattern: &str) -> bool {
        if let Some(patterns) = self.by_session.get_mut(session_id) {
            patterns.remove(pattern);
            if patterns.is_empty() {
                self.by_session.remove(session_id);
            }
        }

        match self.by_pattern.get_mut(pattern) {
            Some(sessions) => {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    self.by_pattern.remove(pattern);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Both indices describe the same set of pairs, with no empty entries.
    fn is_consistent(&self) -> bool {
        let forward = self.by_session.iter().all(|(session, patterns)| {
            !patterns.is_empty()
                && patterns.iter().all(|p| {
                    self.by_pattern
                        .get(p)
                        .is_some_and(|sessions| sessions.contains(session))
                })
        });
        let reverse = self.by_pattern.iter().all(|(pattern, sessions)| {
            !sessions.is_empty()
                && sessions.iter().all(|s| {
                    self.by_session
                        .get(s)
                        .is_some_and(|patterns| patterns.contains(pattern))
                })
        });
        forward && reverse
    }
}

struct Shared {
    indices: Mutex<Indices>,
    forward: RwLock<Option<ForwardCallback>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn forward_message(&self, pattern: &str, message: &Message) {
        let mut sessions: Vec<String> = match self.indices.lock().by_pattern.get(pattern) {
            Some(sessions) => sessions.iter().cloned().collect(),
            None => return,
        };
        sessions.sort();

        let Some(forward) = self.forward.read().clone() else {
            warn!(
                "No forwarder configured, dropping message on '{}'",
                message.topic
            );
            return;
        };

        let timestamp = self.clock.now();
        for session_id in sessions {
            let forwarded = ForwardedMessage {
                session_id,
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                timestamp,
                pattern: pattern.to_string(),
            };
            let what = format!("Forwarding to session {}", forwarded.session_id);
            guarded(&what, || forward(&forwarded));
        }
    }
}

/// Reference-counted pattern subscriptions on behalf of sessions.
pub struct Multiplexer {
    broker: Arc<BrokerConnection>,
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn new(broker: Arc<BrokerConnection>) -> Self {
        Self::with_clock(broker, Arc::new(SystemClock))
    }

    pub fn with_clock(broker: Arc<BrokerConnection>, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            shared: Arc::new(Shared {
                indices: Mutex::new(Indices::default()),
                forward: RwLock::new(None),
                clock,
            }),
        }
    }

    /// Set the callback that delivers messages to sessions.
    pub fn set_forwarder<F>(&self, forward: F)
    where
        F: Fn(&ForwardedMessage) + Send + Sync + 'static,
    {
        *self.shared.forward.write() = Some(Arc::new(forward));
    }

    /// Subscribe `session_id` to `pattern`.
    ///
    /// The first session on a pattern creates the broker subscription; if
    /// that fails nothing is recorded. Returns false when the broker is not
    /// connected.
    pub fn subscribe_session(&self, session_id: &str, pattern: &str) -> bool {
        if !self.broker.is_connected() {
            warn!(
                "Cannot subscribe session {} to '{}': not connected",
                session_id, pattern
            );
            return false;
        }

        // Held across the broker call so no other session sees a pattern
        // that is recorded but not yet subscribed.
        let mut indices = self.shared.indices.lock();
        if indices.contains(session_id, pattern) {
            debug!("Session {} already subscribed to '{}'", session_id, pattern);
            return true;
        }

        if !indices.by_pattern.contains_key(pattern) {
            let shared = Arc::clone(&self.shared);
            let owned = pattern.to_string();
            let registered = self
                .broker
                .register(pattern, QoS::AtMostOnce, move |message| {
                    shared.forward_message(&owned, message)
                });

            let Some(id) = registered else {
                warn!(
                    "Failed to subscribe session {} to '{}'",
                    session_id, pattern
                );
                return false;
            };
            indices.handles.insert(pattern.to_string(), id);
            info!("Subscribed to MQTT pattern '{}'", pattern);
        }

        indices.insert(session_id, pattern);
        debug_assert!(indices.is_consistent());
        info!("Session {} subscribed to '{}'", session_id, pattern);
        true
    }

    /// Drop `session_id`'s interest in `pattern`.
    ///
    /// The broker subscription goes away with the pattern's last session.
    /// Bookkeeping always succeeds; a failed network unsubscribe is logged.
    pub fn unsubscribe_session(&self, session_id: &str, pattern: &str) -> bool {
        let mut indices = self.shared.indices.lock();
        if !indices.contains(session_id, pattern) {
            debug!("Session {} was not subscribed to '{}'", session_id, pattern);
            return true;
        }

        let last = indices.remove(session_id, pattern);
        debug_assert!(indices.is_consistent());

        if last {
            let released = indices
                .handles
                .remove(pattern)
                .is_some_and(|id| self.broker.release(pattern, id));
            if released {
                info!("Unsubscribed from MQTT pattern '{}'", pattern);
            } else {
                warn!("Failed to unsubscribe from MQTT pattern '{}'", pattern);
            }
        }

        info!("Session {} unsubscribed from '{}'", session_id, pattern);
        true
    }

    /// Drop every subscription of `session_id`. Returns how many there were.
    pub fn unsubscribe_session_all(&self, session_id: &str) -> usize {
        let patterns = self.session_patterns(session_id);
        for pattern in &patterns {
            self.unsubscribe_session(session_id, pattern);
        }
        if !patterns.is_empty() {
            info!(
                "Session {} unsubscribed from {} pattern(s)",
                session_id,
                patterns.len()
            );
        }
        patterns.len()
    }

    /// Patterns `session_id` is subscribed to, sorted.
    pub fn session_patterns(&self, session_id: &str) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .shared
            .indices
            .lock()
            .by_session
            .get(session_id)
            .map(|patterns| patterns.iter().cloned().collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }

    /// Sessions subscribed to exactly `pattern`, sorted.
    pub fn pattern_sessions(&self, pattern: &str) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .shared
            .indices
            .lock()
            .by_pattern
            .get(pattern)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    /// Every active pattern with its sessions.
    pub fn subscriptions(&self) -> BTreeMap<String, Vec<String>> {
        self.shared
            .indices
            .lock()
            .by_pattern
            .iter()
            .map(|(pattern, sessions)| {
                let mut sessions: Vec<String> = sessions.iter().cloned().collect();
                sessions.sort();
                (pattern.clone(), sessions)
            })
            .collect()
    }

    /// Number of patterns with a broker subscription.
    pub fn pattern_count(&self) -> usize {
        self.shared.indices.lock().by_pattern.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connected_broker, wait_until, MockTransport};

    fn setup() -> (Multiplexer, MockTransport, Arc<Mutex<Vec<ForwardedMessage>>>) {
        let (broker, mock) = connected_broker();
        let mux = Multiplexer::new(broker);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        mux.set_forwarder(move |m| sink.lock().push(m.clone()));
        (mux, mock, received)
    }

    #[test]
    fn test_shared_pattern_subscribes_once() {
        let (mux, mock, _) = setup();
        assert!(mux.subscribe_session("s1", "home/#"));
        assert!(mux.subscribe_session("s2", "home/#"));
        assert_eq!(mock.subscribes(), vec!["home/#"]);
        assert_eq!(mux.pattern_sessions("home/#"), vec!["s1", "s2"]);

        assert!(mux.unsubscribe_session("s1", "home/#"));
        assert!(mock.unsubscribes().is_empty());
        assert_eq!(mux.pattern_count(), 1);

        assert!(mux.unsubscribe_session("s2", "home/#"));
        assert_eq!(mock.unsubscribes(), vec!["home/#"]);
        assert_eq!(mux.pattern_count(), 0);
    }

    #[test]
    fn test_repeat_subscribe_is_noop() {
        let (mux, mock, _) = setup();
        assert!(mux.subscribe_session("s1", "a"));
        assert!(mux.subscribe_session("s1", "a"));
        assert_eq!(mock.subscribes().len(), 1);
        assert_eq!(mux.session_patterns("s1"), vec!["a"]);
    }

    #[test]
    fn test_failed_subscribe_rolls_back() {
        let (mux, mock, _) = setup();
        mock.with(|s| s.fail_subscribe = true);

        assert!(!mux.subscribe_session("s1", "a/#"));
        assert!(mux.session_patterns("s1").is_empty());
        assert_eq!(mux.pattern_count(), 0);
        assert!(mux.broker.patterns().is_empty());

        mock.with(|s| s.fail_subscribe = false);
        assert!(mux.subscribe_session("s1", "a/#"));
    }

    #[test]
    fn test_subscribe_requires_connection() {
        let (mux, mock, _) = setup();
        mux.broker.disconnect();
        assert!(!mux.subscribe_session("s1", "a"));
        assert!(mock.subscribes().is_empty());
        assert!(mux.subscriptions().is_empty());
    }

    #[test]
    fn test_unsubscribe_all() {
        let (mux, mock, _) = setup();
        mux.subscribe_session("s1", "a");
        mux.subscribe_session("s1", "b");
        mux.subscribe_session("s2", "b");

        assert_eq!(mux.unsubscribe_session_all("s1"), 2);
        assert!(mux.session_patterns("s1").is_empty());
        assert_eq!(mux.pattern_sessions("b"), vec!["s2"]);
        assert!(mux.pattern_sessions("a").is_empty());
        assert_eq!(mock.unsubscribes(), vec!["a"]);

        let subscriptions = mux.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions["b"], vec!["s2"]);

        // Unknown session
        assert_eq!(mux.unsubscribe_session_all("nobody"), 0);
    }

    #[test]
    fn test_unsubscribe_survives_network_failure() {
        let (mux, mock, _) = setup();
        mux.subscribe_session("s1", "a");
        mock.with(|s| s.fail_unsubscribe = true);

        assert!(mux.unsubscribe_session("s1", "a"));
        assert_eq!(mux.pattern_count(), 0);
        assert!(mux.session_patterns("s1").is_empty());
    }

    #[test]
    fn test_last_session_keeps_other_callbacks_on_pattern() {
        let (mux, mock, _) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let other = mux
            .broker
            .register("#", QoS::AtMostOnce, move |m| sink.lock().push(m.topic.clone()))
            .unwrap();

        assert!(mux.subscribe_session("s1", "#"));
        assert!(mux.unsubscribe_session("s1", "#"));
        assert!(mock.unsubscribes().is_empty());
        assert!(mux.broker.is_registered("#", other));

        mock.inject("home/temp", b"1");
        assert!(wait_until(|| seen.lock().len() == 1));
    }

    #[test]
    fn test_forwarding_by_pattern() {
        let (mux, mock, received) = setup();
        mux.subscribe_session("home-viewer", "home/#");
        mux.subscribe_session("office-viewer", "office/#");

        mock.inject("home/temp", b"21.3");
        assert!(wait_until(|| !received.lock().is_empty()));

        mock.inject("marker", b"");
        assert!(wait_until(|| mock.with(|s| s.events.is_empty())));
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].session_id, "home-viewer");
        assert_eq!(received[0].topic, "home/temp");
        assert_eq!(received[0].payload, "21.3");
        assert_eq!(received[0].pattern, "home/#");
    }

    #[test]
    fn test_forwarding_once_per_session() {
        let (mux, mock, received) = setup();
        mux.subscribe_session("s1", "t/+");
        mux.subscribe_session("s2", "t/+");

        mock.inject("t/1", b"x");
        assert!(wait_until(|| received.lock().len() == 2));
        let mut sessions: Vec<String> =
            received.lock().iter().map(|m| m.session_id.clone()).collect();
        sessions.sort();
        assert_eq!(sessions, vec!["s1", "s2"]);
    }

    #[test]
    fn test_missing_forwarder_drops_message() {
        let (broker, mock) = connected_broker();
        let mux = Multiplexer::new(broker);
        assert!(mux.subscribe_session("s1", "t"));
        mock.inject("t", b"x");
        assert!(wait_until(|| mock.with(|s| s.events.is_empty())));
        assert_eq!(mux.broker.state(), crate::connection::ConnectionState::Connected);
    }

    #[test]
    fn test_indices_consistency_check() {
        let mut indices = Indices::default();
        indices.insert("s1", "a");
        indices.insert("s2", "a");
        assert!(indices.is_consistent());
        assert!(!indices.remove("s1", "a"));
        assert!(indices.remove("s2", "a"));
        assert!(indices.is_consistent());
        assert!(indices.by_session.is_empty());

        indices.by_pattern.insert("orphan".into(), HashSet::new());
        assert!(!indices.is_consistent());
    }
}
