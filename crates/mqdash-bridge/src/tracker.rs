//! Topic activity tracking.
//!
//! [`TopicTracker`] listens on the catch-all pattern and keeps one
//! [`TopicInfo`] per topic seen. Records that stay quiet longer than the
//! inactivity window are pruned lazily, whenever a pruning query runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mqdash_client::QoS;
use mqdash_core::topic;

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::connection::{BrokerConnection, CallbackId, Message};
use crate::metrics::topics::SYS_PREFIX;
use crate::util::{guarded, ListenerId, Listeners};

/// Pattern the tracker subscribes to.
pub const TRACK_ALL: &str = "#";

/// Appended to payloads cut at the size limit.
pub const TRUNCATION_MARKER: &str = "...";

/// Activity record for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    pub message_count: u64,
    pub last_payload: String,
    pub last_qos: u8,
    pub last_retained: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Options for [`TopicTracker::list`].
#[derive(Debug, Clone, Default)]
pub struct TopicQuery {
    /// MQTT pattern the topic must match.
    pub filter: Option<String>,
    /// Plain prefix the topic must start with.
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    /// Skip the pruning sweep and return stale records too.
    pub include_inactive: bool,
}

/// Result of [`TopicTracker::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicList {
    /// Most recently seen first.
    pub topics: Vec<TopicInfo>,
    /// Records in the table.
    pub total: usize,
    /// Records matching `filter` and `prefix`, before `limit`.
    pub filtered: usize,
}

/// Cut `payload` to at most `max` bytes on a character boundary, appending
/// the truncation marker if anything was removed.
fn truncate_payload(payload: &str, max: usize) -> String {
    if payload.len() <= max {
        return payload.to_string();
    }
    let mut end = max;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = String::with_capacity(end + TRUNCATION_MARKER.len());
    truncated.push_str(&payload[..end]);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Callback receiving the updated record after every tracked message.
pub type TopicCallback = dyn Fn(&TopicInfo) + Send + Sync;

struct Shared {
    config: TrackerConfig,
    topics: Mutex<HashMap<String, TopicInfo>>,
    callbacks: Listeners<TopicCallback>,
    handle: Mutex<Option<CallbackId>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    /// Remove stale records. Caller holds the table lock.
    fn prune_locked(&self, topics: &mut HashMap<String, TopicInfo>) -> usize {
        if self.config.inactive_timeout == 0 {
            return 0;
        }
        // A window reaching past the earliest representable time keeps
        // everything.
        let Some(cutoff) = i64::try_from(self.config.inactive_timeout)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|window| self.clock.now().checked_sub_signed(window))
        else {
            return 0;
        };

        let before = topics.len();
        topics.retain(|_, info| info.last_seen >= cutoff);
        let pruned = before - topics.len();
        if pruned > 0 {
            debug!("Pruned {} inactive topic(s)", pruned);
        }
        pruned
    }
}

/// Tracks which topics are active. Clones share the same table.
#[derive(Clone)]
pub struct TopicTracker {
    shared: Arc<Shared>,
}

impl TopicTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                topics: Mutex::new(HashMap::new()),
                callbacks: Listeners::new(),
                handle: Mutex::new(None),
                clock,
            }),
        }
    }

    /// Record one message. Returns false if the topic is not tracked.
    pub fn record(&self, topic: &str, payload: &str, qos: QoS, retain: bool) -> bool {
        if !self.shared.config.track_sys_topics && topic.starts_with(SYS_PREFIX) {
            return false;
        }

        let payload = truncate_payload(payload, self.shared.config.max_payload_size);
        let now = self.shared.clock.now();

        let snapshot = {
            let mut topics = self.shared.topics.lock();
            let info = topics
                .entry(topic.to_string())
                .and_modify(|info| {
                    info.message_count += 1;
                    info.last_seen = now;
                })
                .or_insert_with(|| {
                    trace!("Tracking new topic '{}'", topic);
                    TopicInfo {
                        topic: topic.to_string(),
                        message_count: 1,
                        last_payload: String::new(),
                        last_qos: 0,
                        last_retained: false,
                        first_seen: now,
                        last_seen: now,
                    }
                });
            info.last_payload = payload;
            info.last_qos = qos.into();
            info.last_retained = retain;
            info.clone()
        };

        for callback in self.shared.callbacks.snapshot() {
            guarded("Topic update callback", || callback(&snapshot));
        }
        true
    }

    fn on_message(&self, message: &Message) {
        self.record(&message.topic, &message.payload, message.qos, message.retain);
    }

    /// List tracked topics, most recently seen first.
    pub fn list(&self, query: &TopicQuery) -> TopicList {
        let (mut topics, total) = {
            let mut table = self.shared.topics.lock();
            if !query.include_inactive {
                self.shared.prune_locked(&mut table);
            }
            let total = table.len();
            let topics: Vec<TopicInfo> = table
                .values()
                .filter(|info| match query.filter.as_deref() {
                    Some(pattern) => topic::matches(pattern, &info.topic),
                    None => true,
                })
                .filter(|info| match query.prefix.as_deref() {
                    Some(prefix) => info.topic.starts_with(prefix),
                    None => true,
                })
                .cloned()
                .collect();
            (topics, total)
        };

        topics.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        let filtered = topics.len();
        if let Some(limit) = query.limit {
            topics.truncate(limit);
        }

        TopicList {
            topics,
            total,
            filtered,
        }
    }

    /// The record for one topic, if tracked. Does not prune.
    pub fn get_topic(&self, name: &str) -> Option<TopicInfo> {
        self.shared.topics.lock().get(name).cloned()
    }

    /// Number of tracked topics, after pruning.
    pub fn topic_count(&self) -> usize {
        let mut topics = self.shared.topics.lock();
        self.shared.prune_locked(&mut topics);
        topics.len()
    }

    /// Remove stale records now. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut topics = self.shared.topics.lock();
        self.shared.prune_locked(&mut topics)
    }

    pub fn clear(&self) {
        self.shared.topics.lock().clear();
        info!("Cleared all tracked topics");
    }

    /// Register a callback for every tracked message.
    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TopicInfo) + Send + Sync + 'static,
    {
        self.shared.callbacks.add(Arc::new(callback))
    }

    pub fn remove_update_callback(&self, id: ListenerId) -> bool {
        self.shared.callbacks.remove(id)
    }

    /// Subscribe to every topic on `broker`.
    pub fn attach(&self, broker: &BrokerConnection) -> bool {
        let mut handle = self.shared.handle.lock();
        if let Some(id) = *handle {
            if broker.is_registered(TRACK_ALL, id) {
                debug!("Already subscribed to topic tracking");
                return true;
            }
            debug!("Topic tracking subscription was removed, subscribing again");
            *handle = None;
        }

        let tracker = self.clone();
        let registered = broker.register(TRACK_ALL, QoS::AtMostOnce, move |message| {
            tracker.on_message(message)
        });

        match registered {
            Some(id) => {
                *handle = Some(id);
                info!("Subscribed to {} for topic tracking", TRACK_ALL);
                true
            }
            None => {
                warn!("Failed to subscribe for topic tracking");
                false
            }
        }
    }

    /// Stop tracking. Other callbacks on the catch-all pattern stay.
    pub fn detach(&self, broker: &BrokerConnection) {
        if let Some(id) = self.shared.handle.lock().take() {
            broker.release(TRACK_ALL, id);
            info!("Unsubscribed from topic tracking");
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
            .is_some_and(|id| broker.is_registered(TRACK_ALL, id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{connected_broker, wait_until, ManualClock};

    fn tracker_with(config: TrackerConfig) -> (TopicTracker, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (TopicTracker::with_clock(config, clock.clone()), clock)
    }

    fn tracker() -> (TopicTracker, Arc<ManualClock>) {
        tracker_with(TrackerConfig {
            inactive_timeout: 60,
            ..Default::default()
        })
    }

    fn all() -> TopicQuery {
        TopicQuery::default()
    }

    #[test]
    fn test_truncate_payload() {
        assert_eq!(truncate_payload("short", 10), "short");
        assert_eq!(truncate_payload("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_payload("0123456789abc", 10), "0123456789...");
        // 'é' is two bytes; never split it.
        assert_eq!(truncate_payload("aé", 2), "a...");
    }

    #[test]
    fn test_repeat_messages_update_record() {
        let (tracker, clock) = tracker();
        assert!(tracker.record("home/temp", "21.3", QoS::AtMostOnce, false));
        let first = tracker.get_topic("home/temp").unwrap();

        clock.advance(Duration::from_secs(1));
        assert!(tracker.record("home/temp", "21.4", QoS::AtLeastOnce, true));
        let second = tracker.get_topic("home/temp").unwrap();

        assert_eq!(second.message_count, 2);
        assert!(second.last_seen > first.last_seen);
        assert_eq!(second.first_seen, first.first_seen);
        assert_eq!(second.last_payload, "21.4");
        assert_eq!(second.last_qos, 1);
        assert!(second.last_retained);
    }

    #[test]
    fn test_sys_topics_skipped_unless_enabled() {
        let (tracker, _) = tracker();
        assert!(!tracker.record("$SYS/broker/uptime", "1", QoS::AtMostOnce, false));
        assert_eq!(tracker.topic_count(), 0);

        let (tracker, _) = tracker_with(TrackerConfig {
            track_sys_topics: true,
            ..Default::default()
        });
        assert!(tracker.record("$SYS/broker/uptime", "1", QoS::AtMostOnce, false));
        assert_eq!(tracker.topic_count(), 1);
    }

    #[test]
    fn test_payload_truncated_to_limit() {
        let (tracker, _) = tracker_with(TrackerConfig {
            max_payload_size: 4,
            ..Default::default()
        });
        tracker.record("t", "abcdefgh", QoS::AtMostOnce, false);
        assert_eq!(tracker.get_topic("t").unwrap().last_payload, "abcd...");
    }

    #[test]
    fn test_list_sorted_by_last_seen() {
        let (tracker, clock) = tracker();
        for name in ["a", "b", "c"] {
            tracker.record(name, "x", QoS::AtMostOnce, false);
            clock.advance(Duration::from_secs(1));
        }
        tracker.record("a", "y", QoS::AtMostOnce, false);

        let names: Vec<String> = tracker.list(&all()).topics.into_iter().map(|t| t.topic).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_inactive_topics_pruned_on_query() {
        let (tracker, clock) = tracker();
        tracker.record("old", "1", QoS::AtMostOnce, false);
        clock.advance(Duration::from_secs(61));
        tracker.record("fresh", "1", QoS::AtMostOnce, false);

        let stale_view = tracker.list(&TopicQuery {
            include_inactive: true,
            ..all()
        });
        assert_eq!(stale_view.total, 2);

        let active = tracker.list(&all());
        assert_eq!(active.total, 1);
        assert_eq!(active.topics[0].topic, "fresh");

        // Pruned records are gone for good.
        let after = tracker.list(&TopicQuery {
            include_inactive: true,
            ..all()
        });
        assert_eq!(after.total, 1);
        assert!(tracker.get_topic("old").is_none());
    }

    #[test]
    fn test_topic_count_prunes() {
        let (tracker, clock) = tracker();
        tracker.record("a", "1", QoS::AtMostOnce, false);
        tracker.record("b", "1", QoS::AtMostOnce, false);
        clock.advance(Duration::from_secs(120));
        assert!(tracker.get_topic("a").is_some());
        assert_eq!(tracker.topic_count(), 0);
        assert!(tracker.get_topic("a").is_none());
    }

    #[test]
    fn test_zero_timeout_disables_pruning() {
        let (tracker, clock) = tracker_with(TrackerConfig {
            inactive_timeout: 0,
            ..Default::default()
        });
        tracker.record("a", "1", QoS::AtMostOnce, false);
        clock.advance(Duration::from_secs(1_000_000));
        assert_eq!(tracker.prune(), 0);
        assert_eq!(tracker.topic_count(), 1);
    }

    #[test]
    fn test_list_filter_prefix_limit() {
        let (tracker, clock) = tracker();
        for name in ["home/kitchen/temp", "home/garage/door", "office/temp", "home/temp"] {
            tracker.record(name, "1", QoS::AtMostOnce, false);
            clock.advance(Duration::from_millis(10));
        }

        let by_filter = tracker.list(&TopicQuery {
            filter: Some("home/+/temp".into()),
            ..all()
        });
        assert_eq!(by_filter.total, 4);
        assert_eq!(by_filter.filtered, 1);
        assert_eq!(by_filter.topics[0].topic, "home/kitchen/temp");

        let by_prefix = tracker.list(&TopicQuery {
            prefix: Some("home/".into()),
            limit: Some(2),
            ..all()
        });
        assert_eq!(by_prefix.filtered, 3);
        assert_eq!(by_prefix.topics.len(), 2);
        assert_eq!(by_prefix.topics[0].topic, "home/temp");
    }

    #[test]
    fn test_clear() {
        let (tracker, _) = tracker();
        tracker.record("a", "1", QoS::AtMostOnce, false);
        tracker.clear();
        assert_eq!(tracker.list(&all()).total, 0);
    }

    #[test]
    fn test_update_callbacks() {
        let (tracker, _) = tracker();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);
        tracker.on_update(move |info| sink.lock().push(info.message_count));

        tracker.record("a", "1", QoS::AtMostOnce, false);
        tracker.record("a", "2", QoS::AtMostOnce, false);
        tracker.record("$SYS/x", "2", QoS::AtMostOnce, false);
        assert_eq!(*counts.lock(), vec![1, 2]);
    }

    #[test]
    fn test_attach_to_broker() {
        let (broker, mock) = connected_broker();
        let (tracker, _) = tracker();
        assert!(tracker.attach(&broker));
        assert!(tracker.is_subscribed());
        assert_eq!(mock.subscribes(), vec![TRACK_ALL.to_string()]);

        mock.inject("sensors/1", b"on");
        mock.inject("$SYS/broker/uptime", b"5 seconds");
        assert!(wait_until(|| tracker.get_topic("sensors/1").is_some()));
        assert!(tracker.get_topic("$SYS/broker/uptime").is_none());

        tracker.detach(&broker);
        assert!(!tracker.is_subscribed());
        assert!(broker.patterns().is_empty());
    }

    #[test]
    fn test_remove_update_callback() {
        let (tracker, _) = tracker();
        let counts = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&counts);
        let id = tracker.on_update(move |_| *sink.lock() += 1);

        tracker.record("a", "1", QoS::AtMostOnce, false);
        assert!(tracker.remove_update_callback(id));
        assert!(!tracker.remove_update_callback(id));
        tracker.record("a", "2", QoS::AtMostOnce, false);
        assert_eq!(*counts.lock(), 1);
    }

    #[test]
    fn test_huge_inactive_timeout_keeps_everything() {
        for timeout in [u64::MAX, i64::MAX as u64, 10_000_000_000_000_000] {
            let (tracker, clock) = tracker_with(TrackerConfig {
                inactive_timeout: timeout,
                ..Default::default()
            });
            tracker.record("a", "1", QoS::AtMostOnce, false);
            clock.advance(Duration::from_secs(86_400 * 365));
            assert_eq!(tracker.prune(), 0);
            assert!(tracker.get_topic("a").is_some());
            assert_eq!(tracker.list(&TopicQuery::default()).total, 1);
        }
    }

    #[test]
    fn test_detach_keeps_other_catch_all_callbacks() {
        let (broker, mock) = connected_broker();
        let (tracker, _) = tracker();
        assert!(tracker.attach(&broker));
        let other = broker.register(TRACK_ALL, QoS::AtMostOnce, |_| {}).unwrap();

        tracker.detach(&broker);
        assert!(broker.is_registered(TRACK_ALL, other));
        assert!(mock.unsubscribes().is_empty());
    }
}
