//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use mqdash_client::{ClientError, ClientEvent, QoS};

use crate::clock::Clock;
use crate::connection::{BrokerConnection, ConnectionOptions, Transport};

#[derive(Debug, Default)]
pub struct MockState {
    pub open: bool,
    pub events: VecDeque<ClientEvent>,
    /// Connect attempts, including refused ones.
    pub connects: usize,
    pub subscribes: Vec<(String, QoS)>,
    pub unsubscribes: Vec<String>,
    pub publishes: Vec<(String, Vec<u8>, QoS, bool)>,
    pub refuse_connect: bool,
    pub withhold_connack: bool,
    pub fail_subscribe: bool,
    pub fail_unsubscribe: bool,
}

/// In-memory transport. Clones share state, so a test keeps one handle
/// while the connection owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Deliver a message as if the broker had sent it.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.with(|s| {
            s.events.push_back(ClientEvent::Message {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: QoS::AtMostOnce,
                retain: false,
            })
        });
    }

    /// Simulate the broker going away.
    pub fn drop_connection(&self) {
        self.with(|s| {
            s.open = false;
            s.events.push_back(ClientEvent::Disconnected {
                reason: Some("broker went away".to_string()),
            });
        });
    }

    /// Patterns subscribed so far, in call order.
    pub fn subscribes(&self) -> Vec<String> {
        self.with(|s| s.subscribes.iter().map(|(p, _)| p.clone()).collect())
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.with(|s| s.unsubscribes.clone())
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.with(|s| s.publishes.iter().map(|(t, ..)| t.clone()).collect())
    }
}

fn refused() -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), ClientError> {
        self.with(|s| {
            s.connects += 1;
            if s.refuse_connect {
                return Err(refused());
            }
            s.events.clear();
            s.open = true;
            if !s.withhold_connack {
                s.events.push_back(ClientEvent::Connected {
                    session_present: false,
                });
            }
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Result<(), ClientError> {
        self.with(|s| s.open = false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), ClientError> {
        self.with(|s| {
            if s.fail_subscribe {
                return Err(ClientError::NotConnected);
            }
            s.subscribes.push((pattern.to_string(), qos));
            Ok(())
        })
    }

    fn unsubscribe(&mut self, pattern: &str) -> Result<(), ClientError> {
        self.with(|s| {
            if s.fail_unsubscribe {
                return Err(ClientError::NotConnected);
            }
            s.unsubscribes.push(pattern.to_string());
            Ok(())
        })
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.with(|s| {
            s.publishes
                .push((topic.to_string(), payload.to_vec(), qos, retain))
        });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), ClientError> {
        if self.state.lock().events.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        Ok(())
    }

    fn next_event(&mut self) -> Option<ClientEvent> {
        self.state.lock().events.pop_front()
    }
}

/// Options tuned so tests run in milliseconds.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        connect_timeout: Duration::from_secs(1),
        connect_poll_interval: Duration::from_millis(5),
        reconnect_delay: Duration::from_millis(50),
        auto_reconnect: true,
        io_poll_timeout: Duration::from_millis(5),
    }
}

/// A connection over a fresh mock, already connected.
pub fn connected_broker() -> (Arc<BrokerConnection>, MockTransport) {
    let mock = MockTransport::new();
    let broker = Arc::new(BrokerConnection::new(mock.boxed(), fast_options()));
    assert!(broker.connect());
    (broker, mock)
}

/// Poll `condition` for up to two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap();
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
