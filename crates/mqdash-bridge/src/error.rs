//! Error types for the bridge crate.

use std::io;

use thiserror::Error;

/// Failure reported by the query surface.
///
/// The first three variants mean "service unavailable", which callers must
/// be able to tell apart from an empty but valid answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Not connected to MQTT broker")]
    BrokerDisconnected,

    #[error("Not subscribed to broker metrics")]
    MetricsUnavailable,

    #[error("Not subscribed to topic tracking")]
    TrackerUnavailable,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Broker rejected {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BrokerDisconnected => "BROKER_DISCONNECTED",
            ServiceError::MetricsUnavailable => "METRICS_NOT_SUBSCRIBED",
            ServiceError::TrackerUnavailable => "TOPIC_TRACKER_NOT_SUBSCRIBED",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::Rejected(_) => "REJECTED",
        }
    }

    /// True for the "service down / not ready" variants.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ServiceError::BrokerDisconnected
                | ServiceError::MetricsUnavailable
                | ServiceError::TrackerUnavailable
        )
    }
}

/// Secondary bus errors.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Bus is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A bus command that failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("Command topic must not be empty")]
    EmptyTopic,

    #[error("Invalid QoS {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_codes() {
        assert_eq!(ServiceError::BrokerDisconnected.code(), "BROKER_DISCONNECTED");
        assert_eq!(
            ServiceError::TrackerUnavailable.code(),
            "TOPIC_TRACKER_NOT_SUBSCRIBED"
        );
        assert!(ServiceError::MetricsUnavailable.is_unavailable());
        assert!(!ServiceError::InvalidRequest("x".into()).is_unavailable());
    }
}
