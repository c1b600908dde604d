//! Error types for the tidewire client core.
//!
//! Strongly-typed errors per concern: connection failures (retried under the
//! backoff and watchdog policy), send failures (realtime and REST paths), and
//! payload errors (inbound events that cannot be routed).
//!
//! None of these cross a component boundary as a panic. Connection errors are
//! surfaced as passive `SYSTEM` notifications, send errors end up in a
//! [`crate::send::SendState::Failed`] report, and payload errors are logged
//! and dropped.

use std::time::Duration;

use thiserror::Error;

/// Transport-level failure of the realtime channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The endpoint could not be parsed into a channel URL
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The credential could not be encoded into the handshake
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Opening the channel did not complete in time
    #[error("connect timeout after {elapsed:?}")]
    ConnectTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// The channel is not open
    #[error("channel not connected")]
    NotConnected,

    /// Underlying transport error
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Malformed endpoints and credentials never fix themselves; everything
    /// else is handed to the reconnection policy.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidEndpoint(_) | Self::InvalidCredential(_))
    }
}

/// Failure along one of the send paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The channel refused to emit (not connected or closed)
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The server acknowledged the action but reported failure
    #[error("ack rejected: {0}")]
    AckRejected(String),

    /// No acknowledgement arrived within the bound
    #[error("ack timeout after {0:?}")]
    AckTimeout(Duration),

    /// The acknowledgement sender was dropped before answering
    #[error("ack dropped before completion")]
    AckDropped,

    /// The REST fallback failed
    #[error("rest fallback failed: {0}")]
    Rest(String),

    /// Both the realtime attempt and the REST fallback failed
    #[error("send failed: realtime: {realtime}; rest: {rest}")]
    Failed {
        /// Why the realtime attempt did not confirm
        realtime: Box<SendError>,
        /// Why the REST fallback failed
        rest: Box<SendError>,
    },
}

impl SendError {
    /// Returns true if the realtime path should fall back to REST.
    ///
    /// Timeouts and a missing ack are expected and not errors in their own
    /// right; only a completed fallback failure is terminal.
    pub fn should_fall_back(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable(_)
                | Self::AckRejected(_)
                | Self::AckTimeout(_)
                | Self::AckDropped
        )
    }
}

impl From<ConnectionError> for SendError {
    fn from(err: ConnectionError) -> Self {
        Self::ChannelUnavailable(err.to_string())
    }
}

/// Inbound event that cannot be routed.
///
/// Missing optional fields are defaulted by the normalizer; only a missing
/// routing key (room or thread) makes an event unroutable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// A field needed to route the event is absent
    #[error("{event}: missing field `{field}`")]
    MissingField {
        /// Event name
        event: String,
        /// Field that was expected
        field: &'static str,
    },

    /// The event name is not one we consume
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_transience() {
        assert!(ConnectionError::Transport("reset".into()).is_transient());
        assert!(ConnectionError::NotConnected.is_transient());
        assert!(ConnectionError::ConnectTimeout { elapsed: Duration::from_secs(8) }.is_transient());
        assert!(!ConnectionError::InvalidEndpoint("::".into()).is_transient());
    }

    #[test]
    fn realtime_failures_fall_back() {
        assert!(SendError::AckTimeout(Duration::from_millis(1800)).should_fall_back());
        assert!(SendError::AckDropped.should_fall_back());
        assert!(SendError::from(ConnectionError::NotConnected).should_fall_back());
        assert!(!SendError::Rest("500".into()).should_fall_back());
    }

    #[test]
    fn failed_error_names_both_paths() {
        let err = SendError::Failed {
            realtime: Box::new(SendError::AckTimeout(Duration::from_millis(1800))),
            rest: Box::new(SendError::Rest("503 service unavailable".into())),
        };
        let text = err.to_string();
        assert!(text.contains("ack timeout"));
        assert!(text.contains("503"));
    }
}
