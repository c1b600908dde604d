//! Per-attempt send state machine.
//!
//! ```text
//! ┌─────────┐  emit  ┌───────────────┐  ack ok  ┌───────┐
//! │ Created │───────>│ SentRealtime  │─────────>│ Acked │──────────┐
//! └─────────┘        └───────────────┘          └───────┘          │
//!      │                │        │ timeout                         ↓
//!      │ no channel     │        ↓                           ┌───────────┐
//!      │    rejected /  │  ┌──────────┐                      │ Confirmed │
//!      │    dropped     │  │ TimedOut │                      └───────────┘
//!      │                ↓  └──────────┘                            ↑
//!      │         ┌──────────────┐  │                               │
//!      └────────>│ FallbackRest │<─┘───────────────────────────────┘
//!                └──────────────┘          rest ok
//!                       │ rest failed
//!                       ↓
//!                  ┌────────┐
//!                  │ Failed │
//!                  └────────┘
//! ```
//!
//! The async driver lives in the client crate; this module only records which
//! transitions happened and rejects impossible ones.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{ConversationKey, MediaRefs};

/// State of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendState {
    /// Authored locally, nothing emitted yet
    Created,
    /// Emitted over the channel, waiting for the ack
    SentRealtime,
    /// Positive ack received before the timeout
    Acked,
    /// No ack before the timeout
    TimedOut,
    /// REST fallback in flight
    FallbackRest,
    /// Durably visible
    Confirmed,
    /// Both paths failed; the user must resend
    Failed,
}

impl SendState {
    /// Returns true for `Confirmed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    fn can_advance_to(self, next: Self) -> bool {
        use SendState::{Acked, Confirmed, Created, Failed, FallbackRest, SentRealtime, TimedOut};
        matches!(
            (self, next),
            (Created, SentRealtime | FallbackRest)
                | (SentRealtime, Acked | TimedOut | FallbackRest)
                | (Acked | FallbackRest, Confirmed)
                | (TimedOut, FallbackRest)
                | (FallbackRest, Failed)
        )
    }
}

/// Rejected state transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid send transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// State before the attempted transition
    pub from: SendState,
    /// Requested state
    pub to: SendState,
}

/// Transition log of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAttempt {
    state: SendState,
    history: Vec<SendState>,
}

impl SendAttempt {
    /// Fresh attempt in [`SendState::Created`].
    pub fn new() -> Self {
        Self { state: SendState::Created, history: vec![SendState::Created] }
    }

    /// Current state.
    pub fn state(&self) -> SendState {
        self.state
    }

    /// Every state visited, in order, starting with `Created`.
    pub fn history(&self) -> &[SendState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if `next` is not reachable from the current state
    pub fn advance(&mut self, next: SendState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for SendAttempt {
    fn default() -> Self {
        Self::new()
    }
}

/// Optimistic echo of a locally authored message.
///
/// Lives in the snapshot's outbox until confirmed. A confirmed send is removed
/// because the persisted message is now in its conversation; a failed one stays
/// so a view can offer a resend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSend {
    /// Local correlation id
    pub local_id: String,
    /// Target conversation
    pub conversation: ConversationKey,
    /// Text as typed
    pub text: String,
    /// Attached media references
    pub media: MediaRefs,
    /// Wall clock ms when authored
    pub created_at: i64,
    /// Latest attempt state
    pub state: SendState,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ack_path() {
        let mut attempt = SendAttempt::new();
        attempt.advance(SendState::SentRealtime).unwrap();
        attempt.advance(SendState::Acked).unwrap();
        attempt.advance(SendState::Confirmed).unwrap();
        assert!(attempt.state().is_terminal());
        assert_eq!(
            attempt.history(),
            &[SendState::Created, SendState::SentRealtime, SendState::Acked, SendState::Confirmed]
        );
    }

    #[test]
    fn timeout_path_ends_failed() {
        let mut attempt = SendAttempt::new();
        let path = [
            SendState::SentRealtime,
            SendState::TimedOut,
            SendState::FallbackRest,
            SendState::Failed,
        ];
        for next in path {
            attempt.advance(next).unwrap();
        }
        assert_eq!(attempt.state(), SendState::Failed);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut attempt = SendAttempt::new();
        attempt.advance(SendState::FallbackRest).unwrap();
        attempt.advance(SendState::Confirmed).unwrap();
        let err = attempt.advance(SendState::Failed).unwrap_err();
        assert_eq!(err, InvalidTransition { from: SendState::Confirmed, to: SendState::Failed });
        assert_eq!(attempt.history().len(), 3);
    }

    #[test]
    fn ack_cannot_follow_timeout() {
        let mut attempt = SendAttempt::new();
        attempt.advance(SendState::SentRealtime).unwrap();
        attempt.advance(SendState::TimedOut).unwrap();
        assert!(attempt.advance(SendState::Acked).is_err());
    }
}
