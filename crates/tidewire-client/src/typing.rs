//! Trailing debounce for typing indicators.
//!
//! The first keystroke in a burst emits `typing:start`. Every keystroke
//! pushes the stop deadline out by the idle period; once a tick passes the
//! deadline, `typing:stop` is emitted exactly once. Clearing the input (or
//! sending) stops immediately.

use std::{collections::HashMap, ops::Add, time::Duration};

use tidewire_core::OutboundAction;

/// Per-room typing debounce.
#[derive(Debug, Clone)]
pub struct TypingDebounce<I> {
    idle: Duration,
    deadlines: HashMap<String, I>,
}

impl<I> TypingDebounce<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Debounce with the given quiet period.
    pub fn new(idle: Duration) -> Self {
        Self { idle, deadlines: HashMap::new() }
    }

    /// Input text of `room_id` changed.
    pub fn input(&mut self, room_id: &str, text: &str, now: I) -> Vec<OutboundAction> {
        if text.trim().is_empty() {
            return self.stop(room_id);
        }

        let started = self.deadlines.insert(room_id.to_string(), now + self.idle).is_none();
        if started {
            vec![OutboundAction::TypingStart { room_id: room_id.to_string() }]
        } else {
            Vec::new()
        }
    }

    /// Stop immediately, e.g. because the message was sent.
    pub fn stop(&mut self, room_id: &str) -> Vec<OutboundAction> {
        match self.deadlines.remove(room_id) {
            Some(_) => vec![OutboundAction::TypingStop { room_id: room_id.to_string() }],
            None => Vec::new(),
        }
    }

    /// Emit `typing:stop` for every room whose quiet period has passed.
    pub fn tick(&mut self, now: I) -> Vec<OutboundAction> {
        let mut expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|&(_, deadline)| *deadline <= now)
            .map(|(room, _)| room.clone())
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .map(|room_id| {
                self.deadlines.remove(&room_id);
                OutboundAction::TypingStop { room_id }
            })
            .collect()
    }

    /// Rooms currently flagged as typing.
    pub fn active(&self) -> usize {
        self.deadlines.len()
    }
}
