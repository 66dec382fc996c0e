//! Crash-loop policy for unplanned exits

use crate::config::RestartConfig;
use crate::types::SlotId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Verdict for one unplanned exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after the delay
    Respawn {
        /// Backoff before the respawn
        delay: Duration,
        /// Restarts in the window, including this one
        attempt: usize,
    },
    /// Restart budget exhausted
    GiveUp {
        /// Restarts already in the window
        restarts: usize,
    },
}

/// Sliding-window restart counter, one history per slot
#[derive(Debug)]
pub struct RestartTracker {
    config: RestartConfig,
    history: HashMap<SlotId, VecDeque<Instant>>,
}

impl RestartTracker {
    /// Create a tracker
    #[must_use]
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Record an unplanned exit on `slot` and decide what to do
    pub fn on_unplanned_exit(&mut self, slot: SlotId) -> RestartDecision {
        self.on_unplanned_exit_at(slot, Instant::now())
    }

    fn on_unplanned_exit_at(&mut self, slot: SlotId, now: Instant) -> RestartDecision {
        let window = self.config.window();
        let history = self.history.entry(slot).or_default();
        while history
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            history.pop_front();
        }

        if history.len() >= self.config.max_restarts {
            return RestartDecision::GiveUp {
                restarts: history.len(),
            };
        }

        history.push_back(now);
        let attempt = history.len();
        let delay = self
            .config
            .backoff
            .delay_for_attempt(u32::try_from(attempt).unwrap_or(u32::MAX));
        RestartDecision::Respawn { delay, attempt }
    }

    /// Restarts currently counted for `slot`
    #[must_use]
    pub fn restart_count(&self, slot: SlotId) -> usize {
        self.history.get(&slot).map_or(0, VecDeque::len)
    }
}
