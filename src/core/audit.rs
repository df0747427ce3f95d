//! Outcome sinks for account operations.
//!
//! Every operation a worker finishes is reported here as well as to the
//! caller's handle, so failures are observable even when nobody waits.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::worker::OpOutcome;

/// Receives every finished account operation.
pub trait OutcomeSink: Send + Sync {
    /// Record a finished operation.
    fn record(&self, outcome: &OpOutcome);
}

/// Bounded in-memory journal of recent outcomes.
pub struct InMemoryOutcomeSink {
    events: Mutex<VecDeque<OpOutcome>>,
    max_events: usize,
}

impl InMemoryOutcomeSink {
    /// Create a journal keeping at most `max_events` outcomes.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(4096))),
            max_events: max_events.max(1),
        }
    }

    /// Snapshot of stored outcomes, oldest first.
    pub fn outcomes(&self) -> Vec<OpOutcome> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored outcomes whose operation failed.
    pub fn failures(&self) -> Vec<OpOutcome> {
        self.events
            .lock()
            .iter()
            .filter(|o| o.result.is_err())
            .cloned()
            .collect()
    }

    /// Stored outcomes for one account.
    pub fn for_account(&self, account: &str) -> Vec<OpOutcome> {
        self.events
            .lock()
            .iter()
            .filter(|o| o.account == account)
            .cloned()
            .collect()
    }
}

impl OutcomeSink for InMemoryOutcomeSink {
    fn record(&self, outcome: &OpOutcome) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(outcome.clone());
    }
}

/// Sink that forwards outcomes to `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn record(&self, outcome: &OpOutcome) {
        match &outcome.result {
            Ok(()) => tracing::debug!(
                op_id = outcome.op_id,
                account = %outcome.account,
                op = outcome.op.as_str(),
                "account operation recorded"
            ),
            Err(e) => tracing::warn!(
                op_id = outcome.op_id,
                account = %outcome.account,
                op = outcome.op.as_str(),
                error = %e,
                "account operation failed"
            ),
        }
    }
}
