//! Per-request loop limits.

use std::time::Duration;
use tokio::time::Instant;

use super::error::AgentError;
use crate::config::{secs_to_duration, AgentSettings, MAX_TIMEOUT_SECS};

/// Turn count, wall-clock deadline and fan-out cap for one request.
///
/// Created when a request arrives and consumed as the loop advances; never
/// shared between requests.
#[derive(Debug, Clone)]
pub struct LoopBudget {
    max_turns: u32,
    turns_used: u32,
    deadline: Instant,
    max_concurrent_tools: usize,
}

impl LoopBudget {
    pub fn new(max_turns: u32, time_limit: Duration, max_concurrent_tools: usize) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(time_limit)
            .unwrap_or_else(|| now + secs_to_duration(MAX_TIMEOUT_SECS));
        Self {
            max_turns,
            turns_used: 0,
            deadline,
            max_concurrent_tools: max_concurrent_tools.max(1),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(
            settings.max_turns,
            settings.deadline(),
            settings.max_concurrent_tools,
        )
    }

    /// Claim the next turn, failing once the turn limit or deadline is spent.
    pub fn start_turn(&mut self) -> Result<u32, AgentError> {
        if self.turns_used >= self.max_turns {
            return Err(AgentError::turns_exhausted(self.max_turns));
        }
        self.check_deadline()?;
        self.turns_used += 1;
        Ok(self.turns_used)
    }

    pub fn check_deadline(&self) -> Result<(), AgentError> {
        if self.is_expired() {
            Err(AgentError::deadline_exceeded())
        } else {
            Ok(())
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn turns_used(&self) -> u32 {
        self.turns_used
    }

    pub fn remaining_turns(&self) -> u32 {
        self.max_turns.saturating_sub(self.turns_used)
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }
}
