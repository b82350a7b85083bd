//! [`CommandQueue`] – rate-limited FIFO of outbound commands.
//!
//! JS8Call processes one transmission at a time, so bus clients must not be
//! able to burst commands at it. Commands are released strictly in enqueue
//! order and never closer together than the configured minimum delay. The
//! first command after start-up is released immediately.
//!
//! With a capacity set, enqueueing into a full queue evicts the oldest
//! pending command and hands it back to the caller so the drop can be
//! reported.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use js8bridge_core::command_queue::CommandQueue;
//! use js8bridge_types::Command;
//! use serde_json::json;
//!
//! let mut queue = CommandQueue::new(Duration::from_secs(2), None);
//! let t0 = Instant::now();
//! queue.enqueue(Command::new(json!({ "type": "RIG.GET_FREQ" })));
//! queue.enqueue(Command::new(json!({ "type": "RIG.GET_PTT" })));
//!
//! assert!(queue.poll_release(t0).is_some());
//! assert!(queue.poll_release(t0 + Duration::from_secs(1)).is_none()); // too soon
//! assert!(queue.poll_release(t0 + Duration::from_secs(2)).is_some());
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use js8bridge_types::Command;
use tokio::time::Instant;

/// Pending commands plus the release clock.
#[derive(Debug)]
pub struct CommandQueue {
    min_delay: Duration,
    capacity: Option<usize>,
    pending: VecDeque<Command>,
    last_release: Option<Instant>,
}

impl CommandQueue {
    /// Create a queue releasing at most one command per `min_delay`.
    /// `capacity` of `None` means unbounded; `Some(0)` is treated as `Some(1)`.
    pub fn new(min_delay: Duration, capacity: Option<usize>) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        Self {
            min_delay,
            capacity,
            pending: VecDeque::with_capacity(capacity.unwrap_or(16)),
            last_release: None,
        }
    }

    /// Append `command`. Returns the evicted oldest command when the queue
    /// was full.
    pub fn enqueue(&mut self, command: Command) -> Option<Command> {
        let dropped = match self.capacity {
            Some(cap) if self.pending.len() >= cap => self.pending.pop_front(),
            _ => None,
        };
        self.pending.push_back(command);
        dropped
    }

    /// `true` when at least `min_delay` has passed since the last release.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_release {
            Some(last) => now.saturating_duration_since(last) >= self.min_delay,
            None => true,
        }
    }

    /// Earliest instant at which the next release may happen, or `None` if
    /// nothing has been released yet.
    pub fn next_release_at(&self) -> Option<Instant> {
        self.last_release.map(|last| last + self.min_delay)
    }

    /// Release the head command if the delay has elapsed. The release clock
    /// only advances when a command is actually handed out.
    pub fn poll_release(&mut self, now: Instant) -> Option<Command> {
        if !self.is_due(now) {
            return None;
        }
        let command = self.pending.pop_front()?;
        self.last_release = Some(now);
        Some(command)
    }

    /// Put a command whose transmission failed back at the head and rewind
    /// the release clock to `previous_release`.
    pub fn requeue_front(&mut self, command: Command, previous_release: Option<Instant>) {
        self.pending.push_front(command);
        self.last_release = previous_release;
    }

    /// Instant of the most recent release.
    pub fn last_release(&self) -> Option<Instant> {
        self.last_release
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Drop all pending commands. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
