//! [`ReassemblyEngine`] – merges multi-frame activity into whole messages.
//!
//! JS8 transmissions arrive as a series of `RX.ACTIVITY` frames. The engine
//! keeps one [`AssemblyBuffer`] per conversation key, appends each frame's
//! text in arrival order, and emits:
//!
//! * a **complete** [`ReassemblyResult`] from [`ReassemblyEngine::ingest`]
//!   when a final frame arrives, or
//! * an **incomplete** result from [`ReassemblyEngine::sweep`] once a buffer
//!   has seen no frame for longer than the timeout.
//!
//! Either path removes the buffer, so a conversation is reported exactly once.
//! Keys are independent: completing or expiring one never touches another.
//!
//! The engine takes `now` as a parameter and owns no clock or lock; the
//! orchestrator serialises all access to it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use js8bridge_core::reassembly::ReassemblyEngine;
//! use js8bridge_types::ActivityFragment;
//!
//! let mut engine = ReassemblyEngine::new(Duration::from_secs(30));
//! let now = Instant::now();
//!
//! assert!(engine.ingest(ActivityFragment::new("1", "CQ D", false), now).is_none());
//! let done = engine.ingest(ActivityFragment::new("1", "E1", true), now).unwrap();
//! assert_eq!(done.text, "CQ DE1");
//! assert!(done.complete);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use js8bridge_types::{ActivityFragment, ReassemblyResult};
use tokio::time::Instant;
use tracing::debug;

/// Text accumulated so far for one conversation.
#[derive(Debug, Clone)]
pub struct AssemblyBuffer {
    pub key: String,
    pub text: String,
    pub fragments: usize,
    pub created_at: Instant,
    pub updated_at: Instant,
    origin: Option<String>,
    snr: Option<i64>,
    offset: Option<i64>,
}

impl AssemblyBuffer {
    fn open(key: String, fragment: ActivityFragment, now: Instant) -> Self {
        Self {
            key,
            text: fragment.text,
            fragments: 1,
            created_at: now,
            updated_at: now,
            origin: fragment.origin,
            snr: fragment.snr,
            offset: fragment.offset,
        }
    }

    fn append(&mut self, fragment: ActivityFragment, now: Instant) {
        self.text.push_str(&fragment.text);
        self.fragments += 1;
        self.updated_at = now;
        if self.origin.is_none() {
            self.origin = fragment.origin;
        }
    }

    fn into_result(self, complete: bool) -> ReassemblyResult {
        ReassemblyResult {
            key: self.key,
            text: self.text,
            complete,
            fragments: self.fragments,
            origin: self.origin,
            snr: self.snr,
            offset: self.offset,
        }
    }
}

/// Per-key buffer map with timeout-based expiry.
#[derive(Debug)]
pub struct ReassemblyEngine {
    timeout: Duration,
    buffers: HashMap<String, AssemblyBuffer>,
}

impl ReassemblyEngine {
    /// Create an engine that gives up on a conversation after `timeout`
    /// without a new frame.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            buffers: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Feed one fragment.
    ///
    /// Returns the complete result when `fragment` is final, `None` while the
    /// conversation is still open. A fragment without a key has nothing to
    /// merge with and is returned straight away as a single-fragment result.
    pub fn ingest(&mut self, fragment: ActivityFragment, now: Instant) -> Option<ReassemblyResult> {
        let Some(key) = fragment.key.clone() else {
            debug!("activity frame without conversation key; emitting as-is");
            return Some(ReassemblyResult::single(fragment));
        };
        let is_final = fragment.is_final;

        match self.buffers.get_mut(&key) {
            Some(buffer) => buffer.append(fragment, now),
            None => {
                debug!(key = %key, "opening assembly buffer");
                self.buffers
                    .insert(key.clone(), AssemblyBuffer::open(key.clone(), fragment, now));
            }
        }

        if is_final {
            self.buffers
                .remove(&key)
                .map(|buffer| buffer.into_result(true))
        } else {
            None
        }
    }

    /// Remove every buffer idle for longer than the timeout and return them
    /// as incomplete results, oldest conversation first.
    pub fn sweep(&mut self, now: Instant) -> Vec<ReassemblyResult> {
        let timeout = self.timeout;
        let mut expired: Vec<AssemblyBuffer> = Vec::new();
        self.buffers.retain(|_, buffer| {
            if now.saturating_duration_since(buffer.updated_at) > timeout {
                expired.push(buffer.clone());
                false
            } else {
                true
            }
        });
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        expired
            .into_iter()
            .map(|buffer| buffer.into_result(false))
            .collect()
    }

    /// Drop every open buffer without emitting anything. Returns how many
    /// were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.buffers.len();
        self.buffers.clear();
        n
    }

    /// Number of open conversations.
    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Inspect the open buffer for `key`.
    pub fn buffer(&self, key: &str) -> Option<&AssemblyBuffer> {
        self.buffers.get(key)
    }
}
