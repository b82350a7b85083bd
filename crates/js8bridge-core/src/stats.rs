//! Lock-free counters describing what the bridge has done since start-up.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals, shared between the orchestrator and whoever reports them.
#[derive(Debug, Default)]
pub struct BridgeStats {
    events_received: AtomicU64,
    malformed_inputs: AtomicU64,
    passthrough_published: AtomicU64,
    complete_published: AtomicU64,
    incomplete_published: AtomicU64,
    publish_failures: AtomicU64,
    commands_enqueued: AtomicU64,
    commands_released: AtomicU64,
    commands_dropped: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub malformed_inputs: u64,
    pub passthrough_published: u64,
    pub complete_published: u64,
    pub incomplete_published: u64,
    pub publish_failures: u64,
    pub commands_enqueued: u64,
    pub commands_released: u64,
    pub commands_dropped: u64,
    pub send_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        bump(&self.events_received);
    }

    pub fn record_malformed(&self) {
        bump(&self.malformed_inputs);
    }

    pub fn record_passthrough(&self) {
        bump(&self.passthrough_published);
    }

    /// Count a published reassembly result of either kind.
    pub fn record_result(&self, complete: bool) {
        if complete {
            bump(&self.complete_published);
        } else {
            bump(&self.incomplete_published);
        }
    }

    pub fn record_publish_failure(&self) {
        bump(&self.publish_failures);
    }

    pub fn record_enqueued(&self) {
        bump(&self.commands_enqueued);
    }

    pub fn record_released(&self) {
        bump(&self.commands_released);
    }

    pub fn record_dropped(&self) {
        bump(&self.commands_dropped);
    }

    pub fn record_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            malformed_inputs: self.malformed_inputs.load(Ordering::Relaxed),
            passthrough_published: self.passthrough_published.load(Ordering::Relaxed),
            complete_published: self.complete_published.load(Ordering::Relaxed),
            incomplete_published: self.incomplete_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            commands_enqueued: self.commands_enqueued.load(Ordering::Relaxed),
            commands_released: self.commands_released.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = BridgeStats::new();
        stats.record_event();
        stats.record_event();
        stats.record_result(true);
        stats.record_result(false);
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.complete_published, 1);
        assert_eq!(snap.incomplete_published, 1);
        assert_eq!(snap.commands_dropped, 1);
        assert_eq!(snap.commands_released, 0);
    }

    #[test]
    fn snapshot_serialises_field_names() {
        let json = serde_json::to_value(BridgeStats::new().snapshot()).unwrap();
        assert_eq!(json["commands_dropped"], 0);
        assert_eq!(json["malformed_inputs"], 0);
    }
}
