//! Observable statistics (spec §6): one atomic counters struct per
//! long-lived component, each exposing a plain-data [`GatewayStatsSnapshot`]
//! for the stats collector to log or serialize, mirroring this codebase's
//! existing `SourceMetrics`/`SourceMetricsSnapshot` split.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;

/// Atomic counters shared by every long-lived component (TCP listener, UDP
/// receiver, the two processors, the output router). All writes use
/// Relaxed ordering — these are sampling counters, never used for
/// control-flow decisions (spec §5).
pub struct GatewayStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub parse_errors: AtomicU64,
    pub queue_full_drops: AtomicU64,
    /// TCP admission-check failures (`user_id != client_id`). Named in
    /// Testable Property 4 / Scenario E5 but missing from the original
    /// statistics table — added here (SPEC_FULL §6).
    pub admission_rejects: AtomicU64,
    /// Egress drops, split by cause.
    pub messages_dropped_queue_full: AtomicU64,
    pub messages_dropped_client_inactive: AtomicU64,
    pub shard0_dispatches: AtomicU64,
    pub shard1_dispatches: AtomicU64,
    pub poll_empty: AtomicU64,
    pub poll_full: AtomicU64,
    pub active_clients: AtomicUsize,
}

/// Plain-struct snapshot of [`GatewayStats`] for display/serialization (no atomics).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct GatewayStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub parse_errors: u64,
    pub queue_full_drops: u64,
    pub admission_rejects: u64,
    pub messages_dropped_queue_full: u64,
    pub messages_dropped_client_inactive: u64,
    pub shard0_dispatches: u64,
    pub shard1_dispatches: u64,
    pub poll_empty: u64,
    pub poll_full: u64,
    pub active_clients: usize,
}

impl GatewayStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            queue_full_drops: AtomicU64::new(0),
            admission_rejects: AtomicU64::new(0),
            messages_dropped_queue_full: AtomicU64::new(0),
            messages_dropped_client_inactive: AtomicU64::new(0),
            shard0_dispatches: AtomicU64::new(0),
            shard1_dispatches: AtomicU64::new(0),
            poll_empty: AtomicU64::new(0),
            poll_full: AtomicU64::new(0),
            active_clients: AtomicUsize::new(0),
        })
    }

    pub fn record_dispatch(&self, shard: usize) {
        if shard == 0 {
            self.shard0_dispatches.fetch_add(1, Relaxed);
        } else {
            self.shard1_dispatches.fetch_add(1, Relaxed);
        }
    }

    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            rx_packets: self.rx_packets.load(Relaxed),
            rx_bytes: self.rx_bytes.load(Relaxed),
            tx_packets: self.tx_packets.load(Relaxed),
            tx_bytes: self.tx_bytes.load(Relaxed),
            parse_errors: self.parse_errors.load(Relaxed),
            queue_full_drops: self.queue_full_drops.load(Relaxed),
            admission_rejects: self.admission_rejects.load(Relaxed),
            messages_dropped_queue_full: self.messages_dropped_queue_full.load(Relaxed),
            messages_dropped_client_inactive: self.messages_dropped_client_inactive.load(Relaxed),
            shard0_dispatches: self.shard0_dispatches.load(Relaxed),
            shard1_dispatches: self.shard1_dispatches.load(Relaxed),
            poll_empty: self.poll_empty.load(Relaxed),
            poll_full: self.poll_full.load(Relaxed),
            active_clients: self.active_clients.load(Relaxed),
        }
    }
}
