//! Per-subsystem counters and the aggregate statistics snapshot.
//!
//! Counters are relaxed atomics bumped from the data-plane threads; the
//! snapshot is a point-in-time copy and makes no cross-counter consistency
//! promise.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct TunCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub dropped: AtomicU64,
    pub malformed: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_failures: AtomicU64,
}

/// Shared counter block for the TCP engine and the UDP forwarder.
#[derive(Default)]
pub(crate) struct FlowCounters {
    pub flows_created: AtomicU64,
    pub flows_closed: AtomicU64,
    pub flows_blocked: AtomicU64,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

pub(crate) fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct FlowSnapshot {
    pub flows_created: u64,
    pub flows_closed: u64,
    pub flows_blocked: u64,
    pub active_flows: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub read_errors: u64,
    pub write_failures: u64,
    pub tcp: FlowSnapshot,
    pub udp: FlowSnapshot,
    pub dns_queries: u64,
    pub dns_responses: u64,
    pub cache_size: u64,
}

impl FlowCounters {
    pub(crate) fn snapshot(&self, active_flows: u64) -> FlowSnapshot {
        FlowSnapshot {
            flows_created: get(&self.flows_created),
            flows_closed: get(&self.flows_closed),
            flows_blocked: get(&self.flows_blocked),
            active_flows,
            bytes_up: get(&self.bytes_up),
            bytes_down: get(&self.bytes_down),
        }
    }
}
