//! Listener counters
//!
//! Lock-free counters shared by the accept loop, the call sessions and the
//! health endpoint.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use super::call::Disposition;

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    refused: AtomicU64,
    active: AtomicUsize,
    bridged: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    handshake_failures: AtomicU64,
    subscribe_failures: AtomicU64,
    linger_failures: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub refused: u64,
    pub active: usize,
    pub bridged: u64,
    pub rejected: u64,
    pub failed: u64,
    pub handshake_failures: u64,
    pub subscribe_failures: u64,
    pub linger_failures: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn session_finished(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_linger_failure(&self) {
        self.linger_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disposition(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Bridged => &self.bridged,
            Disposition::Rejected => &self.rejected,
            Disposition::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            active: self.active(),
            bridged: self.bridged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            linger_failures: self.linger_failures.load(Ordering::Relaxed),
        }
    }
}
