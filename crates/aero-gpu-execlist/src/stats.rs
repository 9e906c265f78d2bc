use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`EngineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub requests_submitted: u64,
    pub elsp_writes: u64,
    pub lite_restores: u64,
    pub preemptions_requested: u64,
    pub preemptions_completed: u64,
    pub requests_retired: u64,
    pub requests_cancelled: u64,

    pub csb_entries: u64,
    pub unexpected_csb_entries: u64,

    pub ring_out_of_space: u64,
    pub breadcrumb_wakeups: u64,
}

/// Per-engine counters.
///
/// Updated under the engine lock but readable from any thread without it.
#[derive(Debug, Default)]
pub struct EngineStats {
    requests_submitted: AtomicU64,
    elsp_writes: AtomicU64,
    lite_restores: AtomicU64,
    preemptions_requested: AtomicU64,
    preemptions_completed: AtomicU64,
    requests_retired: AtomicU64,
    requests_cancelled: AtomicU64,

    // ---------------------------------------------------------------------
    // Context status buffer
    // ---------------------------------------------------------------------
    csb_entries: AtomicU64,
    unexpected_csb_entries: AtomicU64,

    ring_out_of_space: AtomicU64,
    breadcrumb_wakeups: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_elsp_writes(&self) {
        self.elsp_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lite_restores(&self) {
        self.lite_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_preemptions_requested(&self) {
        self.preemptions_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_preemptions_completed(&self) {
        self.preemptions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requests_retired(&self, n: u64) {
        self.requests_retired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_requests_cancelled(&self, n: u64) {
        self.requests_cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_csb_entries(&self) {
        self.csb_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unexpected_csb_entries(&self) {
        self.unexpected_csb_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ring_out_of_space(&self) {
        self.ring_out_of_space.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_breadcrumb_wakeups(&self, n: u64) {
        self.breadcrumb_wakeups.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            elsp_writes: self.elsp_writes.load(Ordering::Relaxed),
            lite_restores: self.lite_restores.load(Ordering::Relaxed),
            preemptions_requested: self.preemptions_requested.load(Ordering::Relaxed),
            preemptions_completed: self.preemptions_completed.load(Ordering::Relaxed),
            requests_retired: self.requests_retired.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            csb_entries: self.csb_entries.load(Ordering::Relaxed),
            unexpected_csb_entries: self.unexpected_csb_entries.load(Ordering::Relaxed),
            ring_out_of_space: self.ring_out_of_space.load(Ordering::Relaxed),
            breadcrumb_wakeups: self.breadcrumb_wakeups.load(Ordering::Relaxed),
        }
    }
}
