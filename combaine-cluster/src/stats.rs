use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Pipeline counters for one agent.
///
/// Increments happen from many task runners at once; reads produce a
/// consistent-enough snapshot for monitoring.
#[derive(Debug, Default)]
pub struct ClientStats {
    success_parsing: AtomicU64,
    failed_parsing: AtomicU64,
    success_aggregate: AtomicU64,
    failed_aggregate: AtomicU64,
    last: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub success_parsing: u64,
    pub failed_parsing: u64,
    pub success_aggregate: u64,
    pub failed_aggregate: u64,
    pub parsing_total: u64,
    pub aggregate_total: u64,
    pub heartbeated: i64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ClientStats {
    pub fn add_success_parsing(&self) {
        self.success_parsing.fetch_add(1, Ordering::Relaxed);
        self.last.store(unix_now(), Ordering::Relaxed);
    }

    pub fn add_failed_parsing(&self) {
        self.failed_parsing.fetch_add(1, Ordering::Relaxed);
        self.last.store(unix_now(), Ordering::Relaxed);
    }

    pub fn add_success_aggregate(&self) {
        self.success_aggregate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed_aggregate(&self) {
        self.failed_aggregate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let success_parsing = self.success_parsing.load(Ordering::Relaxed);
        let failed_parsing = self.failed_parsing.load(Ordering::Relaxed);
        let success_aggregate = self.success_aggregate.load(Ordering::Relaxed);
        let failed_aggregate = self.failed_aggregate.load(Ordering::Relaxed);
        StatsSnapshot {
            success_parsing,
            failed_parsing,
            success_aggregate,
            failed_aggregate,
            parsing_total: success_parsing + failed_parsing,
            aggregate_total: success_aggregate + failed_aggregate,
            heartbeated: self.last.load(Ordering::Relaxed),
        }
    }

    /// Deep copy of the counters, for tests.
    pub fn copy_stats(&self, dst: &ClientStats) {
        dst.success_parsing
            .store(self.success_parsing.load(Ordering::Relaxed), Ordering::Relaxed);
        dst.failed_parsing
            .store(self.failed_parsing.load(Ordering::Relaxed), Ordering::Relaxed);
        dst.success_aggregate
            .store(self.success_aggregate.load(Ordering::Relaxed), Ordering::Relaxed);
        dst.failed_aggregate
            .store(self.failed_aggregate.load(Ordering::Relaxed), Ordering::Relaxed);
        dst.last.store(self.last.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}
