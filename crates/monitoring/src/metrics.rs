//! Process counters bumped by the gateway components.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for lock-free updates from any task.
#[derive(Debug)]
pub struct GatewayMetrics {
    started_at: Instant,
    pub intents_received: AtomicU64,
    pub intents_duplicate: AtomicU64,
    pub intents_rejected: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub sessions_expired: AtomicU64,
    pub challenges_issued: AtomicU64,
    pub responses_accepted: AtomicU64,
    pub responses_rejected: AtomicU64,
    pub vtxos_created: AtomicU64,
    pub vtxos_spent: AtomicU64,
    pub vtxos_expired: AtomicU64,
    pub settlements_committed: AtomicU64,
    pub invoices_settled: AtomicU64,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            intents_received: AtomicU64::new(0),
            intents_duplicate: AtomicU64::new(0),
            intents_rejected: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            challenges_issued: AtomicU64::new(0),
            responses_accepted: AtomicU64::new(0),
            responses_rejected: AtomicU64::new(0),
            vtxos_created: AtomicU64::new(0),
            vtxos_spent: AtomicU64::new(0),
            vtxos_expired: AtomicU64::new(0),
            settlements_committed: AtomicU64::new(0),
            invoices_settled: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub intents_received: u64,
    pub intents_duplicate: u64,
    pub intents_rejected: u64,
    pub sessions_created: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_expired: u64,
    pub challenges_issued: u64,
    pub responses_accepted: u64,
    pub responses_rejected: u64,
    pub vtxos_created: u64,
    pub vtxos_spent: u64,
    pub vtxos_expired: u64,
    pub settlements_committed: u64,
    pub invoices_settled: u64,
}

impl GatewayMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            intents_received: self.intents_received.load(Ordering::Relaxed),
            intents_duplicate: self.intents_duplicate.load(Ordering::Relaxed),
            intents_rejected: self.intents_rejected.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            responses_accepted: self.responses_accepted.load(Ordering::Relaxed),
            responses_rejected: self.responses_rejected.load(Ordering::Relaxed),
            vtxos_created: self.vtxos_created.load(Ordering::Relaxed),
            vtxos_spent: self.vtxos_spent.load(Ordering::Relaxed),
            vtxos_expired: self.vtxos_expired.load(Ordering::Relaxed),
            settlements_committed: self.settlements_committed.load(Ordering::Relaxed),
            invoices_settled: self.invoices_settled.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// One-line heartbeat summary.
    pub fn summary(&self) -> String {
        format!(
            "up {}s | intents {} (dup {}, rejected {}) | sessions {}/{}/{} c/f/e | responses {}+{} | vtxos {} created, {} spent | settlements {}",
            self.uptime_secs,
            self.intents_received,
            self.intents_duplicate,
            self.intents_rejected,
            self.sessions_completed,
            self.sessions_failed,
            self.sessions_expired,
            self.responses_accepted,
            self.responses_rejected,
            self.vtxos_created,
            self.vtxos_spent,
            self.settlements_committed,
        )
    }
}
