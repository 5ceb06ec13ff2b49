//! In-process statistics counters.
//!
//! Counters are plain atomics so the hot paths never contend on a lock, and
//! exporting is a best-effort snapshot. Per-service counters live in a
//! `DashMap` keyed by service name; the table only grows, one entry per
//! service the client has ever talked to.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Write-side counters for one service.
#[derive(Default)]
pub struct ServiceStats {
    /// Points accepted into the write queue.
    pub enqueued: AtomicU64,

    /// Points rejected by a full write queue.
    pub enqueue_dropped: AtomicU64,

    /// Points the service acknowledged.
    pub put: AtomicU64,

    /// Points given up on, with the reason logged at drop time.
    pub put_dropped: AtomicU64,

    /// Points handed to the retry queue.
    pub put_retry: AtomicU64,

    /// Microseconds spent in `perform_put`, and the number of calls, for an
    /// average-latency readout.
    pub put_time_us: AtomicU64,
    pub put_calls: AtomicU64,

    /// Last observed queue size, in points.
    pub queue_size: AtomicU64,
}

impl ServiceStats {
    pub fn record_put_timing(&self, us: u64) {
        self.put_time_us.fetch_add(us, Ordering::Relaxed);
        self.put_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Average microseconds per `perform_put` call.
    pub fn us_per_put(&self) -> u64 {
        let calls = self.put_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0;
        }
        self.put_time_us.load(Ordering::Relaxed) / calls
    }
}

/// Counters shared by the whole client.
#[derive(Default)]
pub struct Stats {
    services: DashMap<String, Arc<ServiceStats>>,

    /// Reads that had to fail over to another service.
    pub read_failover: AtomicU64,

    /// Retry operations rejected by a full retry queue.
    pub retry_queue_write_failures: AtomicU64,

    /// Configured read services that were invalid or unreachable.
    pub bad_read_services: AtomicU64,

    /// Keys a service answered with known gaps, redirecting the read.
    pub redirect_for_missing_data: AtomicU64,

    /// Last observed retry queue size, in points.
    pub retry_queue_size: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one service, created on first use.
    pub fn service(&self, name: &str) -> Arc<ServiceStats> {
        if let Some(stats) = self.services.get(name) {
            return stats.value().clone();
        }
        self.services
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Point-in-time copy of every counter. Lossy by design; concurrent
    /// updates may or may not be visible.
    pub fn snapshot(&self) -> StatsSnapshot {
        let services = self
            .services
            .iter()
            .map(|entry| {
                let s = entry.value();
                ServiceStatsSnapshot {
                    service: entry.key().clone(),
                    enqueued: s.enqueued.load(Ordering::Relaxed),
                    enqueue_dropped: s.enqueue_dropped.load(Ordering::Relaxed),
                    put: s.put.load(Ordering::Relaxed),
                    put_dropped: s.put_dropped.load(Ordering::Relaxed),
                    put_retry: s.put_retry.load(Ordering::Relaxed),
                    us_per_put: s.us_per_put(),
                    queue_size: s.queue_size.load(Ordering::Relaxed),
                }
            })
            .collect();

        StatsSnapshot {
            services,
            read_failover: self.read_failover.load(Ordering::Relaxed),
            retry_queue_write_failures: self.retry_queue_write_failures.load(Ordering::Relaxed),
            bad_read_services: self.bad_read_services.load(Ordering::Relaxed),
            redirect_for_missing_data: self.redirect_for_missing_data.load(Ordering::Relaxed),
            retry_queue_size: self.retry_queue_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceStatsSnapshot {
    pub service: String,
    pub enqueued: u64,
    pub enqueue_dropped: u64,
    pub put: u64,
    pub put_dropped: u64,
    pub put_retry: u64,
    pub us_per_put: u64,
    pub queue_size: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub services: Vec<ServiceStatsSnapshot>,
    pub read_failover: u64,
    pub retry_queue_write_failures: u64,
    pub bad_read_services: u64,
    pub redirect_for_missing_data: u64,
    pub retry_queue_size: u64,
}

impl StatsSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceStatsSnapshot> {
        self.services.iter().find(|s| s.service == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_counters() {
        let stats = Stats::new();

        stats.service("east").enqueued.fetch_add(500, Ordering::Relaxed);
        stats.service("east").put.fetch_add(480, Ordering::Relaxed);
        stats.service("west").enqueued.fetch_add(100, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.service("east").unwrap().enqueued, 500);
        assert_eq!(snapshot.service("east").unwrap().put, 480);
        assert_eq!(snapshot.service("west").unwrap().enqueued, 100);
        assert!(snapshot.service("north").is_none());
    }

    #[test]
    fn test_us_per_put_average() {
        let stats = ServiceStats::default();
        assert_eq!(stats.us_per_put(), 0);

        stats.record_put_timing(100);
        stats.record_put_timing(300);
        assert_eq!(stats.us_per_put(), 200);
    }
}
