//! Client tuning knobs and their defaults.

/// Points a single retry batch may accumulate before the writer stops
/// pulling from the queue.
pub const MAX_RETRY_BATCH_SIZE: usize = 10_000;

/// Lower bound on write queue batch slots, so tiny point capacities still
/// leave room for drain sentinels and a few batches.
pub const MIN_QUEUE_SLOTS: usize = 10;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Writer workers per write service. Zero makes this a reader-only
    /// client: the read registry is kept fresh and no pipelines are built.
    pub writer_threads: usize,

    /// Write queue capacity in data points, per service.
    pub queue_capacity: usize,

    /// Ratio between point capacity and batch slots. Slots hold whole
    /// batches, so far fewer of them are needed.
    pub queue_size_ratio: usize,

    /// Writers sleep between rounds while the queue holds fewer points than
    /// this, letting the next round batch more per request.
    pub min_queue_size: usize,

    /// Sleep length for shallow queues, in microseconds.
    pub sleep_per_put_us: u64,

    /// Retry queue capacity in data points, shared by all services.
    pub retry_queue_capacity: usize,

    /// Delay before resending a failed batch. Kept under one minute so
    /// retried points still land in the right one-minute bucket.
    pub retry_delay_secs: i64,

    /// How stale past its send time a retry batch may be before it is
    /// discarded instead of sent.
    pub retry_threshold_secs: i64,

    /// Workers draining the retry queue.
    pub write_retry_threads: usize,

    /// Fan `scan_shard` out across every read service instead of asking one.
    pub parallel_scan_shard: bool,

    /// Seconds between read service list refreshes. Negative disables the
    /// refresh loop.
    pub read_services_update_interval_secs: i64,

    /// Keep every service's OK payloads during fan-out reads and log
    /// cross-service mismatches at finalize time.
    pub compare_reads: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            writer_threads: 0,
            queue_capacity: 1,
            queue_size_ratio: 500,
            min_queue_size: 100,
            sleep_per_put_us: 100_000,
            retry_queue_capacity: 10_000,
            retry_delay_secs: 55,
            retry_threshold_secs: 30,
            write_retry_threads: 4,
            parallel_scan_shard: false,
            read_services_update_interval_secs: 15,
            compare_reads: false,
        }
    }
}

impl ClientOptions {
    /// Batch slots of one write queue, derived from the point capacity.
    pub fn queue_slots(&self) -> usize {
        std::cmp::max(self.queue_capacity / self.queue_size_ratio, MIN_QUEUE_SLOTS)
    }
}
