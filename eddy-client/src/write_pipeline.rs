//! Per-service write pipeline.
//!
//! Producers push batches into the pipeline's bounded queue and return
//! immediately. Writer workers pull points back out, re-grouped per
//! destination host by the service's network client, send them, and classify
//! everything that did not make it: locally unroutable points and
//! server-rejected points both become one delayed retry operation.
//!
//! Workers never die on transport errors. The only way out of the loop is a
//! drain sentinel, one per worker, enqueued by `flush`.

use log::{error, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eddy_core::model::DataPoint;
use eddy_core::network::{NetworkClient, PutRequestMap};
use eddy_core::queue::BoundedPointQueue;
use eddy_core::retry::{RetryOperation, RetryQueue};
use eddy_core::stats::{ServiceStats, Stats};
use eddy_core::tool;

use crate::config::{ClientOptions, MAX_RETRY_BATCH_SIZE};

pub struct WritePipeline {
    client: Arc<dyn NetworkClient>,
    queue: BoundedPointQueue,
    stats: Arc<ServiceStats>,
}

impl WritePipeline {
    pub fn new(client: Arc<dyn NetworkClient>, options: &ClientOptions, stats: Arc<ServiceStats>) -> Self {
        Self {
            client,
            queue: BoundedPointQueue::new(options.queue_slots(), options.queue_capacity),
            stats,
        }
    }

    pub fn client(&self) -> &Arc<dyn NetworkClient> {
        &self.client
    }

    pub fn queue(&self) -> &BoundedPointQueue {
        &self.queue
    }

    /// Enqueue one producer batch. Returns whether the queue accepted it;
    /// the rejected batch is dropped here, counted, and the producer decides
    /// what that means.
    pub fn push(&self, batch: Vec<DataPoint>) -> bool {
        let num_points = batch.len() as u64;

        let accepted = self.queue.push(batch).is_ok();
        if accepted {
            self.stats.enqueued.fetch_add(num_points, Ordering::Relaxed);
        } else {
            self.stats
                .enqueue_dropped
                .fetch_add(num_points, Ordering::Relaxed);
        }
        self.stats
            .queue_size
            .store(self.queue.size() as u64, Ordering::Relaxed);

        accepted
    }

    /// Writer worker loop. Runs until a drain sentinel is consumed.
    pub async fn run(
        self: Arc<Self>,
        retry_queue: Arc<RetryQueue>,
        stats: Arc<Stats>,
        options: ClientOptions,
    ) {
        loop {
            let mut requests = PutRequestMap::new();
            let mut local_dropped: Vec<DataPoint> = Vec::new();

            let client = self.client.clone();
            let (alive, count) = self
                .queue
                .pop(|dp| {
                    let more = client.add_data_point_to_request(dp, &mut requests, &mut local_dropped);
                    more && local_dropped.len() < MAX_RETRY_BATCH_SIZE
                })
                .await;

            if count > 0 {
                let mut dropped = local_dropped;
                let attempted = count - dropped.len();
                let rejected = put_with_stats(&self.client, attempted, requests, &self.stats).await;
                dropped.extend(rejected);

                if !dropped.is_empty() {
                    self.queue_for_retry(dropped, &retry_queue, &stats, &options);
                }

                let queue_size = self.queue.size();
                self.stats
                    .queue_size
                    .store(queue_size as u64, Ordering::Relaxed);

                // Wait for a bit if there isn't much in the queue, so the
                // next round sends a bigger request.
                if alive && queue_size < options.min_queue_size {
                    tokio::time::sleep(Duration::from_micros(options.sleep_per_put_us)).await;
                }
            }

            if !alive {
                warn!(
                    "shutting down writer for service: {}",
                    self.client.service_name()
                );
                break;
            }
        }
    }

    /// Hand failed points to the retry queue with a send-after delay, or
    /// give up on them if the retry queue has no room.
    fn queue_for_retry(
        &self,
        dropped: Vec<DataPoint>,
        retry_queue: &RetryQueue,
        stats: &Stats,
        options: &ClientOptions,
    ) {
        let num_dropped = dropped.len() as u64;
        let op = RetryOperation {
            client: self.client.clone(),
            points: dropped,
            earliest_send_time: tool::now_secs() + options.retry_delay_secs,
        };

        match retry_queue.try_push(op) {
            Ok(()) => {
                self.stats
                    .put_retry
                    .fetch_add(num_dropped, Ordering::Relaxed);
                stats
                    .retry_queue_size
                    .store(retry_queue.queued_points() as u64, Ordering::Relaxed);
            }
            Err(op) => {
                log_dropped_points(
                    &self.client,
                    &self.stats,
                    op.points.len(),
                    "retry queue is full",
                );
                stats
                    .retry_queue_write_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Send one per-host request map and record timing and acceptance counters.
/// Returns the points the service rejected.
pub(crate) async fn put_with_stats(
    client: &Arc<dyn NetworkClient>,
    attempted: usize,
    requests: PutRequestMap,
    stats: &ServiceStats,
) -> Vec<DataPoint> {
    let start = Instant::now();
    let result = client.perform_put(requests).await;
    stats.record_put_timing(start.elapsed().as_micros() as u64);

    match result {
        Ok(rejected) => {
            let sent = attempted.saturating_sub(rejected.len());
            stats.put.fetch_add(sent as u64, Ordering::Relaxed);
            rejected
        }
        Err(e) => {
            error!(
                "put to service failed outside the protocol, service: {}, error: {}",
                client.service_name(),
                e
            );
            Vec::new()
        }
    }
}

/// Log and count points the client is giving up on.
pub(crate) fn log_dropped_points(
    client: &Arc<dyn NetworkClient>,
    stats: &ServiceStats,
    dropped: usize,
    reason: &str,
) {
    warn!(
        "dropping {} data points for service {} because {}",
        dropped,
        client.service_name(),
        reason
    );
    stats.put_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
}
