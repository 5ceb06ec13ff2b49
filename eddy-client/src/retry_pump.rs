//! Workers draining the retry queue.
//!
//! The queue is FIFO and every entry carries the same constant delay, so
//! deadlines are non-decreasing and a worker can simply sleep until the head
//! entry is due. Batches that went stale past the staleness threshold are
//! surrendered instead of sent; a batch that fails its retry is surrendered
//! too, retries are never chained.

use likely_stable::unlikely;
use log::warn;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use eddy_core::network::PutRequestMap;
use eddy_core::retry::{RetryCommand, RetryOperation, RetryQueue};
use eddy_core::stats::Stats;
use eddy_core::tool;

use crate::write_pipeline::{log_dropped_points, put_with_stats};

/// Retry pump worker loop. Runs until a shutdown command is consumed.
pub async fn run(queue: Arc<RetryQueue>, stats: Arc<Stats>, retry_threshold_secs: i64) {
    loop {
        let op = match queue.read().await {
            RetryCommand::Retry(op) => op,
            RetryCommand::Shutdown => {
                warn!("shutting down retry writer");
                break;
            }
        };
        stats
            .retry_queue_size
            .store(queue.queued_points() as u64, Ordering::Relaxed);

        let RetryOperation {
            client,
            points,
            earliest_send_time,
        } = op;
        let service_stats = stats.service(client.service_name());

        let now = tool::now_secs();
        if unlikely(earliest_send_time < now - retry_threshold_secs) {
            log_dropped_points(&client, &service_stats, points.len(), "data points are too old");
            continue;
        }

        if earliest_send_time > now {
            tokio::time::sleep(Duration::from_secs((earliest_send_time - now) as u64)).await;
        }

        let mut requests = PutRequestMap::new();
        let mut dropped = Vec::new();
        let total = points.len();
        for dp in points {
            client.add_data_point_to_request(dp, &mut requests, &mut dropped);
        }

        let attempted = total - dropped.len();
        let rejected = put_with_stats(&client, attempted, requests, &service_stats).await;

        let failed = dropped.len() + rejected.len();
        if failed > 0 {
            log_dropped_points(&client, &service_stats, failed, "retry send failed");
        }
    }
}
