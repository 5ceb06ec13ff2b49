//! Bounded MPMC queue of data point batches.
//!
//! Producers push whole batches, one per `put` call, so entries are
//! heterogeneous in size. Capacity is therefore tracked in two dimensions:
//! the channel bounds the number of batch slots and an atomic counter bounds
//! the total number of points across all queued batches.
//!
//! Consumers do not pop batches as-is. Points arrive grouped per producer but
//! are sent grouped per destination host, so `pop` feeds points one at a time
//! into a caller predicate that re-groups them, and stops pulling as soon as
//! the predicate reports that its request map cannot take more.

use async_channel::{Receiver, Sender, TrySendError};
use likely_stable::unlikely;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::DataPoint;

/// Work unit carried by the queue. `Drain` makes exactly one consumer exit.
pub enum QueueEntry {
    Batch(Vec<DataPoint>),
    Drain,
}

/// Batches consumed by a single `pop` before it hands control back, even if
/// the predicate keeps asking for more.
const MAX_POP_BATCHES: usize = 64;

pub struct BoundedPointQueue {
    sender: Sender<QueueEntry>,
    receiver: Receiver<QueueEntry>,

    /// Total points across queued batches. Approximate under concurrency,
    /// exact at quiescence.
    num_points: AtomicUsize,

    point_capacity: usize,
}

impl BoundedPointQueue {
    pub fn new(slot_capacity: usize, point_capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(slot_capacity);

        Self {
            sender,
            receiver,
            num_points: AtomicUsize::new(0),
            point_capacity,
        }
    }

    /// Enqueue a batch without blocking. On overflow in either dimension the
    /// batch is handed back to the caller, who decides what to do with it.
    pub fn push(&self, batch: Vec<DataPoint>) -> Result<(), Vec<DataPoint>> {
        let len = batch.len();

        let prev = self.num_points.fetch_add(len, Ordering::AcqRel);
        if unlikely(prev + len > self.point_capacity) {
            self.num_points.fetch_sub(len, Ordering::AcqRel);
            return Err(batch);
        }

        match self.sender.try_send(QueueEntry::Batch(batch)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.num_points.fetch_sub(len, Ordering::AcqRel);
                match err {
                    TrySendError::Full(QueueEntry::Batch(batch))
                    | TrySendError::Closed(QueueEntry::Batch(batch)) => Err(batch),
                    // `push` never sends sentinels.
                    _ => Err(Vec::new()),
                }
            }
        }
    }

    /// Dequeue batches and feed every point to `pred`.
    ///
    /// Blocks until at least one entry is available, then keeps pulling
    /// non-blockingly while `pred` returns `true` and the batch limit is not
    /// reached. A batch that is already dequeued is always fed to the
    /// predicate in full, so a mid-batch `false` stops further pulling
    /// without losing points.
    ///
    /// Returns `(alive, count)` where `count` is the number of points fed and
    /// `alive` is `false` only when a drain sentinel was consumed.
    pub async fn pop<F>(&self, mut pred: F) -> (bool, usize)
    where
        F: FnMut(DataPoint) -> bool,
    {
        let mut count = 0;
        let mut batches = 0;
        let mut keep_pulling = true;

        let mut entry = match self.receiver.recv().await {
            Ok(entry) => Some(entry),
            Err(_) => return (false, 0),
        };

        while let Some(e) = entry.take() {
            match e {
                QueueEntry::Drain => return (false, count),
                QueueEntry::Batch(points) => {
                    self.num_points.fetch_sub(points.len(), Ordering::AcqRel);
                    batches += 1;

                    for dp in points {
                        count += 1;
                        if !pred(dp) {
                            keep_pulling = false;
                        }
                    }
                }
            }

            if keep_pulling && batches < MAX_POP_BATCHES {
                entry = self.receiver.try_recv().ok();
            }
        }

        (true, count)
    }

    /// Approximate number of queued points.
    pub fn size(&self) -> usize {
        self.num_points.load(Ordering::Acquire)
    }

    /// Enqueue `n_drain` sentinels, one per consumer to stop. Waits for slot
    /// space, so it always succeeds against live consumers.
    pub async fn flush(&self, n_drain: usize) {
        for _ in 0..n_drain {
            let _ = self.sender.send(QueueEntry::Drain).await;
        }
    }
}
