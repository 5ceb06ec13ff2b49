//! Delayed-retry queue for write drops.
//!
//! Kept separate from the main write queue on purpose: retry entries carry a
//! delay and a staleness deadline, and their capacity is bounded
//! independently so a dead service cannot starve fresh writes. The atomic
//! point counter is the single source of truth for that cap.

use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::model::DataPoint;
use crate::network::NetworkClient;

/// Channel slots hold whole operations, which are much smaller than write
/// batches, so the slot count is derived with a smaller ratio.
const RETRY_SLOT_RATIO: usize = 100;
const MIN_RETRY_SLOTS: usize = 10;

/// One failed batch waiting to be resent to its original service.
pub struct RetryOperation {
    pub client: Arc<dyn NetworkClient>,
    pub points: Vec<DataPoint>,

    /// Wall-clock seconds before which the batch must not be resent.
    pub earliest_send_time: i64,
}

impl std::fmt::Debug for RetryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOperation")
            .field("points", &self.points)
            .field("earliest_send_time", &self.earliest_send_time)
            .finish()
    }
}

/// Work unit of the retry pump. `Shutdown` makes exactly one worker exit.
pub enum RetryCommand {
    Retry(RetryOperation),
    Shutdown,
}

pub struct RetryQueue {
    sender: Sender<RetryCommand>,
    receiver: Receiver<RetryCommand>,

    /// Total points across queued operations.
    num_queued_points: AtomicUsize,

    point_capacity: usize,
}

impl RetryQueue {
    pub fn new(point_capacity: usize) -> Self {
        let slots = std::cmp::max(point_capacity / RETRY_SLOT_RATIO, MIN_RETRY_SLOTS);
        let (sender, receiver) = async_channel::bounded(slots);

        Self {
            sender,
            receiver,
            num_queued_points: AtomicUsize::new(0),
            point_capacity,
        }
    }

    /// Enqueue without blocking. Fails when the point cap or the slot cap is
    /// reached, handing the operation back to the caller.
    pub fn try_push(&self, op: RetryOperation) -> Result<(), RetryOperation> {
        let len = op.points.len();

        if self.num_queued_points.load(Ordering::Acquire) + len >= self.point_capacity {
            return Err(op);
        }

        match self.sender.try_send(RetryCommand::Retry(op)) {
            Ok(()) => {
                self.num_queued_points.fetch_add(len, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => match err.into_inner() {
                RetryCommand::Retry(op) => Err(op),
                RetryCommand::Shutdown => unreachable!("try_push only sends retry commands"),
            },
        }
    }

    /// Blocking read for pump workers. The point counter is decremented as
    /// the operation leaves the queue. A closed channel reads as `Shutdown`.
    pub async fn read(&self) -> RetryCommand {
        match self.receiver.recv().await {
            Ok(RetryCommand::Retry(op)) => {
                self.num_queued_points
                    .fetch_sub(op.points.len(), Ordering::AcqRel);
                RetryCommand::Retry(op)
            }
            Ok(RetryCommand::Shutdown) => RetryCommand::Shutdown,
            Err(_) => RetryCommand::Shutdown,
        }
    }

    /// Ask one pump worker to exit. Waits for slot space.
    pub async fn push_shutdown(&self) {
        let _ = self.sender.send(RetryCommand::Shutdown).await;
    }

    /// Points currently queued across all operations.
    pub fn queued_points(&self) -> usize {
        self.num_queued_points.load(Ordering::Acquire)
    }
}
