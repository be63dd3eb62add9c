//! Priority egress queue.
//!
//! N bounded FIFO levels and a single consumer worker that always drains
//! the highest-priority non-empty level first. A Top message is never
//! queued behind Low traffic: higher priority fully preempts lower at
//! dequeue time. Within one level, strict FIFO.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Number of priority levels.
pub const PRIORITY_LEVELS: usize = 4;

/// Egress priority of a queued message. Ordering is significant:
/// `Top > High > Mid > Low` at dequeue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Mid = 1,
    High = 2,
    Top = 3,
}

impl Priority {
    fn index(self) -> usize {
        self as usize
    }
}

/// Priority byte on the wire that maps to no known level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority byte: 0x{0:02x}")]
pub struct UnknownPriority(pub u8);

impl TryFrom<u8> for Priority {
    type Error = UnknownPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Mid),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Top),
            other => Err(UnknownPriority(other)),
        }
    }
}

/// Why a push did not enqueue.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("priority level {0:?} is full")]
    Full(Priority),

    #[error("queue worker is gone")]
    Closed,

    #[error("push cancelled")]
    Cancelled,
}

/// Producer handle: clonable, push-only.
#[derive(Clone)]
pub struct PriorityQueue<T> {
    senders: Vec<mpsc::Sender<T>>,
    notify: Arc<Notify>,
}

/// Consumer half, driven by [`QueueWorker::run`] on a dedicated task.
pub struct QueueWorker<T> {
    receivers: Vec<mpsc::Receiver<T>>,
    notify: Arc<Notify>,
}

impl<T> PriorityQueue<T> {
    /// Build the queue with `capacity` slots per level.
    pub fn new(capacity: usize) -> (Self, QueueWorker<T>) {
        let capacity = capacity.max(1);
        let mut senders = Vec::with_capacity(PRIORITY_LEVELS);
        let mut receivers = Vec::with_capacity(PRIORITY_LEVELS);
        for _ in 0..PRIORITY_LEVELS {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        let notify = Arc::new(Notify::new());
        (
            Self {
                senders,
                notify: notify.clone(),
            },
            QueueWorker { receivers, notify },
        )
    }

    /// Non-blocking push. Fails with [`PushError::Full`] when the level has
    /// no room.
    pub fn push(&self, item: T, prio: Priority) -> Result<(), PushError> {
        match self.senders[prio.index()].try_send(item) {
            Ok(()) => {
                self.notify.notify_one();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full(prio)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Blocking push: waits for room in the level, or for `cancel`.
    pub async fn push_blocking(
        &self,
        item: T,
        prio: Priority,
        cancel: &CancellationToken,
    ) -> Result<(), PushError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.senders[prio.index()].send(item) => {
                sent.map_err(|_| PushError::Closed)?;
                self.notify.notify_one();
                Ok(())
            }
        }
    }
}

impl<T> QueueWorker<T> {
    /// Worker loop: drains the highest-priority non-empty level one item at
    /// a time, invoking `send` for each. Exits promptly on cancellation;
    /// queued items are discarded with the receivers.
    pub async fn run<F, Fut>(mut self, cancel: CancellationToken, mut send: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.try_pop() {
                Some(item) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = send(item) => {}
                    }
                }
                None => {
                    // notify_one leaves a stored permit if a push lands
                    // between try_pop and notified, so no wakeup is lost.
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    fn try_pop(&mut self) -> Option<T> {
        for rx in self.receivers.iter_mut().rev() {
            if let Ok(item) = rx.try_recv() {
                return Some(item);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32) -> futures::future::Ready<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |item| {
            sink.lock().unwrap().push(item);
            futures::future::ready(())
        })
    }

    #[tokio::test]
    async fn drains_strictly_by_priority() {
        let (queue, worker) = PriorityQueue::new(8);
        queue.push(1, Priority::Low).unwrap();
        queue.push(2, Priority::Mid).unwrap();
        queue.push(3, Priority::Top).unwrap();
        queue.push(4, Priority::High).unwrap();

        let cancel = CancellationToken::new();
        let (seen, sink) = collector();
        let handle = tokio::spawn(worker.run(cancel.clone(), sink));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3, 4, 2, 1]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn fifo_within_a_level() {
        let (queue, worker) = PriorityQueue::new(8);
        for item in 0..5u32 {
            queue.push(item, Priority::Mid).unwrap();
        }

        let cancel = CancellationToken::new();
        let (seen, sink) = collector();
        let handle = tokio::spawn(worker.run(cancel.clone(), sink));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn later_high_priority_overtakes_queued_low() {
        let (queue, worker) = PriorityQueue::new(8);
        queue.push(1, Priority::Low).unwrap();
        queue.push(2, Priority::Low).unwrap();
        queue.push(3, Priority::Top).unwrap();

        let cancel = CancellationToken::new();
        let (seen, sink) = collector();
        let handle = tokio::spawn(worker.run(cancel.clone(), sink));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn push_fails_when_level_full() {
        let (queue, _worker) = PriorityQueue::new(2);
        queue.push(1, Priority::Low).unwrap();
        queue.push(2, Priority::Low).unwrap();
        assert!(matches!(
            queue.push(3, Priority::Low),
            Err(PushError::Full(Priority::Low))
        ));
        // other levels are independent
        queue.push(4, Priority::High).unwrap();
    }

    #[tokio::test]
    async fn blocking_push_waits_for_room() {
        let (queue, worker) = PriorityQueue::new(1);
        queue.push(1, Priority::Mid).unwrap();

        let cancel = CancellationToken::new();
        let blocked = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push_blocking(2, Priority::Mid, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let (seen, sink) = collector();
        let handle = tokio::spawn(worker.run(cancel.clone(), sink));
        blocked.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn blocking_push_honours_cancellation() {
        let (queue, _worker) = PriorityQueue::new(1);
        queue.push(1, Priority::Mid).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            queue.push_blocking(2, Priority::Mid, &cancel).await,
            Err(PushError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancelled_worker_discards_backlog() {
        let (queue, worker) = PriorityQueue::new(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        queue.push(1, Priority::Top).unwrap();
        let (seen, sink) = collector();
        worker.run(cancel, sink).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn priority_byte_roundtrip() {
        for prio in [Priority::Low, Priority::Mid, Priority::High, Priority::Top] {
            assert_eq!(Priority::try_from(prio as u8).unwrap(), prio);
        }
        assert_eq!(Priority::try_from(9).unwrap_err(), UnknownPriority(9));
    }
}
