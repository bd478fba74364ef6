//! Bounded work queue between Fetcher and the worker pool. Backpressure is
//! threshold-based rather than purely capacity-based: the Fetcher watches
//! `remaining_capacity` against `pause_below`/`resume_above` so it stops
//! pulling well before the queue is actually full, and resumes only once
//! there's real headroom again — avoiding the thrash of pausing and
//! resuming every single item.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::message::{OfferOutcome, WorkItem};

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity, not_empty: Notify::new(), not_full: Notify::new() }
    }

    /// Non-blocking enqueue. Rejects rather than blocking the caller so the
    /// Fetcher can react to backpressure instead of stalling mid-poll.
    pub async fn offer(&self, item: T) -> OfferOutcome {
        let mut guard = self.inner.lock().await;
        if guard.len() >= self.capacity {
            return OfferOutcome::RejectedFull;
        }
        guard.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        OfferOutcome::Accepted
    }

    /// Block until an item is available.
    pub async fn take(&self) -> T {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(item) = guard.pop_front() {
                    drop(guard);
                    self.not_full.notify_one();
                    return item;
                }
            }
            self.not_empty.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn remaining_capacity(&self) -> usize {
        self.capacity - self.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Offer a `WorkItem`, retrying once after a short delay if the queue was
/// momentarily full, then dropping it with a logged warning. Returns whether
/// the item was enqueued.
pub async fn offer_or_drop(queue: &BoundedQueue<WorkItem>, item: WorkItem, retry_delay: Duration) -> bool {
    if queue.offer(item.clone()).await == OfferOutcome::Accepted {
        return true;
    }
    tokio::time::sleep(retry_delay).await;
    if queue.offer(item.clone()).await == OfferOutcome::Accepted {
        return true;
    }
    tracing::warn!(file_id = %item.file_id, "queue saturated twice, dropping work item");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_rejects_once_capacity_is_reached() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        assert_eq!(queue.offer(1).await, OfferOutcome::Accepted);
        assert_eq!(queue.offer(2).await, OfferOutcome::Accepted);
        assert_eq!(queue.offer(3).await, OfferOutcome::RejectedFull);
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.remaining_capacity().await, 0);
    }

    #[tokio::test]
    async fn take_returns_items_in_fifo_order() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        queue.offer(1).await;
        queue.offer(2).await;
        assert_eq!(queue.take().await, 1);
        assert_eq!(queue.take().await, 2);
    }

    #[tokio::test]
    async fn take_waits_for_an_offer() {
        let queue = std::sync::Arc::new(BoundedQueue::<u32>::new(1));
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.offer(42).await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(result, 42);
    }
}
