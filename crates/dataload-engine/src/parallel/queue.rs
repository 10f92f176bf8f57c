//! Bounded FIFO queue that can be stopped
//!
//! Once [`StoppableQueue::stop`] is called the queue is empty for good:
//! every pending or later `put`, `offer`, `take`, `poll` or `peek` returns
//! at once with `false` / `None`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::pin;
use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

pub struct StoppableQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> StoppableQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `item`, waiting while the queue is full.
    ///
    /// Returns `false` when the queue is or gets stopped.
    pub async fn put(&self, item: T) -> bool {
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.stopped {
                    return false;
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Append `item` if there is room, without waiting
    pub fn offer(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.stopped || state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Append `item` even when the queue is full; used for shutdown markers
    pub fn force_put(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Remove the head, waiting while the queue is empty.
    ///
    /// Returns `None` when the queue is or gets stopped.
    pub async fn take(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.stopped {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    self.not_full.notify_one();
                    if more {
                        // pass the wakeup on to the next waiting consumer
                        self.not_empty.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Remove the head without waiting
    pub fn poll(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.items.front().cloned()
    }

    /// Drop queued items; the queue stays usable
    pub fn clear(&self) {
        self.state.lock().items.clear();
        self.not_full.notify_waiters();
    }

    /// Clear the queue and reject all further operations
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
            state.items.clear();
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_within_capacity() {
        let queue = StoppableQueue::new(2);
        assert!(queue.put(1).await);
        assert!(queue.offer(2));
        assert!(!queue.offer(3));
        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), None);
    }

    #[tokio::test]
    async fn put_waits_for_room() {
        let queue = Arc::new(StoppableQueue::new(1));
        assert!(queue.put(1).await);

        let producer = Arc::clone(&queue);
        let pending = tokio::spawn(async move { producer.put(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(queue.take().await, Some(1));
        assert!(pending.await.expect("put finished"));
        assert_eq!(queue.take().await, Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_releases_pending_take() {
        let queue: Arc<StoppableQueue<u32>> = Arc::new(StoppableQueue::new(4));
        let consumer = Arc::clone(&queue);
        let pending = tokio::spawn(async move { consumer.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.stop();
        let taken = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("take returned promptly")
            .expect("task finished");
        assert_eq!(taken, None);
    }

    #[tokio::test]
    async fn stopped_queue_rejects_everything() {
        let queue = StoppableQueue::new(4);
        assert!(queue.put(1).await);
        queue.stop();

        assert!(queue.is_stopped());
        assert!(queue.is_empty());
        assert!(!queue.put(2).await);
        assert!(!queue.offer(3));
        assert!(!queue.force_put(4));
        assert_eq!(queue.take().await, None);
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.peek(), None);
    }

    #[tokio::test]
    async fn stop_releases_pending_put() {
        let queue = Arc::new(StoppableQueue::new(1));
        assert!(queue.put(1).await);
        let producer = Arc::clone(&queue);
        let pending = tokio::spawn(async move { producer.put(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.stop();
        assert!(!pending.await.expect("put finished"));
    }

    #[test]
    fn force_put_ignores_capacity() {
        let queue = StoppableQueue::new(1);
        assert!(queue.offer(1));
        assert!(queue.force_put(2));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_stopped());
    }
}
