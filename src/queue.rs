//! Mutex-guarded FIFO queues shared between threads
//!
//! Producers that must not drop data wait on a condition variable for space,
//! re-checking a caller-supplied cancel predicate (stop / flush) on every
//! wake-up so that waits never outlive a shutdown or seek.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of a blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The cancel predicate fired while waiting; the item was discarded
    Cancelled,
}

/// Bounded (or unbounded) FIFO with blocking push/pop
pub struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// `None` = unbounded
    capacity: Option<usize>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> SharedQueue<T> {
    /// Create a bounded queue; capacity is clamped to at least one item
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.unwrap_or(16).min(4096))),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push ignoring the capacity bound
    pub fn force_push(&self, item: T) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Push several items under one lock so no other push interleaves
    pub fn push_batch<I: IntoIterator<Item = T>>(&self, batch: I) {
        let mut items = self.items.lock();
        items.extend(batch);
        self.not_empty.notify_all();
    }

    /// Push, waiting for space in slices of `poll` until `cancel` returns true
    pub fn push_wait(&self, item: T, poll: Duration, cancel: impl Fn() -> bool) -> PushOutcome {
        let mut items = self.items.lock();
        while self.is_full_locked(&items) {
            if cancel() {
                return PushOutcome::Cancelled;
            }
            self.not_full.wait_for(&mut items, poll);
        }
        if cancel() {
            return PushOutcome::Cancelled;
        }
        items.push_back(item);
        self.not_empty.notify_one();
        PushOutcome::Pushed
    }

    /// Pop without waiting
    pub fn pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop, waiting up to `timeout` for an item
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.not_empty.wait_for(&mut items, timeout);
        }
        let item = items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop at most `max` items in FIFO order
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        let drained: Vec<T> = items.drain(..n).collect();
        if n > 0 {
            self.not_full.notify_all();
        }
        drained
    }

    /// Pop the front item only if `ready` accepts it
    pub fn pop_if(&self, ready: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut items = self.items.lock();
        if items.front().is_some_and(ready) {
            self.not_full.notify_one();
            items.pop_front()
        } else {
            None
        }
    }

    /// Remove every item, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        self.not_full.notify_all();
        dropped
    }

    /// Keep only items matching `keep`, returning how many were removed
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(keep);
        let removed = before - items.len();
        if removed > 0 {
            self.not_full.notify_all();
        }
        removed
    }

    /// Apply `f` to the newest item
    pub fn with_back<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().back().map(f)
    }

    /// Apply `f` to the oldest item
    pub fn with_front<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Wake every waiter (used on shutdown)
    pub fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_full_locked(&self, items: &VecDeque<T>) -> bool {
        self.capacity.is_some_and(|cap| items.len() >= cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_basic() {
        let queue = SharedQueue::bounded(4);
        queue.force_push(1);
        queue.force_push(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_force_push_ignores_capacity() {
        let queue = SharedQueue::bounded(1);
        queue.force_push(1);
        queue.force_push(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), Some(1));
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Some(1));
    }

    #[test]
    fn test_push_wait_unblocks_on_pop() {
        let queue = Arc::new(SharedQueue::bounded(1));
        queue.force_push(0);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push_wait(1, Duration::from_millis(5), || false))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(producer.join().unwrap(), PushOutcome::Pushed);
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_push_wait_cancelled() {
        let queue = Arc::new(SharedQueue::bounded(1));
        queue.force_push(0);
        let cancel = Arc::new(AtomicBool::new(false));

        let producer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                queue.push_wait(1, Duration::from_millis(5), || cancel.load(Ordering::SeqCst))
            })
        };

        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::SeqCst);
        assert_eq!(producer.join().unwrap(), PushOutcome::Cancelled);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retain_and_drain() {
        let queue = SharedQueue::unbounded();
        queue.push_batch(0..10);
        assert_eq!(queue.retain(|v| v % 2 == 0), 5);
        assert_eq!(queue.drain(3), vec![0, 2, 4]);
        assert_eq!(queue.with_back(|v| *v), Some(8));
        assert_eq!(queue.clear(), 2);
    }

    #[test]
    fn test_pop_if() {
        let queue = SharedQueue::unbounded();
        queue.force_push(10);
        assert_eq!(queue.pop_if(|v| *v < 5), None);
        assert_eq!(queue.pop_if(|v| *v >= 5), Some(10));
    }
}
