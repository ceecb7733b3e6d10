//! Concurrency-safe hand-off structures.
//!
//! Two small primitives connect the event loop to the worker pool:
//! - [`BlockingQueue`]: a FIFO that rejects duplicates and blocks on `take`.
//!   Used for the scheduler's pending-task and idle-worker queues, where a
//!   duplicate entry would let one worker run two tasks at once.
//! - [`PendingSet`]: a multiset with bulk insert and atomic predicate-based
//!   bulk extraction. Used for acknowledgment tokens awaiting delivery.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A blocking FIFO queue with set-like uniqueness.
///
/// Equality is caller-defined through `PartialEq`.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T: PartialEq> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append an item if no equal item is already queued.
    ///
    /// Returns `true` on success; a successful add wakes one blocked `take`.
    pub fn add(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.contains(&item) {
            return false;
        }
        items.push_back(item);
        self.available.notify_one();
        true
    }

    /// Remove and return the head, blocking until one exists.
    pub fn take(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            match items.pop_front() {
                Some(item) => return item,
                None => items = self.available.wait(items).unwrap(),
            }
        }
    }

    /// Remove and return the head without blocking.
    pub fn poll(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PartialEq> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An insertion-ordered multiset with atomic bulk extraction.
///
/// `extract_all_matching` removes every matching element under one lock
/// acquisition, so an element fully inserted before the call began can never
/// be missed, and no element can be returned by two extractions.
pub struct PendingSet<T> {
    items: Mutex<Vec<T>>,
}

impl<T> PendingSet<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Append a batch. Duplicates are allowed.
    pub fn add_all(&self, batch: Vec<T>) {
        self.items.lock().unwrap().extend(batch);
    }

    /// Atomically remove and return every element satisfying `predicate`,
    /// preserving insertion order on both sides of the split.
    ///
    /// Single linear pass: the event loop calls this on every writable
    /// event, so the critical section must not go quadratic in set size.
    pub fn extract_all_matching<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut items = self.items.lock().unwrap();
        let mut kept = Vec::with_capacity(items.len());
        let mut extracted = Vec::new();
        for item in items.drain(..) {
            if predicate(&item) {
                extracted.push(item);
            } else {
                kept.push(item);
            }
        }
        *items = kept;
        extracted
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_blocking_queue_rejects_duplicates() {
        let queue = BlockingQueue::new();

        assert!(queue.add(7));
        assert!(!queue.add(7));
        assert_eq!(queue.len(), 1);

        assert!(queue.add(8));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_blocking_queue_fifo_order() {
        let queue = BlockingQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(3);

        assert_eq!(queue.take(), 1);
        assert_eq!(queue.take(), 2);
        assert_eq!(queue.take(), 3);
    }

    #[test]
    fn test_blocking_queue_poll_does_not_block() {
        let queue: BlockingQueue<u32> = BlockingQueue::new();
        assert_eq!(queue.poll(), None);

        queue.add(5);
        assert_eq!(queue.poll(), Some(5));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_take_blocks_until_add() {
        let queue = Arc::new(BlockingQueue::new());
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };

        // Give the taker time to block on the empty queue
        thread::sleep(Duration::from_millis(50));
        assert!(queue.add(42));

        assert_eq!(taker.join().unwrap(), 42);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pending_set_extracts_matching_in_order() {
        let set = PendingSet::new();
        set.add_all(vec![("a", 1), ("b", 2), ("a", 3), ("c", 4), ("a", 5)]);

        let extracted = set.extract_all_matching(|(k, _)| *k == "a");
        assert_eq!(extracted, vec![("a", 1), ("a", 3), ("a", 5)]);
        assert_eq!(set.len(), 2);

        // A second extraction never returns the same elements again
        let again = set.extract_all_matching(|(k, _)| *k == "a");
        assert!(again.is_empty());

        // Unmatched elements keep their insertion order too
        let rest = set.extract_all_matching(|_| true);
        assert_eq!(rest, vec![("b", 2), ("c", 4)]);
    }

    #[test]
    fn test_pending_set_allows_duplicates() {
        let set = PendingSet::new();
        set.add_all(vec![9, 9, 9]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.extract_all_matching(|n| *n == 9), vec![9, 9, 9]);
    }

    #[test]
    fn test_pending_set_concurrent_insert_and_extract() {
        let set = Arc::new(PendingSet::new());
        set.add_all(vec![0u64; 100]);

        let writer = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for _ in 0..100 {
                    set.add_all(vec![1u64; 10]);
                }
            })
        };

        // Elements inserted before the extraction began must all be seen
        let zeros = set.extract_all_matching(|n| *n == 0);
        assert_eq!(zeros.len(), 100);

        writer.join().unwrap();
        let ones = set.extract_all_matching(|n| *n == 1);
        assert_eq!(ones.len(), 1000);
        assert!(set.is_empty());
    }
}
