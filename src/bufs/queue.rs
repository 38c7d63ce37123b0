//! Free / in-use buffer queue.
//!
//! One queue exists per direction. The free list is FIFO and gates blocking
//! acquisition; the in-use list holds entries queued in the driver, in
//! submission order, and is searched by descriptor when the driver hands a
//! buffer back. Completion is usually in order, so the search starts at the
//! front, but any position is accepted.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// An entry that can live in a [`BufQueue`].
pub trait QueueEntry: Send {
    /// Descriptor of the first plane; the identity matched on dequeue.
    fn primary_fd(&self) -> Option<RawFd>;

    /// Reset per-use state before the entry goes on the free list.
    fn on_put_free(&mut self);

    /// Mark the entry as waiting for the driver.
    fn on_put_inuse(&mut self);
}

struct Lists<E> {
    free: VecDeque<E>,
    inuse: VecDeque<E>,
}

/// Free and in-use lists for one buffer direction.
pub struct BufQueue<E> {
    lists: Mutex<Lists<E>>,
    /// Signalled on every `put_free`.
    free_cond: Condvar,
}

impl<E: QueueEntry> BufQueue<E> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Lists {
                free: VecDeque::new(),
                inuse: VecDeque::new(),
            }),
            free_cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lists<E>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry to the free list and wake one waiter.
    pub fn put_free(&self, mut entry: E) {
        entry.on_put_free();
        self.lock().free.push_back(entry);
        self.free_cond.notify_one();
    }

    /// Take the oldest free entry, blocking until one exists.
    pub fn get_free(&self) -> E {
        let mut lists = self.lock();
        loop {
            if let Some(entry) = lists.free.pop_front() {
                return entry;
            }
            lists = self
                .free_cond
                .wait(lists)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the oldest free entry, waiting at most `timeout`.
    pub fn get_free_timeout(&self, timeout: Duration) -> Option<E> {
        let deadline = Instant::now() + timeout;
        let mut lists = self.lock();
        loop {
            if let Some(entry) = lists.free.pop_front() {
                return Some(entry);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            lists = self
                .free_cond
                .wait_timeout(lists, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take the oldest free entry without blocking.
    pub fn try_get_free(&self) -> Option<E> {
        self.lock().free.pop_front()
    }

    /// Append an entry to the in-use list.
    pub fn put_inuse(&self, mut entry: E) {
        entry.on_put_inuse();
        self.lock().inuse.push_back(entry);
    }

    /// Remove and return the first in-use entry whose primary descriptor is `fd`.
    pub fn extract_inuse(&self, fd: RawFd) -> Option<E> {
        let mut lists = self.lock();
        let pos = lists
            .inuse
            .iter()
            .position(|e| e.primary_fd() == Some(fd))?;
        lists.inuse.remove(pos)
    }

    /// Whether any entry is queued in the driver.
    pub fn is_inuse(&self) -> bool {
        !self.lock().inuse.is_empty()
    }

    /// Entries on the free list.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Entries on the in-use list.
    pub fn inuse_count(&self) -> usize {
        self.lock().inuse.len()
    }

    /// Remove every free entry.
    pub fn drain_free(&self) -> Vec<E> {
        self.lock().free.drain(..).collect()
    }

    /// Remove every in-use entry.
    pub fn drain_inuse(&self) -> Vec<E> {
        self.lock().inuse.drain(..).collect()
    }
}

impl<E: QueueEntry> Default for BufQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for BufQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("BufQueue")
            .field("free", &lists.free.len())
            .field("inuse", &lists.inuse.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Entry {
        id: u32,
        fd: RawFd,
        waiting: bool,
        resets: u32,
    }

    impl Entry {
        fn new(id: u32, fd: RawFd) -> Self {
            Self {
                id,
                fd,
                waiting: false,
                resets: 0,
            }
        }
    }

    impl QueueEntry for Entry {
        fn primary_fd(&self) -> Option<RawFd> {
            Some(self.fd)
        }

        fn on_put_free(&mut self) {
            self.waiting = false;
            self.resets += 1;
        }

        fn on_put_inuse(&mut self) {
            self.waiting = true;
        }
    }

    #[test]
    fn test_free_list_is_fifo() {
        let q = BufQueue::new();
        q.put_free(Entry::new(1, 10));
        q.put_free(Entry::new(2, 11));
        assert_eq!(q.free_count(), 2);
        assert_eq!(q.try_get_free().unwrap().id, 1);
        assert_eq!(q.get_free().id, 2);
        assert!(q.try_get_free().is_none());
    }

    #[test]
    fn test_extract_out_of_order() {
        let q = BufQueue::new();
        for i in 0..4 {
            q.put_inuse(Entry::new(i, 20 + i as RawFd));
        }
        assert!(q.is_inuse());

        let e = q.extract_inuse(22).unwrap();
        assert_eq!(e.id, 2);
        assert!(e.waiting);
        assert!(q.extract_inuse(22).is_none());
        assert_eq!(q.inuse_count(), 3);

        for fd in [20, 21, 23] {
            assert!(q.extract_inuse(fd).is_some());
        }
        assert!(!q.is_inuse());
    }

    #[test]
    fn test_put_free_resets_entry() {
        let q = BufQueue::new();
        q.put_inuse(Entry::new(7, 5));
        let e = q.extract_inuse(5).unwrap();
        q.put_free(e);
        let e = q.try_get_free().unwrap();
        assert!(!e.waiting);
        assert_eq!(e.resets, 1);
    }

    #[test]
    fn test_get_free_blocks_until_put() {
        let q = Arc::new(BufQueue::<Entry>::new());
        let q2 = Arc::clone(&q);
        let waiter = std::thread::spawn(move || q2.get_free().id);

        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        q.put_free(Entry::new(42, 1));
        assert_eq!(waiter.join().unwrap(), 42);
    }

    #[test]
    fn test_get_free_timeout() {
        let q: BufQueue<Entry> = BufQueue::new();
        assert!(q.get_free_timeout(Duration::from_millis(10)).is_none());
        q.put_free(Entry::new(1, 1));
        assert!(q.get_free_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_drain() {
        let q = BufQueue::new();
        q.put_free(Entry::new(1, 1));
        q.put_inuse(Entry::new(2, 2));
        assert_eq!(q.drain_free().len(), 1);
        assert_eq!(q.drain_inuse().len(), 1);
        assert_eq!(q.free_count() + q.inuse_count(), 0);
    }
}
