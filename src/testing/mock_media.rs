//! In-memory [`MediaDevice`].

use crate::media::MediaDevice;
use rustix::event::{EventfdFlags, eventfd};
use rustix::io::Errno;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct Inner {
    alloc_limit: Mutex<Option<usize>>,
    fail_queue: AtomicBool,
    allocs: AtomicUsize,
    reinits: AtomicUsize,
    queued: Mutex<Vec<RawFd>>,
}

/// Media device whose requests are eventfds.
///
/// Cloning shares the same device, so a test can keep a handle after
/// boxing one into a pool.
#[derive(Clone, Default)]
pub struct MockMediaDevice {
    inner: Arc<Inner>,
}

impl MockMediaDevice {
    /// Create a device that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more request allocations succeed, then fail the rest.
    pub fn fail_alloc_after(&self, n: usize) {
        let done = self.inner.allocs.load(Ordering::SeqCst);
        *self
            .inner
            .alloc_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(done + n);
    }

    /// Make `queue_request` fail.
    pub fn fail_queue(&self, fail: bool) {
        self.inner.fail_queue.store(fail, Ordering::SeqCst);
    }

    /// Requests allocated so far.
    pub fn alloc_count(&self) -> usize {
        self.inner.allocs.load(Ordering::SeqCst)
    }

    /// Successful `queue_request` calls.
    pub fn queued_count(&self) -> usize {
        self.queued_fds().len()
    }

    /// Descriptors of successfully queued requests, in order.
    pub fn queued_fds(&self) -> Vec<RawFd> {
        self.inner
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `reinit_request` calls.
    pub fn reinit_count(&self) -> usize {
        self.inner.reinits.load(Ordering::SeqCst)
    }
}

impl MediaDevice for MockMediaDevice {
    fn alloc_request(&self) -> Result<OwnedFd, Errno> {
        let limit = *self
            .inner
            .alloc_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if limit.is_some_and(|limit| self.inner.allocs.load(Ordering::SeqCst) >= limit) {
            return Err(Errno::NOMEM);
        }
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        self.inner.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(fd)
    }

    fn queue_request(&self, request: BorrowedFd<'_>) -> Result<(), Errno> {
        if self.inner.fail_queue.load(Ordering::SeqCst) {
            return Err(Errno::INVAL);
        }
        self.inner
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.as_raw_fd());
        Ok(())
    }

    fn reinit_request(&self, _request: BorrowedFd<'_>) -> Result<(), Errno> {
        self.inner.reinits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for MockMediaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMediaDevice")
            .field("allocs", &self.alloc_count())
            .field("queued", &self.queued_count())
            .field("reinits", &self.reinit_count())
            .finish()
    }
}
