//! Fixed pool of media requests.
//!
//! Every request is in exactly one of three places: on the free list, held
//! by a caller (a [`MediaRequest`] not yet submitted), or in flight in the
//! driver. A held request goes back to the free list when it is aborted or
//! dropped; an in-flight request goes back when its poll task reports
//! completion or times out. Both paths reinitialise the kernel object first.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediabufs::media::MediaPool;
//!
//! let pool = MediaPool::new(&MediaConfig::default(), &poll_queue)?;
//!
//! // Blocks while all requests are in flight
//! let req = pool.acquire();
//! ctl.set_ext_ctrls(Some(&req), &mut controls)?;
//! ctl.start_request(req, src, Some(&dst), true)?;
//! ```

use super::{MediaDevice, MediaNode};
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::poll::{PollFlags, PollQueue, PollTask};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total requests owned by the pool.
    pub capacity: usize,
    /// Requests on the free list.
    pub available: usize,
    /// Requests acquired but not yet submitted.
    pub held: usize,
    /// Requests queued in the driver and not yet reclaimed.
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Held,
    InFlight,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

struct PoolInner {
    /// Dropped before `requests` so no callback can see a closed fd.
    tasks: OnceLock<Vec<PollTask>>,
    requests: Vec<OwnedFd>,
    device: Box<dyn MediaDevice>,
    state: Mutex<PoolState>,
    available: Condvar,
    timeout: Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_free(&self, st: &mut PoolState) -> Option<usize> {
        let index = st.free.pop()?;
        st.slots[index] = Slot::Held;
        Some(index)
    }

    /// Reinitialise a request and put it back on the free list.
    fn reclaim(&self, index: usize) {
        if let Err(e) = self.device.reinit_request(self.requests[index].as_fd()) {
            tracing::warn!(request = index, "failed to reinit request: {}", e);
        }
        {
            let mut st = self.lock();
            debug_assert_ne!(st.slots[index], Slot::Free);
            st.slots[index] = Slot::Free;
            st.free.push(index);
        }
        self.available.notify_one();
    }

    fn complete(&self, index: usize, flags: PollFlags) {
        if self.lock().slots[index] != Slot::InFlight {
            tracing::debug!(request = index, "completion for request not in flight");
            return;
        }
        if flags.is_empty() {
            tracing::warn!(request = index, "request timed out, reclaiming");
        }
        self.reclaim(index);
    }

    /// Arms before queueing: once the kernel owns the request only its
    /// completion may reclaim it. A stale arm left by a failed queue fires
    /// for a slot that is no longer in flight and is ignored.
    fn submit(self: &Arc<Self>, index: usize) -> Result<()> {
        self.lock().slots[index] = Slot::InFlight;

        let task = self.tasks.get().and_then(|tasks| tasks.get(index));
        let armed = match task {
            Some(task) => task.arm(self.timeout),
            None => Err(Error::op("request poll task missing")),
        };
        if let Err(e) = armed {
            tracing::error!(request = index, "failed to arm request poll: {}", e);
            self.reclaim(index);
            return Err(e);
        }

        if let Err(e) = self.device.queue_request(self.requests[index].as_fd()) {
            tracing::error!(request = index, "failed to queue request: {}", e);
            self.reclaim(index);
            return Err(Error::op(format!("request queue failed: {}", e)));
        }
        Ok(())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let in_flight = st.slots.iter().filter(|&&s| s == Slot::InFlight).count();
        if in_flight > 0 {
            tracing::warn!(in_flight, "media pool dropped with requests in flight");
        }
        tracing::debug!(requests = self.requests.len(), "media pool closed");
    }
}

/// A fixed set of media requests with blocking acquisition.
#[derive(Clone)]
pub struct MediaPool {
    inner: Arc<PoolInner>,
}

impl MediaPool {
    /// Open the media node named by `config` and allocate
    /// `config.request_count` requests.
    pub fn new(config: &MediaConfig, poll: &Arc<dyn PollQueue>) -> Result<Self> {
        let node = MediaNode::open(&config.media_path).map_err(|e| {
            tracing::error!(path = %config.media_path.display(), "failed to open media device: {}", e);
            Error::op(format!("open {}: {}", config.media_path.display(), e))
        })?;
        Self::with_device(Box::new(node), poll, config.request_count, config.poll_timeout)
    }

    /// Allocate `count` requests from `device`.
    ///
    /// Either every request is allocated and bound to a poll task, or
    /// nothing is kept and an error is returned.
    pub fn with_device(
        device: Box<dyn MediaDevice>,
        poll: &Arc<dyn PollQueue>,
        count: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::op("media pool needs at least one request"));
        }

        let mut requests = Vec::with_capacity(count);
        for i in 0..count {
            let fd = device.alloc_request().map_err(|e| {
                tracing::error!(request = i, "failed to alloc request: {}", e);
                Error::op(format!("request alloc failed: {}", e))
            })?;
            requests.push(fd);
        }

        let inner = Arc::new(PoolInner {
            tasks: OnceLock::new(),
            requests,
            device,
            state: Mutex::new(PoolState {
                slots: vec![Slot::Free; count],
                // Popped from the back, so request 0 goes out first.
                free: (0..count).rev().collect(),
            }),
            available: Condvar::new(),
            timeout,
        });

        let mut tasks = Vec::with_capacity(count);
        for index in 0..count {
            let weak: Weak<PoolInner> = Arc::downgrade(&inner);
            let task = PollTask::new(
                poll,
                inner.requests[index].as_fd(),
                PollFlags::PRI,
                Box::new(move |flags| {
                    if let Some(pool) = weak.upgrade() {
                        pool.complete(index, flags);
                    }
                }),
            )?;
            tasks.push(task);
        }
        let _ = inner.tasks.set(tasks);

        tracing::debug!(count, "media pool created");
        Ok(Self { inner })
    }

    /// Take a request, blocking until one is free.
    ///
    /// The wait is bounded in practice: every in-flight request is
    /// reclaimed on completion or when its poll timeout expires.
    pub fn acquire(&self) -> MediaRequest {
        let mut st = self.inner.lock();
        loop {
            if let Some(index) = self.inner.take_free(&mut st) {
                return self.request(index);
            }
            st = self
                .inner
                .available
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take a request if one is free.
    pub fn try_acquire(&self) -> Option<MediaRequest> {
        let mut st = self.inner.lock();
        let index = self.inner.take_free(&mut st)?;
        Some(self.request(index))
    }

    /// Take a request, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<MediaRequest> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.lock();
        loop {
            if let Some(index) = self.inner.take_free(&mut st) {
                return Some(self.request(index));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            st = self
                .inner
                .available
                .wait_timeout(st, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock();
        let mut stats = PoolStats {
            capacity: st.slots.len(),
            ..Default::default()
        };
        for slot in &st.slots {
            match slot {
                Slot::Free => stats.available += 1,
                Slot::Held => stats.held += 1,
                Slot::InFlight => stats.in_flight += 1,
            }
        }
        stats
    }

    /// Total number of requests.
    pub fn capacity(&self) -> usize {
        self.inner.requests.len()
    }

    fn request(&self, index: usize) -> MediaRequest {
        MediaRequest {
            pool: Arc::clone(&self.inner),
            index: Some(index),
        }
    }
}

impl std::fmt::Debug for MediaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPool").field("stats", &self.stats()).finish()
    }
}

/// A request taken from a [`MediaPool`].
///
/// Consumed by [`submit`](Self::submit) or [`abort`](Self::abort). Dropping
/// it unsubmitted aborts it.
pub struct MediaRequest {
    pool: Arc<PoolInner>,
    /// `None` once ownership has passed back to the pool.
    index: Option<usize>,
}

impl MediaRequest {
    fn slot(&self) -> usize {
        // Only `submit`/`abort`/drop clear the index, and they consume self.
        self.index.unwrap_or_default()
    }

    /// The request descriptor, for scoping controls and buffers to it.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.pool.requests[self.slot()].as_fd()
    }

    /// Raw request descriptor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd().as_raw_fd()
    }

    /// Queue the request in the driver and arm its completion poll.
    ///
    /// On failure the request is reclaimed by the pool.
    pub fn submit(mut self) -> Result<()> {
        match self.index.take() {
            Some(index) => self.pool.submit(index),
            None => Err(Error::op("request already released")),
        }
    }

    /// Return the request to the pool without submitting it.
    pub fn abort(mut self) {
        if let Some(index) = self.index.take() {
            self.pool.reclaim(index);
        }
    }
}

impl Drop for MediaRequest {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            tracing::debug!(request = index, "unsubmitted request dropped, aborting");
            self.pool.reclaim(index);
        }
    }
}

impl std::fmt::Debug for MediaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRequest")
            .field("index", &self.index)
            .field("fd", &self.raw_fd())
            .finish()
    }
}
