//! In-memory stand-ins for the kernel, used by the unit and integration
//! tests and usable by downstream crates for their own tests. Enabled by
//! the `testing` feature.
//!
//! None of these touch real hardware. Buffers are memfd-backed, requests
//! are eventfds, and completions are driven explicitly by the test.

mod manual_poll;
mod mock_media;
mod mock_video;

pub use manual_poll::ManualPollQueue;
pub use mock_media::MockMediaDevice;
pub use mock_video::{MOCK_CTRL_DECODE_MODE, MOCK_CTRL_SPS, MockVideoDevice};

use crate::error::{Error, Result};
use crate::memory::{DmaBuf, DmaBufAllocator, MemfdAllocator};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memfd allocator that runs out after a fixed number of allocations.
#[derive(Debug)]
pub struct LimitedAllocator {
    inner: MemfdAllocator,
    remaining: AtomicUsize,
}

impl LimitedAllocator {
    /// Allow `n` allocations.
    pub fn new(n: usize) -> Self {
        Self {
            inner: MemfdAllocator::new(),
            remaining: AtomicUsize::new(n),
        }
    }

    /// Allocations still allowed.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

impl DmaBufAllocator for LimitedAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBuf> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| Error::AllocationFailed(format!("allocator exhausted at {} bytes", size)))?;
        self.inner.alloc(size)
    }
}
