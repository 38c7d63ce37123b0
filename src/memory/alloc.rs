//! Allocators producing [`DmaBuf`] handles.

use super::DmaBuf;
use crate::error::{Error, Result};
use crate::v4l2::sys;
use rustix::fd::{AsRawFd, FromRawFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Heaps tried in order by [`DmaHeapAllocator::new`].
pub const DMA_HEAP_CANDIDATES: &[&str] = &[
    "/dev/dma_heap/linux,cma",
    "/dev/dma_heap/reserved",
    "/dev/dma_heap/system",
];

/// Source of shareable buffers.
pub trait DmaBufAllocator: Send + Sync {
    /// Allocate a buffer of at least `size` bytes.
    fn alloc(&self, size: usize) -> Result<DmaBuf>;

    /// Make `buf` hold at least `size` bytes.
    ///
    /// An existing buffer that is already large enough is kept. Otherwise a
    /// new one is allocated and swapped in; on failure `buf` is untouched.
    fn realloc(&self, buf: &mut Option<DmaBuf>, size: usize) -> Result<()> {
        if let Some(existing) = buf {
            if existing.size() >= size {
                return Ok(());
            }
        }
        *buf = Some(self.alloc(size)?);
        Ok(())
    }
}

fn page_round(size: usize) -> usize {
    let page = rustix::param::page_size();
    size.max(1).div_ceil(page) * page
}

/// Allocator backed by a `/dev/dma_heap` node.
#[derive(Debug)]
pub struct DmaHeapAllocator {
    heap: OwnedFd,
    path: PathBuf,
}

impl DmaHeapAllocator {
    /// Open the first available heap from [`DMA_HEAP_CANDIDATES`].
    pub fn new() -> Result<Self> {
        for path in DMA_HEAP_CANDIDATES {
            match Self::open(path) {
                Ok(alloc) => return Ok(alloc),
                Err(e) => tracing::debug!(heap = path, error = %e, "dma heap unavailable"),
            }
        }
        Err(Error::AllocationFailed("no usable dma heap".into()))
    }

    /// Open a specific heap.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let heap = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::AllocationFailed(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(heap = %path.display(), "using dma heap");
        Ok(Self {
            heap,
            path: path.to_path_buf(),
        })
    }

    /// Path of the heap in use.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DmaBufAllocator for DmaHeapAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBuf> {
        let size = page_round(size);
        let mut data = sys::DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        // SAFETY: DMA_HEAP_IOCTL_ALLOC takes a dma_heap_allocation_data.
        unsafe { sys::xioctl(self.heap.as_raw_fd(), sys::DMA_HEAP_IOCTL_ALLOC, &mut data) }
            .map_err(|e| Error::AllocationFailed(format!("dma heap alloc of {}: {}", size, e)))?;
        // SAFETY: the kernel handed us a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as i32) };
        Ok(DmaBuf::from_fd(fd, size, false))
    }
}

/// Coherent allocator backed by anonymous `memfd` files.
///
/// Buffers are ordinary shared memory, so no cache maintenance is needed.
/// Drivers generally refuse to import them; use it for CPU-side pools and
/// for tests.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    allocations: AtomicUsize,
}

impl MemfdAllocator {
    /// Create a new allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers allocated so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl DmaBufAllocator for MemfdAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBuf> {
        let size = page_round(size);
        let fd = rustix::fs::memfd_create("mediabufs", rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::AllocationFailed(format!("memfd_create: {}", e)))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::AllocationFailed(format!("ftruncate to {}: {}", size, e)))?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DmaBuf::from_fd(fd, size, true))
    }
}
