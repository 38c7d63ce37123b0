//! DMA-BUF handle for zero-copy codec buffers.
//!
//! A [`DmaBuf`] owns one shareable descriptor. It is what the driver sees
//! (the descriptor is queued with `V4L2_MEMORY_DMABUF`) and what the CPU
//! sees (a lazily created shared mapping). CPU access must be bracketed with
//! [`read_start`](DmaBuf::read_start)/[`read_end`](DmaBuf::read_end) or
//! [`write_start`](DmaBuf::write_start)/[`write_end`](DmaBuf::write_end) so
//! non-coherent exporters can flush and invalidate caches.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediabufs::memory::{DmaBufAllocator, MemfdAllocator};
//!
//! let mut buf = MemfdAllocator::new().alloc(4096)?;
//! buf.write_at(0, b"bitstream")?;
//! assert_eq!(buf.len(), 9);
//! ```

use crate::error::{Error, Result};
use crate::v4l2::sys;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A DMA-BUF (or DMA-BUF-like) memory handle.
///
/// `size` is the allocated capacity, `len` the number of bytes holding
/// payload. The mapping is created on first CPU access and removed on drop,
/// before the descriptor is closed.
pub struct DmaBuf {
    fd: OwnedFd,
    size: usize,
    len: usize,
    map: Option<NonNull<u8>>,
    coherent: bool,
}

impl DmaBuf {
    /// Wrap an owned descriptor of `size` bytes.
    ///
    /// `coherent` buffers skip the cache sync ioctls (memfd-backed memory
    /// has nothing to sync).
    pub fn from_fd(fd: OwnedFd, size: usize, coherent: bool) -> Self {
        Self {
            fd,
            size,
            len: 0,
            map: None,
            coherent,
        }
    }

    /// Import an externally owned descriptor by duplicating it.
    pub fn import(fd: BorrowedFd<'_>, size: usize) -> Result<Self> {
        let dup = rustix::io::fcntl_dupfd_cloexec(fd, 0)
            .map_err(|e| Error::op(format!("dup of imported fd failed: {}", e)))?;
        Ok(Self::from_fd(dup, size, false))
    }

    /// Borrow the descriptor.
    #[inline]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Raw descriptor value; the identity the driver reports on dequeue.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the descriptor for hand-off to a consumer.
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)
            .map_err(|e| Error::op(format!("dup failed: {}", e)))
    }

    /// Allocated capacity in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer carries no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size);
    }

    /// Whether cache syncs are skipped.
    #[inline]
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Whether the buffer is currently mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Map the whole buffer (once) and return it as a byte slice.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        if self.size == 0 {
            return Ok(&mut []);
        }
        let ptr = match self.map {
            Some(ptr) => ptr,
            None => {
                // SAFETY: mapping a descriptor we own for its full size.
                let raw = unsafe {
                    rustix::mm::mmap(
                        std::ptr::null_mut(),
                        self.size,
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::SHARED,
                        &self.fd,
                        0,
                    )
                }
                .map_err(|e| Error::op(format!("mmap of dmabuf failed: {}", e)))?;
                let ptr = NonNull::new(raw.cast::<u8>())
                    .ok_or_else(|| Error::op("mmap returned null"))?;
                self.map = Some(ptr);
                ptr
            }
        };
        // SAFETY: ptr is valid for `size` bytes while the mapping lives, and
        // `&mut self` gives exclusive access.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) })
    }

    fn sync(&self, flags: u64) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let mut arg = sys::DmaBufSync { flags };
        // SAFETY: DMA_BUF_IOCTL_SYNC takes a dma_buf_sync.
        match unsafe { sys::xioctl(self.raw_fd(), sys::DMA_BUF_IOCTL_SYNC, &mut arg) } {
            Ok(()) => Ok(()),
            // Not a dma-buf exporter: plain shared memory, nothing to sync.
            Err(Errno::NOTTY) => Ok(()),
            Err(e) => Err(Error::op(format!("dmabuf sync {:#x} failed: {}", flags, e))),
        }
    }

    /// Begin a CPU read.
    pub fn read_start(&self) -> Result<()> {
        self.sync(sys::DMA_BUF_SYNC_START | sys::DMA_BUF_SYNC_READ)
    }

    /// End a CPU read.
    pub fn read_end(&self) -> Result<()> {
        self.sync(sys::DMA_BUF_SYNC_END | sys::DMA_BUF_SYNC_READ)
    }

    /// Begin a CPU write.
    pub fn write_start(&self) -> Result<()> {
        self.sync(sys::DMA_BUF_SYNC_START | sys::DMA_BUF_SYNC_WRITE)
    }

    /// End a CPU write.
    pub fn write_end(&self) -> Result<()> {
        self.sync(sys::DMA_BUF_SYNC_END | sys::DMA_BUF_SYNC_WRITE)
    }

    /// Copy `data` in at `offset` inside a write bracket.
    ///
    /// The payload length becomes `offset + data.len()`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                Error::op(format!(
                    "write of {} bytes at {} exceeds buffer of {}",
                    data.len(),
                    offset,
                    self.size
                ))
            })?;
        if data.is_empty() {
            self.len = end;
            return Ok(());
        }

        self.write_start()?;
        let copied = self.map().map(|bytes| bytes[offset..end].copy_from_slice(data));
        let ended = self.write_end();
        copied?;
        ended?;
        self.len = end;
        Ok(())
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        if let Some(ptr) = self.map.take() {
            // SAFETY: unmapping exactly the region created in `map`.
            unsafe {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), self.size);
            }
        }
    }
}

// SAFETY: the descriptor is a plain kernel handle and the mapping is only
// reachable through `&mut self`.
unsafe impl Send for DmaBuf {}

// SAFETY: shared access never touches the mapping.
unsafe impl Sync for DmaBuf {}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.size)
            .field("len", &self.len)
            .field("mapped", &self.map.is_some())
            .field("coherent", &self.coherent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memfd(size: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("test_dmabuf", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size).unwrap();
        fd
    }

    #[test]
    fn test_lazy_map() {
        let mut buf = DmaBuf::from_fd(memfd(4096), 4096, true);
        assert!(!buf.is_mapped());
        assert_eq!(buf.map().unwrap().len(), 4096);
        assert!(buf.is_mapped());
    }

    #[test]
    fn test_write_at_sets_len() {
        let mut buf = DmaBuf::from_fd(memfd(1024), 1024, true);
        buf.write_at(0, b"Hello").unwrap();
        buf.write_at(5, b", DMA-BUF!").unwrap();
        assert_eq!(buf.len(), 15);
        assert_eq!(&buf.map().unwrap()[..15], b"Hello, DMA-BUF!");
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut buf = DmaBuf::from_fd(memfd(16), 16, true);
        assert!(buf.write_at(10, &[0u8; 7]).is_err());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_sync_on_non_dmabuf_is_noop() {
        // Non-coherent wrapper around a memfd: the sync ioctl is rejected with
        // ENOTTY, which is not an error.
        let buf = DmaBuf::from_fd(memfd(64), 64, false);
        buf.read_start().unwrap();
        buf.read_end().unwrap();
    }

    #[test]
    fn test_import_duplicates_fd() {
        let fd = memfd(256);
        let buf = DmaBuf::import(fd.as_fd(), 256).unwrap();
        assert_ne!(buf.raw_fd(), fd.as_raw_fd());
        assert_eq!(buf.size(), 256);

        let dup = buf.dup_fd().unwrap();
        let stat = rustix::fs::fstat(&dup).unwrap();
        assert_eq!(stat.st_size, 256);
    }

    #[test]
    fn test_debug() {
        let buf = DmaBuf::from_fd(memfd(128), 128, true);
        let debug_str = format!("{:?}", buf);
        assert!(debug_str.contains("DmaBuf"));
        assert!(debug_str.contains("size: 128"));
    }
}
