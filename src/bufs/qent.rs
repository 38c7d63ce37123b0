//! Source and destination buffer entries.

use super::ctl::CtlInner;
use super::queue::QueueEntry;
use crate::error::{Error, Result};
use crate::memory::{DmaBuf, DmaBufAllocator, round_up_size};
use crate::v4l2::{Format, QueuePlane};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Kernel index of an entry that has no slot.
pub(crate) const INDEX_UNSET: u32 = u32::MAX;

/// Lifecycle status of a buffer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QentStatus {
    /// Never submitted.
    New,
    /// Claimed by a submission that has not reached the driver.
    Pending,
    /// Queued in the driver.
    Waiting,
    /// Completed successfully.
    Done,
    /// Completed with the driver's error flag set.
    Error,
    /// Detached entry holding externally owned memory.
    Import,
}

/// State shared by both entry kinds.
#[derive(Debug)]
pub(crate) struct QentBase {
    pub status: QentStatus,
    pub index: u32,
    pub planes: Vec<DmaBuf>,
    pub timestamp: Duration,
}

impl Default for QentBase {
    fn default() -> Self {
        Self::new(INDEX_UNSET)
    }
}

impl QentBase {
    pub fn new(index: u32) -> Self {
        Self {
            status: QentStatus::New,
            index,
            planes: Vec::new(),
            timestamp: Duration::ZERO,
        }
    }

    pub fn primary_fd(&self) -> Option<RawFd> {
        self.planes.first().map(DmaBuf::raw_fd)
    }

    pub fn reset_for_free(&mut self) {
        self.timestamp = Duration::ZERO;
        for plane in &mut self.planes {
            plane.set_len(0);
        }
    }

    /// Planes as handed to `VIDIOC_QBUF`.
    pub fn queue_planes(&self) -> Vec<QueuePlane> {
        self.planes
            .iter()
            .map(|p| QueuePlane {
                fd: p.raw_fd(),
                length: p.size() as u32,
                bytesused: p.len() as u32,
            })
            .collect()
    }

    /// Give every plane of `fmt` backing memory of at least `sizeimage`.
    ///
    /// Existing planes that are large enough are kept. On failure the entry
    /// is left with no planes at all.
    pub fn alloc_from_fmt(&mut self, fmt: &Format, allocator: &dyn DmaBufAllocator) -> Result<()> {
        if fmt.planes.is_empty() {
            return Err(Error::AllocationFailed("format has no planes".into()));
        }
        let mut old = std::mem::take(&mut self.planes).into_iter();
        let mut planes = Vec::with_capacity(fmt.planes.len());
        for (i, pf) in fmt.planes.iter().enumerate() {
            let mut slot = old.next();
            allocator.realloc(&mut slot, pf.sizeimage as usize).map_err(|e| {
                tracing::error!(plane = i, size = pf.sizeimage, "plane allocation failed: {}", e);
                Error::AllocationFailed(format!("plane {} of {} bytes", i, pf.sizeimage))
            })?;
            planes.extend(slot);
        }
        self.planes = planes;
        Ok(())
    }

    /// Make plane 0 hold at least `len` bytes, growing to the next size
    /// class. Without an allocator the plane may not grow.
    fn grow(&mut self, len: usize, allocator: Option<&dyn DmaBufAllocator>) -> Result<()> {
        let current = self.planes.first().map(DmaBuf::size);
        if current.is_some_and(|size| len <= size) {
            return Ok(());
        }
        let newsize = round_up_size(len);
        tracing::debug!(
            len,
            current = current.unwrap_or(0),
            newsize,
            "source buffer overrun, reallocating"
        );
        let Some(allocator) = allocator else {
            return Err(Error::AllocationFailed(format!(
                "buffer of {} bytes may not grow to {}",
                current.unwrap_or(0),
                len
            )));
        };

        let mut slot = if self.planes.is_empty() {
            None
        } else {
            Some(self.planes.remove(0))
        };
        let grown = allocator.realloc(&mut slot, newsize);
        if let Some(buf) = slot {
            self.planes.insert(0, buf);
        }
        grown.map_err(|e| {
            tracing::warn!(newsize, "source realloc failed: {}", e);
            Error::AllocationFailed(format!("realloc to {} bytes", newsize))
        })
    }
}

// ============================================================================
// Source entries
// ============================================================================

/// Queue-resident state of a source entry.
#[derive(Debug, Default)]
pub(crate) struct SrcEntry {
    pub base: QentBase,
    pub fixed_size: bool,
}

impl SrcEntry {
    pub fn new(index: u32, fixed_size: bool) -> Self {
        Self {
            base: QentBase::new(index),
            fixed_size,
        }
    }

    fn is_detached(&self) -> bool {
        self.base.index == INDEX_UNSET
    }
}

impl QueueEntry for SrcEntry {
    fn primary_fd(&self) -> Option<RawFd> {
        self.base.primary_fd()
    }

    fn on_put_free(&mut self) {
        self.base.reset_for_free();
    }

    fn on_put_inuse(&mut self) {
        self.base.status = QentStatus::Waiting;
    }
}

/// A source (bitstream) buffer taken from a controller.
///
/// Fill it with [`copy_in`](Self::copy_in), stamp it with
/// [`params_set`](Self::params_set) and hand it to
/// [`MediaBufsCtl::start_request`](super::MediaBufsCtl::start_request).
/// Dropping it unsubmitted returns it to the controller's free list.
pub struct QentSrc {
    entry: SrcEntry,
    ctl: Weak<CtlInner>,
}

impl QentSrc {
    pub(crate) fn new(entry: SrcEntry, ctl: Weak<CtlInner>) -> Self {
        Self { entry, ctl }
    }

    pub(crate) fn belongs_to(&self, ctl: &Weak<CtlInner>) -> bool {
        Weak::ptr_eq(&self.ctl, ctl)
    }

    pub(crate) fn into_entry(mut self) -> SrcEntry {
        std::mem::take(&mut self.entry)
    }

    /// Set the timestamp carried to the matching destination buffer.
    pub fn params_set(&mut self, timestamp: Duration) {
        self.entry.base.timestamp = timestamp;
    }

    /// Timestamp set by [`params_set`](Self::params_set).
    pub fn timestamp(&self) -> Duration {
        self.entry.base.timestamp
    }

    /// Ensure the buffer can hold `len` bytes.
    pub fn alloc(&mut self, len: usize, allocator: &dyn DmaBufAllocator) -> Result<()> {
        self.entry.base.grow(len, Some(allocator))
    }

    /// Copy `data` in at `offset`; the payload becomes `offset + data.len()`.
    ///
    /// Growing discards the old contents, so the buffer only grows for a
    /// write at offset 0 into a resizable entry.
    pub fn copy_in(&mut self, offset: usize, data: &[u8], allocator: &dyn DmaBufAllocator) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or_else(|| {
            Error::AllocationFailed(format!("copy of {} bytes at offset {} overflows", data.len(), offset))
        })?;
        let allocator = if self.entry.fixed_size || offset != 0 {
            None
        } else {
            Some(allocator)
        };
        self.entry.base.grow(end, allocator)?;
        match self.entry.base.planes.first_mut() {
            Some(plane) => plane.write_at(offset, data),
            None => Err(Error::AllocationFailed("source has no memory".into())),
        }
    }

    /// Allocated size of the buffer.
    pub fn plane_size(&self) -> usize {
        self.entry.base.planes.first().map_or(0, DmaBuf::size)
    }

    /// Bytes of payload.
    pub fn len(&self) -> usize {
        self.entry.base.planes.first().map_or(0, DmaBuf::len)
    }

    /// Whether the buffer holds no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kernel buffer index.
    pub fn index(&self) -> u32 {
        self.entry.base.index
    }

    /// Whether the driver needs buffers of exactly the negotiated size.
    pub fn is_fixed_size(&self) -> bool {
        self.entry.fixed_size
    }

    /// Current status.
    pub fn status(&self) -> QentStatus {
        self.entry.base.status
    }
}

impl Drop for QentSrc {
    fn drop(&mut self) {
        if self.entry.is_detached() {
            return;
        }
        let entry = std::mem::take(&mut self.entry);
        if let Some(ctl) = self.ctl.upgrade() {
            ctl.src.put_free(entry);
        }
    }
}

impl std::fmt::Debug for QentSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QentSrc")
            .field("index", &self.entry.base.index)
            .field("status", &self.entry.base.status)
            .field("len", &self.len())
            .field("size", &self.plane_size())
            .finish()
    }
}

// ============================================================================
// Destination entries
// ============================================================================

#[derive(Debug)]
pub(crate) struct DstState {
    pub base: QentBase,
    /// A consumer may block in `wait` until this clears.
    pub waiting: bool,
    /// Held by the driver's capture queue.
    pub queued: bool,
    /// Its request never reached the driver; the result is discarded.
    pub orphaned: bool,
    /// The consumer let go while it was queued; recycle on dequeue.
    pub release_on_dequeue: bool,
}

/// Shared state of a destination entry.
///
/// The controller's queues hold it directly; consumers hold it through a
/// [`QentDst`].
#[derive(Debug)]
pub(crate) struct DstShared {
    state: Mutex<DstState>,
    cond: Condvar,
    /// Plane 0 descriptor, readable without the lock. -1 when unpopulated.
    fd: AtomicI32,
    ctl: Weak<CtlInner>,
}

impl DstShared {
    pub fn new(index: u32, status: QentStatus, ctl: Weak<CtlInner>) -> Arc<Self> {
        let mut base = QentBase::new(index);
        base.status = status;
        Arc::new(Self {
            state: Mutex::new(DstState {
                base,
                waiting: false,
                queued: false,
                orphaned: false,
                release_on_dequeue: false,
            }),
            cond: Condvar::new(),
            fd: AtomicI32::new(-1),
            ctl,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, DstState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the cached identity after the planes changed.
    pub fn sync_fd(&self, st: &DstState) {
        self.fd
            .store(st.base.primary_fd().unwrap_or(-1), Ordering::Release);
    }

    /// Clear the waiting flag and wake every waiter.
    pub fn release(&self, st: &mut DstState) {
        st.waiting = false;
        self.cond.notify_all();
    }

    pub fn belongs_to(&self, ctl: &Weak<CtlInner>) -> bool {
        Weak::ptr_eq(&self.ctl, ctl)
    }
}

impl QueueEntry for Arc<DstShared> {
    fn primary_fd(&self) -> Option<RawFd> {
        let fd = self.fd.load(Ordering::Acquire);
        (fd >= 0).then_some(fd)
    }

    fn on_put_free(&mut self) {
        let mut st = self.lock();
        st.base.reset_for_free();
        st.release_on_dequeue = false;
        st.orphaned = false;
    }

    fn on_put_inuse(&mut self) {
        self.lock().base.status = QentStatus::Waiting;
    }
}

/// A destination (frame) buffer.
///
/// Obtained from [`MediaBufsCtl::dst_qent_alloc`](super::MediaBufsCtl::dst_qent_alloc)
/// or created detached with [`new_import`](Self::new_import). Dropping it
/// (or calling [`free`](Self::free)) returns it to its controller if the
/// controller still exists, and otherwise releases its memory. A buffer
/// dropped while the driver still holds it is recycled once the driver
/// returns it.
pub struct QentDst {
    inner: Arc<DstShared>,
}

impl QentDst {
    pub(crate) fn from_shared(inner: Arc<DstShared>) -> Self {
        Self { inner }
    }

    pub(crate) fn shared(&self) -> &Arc<DstShared> {
        &self.inner
    }

    /// A detached entry for externally owned memory; populate it with
    /// [`import_plane`](Self::import_plane).
    pub fn new_import() -> Self {
        Self::from_shared(DstShared::new(INDEX_UNSET, QentStatus::Import, Weak::new()))
    }

    fn outcome(st: &DstState) -> Result<()> {
        match st.base.status {
            QentStatus::Done => Ok(()),
            QentStatus::Error => Err(Error::DecodingError),
            status => Err(Error::op(format!("no result for buffer ({:?})", status))),
        }
    }

    /// Block until the buffer's submission completes.
    ///
    /// Returns `Ok` if the driver produced a frame, [`Error::DecodingError`]
    /// if it flagged the frame bad, and [`Error::OperationFailed`] if the
    /// submission never produced a result.
    pub fn wait(&self) -> Result<()> {
        let mut st = self.inner.lock();
        while st.waiting {
            st = self
                .inner
                .cond
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::outcome(&st)
    }

    /// [`wait`](Self::wait) with an upper bound.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.lock();
        while st.waiting {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::op("timed out waiting for buffer"));
            }
            st = self
                .inner
                .cond
                .wait_timeout(st, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Self::outcome(&st)
    }

    /// Whether a submission is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.inner.lock().waiting
    }

    /// Current status.
    pub fn status(&self) -> QentStatus {
        self.inner.lock().base.status
    }

    /// Timestamp returned by the driver.
    pub fn timestamp(&self) -> Duration {
        self.inner.lock().base.timestamp
    }

    /// Kernel buffer index; `None` for imported entries.
    pub fn index(&self) -> Option<u32> {
        let index = self.inner.lock().base.index;
        (index != INDEX_UNSET).then_some(index)
    }

    /// Begin a CPU read of every plane.
    ///
    /// If any plane fails, the planes already started are ended again.
    pub fn read_start(&self) -> Result<()> {
        let st = self.inner.lock();
        for (i, plane) in st.base.planes.iter().enumerate() {
            if let Err(e) = plane.read_start() {
                for started in &st.base.planes[..i] {
                    let _ = started.read_end();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// End a CPU read of every plane, attempting all of them.
    pub fn read_stop(&self) -> Result<()> {
        let st = self.inner.lock();
        let mut status = Ok(());
        for plane in &st.base.planes {
            if let Err(e) = plane.read_end() {
                status = Err(e);
            }
        }
        status
    }

    /// Run `f` over the mapped contents of `plane`.
    pub fn map_plane<R>(&self, plane: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut st = self.inner.lock();
        let buf = st
            .base
            .planes
            .get_mut(plane)
            .ok_or_else(|| Error::op(format!("no plane {}", plane)))?;
        let bytes = buf.map()?;
        Ok(f(bytes))
    }

    /// Duplicate the descriptor of `plane` for a consumer.
    pub fn dup_plane_fd(&self, plane: usize) -> Result<OwnedFd> {
        let st = self.inner.lock();
        st.base
            .planes
            .get(plane)
            .ok_or_else(|| Error::op(format!("no plane {}", plane)))?
            .dup_fd()
    }

    /// Attach external memory as `plane` of an imported entry.
    ///
    /// Planes are populated in order and only once.
    pub fn import_plane(&self, plane: usize, fd: BorrowedFd<'_>, size: usize) -> Result<()> {
        let mut st = self.inner.lock();
        if st.base.status != QentStatus::Import || plane != st.base.planes.len() {
            return Err(Error::op(format!(
                "cannot import plane {} into entry with {} planes ({:?})",
                plane,
                st.base.planes.len(),
                st.base.status
            )));
        }
        let buf = DmaBuf::import(fd, size)
            .map_err(|e| Error::AllocationFailed(format!("import of plane {}: {}", plane, e)))?;
        st.base.planes.push(buf);
        self.inner.sync_fd(&st);
        Ok(())
    }

    /// Number of populated planes.
    pub fn plane_count(&self) -> usize {
        self.inner.lock().base.planes.len()
    }

    /// Bytes the driver wrote to `plane`.
    pub fn plane_len(&self, plane: usize) -> usize {
        self.inner.lock().base.planes.get(plane).map_or(0, DmaBuf::len)
    }

    /// Allocated size of `plane`.
    pub fn plane_size(&self, plane: usize) -> usize {
        self.inner.lock().base.planes.get(plane).map_or(0, DmaBuf::size)
    }

    /// Give the buffer back; same as dropping it.
    pub fn free(self) {}
}

impl Drop for QentDst {
    fn drop(&mut self) {
        let Some(ctl) = self.inner.ctl.upgrade() else {
            return;
        };
        {
            let mut st = self.inner.lock();
            if st.queued {
                st.release_on_dequeue = true;
                return;
            }
        }
        ctl.dst.put_free(Arc::clone(&self.inner));
    }
}

impl std::fmt::Debug for QentDst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("QentDst")
            .field("index", &st.base.index)
            .field("status", &st.base.status)
            .field("planes", &st.base.planes.len())
            .field("waiting", &st.waiting)
            .finish()
    }
}
