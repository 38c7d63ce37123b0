//! Transaction controller for one M2M decode session.
//!
//! Lock order is controller state, then queue lists, then a destination
//! entry's own state. Queue hooks run before the list lock is taken, and
//! dequeue matching reads a cached descriptor, so the last two never nest.

use super::qent::{DstShared, INDEX_UNSET, QentDst, QentSrc, QentStatus, SrcEntry};
use super::queue::{BufQueue, QueueEntry};
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::media::MediaRequest;
use crate::memory::DmaBufAllocator;
use crate::poll::{PollFlags, PollQueue, PollTask};
use crate::v4l2::sys::{V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF, V4L2_CAP_VIDEO_M2M, V4L2_CAP_VIDEO_M2M_MPLANE};
use crate::v4l2::{
    BufType, Capability, ExtControl, FormatDesc, FourCc, Format, Memory, PlaneFormat, QueryExtCtrl,
    QueueBuffer, V4l2Device, VideoDevice,
};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

/// Strong reference held while the completion poll is armed.
struct PollArmed {
    _ctl: Arc<CtlInner>,
}

impl PollArmed {
    fn new(ctl: &Arc<CtlInner>) -> Self {
        Self {
            _ctl: Arc::clone(ctl),
        }
    }
}

struct CtlState {
    stream_on: bool,
    polling: Option<PollArmed>,
    src_fmt: Format,
    dst_fmt: Format,
}

pub(crate) struct CtlInner {
    /// Unregistered first on teardown.
    task: OnceLock<PollTask>,
    state: Mutex<CtlState>,
    pub(crate) src: BufQueue<SrcEntry>,
    pub(crate) dst: BufQueue<Arc<DstShared>>,
    src_type: BufType,
    dst_type: BufType,
    caps: Capability,
    poll_timeout: Duration,
    device: Box<dyn VideoDevice>,
}

impl CtlInner {
    fn lock(&self) -> MutexGuard<'_, CtlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wants_poll(&self) -> bool {
        self.src.is_inuse() || self.dst.is_inuse()
    }

    fn arm(&self) -> Result<()> {
        match self.task.get() {
            Some(task) => task.arm(self.poll_timeout),
            None => Err(Error::op("controller poll task missing")),
        }
    }

    fn dequeue_src(&self, num_planes: usize) -> Option<SrcEntry> {
        let buf = match self.device.dequeue_buffer(self.src_type, num_planes) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(buf_type = ?self.src_type, "failed to dequeue source buffer: {}", e);
                return None;
            }
        };
        let Some(mut entry) = self.src.extract_inuse(buf.fd) else {
            tracing::warn!(fd = buf.fd, index = buf.index, "dequeued source buffer not in use");
            return None;
        };
        entry.base.timestamp = buf.timestamp;
        entry.base.status = if buf.is_error() {
            QentStatus::Error
        } else {
            QentStatus::Done
        };
        Some(entry)
    }

    /// Post the result of a completed destination buffer. Returns the entry
    /// if its consumer already let go of it.
    fn dequeue_dst(&self, num_planes: usize) -> Option<Arc<DstShared>> {
        let buf = match self.device.dequeue_buffer(self.dst_type, num_planes) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(buf_type = ?self.dst_type, "failed to dequeue destination buffer: {}", e);
                return None;
            }
        };
        let Some(shared) = self.dst.extract_inuse(buf.fd) else {
            tracing::warn!(fd = buf.fd, index = buf.index, "dequeued destination buffer not in use");
            return None;
        };

        let mut ds = shared.lock();
        ds.queued = false;
        if std::mem::take(&mut ds.orphaned) {
            tracing::debug!(index = buf.index, "discarding result of orphaned buffer");
        } else {
            ds.base.timestamp = buf.timestamp;
            ds.base.status = if buf.is_error() {
                QentStatus::Error
            } else {
                QentStatus::Done
            };
            for (plane, used) in ds.base.planes.iter_mut().zip(&buf.bytesused) {
                plane.set_len(*used as usize);
            }
            shared.release(&mut ds);
        }
        let recycle = std::mem::take(&mut ds.release_on_dequeue);
        drop(ds);
        recycle.then_some(shared)
    }

    /// Arm the completion poll if anything is in use and it is not armed.
    fn ensure_polling(self: &Arc<Self>, st: &mut CtlState) {
        if st.polling.is_none() && self.wants_poll() {
            match self.arm() {
                Ok(()) => st.polling = Some(PollArmed::new(self)),
                Err(e) => tracing::error!("failed to arm buffer poll: {}", e),
            }
        }
    }

    fn poll_complete(self: &Arc<Self>, flags: PollFlags) {
        if flags.is_empty() {
            tracing::warn!("buffer completion poll timed out");
        }
        // The device reports POLLERR while its queues are not streaming and
        // stays ready; polling resumes on the next submission or stream on.
        let stalled = flags.intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL)
            && !flags.intersects(PollFlags::IN | PollFlags::OUT);
        if stalled {
            tracing::warn!(?flags, "buffer poll reported an error, pausing");
        }

        let mut done_src = None;
        let mut done_dst = None;
        let guard = {
            let mut st = self.lock();
            let mut guard = st.polling.take();

            if flags.contains(PollFlags::OUT) {
                done_src = self.dequeue_src(st.src_fmt.num_planes().max(1));
            }
            if flags.contains(PollFlags::IN) {
                done_dst = self.dequeue_dst(st.dst_fmt.num_planes().max(1));
            }

            if !stalled && self.wants_poll() {
                match self.arm() {
                    Ok(()) => {
                        st.polling =
                            Some(guard.take().unwrap_or_else(|| PollArmed::new(self)));
                    }
                    Err(e) => tracing::error!("failed to re-arm buffer poll: {}", e),
                }
            }
            guard
        };

        if let Some(entry) = done_src {
            self.src.put_free(entry);
        }
        if let Some(shared) = done_dst {
            self.dst.put_free(shared);
        }
        // May be the last reference
        drop(guard);
    }

    fn release_drained(&self, src: Vec<SrcEntry>, dst: Vec<Arc<DstShared>>) {
        for entry in src {
            self.src.put_free(entry);
        }
        for shared in dst {
            let recycle = {
                let mut ds = shared.lock();
                ds.queued = false;
                ds.orphaned = false;
                shared.release(&mut ds);
                std::mem::take(&mut ds.release_on_dequeue)
            };
            if recycle {
                self.dst.put_free(shared);
            }
        }
    }
}

impl Drop for CtlInner {
    fn drop(&mut self) {
        drop(self.task.take());

        let stream_on = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .stream_on;
        if stream_on {
            for buf_type in [self.src_type, self.dst_type] {
                if let Err(e) = self.device.set_stream(buf_type, false) {
                    tracing::warn!(?buf_type, "failed to stop stream on close: {}", e);
                }
            }
        }

        // Waiters on buffers still in the driver get no result
        let src = self.src.drain_inuse();
        let dst = self.dst.drain_inuse();
        self.release_drained(src, dst);

        for buf_type in [self.src_type, self.dst_type] {
            if let Err(e) = self.device.request_buffers(buf_type, Memory::Mmap, 0) {
                tracing::debug!(?buf_type, "failed to release driver buffers: {}", e);
            }
        }
        tracing::debug!(driver = %self.caps.driver, "buffer controller closed");
    }
}

/// Drives the source and destination queues of one M2M video device.
///
/// Typical setup order: [`src_fmt_set`](Self::src_fmt_set), codec controls,
/// [`dst_fmt_set`](Self::dst_fmt_set), [`src_pool_create`](Self::src_pool_create),
/// [`dst_slots_create`](Self::dst_slots_create) or
/// [`dst_qent_alloc`](Self::dst_qent_alloc), then [`stream_on`](Self::stream_on).
///
/// Cloning yields another handle to the same controller. The controller
/// lives until the last handle is dropped and no completion poll is armed.
#[derive(Clone)]
pub struct MediaBufsCtl {
    inner: Arc<CtlInner>,
}

impl MediaBufsCtl {
    /// Open the video node named by `config`.
    pub fn open(config: &MediaConfig, poll: &Arc<dyn PollQueue>) -> Result<Self> {
        let device = V4l2Device::open(&config.video_path).map_err(|e| {
            tracing::error!(path = %config.video_path.display(), "failed to open video device: {}", e);
            Error::op(format!("open {}: {}", config.video_path.display(), e))
        })?;
        Self::with_device(Box::new(device), poll, config)
    }

    /// Build a controller over `device`.
    ///
    /// Fails with [`Error::UnsupportedBufferType`] unless the device is a
    /// single- or multi-planar memory-to-memory device.
    pub fn with_device(
        device: Box<dyn VideoDevice>,
        poll: &Arc<dyn PollQueue>,
        config: &MediaConfig,
    ) -> Result<Self> {
        let caps = device.query_caps().map_err(|e| {
            tracing::error!("failed to get capabilities: {}", e);
            Error::op(format!("VIDIOC_QUERYCAP: {}", e))
        })?;

        let effective = caps.effective_caps();
        let (src_type, dst_type) = if effective & V4L2_CAP_VIDEO_M2M_MPLANE != 0 {
            (BufType::VideoOutputMplane, BufType::VideoCaptureMplane)
        } else if effective & V4L2_CAP_VIDEO_M2M != 0 {
            (BufType::VideoOutput, BufType::VideoCapture)
        } else {
            tracing::error!(caps = format_args!("{:#x}", effective), "no M2M capabilities");
            return Err(Error::UnsupportedBufferType(format!(
                "{} has no M2M capability ({:#x})",
                caps.driver, effective
            )));
        };

        let inner = Arc::new(CtlInner {
            task: OnceLock::new(),
            state: Mutex::new(CtlState {
                stream_on: false,
                polling: None,
                src_fmt: Format::empty(src_type),
                dst_fmt: Format::empty(dst_type),
            }),
            src: BufQueue::new(),
            dst: BufQueue::new(),
            src_type,
            dst_type,
            caps,
            poll_timeout: config.poll_timeout,
            device,
        });

        let weak = Arc::downgrade(&inner);
        let task = PollTask::new(
            poll,
            inner.device.poll_fd(),
            PollFlags::IN | PollFlags::OUT,
            Box::new(move |flags| {
                if let Some(ctl) = weak.upgrade() {
                    ctl.poll_complete(flags);
                }
            }),
        )?;
        let _ = inner.task.set(task);

        tracing::info!(
            driver = %inner.caps.driver,
            card = %inner.caps.card,
            multiplanar = src_type.is_multiplanar(),
            "buffer controller ready"
        );
        Ok(Self { inner })
    }

    fn weak(&self) -> Weak<CtlInner> {
        Arc::downgrade(&self.inner)
    }

    /// Capabilities reported by the device.
    pub fn capabilities(&self) -> &Capability {
        &self.inner.caps
    }

    /// Queue type bitstream buffers are submitted on.
    pub fn src_type(&self) -> BufType {
        self.inner.src_type
    }

    /// Queue type frames come back on.
    pub fn dst_type(&self) -> BufType {
        self.inner.dst_type
    }

    // ------------------------------------------------------------------
    // Formats
    // ------------------------------------------------------------------

    fn fmt_set(&self, buf_type: BufType, pixfmt: FourCc, width: u32, height: u32, bufsize: u32) -> Result<Format> {
        let want = Format {
            buf_type,
            width,
            height,
            pixelformat: pixfmt,
            planes: if bufsize > 0 {
                vec![PlaneFormat {
                    sizeimage: bufsize,
                    bytesperline: 0,
                }]
            } else {
                Vec::new()
            },
        };
        let got = self
            .inner
            .device
            .set_format(&want)
            .map_err(|e| Error::op(format!("VIDIOC_S_FMT {} {}x{}: {}", pixfmt, width, height, e)))?;

        if got.width < width || got.height < height || got.pixelformat != pixfmt {
            return Err(Error::UnsupportedBufferType(format!(
                "asked for {} {}x{}, driver chose {} {}x{}",
                pixfmt, width, height, got.pixelformat, got.width, got.height
            )));
        }
        Ok(got)
    }

    /// Set the bitstream format. `bufsize` of 0 lets the driver pick.
    pub fn src_fmt_set(&self, buf_type: BufType, pixfmt: FourCc, width: u32, height: u32, bufsize: u32) -> Result<()> {
        match self.fmt_set(buf_type, pixfmt, width, height, bufsize) {
            Ok(fmt) => {
                tracing::debug!(%pixfmt, width, height, sizeimage = ?fmt.planes.first().map(|p| p.sizeimage), "source format set");
                self.inner.lock().src_fmt = fmt;
                Ok(())
            }
            Err(e) => {
                tracing::error!(?buf_type, %pixfmt, width, height, "failed to set source format: {}", e);
                Err(e)
            }
        }
    }

    fn find_fmt(
        &self,
        width: u32,
        height: u32,
        emulated: bool,
        accept: &mut dyn FnMut(&FormatDesc) -> bool,
    ) -> Result<Format> {
        let mut index = 0;
        loop {
            let desc = self
                .inner
                .device
                .enum_format(self.inner.dst_type, index)
                .map_err(|e| Error::UnsupportedBufferType(format!("format enumeration ended: {}", e)))?;
            index += 1;

            if desc.is_emulated() != emulated || !accept(&desc) {
                continue;
            }
            match self.fmt_set(desc.buf_type, desc.pixelformat, width, height, 0) {
                Ok(fmt) => return Ok(fmt),
                Err(e) => tracing::debug!(format = %desc.pixelformat, "candidate rejected: {}", e),
            }
        }
    }

    /// Negotiate the frame format.
    ///
    /// Formats the driver advertises are offered to `accept`, native ones
    /// first and emulated ones only if no native format works. The first
    /// accepted format the driver sets at no less than `width` x `height`
    /// wins.
    pub fn dst_fmt_set(&self, width: u32, height: u32, mut accept: impl FnMut(&FormatDesc) -> bool) -> Result<()> {
        for emulated in [false, true] {
            match self.find_fmt(width, height, emulated, &mut accept) {
                Ok(fmt) => {
                    tracing::debug!(format = %fmt.pixelformat, width = fmt.width, height = fmt.height, emulated, "destination format set");
                    self.inner.lock().dst_fmt = fmt;
                    return Ok(());
                }
                Err(Error::UnsupportedBufferType(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::UnsupportedBufferType(format!(
            "no acceptable destination format for {}x{}",
            width, height
        )))
    }

    /// Negotiated bitstream format.
    pub fn src_fmt(&self) -> Format {
        self.inner.lock().src_fmt.clone()
    }

    /// Negotiated frame format.
    pub fn dst_fmt(&self) -> Format {
        self.inner.lock().dst_fmt.clone()
    }

    /// Whether source buffers may be larger than the negotiated size.
    pub fn src_resizable(&self) -> bool {
        self.inner.src_type.is_multiplanar()
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Request `n` source buffers from the driver and back each with memory.
    ///
    /// Any existing free source entries are discarded first. If memory for
    /// any entry cannot be allocated, the driver's buffers are released and
    /// no entry is kept.
    pub fn src_pool_create(&self, allocator: &dyn DmaBufAllocator, n: u32) -> Result<()> {
        drop(self.inner.src.drain_free());
        let fmt = self.src_fmt();
        let device = &self.inner.device;

        let granted = device
            .request_buffers(self.inner.src_type, Memory::DmaBuf, n)
            .map_err(|e| {
                tracing::error!(count = n, "failed to request source buffers: {}", e);
                Error::op(format!("VIDIOC_REQBUFS {}: {}", n, e))
            })?;
        if granted < n {
            tracing::info!(requested = n, granted, "driver granted fewer source buffers");
        }

        let fixed_size = !self.src_resizable();
        let count = granted.min(n);
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut entry = SrcEntry::new(index, fixed_size);
            if let Err(e) = entry.base.alloc_from_fmt(&fmt, allocator) {
                tracing::error!(index, "failed to back source buffer: {}", e);
                drop(entries);
                if let Err(e) = device.request_buffers(self.inner.src_type, Memory::DmaBuf, 0) {
                    tracing::warn!("failed to release source buffers: {}", e);
                }
                return Err(Error::op(format!("source buffer {} allocation: {}", index, e)));
            }
            entries.push(entry);
        }
        for entry in entries {
            self.inner.src.put_free(entry);
        }
        tracing::debug!(count, fixed_size, "source pool created");
        Ok(())
    }

    fn create_dst_slot(&self, fmt: &Format) -> Result<u32> {
        self.inner
            .device
            .create_buffer(fmt, Memory::DmaBuf)
            .map_err(|e| {
                tracing::error!("failed to create destination buffer: {}", e);
                Error::op(format!("VIDIOC_CREATE_BUFS: {}", e))
            })
    }

    /// Create `n` destination slots in the driver without attaching memory.
    ///
    /// Slots cannot be removed once created, so memory is attached later by
    /// [`dst_qent_alloc`](Self::dst_qent_alloc).
    pub fn dst_slots_create(&self, n: u32) -> Result<()> {
        let fmt = self.dst_fmt();
        for _ in 0..n {
            let index = self.create_dst_slot(&fmt)?;
            self.inner
                .dst
                .put_free(DstShared::new(index, QentStatus::New, self.weak()));
        }
        Ok(())
    }

    /// Take a destination buffer backed by memory for every plane of the
    /// negotiated format.
    ///
    /// A free slot is reused when there is one; otherwise a new slot is
    /// created. If memory cannot be attached the slot stays on the free list.
    pub fn dst_qent_alloc(&self, allocator: &dyn DmaBufAllocator) -> Result<QentDst> {
        let fmt = self.dst_fmt();
        let shared = match self.inner.dst.try_get_free() {
            Some(shared) => shared,
            None => {
                let index = self.create_dst_slot(&fmt)?;
                DstShared::new(index, QentStatus::New, self.weak())
            }
        };

        let attached = {
            let mut ds = shared.lock();
            let attached = ds.base.alloc_from_fmt(&fmt, allocator);
            ds.base.status = QentStatus::New;
            shared.sync_fd(&ds);
            attached
        };
        if let Err(e) = attached {
            self.inner.dst.put_free(shared);
            return Err(e);
        }
        Ok(QentDst::from_shared(shared))
    }

    /// Take a free source buffer, blocking until one is returned.
    pub fn src_qent_get(&self) -> QentSrc {
        QentSrc::new(self.inner.src.get_free(), self.weak())
    }

    /// Take a free source buffer if one is available.
    pub fn src_qent_try_get(&self) -> Option<QentSrc> {
        let entry = self.inner.src.try_get_free()?;
        Some(QentSrc::new(entry, self.weak()))
    }

    /// Take a free source buffer, waiting at most `timeout`.
    pub fn src_qent_get_timeout(&self, timeout: Duration) -> Option<QentSrc> {
        let entry = self.inner.src.get_free_timeout(timeout)?;
        Some(QentSrc::new(entry, self.weak()))
    }

    /// Return an unsubmitted source buffer.
    pub fn src_qent_abort(&self, src: QentSrc) {
        drop(src);
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    fn unwind_start(&self, req: MediaRequest, src: SrcEntry, dst: Option<&Arc<DstShared>>) {
        req.abort();
        self.inner.src.put_free(src);
        if let Some(shared) = dst {
            let mut ds = shared.lock();
            shared.release(&mut ds);
        }
    }

    /// Submit one frame's worth of work.
    ///
    /// `req` and `src` are consumed whatever the outcome. `dst`, if given,
    /// must belong to this controller, have memory attached and not already
    /// be awaiting a result. Set `is_final` to false for all but the last
    /// request of a frame so the driver holds the capture buffer.
    ///
    /// If submission fails after `dst` was claimed, its waiters are released
    /// with no result: [`QentDst::wait`] then reports
    /// [`Error::OperationFailed`].
    pub fn start_request(
        &self,
        req: MediaRequest,
        src: QentSrc,
        dst: Option<&QentDst>,
        is_final: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let me = self.weak();

        if !src.belongs_to(&me) {
            tracing::error!("source buffer belongs to another controller");
            req.abort();
            return Err(Error::op("source buffer from another controller"));
        }

        let mut st = inner.lock();
        let dst = dst.map(QentDst::shared);

        if let Some(shared) = dst {
            let mut ds = shared.lock();
            let reason = if !shared.belongs_to(&me) {
                Some("belongs to another controller")
            } else if ds.waiting || ds.queued {
                Some("already waiting")
            } else if ds.base.planes.is_empty() || ds.base.index == INDEX_UNSET {
                Some("has no memory")
            } else {
                None
            };
            if let Some(reason) = reason {
                drop(ds);
                drop(st);
                tracing::info!("destination buffer {} on start", reason);
                req.abort();
                drop(src);
                return Err(Error::op(format!("destination buffer {}", reason)));
            }
            ds.waiting = true;
            ds.base.status = QentStatus::Pending;
        }

        let entry = src.into_entry();
        let src_fd: Option<RawFd> = entry.primary_fd();
        let src_buf = QueueBuffer {
            buf_type: inner.src_type,
            index: entry.base.index,
            planes: entry.base.queue_planes(),
            flags: if is_final {
                0
            } else {
                V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF
            },
            request_fd: Some(req.raw_fd()),
            timestamp: entry.base.timestamp,
        };
        if let Err(e) = inner.device.queue_buffer(&src_buf) {
            tracing::error!(index = src_buf.index, "failed to queue source buffer: {}", e);
            drop(st);
            self.unwind_start(req, entry, dst);
            return Err(Error::op(format!("source VIDIOC_QBUF: {}", e)));
        }

        if let Some(shared) = dst {
            let dst_buf = {
                let mut ds = shared.lock();
                ds.base.timestamp = Duration::ZERO;
                for plane in &mut ds.base.planes {
                    plane.set_len(0);
                }
                QueueBuffer {
                    buf_type: inner.dst_type,
                    index: ds.base.index,
                    planes: ds.base.queue_planes(),
                    flags: 0,
                    request_fd: None,
                    timestamp: Duration::ZERO,
                }
            };
            if let Err(e) = inner.device.queue_buffer(&dst_buf) {
                tracing::error!(index = dst_buf.index, "failed to queue destination buffer: {}", e);
                drop(st);
                self.unwind_start(req, entry, dst);
                return Err(Error::op(format!("destination VIDIOC_QBUF: {}", e)));
            }
        }

        inner.src.put_inuse(entry);
        if let Some(shared) = dst {
            shared.lock().queued = true;
            inner.dst.put_inuse(Arc::clone(shared));
        }

        inner.ensure_polling(&mut st);
        drop(st);

        if let Err(e) = req.submit() {
            if let Some(entry) = src_fd.and_then(|fd| inner.src.extract_inuse(fd)) {
                inner.src.put_free(entry);
            }
            if let Some(shared) = dst {
                let mut ds = shared.lock();
                if ds.queued {
                    ds.orphaned = true;
                    shared.release(&mut ds);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Start both queues. If the destination queue fails the source queue
    /// is stopped again.
    pub fn stream_on(&self) -> Result<()> {
        let device = &self.inner.device;
        let mut st = self.inner.lock();
        if st.stream_on {
            return Ok(());
        }

        device.set_stream(self.inner.src_type, true).map_err(|e| {
            tracing::error!(buf_type = ?self.inner.src_type, "failed to start stream: {}", e);
            Error::op(format!("source VIDIOC_STREAMON: {}", e))
        })?;
        if let Err(e) = device.set_stream(self.inner.dst_type, true) {
            tracing::error!(buf_type = ?self.inner.dst_type, "failed to start stream: {}", e);
            if let Err(e) = device.set_stream(self.inner.src_type, false) {
                tracing::warn!("failed to roll back source stream: {}", e);
            }
            return Err(Error::op(format!("destination VIDIOC_STREAMON: {}", e)));
        }

        st.stream_on = true;
        self.inner.ensure_polling(&mut st);
        Ok(())
    }

    /// Stop both queues, attempting each even if the other fails.
    ///
    /// Buffers the driver gives back by stopping are returned to the free
    /// lists; their waiters are released with no result.
    pub fn stream_off(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();
        if !st.stream_on {
            return Ok(());
        }

        let mut status = Ok(());
        let mut src = Vec::new();
        let mut dst = Vec::new();

        match inner.device.set_stream(inner.src_type, false) {
            Ok(()) => src = inner.src.drain_inuse(),
            Err(e) => {
                tracing::error!(buf_type = ?inner.src_type, "failed to stop stream: {}", e);
                status = Err(Error::op(format!("source VIDIOC_STREAMOFF: {}", e)));
            }
        }
        match inner.device.set_stream(inner.dst_type, false) {
            Ok(()) => dst = inner.dst.drain_inuse(),
            Err(e) => {
                tracing::error!(buf_type = ?inner.dst_type, "failed to stop stream: {}", e);
                status = Err(Error::op(format!("destination VIDIOC_STREAMOFF: {}", e)));
            }
        }
        st.stream_on = false;
        drop(st);

        inner.release_drained(src, dst);
        status
    }

    // ------------------------------------------------------------------
    // Controls and events
    // ------------------------------------------------------------------

    /// Set controls, scoped to `req` when given.
    pub fn set_ext_ctrls(&self, req: Option<&MediaRequest>, controls: &mut [ExtControl]) -> Result<()> {
        self.inner
            .device
            .set_ext_ctrls(req.map(MediaRequest::raw_fd), controls)
            .map_err(|e| {
                tracing::error!(count = controls.len(), "unable to set controls: {}", e);
                Error::op(format!("VIDIOC_S_EXT_CTRLS: {}", e))
            })
    }

    /// Set one compound control from raw bytes.
    pub fn set_ext_ctrl(&self, req: Option<&MediaRequest>, id: u32, data: &[u8]) -> Result<()> {
        self.set_ext_ctrls(req, &mut [ExtControl::compound(id, data)])
    }

    /// Read the current values of `controls`.
    pub fn get_ext_ctrls(&self, controls: &mut [ExtControl]) -> Result<()> {
        self.inner.device.get_ext_ctrls(controls).map_err(|e| {
            tracing::error!(count = controls.len(), "unable to get controls: {}", e);
            Error::op(format!("VIDIOC_G_EXT_CTRLS: {}", e))
        })
    }

    /// Describe each control in `ids`. Unknown controls come back with a
    /// `ctrl_type` of 0.
    pub fn query_ext_ctrls(&self, ids: &[u32]) -> Vec<QueryExtCtrl> {
        ids.iter()
            .map(|&id| match self.inner.device.query_ext_ctrl(id) {
                Ok(q) => q,
                Err(e) => {
                    tracing::debug!(id = format_args!("{:#x}", id), "control query failed: {}", e);
                    QueryExtCtrl {
                        id,
                        ..Default::default()
                    }
                }
            })
            .collect()
    }

    /// Subscribe to a V4L2 event.
    pub fn subscribe_event(&self, event_type: u32, id: u32) -> Result<()> {
        self.inner.device.subscribe_event(event_type, id).map_err(|e| {
            tracing::error!(event_type, id, "failed to subscribe event: {}", e);
            Error::op(format!("VIDIOC_SUBSCRIBE_EVENT: {}", e))
        })
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Source buffers on the free list.
    pub fn src_free_count(&self) -> usize {
        self.inner.src.free_count()
    }

    /// Destination buffers on the free list.
    pub fn dst_free_count(&self) -> usize {
        self.inner.dst.free_count()
    }

    /// Source buffers queued in the driver.
    pub fn src_inuse_count(&self) -> usize {
        self.inner.src.inuse_count()
    }

    /// Destination buffers queued in the driver.
    pub fn dst_inuse_count(&self) -> usize {
        self.inner.dst.inuse_count()
    }

    /// Whether the completion poll is armed.
    pub fn is_polling(&self) -> bool {
        self.inner.lock().polling.is_some()
    }

    /// Whether both queues are streaming.
    pub fn is_streaming(&self) -> bool {
        self.inner.lock().stream_on
    }
}

impl std::fmt::Debug for MediaBufsCtl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBufsCtl")
            .field("driver", &self.inner.caps.driver)
            .field("src_type", &self.inner.src_type)
            .field("dst_type", &self.inner.dst_type)
            .field("src", &self.inner.src)
            .field("dst", &self.inner.dst)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualPollQueue, MockVideoDevice};

    fn ctl(video: &MockVideoDevice) -> (MediaBufsCtl, ManualPollQueue) {
        let poll = ManualPollQueue::new();
        let ctl = MediaBufsCtl::with_device(Box::new(video.clone()), &poll.shared(), &MediaConfig::default())
            .unwrap();
        (ctl, poll)
    }

    #[test]
    fn test_mplane_caps_select_mplane_types() {
        let video = MockVideoDevice::new();
        let (ctl, poll) = ctl(&video);
        assert_eq!(ctl.src_type(), BufType::VideoOutputMplane);
        assert_eq!(ctl.dst_type(), BufType::VideoCaptureMplane);
        assert!(ctl.src_resizable());
        assert_eq!(poll.task_count(), 1);
    }

    #[test]
    fn test_single_plane_caps() {
        let video = MockVideoDevice::single_planar();
        let (ctl, _poll) = ctl(&video);
        assert_eq!(ctl.src_type(), BufType::VideoOutput);
        assert!(!ctl.src_resizable());
    }

    #[test]
    fn test_no_m2m_caps_rejected() {
        let video = MockVideoDevice::with_caps(0);
        let poll = ManualPollQueue::new();
        let err = MediaBufsCtl::with_device(Box::new(video), &poll.shared(), &MediaConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedBufferType(_)));
        assert_eq!(poll.task_count(), 0);
    }

    #[test]
    fn test_src_fmt_fails_closed() {
        let video = MockVideoDevice::new();
        let (ctl, _poll) = ctl(&video);
        video.clamp_size(1280, 720);
        let err = ctl
            .src_fmt_set(BufType::VideoOutputMplane, FourCc::new(b"S264"), 1920, 1080, 0)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedBufferType(_)));
        assert_eq!(ctl.src_fmt().width, 0);
    }

    #[test]
    fn test_query_unknown_control() {
        let video = MockVideoDevice::new();
        let (ctl, _poll) = ctl(&video);
        let q = ctl.query_ext_ctrls(&[0x00a4_0a00, 0xdead]);
        assert_eq!(q.len(), 2);
        assert_ne!(q[0].ctrl_type, 0);
        assert_eq!(q[1].ctrl_type, 0);
        assert_eq!(q[1].id, 0xdead);
    }

    #[test]
    fn test_teardown_unregisters_poll() {
        let video = MockVideoDevice::new();
        let (ctl, poll) = ctl(&video);
        drop(ctl);
        assert_eq!(poll.task_count(), 0);
        assert_eq!(video.released_buffer_types().len(), 2);
    }
}
