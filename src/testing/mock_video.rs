//! In-memory M2M [`VideoDevice`].
//!
//! Buffers queued on the device stay queued until the test completes them
//! with [`MockVideoDevice::complete_next`] or
//! [`MockVideoDevice::complete_frame`]; the poll descriptor never becomes
//! ready on its own, so completions are delivered through
//! [`ManualPollQueue::fire`](super::ManualPollQueue::fire).

use crate::poll::EventFd;
use crate::v4l2::sys::{
    V4L2_BUF_FLAG_ERROR, V4L2_CAP_VIDEO_M2M, V4L2_CAP_VIDEO_M2M_MPLANE, V4L2_FMT_FLAG_EMULATED,
};
use crate::v4l2::{
    BufType, Capability, CtrlValue, DequeuedBuffer, ExtControl, Format, FormatDesc, FourCc,
    Memory, PlaneFormat, QueryExtCtrl, QueueBuffer, VideoDevice,
};
use rustix::io::Errno;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// H.264 stateless decode-mode control, known to every mock device.
pub const MOCK_CTRL_DECODE_MODE: u32 = 0x00a4_0a00;
/// H.264 stateless SPS control, known to every mock device.
pub const MOCK_CTRL_SPS: u32 = 0x00a4_0a02;

const COMPOUND_CTRL_TYPE: u32 = 0x0102;
const DEFAULT_SRC_SIZEIMAGE: u32 = 256 * 1024;

#[derive(Debug, Clone)]
struct MockFormat {
    fourcc: FourCc,
    emulated: bool,
    max_width: u32,
    max_height: u32,
}

struct State {
    caps: u32,
    output_formats: Vec<FourCc>,
    capture_formats: Vec<MockFormat>,
    capture_planes: usize,
    clamp: Option<(u32, u32)>,
    grant_limit: Option<u32>,
    granted: HashMap<BufType, u32>,
    released: Vec<BufType>,
    next_slot: u32,
    queued: HashMap<BufType, VecDeque<QueueBuffer>>,
    done: HashMap<BufType, VecDeque<DequeuedBuffer>>,
    last_src_timestamp: Duration,
    streaming: HashSet<BufType>,
    stream_calls: Vec<(BufType, bool)>,
    fail_queue: HashSet<BufType>,
    fail_stream_on: HashSet<BufType>,
    fail_stream_off: HashSet<BufType>,
    fail_create: bool,
    fail_set_format: bool,
    controls: HashMap<u32, CtrlValue>,
    known_controls: HashSet<u32>,
    request_controls: Vec<(RawFd, ExtControl)>,
    events: Vec<(u32, u32)>,
}

struct Inner {
    poll: EventFd,
    state: Mutex<State>,
}

/// In-memory memory-to-memory video device.
///
/// Cloning shares the same device.
#[derive(Clone)]
pub struct MockVideoDevice {
    inner: Arc<Inner>,
}

impl MockVideoDevice {
    /// A multi-planar M2M device offering native NV12 up to 4096x4096.
    pub fn new() -> Self {
        Self::with_caps(V4L2_CAP_VIDEO_M2M_MPLANE)
    }

    /// A single-planar M2M device.
    pub fn single_planar() -> Self {
        Self::with_caps(V4L2_CAP_VIDEO_M2M)
    }

    /// A device reporting `caps` from `VIDIOC_QUERYCAP`.
    ///
    /// # Panics
    ///
    /// Panics if no eventfd can be created.
    pub fn with_caps(caps: u32) -> Self {
        let poll = EventFd::new().expect("eventfd for mock video device");
        let state = State {
            caps,
            output_formats: vec![FourCc::new(b"S264"), FourCc::new(b"S265")],
            capture_formats: vec![MockFormat {
                fourcc: FourCc::new(b"NV12"),
                emulated: false,
                max_width: 4096,
                max_height: 4096,
            }],
            capture_planes: 1,
            clamp: None,
            grant_limit: None,
            granted: HashMap::new(),
            released: Vec::new(),
            next_slot: 0,
            queued: HashMap::new(),
            done: HashMap::new(),
            last_src_timestamp: Duration::ZERO,
            streaming: HashSet::new(),
            stream_calls: Vec::new(),
            fail_queue: HashSet::new(),
            fail_stream_on: HashSet::new(),
            fail_stream_off: HashSet::new(),
            fail_create: false,
            fail_set_format: false,
            controls: HashMap::new(),
            known_controls: [MOCK_CTRL_DECODE_MODE, MOCK_CTRL_SPS].into_iter().collect(),
            request_controls: Vec::new(),
            events: Vec::new(),
        };
        Self {
            inner: Arc::new(Inner {
                poll,
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capture_type(st: &State) -> BufType {
        if st.caps & V4L2_CAP_VIDEO_M2M_MPLANE != 0 {
            BufType::VideoCaptureMplane
        } else {
            BufType::VideoCapture
        }
    }

    /// Raw descriptor the controller polls.
    pub fn poll_raw_fd(&self) -> RawFd {
        self.inner.poll.as_fd().as_raw_fd()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Replace the advertised capture formats.
    pub fn clear_capture_formats(&self) {
        self.lock().capture_formats.clear();
    }

    /// Advertise a capture format the driver can produce up to the given size.
    pub fn add_capture_format(&self, fourcc: FourCc, emulated: bool, max_width: u32, max_height: u32) {
        self.lock().capture_formats.push(MockFormat {
            fourcc,
            emulated,
            max_width,
            max_height,
        });
    }

    /// Number of planes capture formats are split into.
    pub fn set_capture_planes(&self, planes: usize) {
        self.lock().capture_planes = planes.max(1);
    }

    /// Never set a format larger than `width` x `height`.
    pub fn clamp_size(&self, width: u32, height: u32) {
        self.lock().clamp = Some((width, height));
    }

    /// Grant at most `n` buffers per `VIDIOC_REQBUFS`.
    pub fn limit_grant(&self, n: u32) {
        self.lock().grant_limit = Some(n);
    }

    /// Make `VIDIOC_QBUF` fail for `buf_type`.
    pub fn fail_queue(&self, buf_type: BufType, fail: bool) {
        let mut st = self.lock();
        if fail {
            st.fail_queue.insert(buf_type);
        } else {
            st.fail_queue.remove(&buf_type);
        }
    }

    /// Make `VIDIOC_STREAMON` fail for `buf_type`.
    pub fn fail_stream_on(&self, buf_type: BufType) {
        self.lock().fail_stream_on.insert(buf_type);
    }

    /// Make `VIDIOC_STREAMOFF` fail for `buf_type`.
    pub fn fail_stream_off(&self, buf_type: BufType) {
        self.lock().fail_stream_off.insert(buf_type);
    }

    /// Make `VIDIOC_CREATE_BUFS` fail.
    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Make `VIDIOC_S_FMT` fail.
    pub fn fail_set_format(&self, fail: bool) {
        self.lock().fail_set_format = fail;
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Finish the oldest queued buffer of `buf_type`, optionally flagging
    /// it bad. Returns `false` if none is queued.
    ///
    /// Capture buffers take the timestamp of the last finished output
    /// buffer and report every plane full.
    pub fn complete_next(&self, buf_type: BufType, error: bool) -> bool {
        let mut st = self.lock();
        let Some(qb) = st.queued.get_mut(&buf_type).and_then(VecDeque::pop_front) else {
            return false;
        };
        let is_capture = matches!(buf_type, BufType::VideoCapture | BufType::VideoCaptureMplane);
        let timestamp = if is_capture {
            st.last_src_timestamp
        } else {
            st.last_src_timestamp = qb.timestamp;
            qb.timestamp
        };
        let bytesused = qb
            .planes
            .iter()
            .map(|p| if is_capture { p.length } else { p.bytesused })
            .collect();
        let done = DequeuedBuffer {
            index: qb.index,
            fd: qb.planes.first().map_or(-1, |p| p.fd),
            flags: if error { V4L2_BUF_FLAG_ERROR } else { 0 },
            timestamp,
            bytesused,
        };
        st.done.entry(buf_type).or_default().push_back(done);
        true
    }

    /// Finish the oldest output and capture buffers as one decoded frame.
    pub fn complete_frame(&self, error: bool) {
        let (output, capture) = {
            let st = self.lock();
            let capture = Self::capture_type(&st);
            let output = if capture.is_multiplanar() {
                BufType::VideoOutputMplane
            } else {
                BufType::VideoOutput
            };
            (output, capture)
        };
        self.complete_next(output, false);
        self.complete_next(capture, error);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Buffers of `buf_type` queued and not yet completed.
    pub fn queued_count(&self, buf_type: BufType) -> usize {
        self.lock().queued.get(&buf_type).map_or(0, VecDeque::len)
    }

    /// Most recently queued buffer of `buf_type` still held by the device.
    pub fn last_queued(&self, buf_type: BufType) -> Option<QueueBuffer> {
        self.lock()
            .queued
            .get(&buf_type)
            .and_then(|q| q.back().cloned())
    }

    /// Every stream on/off call, in order.
    pub fn stream_calls(&self) -> Vec<(BufType, bool)> {
        self.lock().stream_calls.clone()
    }

    /// Whether `buf_type` is streaming.
    pub fn is_streaming(&self, buf_type: BufType) -> bool {
        self.lock().streaming.contains(&buf_type)
    }

    /// Buffer types released with a zero-count `VIDIOC_REQBUFS`.
    pub fn released_buffer_types(&self) -> Vec<BufType> {
        self.lock().released.clone()
    }

    /// Buffers currently granted for `buf_type`.
    pub fn granted(&self, buf_type: BufType) -> u32 {
        self.lock().granted.get(&buf_type).copied().unwrap_or(0)
    }

    /// Controls set against requests, as `(request fd, control)`.
    pub fn request_controls(&self) -> Vec<(RawFd, ExtControl)> {
        self.lock().request_controls.clone()
    }

    /// Current value of a control set without a request.
    pub fn control(&self, id: u32) -> Option<CtrlValue> {
        self.lock().controls.get(&id).cloned()
    }

    /// Subscribed `(type, id)` events.
    pub fn events(&self) -> Vec<(u32, u32)> {
        self.lock().events.clone()
    }
}

impl Default for MockVideoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDevice for MockVideoDevice {
    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.inner.poll.as_fd()
    }

    fn query_caps(&self) -> Result<Capability, Errno> {
        Ok(Capability {
            driver: "mock-m2m".into(),
            card: "mock decoder".into(),
            bus_info: "platform:mock".into(),
            capabilities: self.lock().caps,
            device_caps: 0,
        })
    }

    fn enum_format(&self, buf_type: BufType, index: u32) -> Result<FormatDesc, Errno> {
        let st = self.lock();
        let desc = if buf_type == Self::capture_type(&st) {
            st.capture_formats.get(index as usize).map(|f| (f.fourcc, f.emulated))
        } else {
            st.output_formats.get(index as usize).map(|&f| (f, false))
        };
        let (pixelformat, emulated) = desc.ok_or(Errno::INVAL)?;
        Ok(FormatDesc {
            index,
            buf_type,
            flags: if emulated { V4L2_FMT_FLAG_EMULATED } else { 0 },
            description: pixelformat.to_string(),
            pixelformat,
        })
    }

    fn set_format(&self, format: &Format) -> Result<Format, Errno> {
        let st = self.lock();
        if st.fail_set_format {
            return Err(Errno::INVAL);
        }
        let mut got = format.clone();
        let is_capture = format.buf_type == Self::capture_type(&st);

        let (max_w, max_h) = if is_capture {
            match st.capture_formats.iter().find(|f| f.fourcc == format.pixelformat) {
                Some(f) => (f.max_width, f.max_height),
                None => {
                    let first = st.capture_formats.first().ok_or(Errno::INVAL)?;
                    got.pixelformat = first.fourcc;
                    (first.max_width, first.max_height)
                }
            }
        } else {
            if !st.output_formats.contains(&format.pixelformat) {
                got.pixelformat = *st.output_formats.first().ok_or(Errno::INVAL)?;
            }
            (u32::MAX, u32::MAX)
        };
        let (clamp_w, clamp_h) = st.clamp.unwrap_or((u32::MAX, u32::MAX));
        got.width = got.width.min(max_w).min(clamp_w);
        got.height = got.height.min(max_h).min(clamp_h);

        got.planes = if is_capture {
            let luma = got.width * got.height;
            let n = if format.buf_type.is_multiplanar() {
                st.capture_planes
            } else {
                1
            };
            (0..n)
                .map(|i| PlaneFormat {
                    sizeimage: if i == 0 { luma.max(1) } else { (luma / 2).max(1) },
                    bytesperline: got.width,
                })
                .collect()
        } else {
            let sizeimage = format
                .planes
                .first()
                .map_or(DEFAULT_SRC_SIZEIMAGE, |p| p.sizeimage.max(1));
            vec![PlaneFormat {
                sizeimage,
                bytesperline: 0,
            }]
        };
        Ok(got)
    }

    fn request_buffers(&self, buf_type: BufType, _memory: Memory, count: u32) -> Result<u32, Errno> {
        let mut st = self.lock();
        if count == 0 {
            st.released.push(buf_type);
            st.granted.remove(&buf_type);
            st.queued.remove(&buf_type);
            st.done.remove(&buf_type);
            return Ok(0);
        }
        let granted = st.grant_limit.map_or(count, |limit| count.min(limit));
        st.granted.insert(buf_type, granted);
        Ok(granted)
    }

    fn create_buffer(&self, _format: &Format, _memory: Memory) -> Result<u32, Errno> {
        let mut st = self.lock();
        if st.fail_create {
            return Err(Errno::NOMEM);
        }
        let index = st.next_slot;
        st.next_slot += 1;
        Ok(index)
    }

    fn queue_buffer(&self, buffer: &QueueBuffer) -> Result<(), Errno> {
        let mut st = self.lock();
        if st.fail_queue.contains(&buffer.buf_type) || buffer.planes.is_empty() {
            return Err(Errno::INVAL);
        }
        st.queued
            .entry(buffer.buf_type)
            .or_default()
            .push_back(buffer.clone());
        Ok(())
    }

    fn dequeue_buffer(&self, buf_type: BufType, _num_planes: usize) -> Result<DequeuedBuffer, Errno> {
        self.lock()
            .done
            .get_mut(&buf_type)
            .and_then(VecDeque::pop_front)
            .ok_or(Errno::AGAIN)
    }

    fn set_stream(&self, buf_type: BufType, enable: bool) -> Result<(), Errno> {
        let mut st = self.lock();
        st.stream_calls.push((buf_type, enable));
        let failing = if enable {
            &st.fail_stream_on
        } else {
            &st.fail_stream_off
        };
        if failing.contains(&buf_type) {
            return Err(Errno::IO);
        }
        if enable {
            st.streaming.insert(buf_type);
        } else {
            // Stopping hands every buffer back
            st.streaming.remove(&buf_type);
            st.queued.remove(&buf_type);
            st.done.remove(&buf_type);
        }
        Ok(())
    }

    fn set_ext_ctrls(&self, request_fd: Option<RawFd>, controls: &mut [ExtControl]) -> Result<(), Errno> {
        let mut st = self.lock();
        if controls.iter().any(|c| !st.known_controls.contains(&c.id)) {
            return Err(Errno::INVAL);
        }
        for ctrl in controls.iter() {
            match request_fd {
                Some(fd) => st.request_controls.push((fd, ctrl.clone())),
                None => {
                    st.controls.insert(ctrl.id, ctrl.value.clone());
                }
            }
        }
        Ok(())
    }

    fn get_ext_ctrls(&self, controls: &mut [ExtControl]) -> Result<(), Errno> {
        let st = self.lock();
        for ctrl in controls.iter_mut() {
            ctrl.value = st.controls.get(&ctrl.id).cloned().ok_or(Errno::INVAL)?;
        }
        Ok(())
    }

    fn query_ext_ctrl(&self, id: u32) -> Result<QueryExtCtrl, Errno> {
        if !self.lock().known_controls.contains(&id) {
            return Err(Errno::INVAL);
        }
        Ok(QueryExtCtrl {
            id,
            ctrl_type: COMPOUND_CTRL_TYPE,
            name: format!("mock control {:#x}", id),
            elem_size: 4,
            elems: 1,
            ..Default::default()
        })
    }

    fn subscribe_event(&self, event_type: u32, id: u32) -> Result<(), Errno> {
        self.lock().events.push((event_type, id));
        Ok(())
    }
}

impl std::fmt::Debug for MockVideoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("MockVideoDevice")
            .field("caps", &format_args!("{:#x}", st.caps))
            .field("streaming", &st.streaming)
            .finish()
    }
}
