//! Typed view of the V4L2 memory-to-memory interface.
//!
//! The buffer and request pools never touch the raw ABI directly. They talk
//! to a [`VideoDevice`], which the real [`V4l2Device`] implements with ioctls
//! and `testing::MockVideoDevice` (behind the `testing` feature) implements
//! in memory for tests.
//!
//! Buffers are always exchanged with the driver as DMA-BUF file descriptors,
//! and a completed buffer is identified by the descriptor of its first plane,
//! never by its kernel index.

mod device;
pub mod sys;

pub use device::V4l2Device;

use rustix::io::Errno;
use std::fmt;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// Maximum number of planes a buffer can carry.
pub const VIDEO_MAX_PLANES: usize = sys::VIDEO_MAX_PLANES;

/// A four-character pixel or bitstream format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub u32);

impl FourCc {
    /// Build a code from its four ASCII bytes (e.g. `b"NV12"`).
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    /// The four ASCII bytes of this code.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({} / {:#010x})", self, self.0)
    }
}

/// V4L2 buffer queue type used by an M2M device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufType {
    /// Single-planar capture (decoded frames out).
    VideoCapture,
    /// Single-planar output (bitstream in).
    VideoOutput,
    /// Multi-planar capture.
    VideoCaptureMplane,
    /// Multi-planar output.
    VideoOutputMplane,
}

impl BufType {
    /// Raw `enum v4l2_buf_type` value.
    pub fn raw(self) -> u32 {
        match self {
            BufType::VideoCapture => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            BufType::VideoOutput => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            BufType::VideoCaptureMplane => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            BufType::VideoOutputMplane => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
        }
    }

    /// Parse a raw buffer type; `None` for types this crate does not drive.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            sys::V4L2_BUF_TYPE_VIDEO_CAPTURE => Some(BufType::VideoCapture),
            sys::V4L2_BUF_TYPE_VIDEO_OUTPUT => Some(BufType::VideoOutput),
            sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE => Some(BufType::VideoCaptureMplane),
            sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE => Some(BufType::VideoOutputMplane),
            _ => None,
        }
    }

    /// Whether buffers of this type carry a plane array.
    pub fn is_multiplanar(self) -> bool {
        matches!(self, BufType::VideoCaptureMplane | BufType::VideoOutputMplane)
    }
}

/// Buffer memory model passed to `VIDIOC_REQBUFS` / `VIDIOC_CREATE_BUFS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// Driver-allocated, mmap'able buffers.
    Mmap,
    /// Externally allocated DMA-BUF buffers.
    DmaBuf,
}

impl Memory {
    /// Raw `enum v4l2_memory` value.
    pub fn raw(self) -> u32 {
        match self {
            Memory::Mmap => sys::V4L2_MEMORY_MMAP,
            Memory::DmaBuf => sys::V4L2_MEMORY_DMABUF,
        }
    }
}

/// Result of `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, Default)]
pub struct Capability {
    /// Driver name.
    pub driver: String,
    /// Card name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Capabilities of the physical device.
    pub capabilities: u32,
    /// Capabilities of this node (valid when `V4L2_CAP_DEVICE_CAPS` is set).
    pub device_caps: u32,
}

impl Capability {
    /// The capability set that applies to this node.
    pub fn effective_caps(&self) -> u32 {
        if self.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

/// One entry of `VIDIOC_ENUM_FMT`.
#[derive(Debug, Clone)]
pub struct FormatDesc {
    /// Enumeration index.
    pub index: u32,
    /// Queue the format belongs to.
    pub buf_type: BufType,
    /// `V4L2_FMT_FLAG_*` bits.
    pub flags: u32,
    /// Human readable description.
    pub description: String,
    /// Format code.
    pub pixelformat: FourCc,
}

impl FormatDesc {
    /// Whether the driver emulates this format in software.
    pub fn is_emulated(&self) -> bool {
        self.flags & sys::V4L2_FMT_FLAG_EMULATED != 0
    }
}

/// Per-plane layout of a negotiated format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    /// Maximum bytes a plane of this format occupies.
    pub sizeimage: u32,
    /// Line stride in bytes.
    pub bytesperline: u32,
}

/// A negotiated (or requested) queue format.
///
/// Single-planar formats are represented with exactly one entry in
/// `planes`, holding `pix.sizeimage` / `pix.bytesperline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Queue this format applies to.
    pub buf_type: BufType,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel or bitstream format.
    pub pixelformat: FourCc,
    /// Plane layouts.
    pub planes: Vec<PlaneFormat>,
}

impl Format {
    /// An unset format for `buf_type`.
    pub fn empty(buf_type: BufType) -> Self {
        Self {
            buf_type,
            width: 0,
            height: 0,
            pixelformat: FourCc::default(),
            planes: Vec::new(),
        }
    }

    /// Number of planes the format describes.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Encode into the kernel representation.
    pub fn to_raw(&self) -> sys::V4l2Format {
        // SAFETY: V4l2Format is plain data.
        let mut raw: sys::V4l2Format = unsafe { sys::zeroed() };
        raw.type_ = self.buf_type.raw();

        if self.buf_type.is_multiplanar() {
            // SAFETY: as above.
            let mut mp: sys::V4l2PixFormatMplane = unsafe { sys::zeroed() };
            mp.width = self.width;
            mp.height = self.height;
            mp.pixelformat = self.pixelformat.0;
            let n = self.planes.len().min(VIDEO_MAX_PLANES);
            for (i, plane) in self.planes.iter().take(n).enumerate() {
                mp.plane_fmt[i].sizeimage = plane.sizeimage;
                mp.plane_fmt[i].bytesperline = plane.bytesperline;
            }
            mp.num_planes = n as u8;
            raw.fmt.pix_mp = mp;
        } else {
            // SAFETY: as above.
            let mut pix: sys::V4l2PixFormat = unsafe { sys::zeroed() };
            pix.width = self.width;
            pix.height = self.height;
            pix.pixelformat = self.pixelformat.0;
            if let Some(plane) = self.planes.first() {
                pix.sizeimage = plane.sizeimage;
                pix.bytesperline = plane.bytesperline;
            }
            raw.fmt.pix = pix;
        }
        raw
    }

    /// Decode from the kernel representation.
    pub fn from_raw(raw: &sys::V4l2Format) -> Option<Self> {
        let buf_type = BufType::from_raw(raw.type_)?;

        if buf_type.is_multiplanar() {
            // SAFETY: the kernel fills `pix_mp` for multi-planar types.
            let mp = unsafe { raw.fmt.pix_mp };
            let n = (mp.num_planes as usize).min(VIDEO_MAX_PLANES);
            let planes = (0..n)
                .map(|i| {
                    let p = mp.plane_fmt[i];
                    PlaneFormat {
                        sizeimage: p.sizeimage,
                        bytesperline: p.bytesperline,
                    }
                })
                .collect();
            Some(Self {
                buf_type,
                width: mp.width,
                height: mp.height,
                pixelformat: FourCc(mp.pixelformat),
                planes,
            })
        } else {
            // SAFETY: the kernel fills `pix` for single-planar types.
            let pix = unsafe { raw.fmt.pix };
            Some(Self {
                buf_type,
                width: pix.width,
                height: pix.height,
                pixelformat: FourCc(pix.pixelformat),
                planes: vec![PlaneFormat {
                    sizeimage: pix.sizeimage,
                    bytesperline: pix.bytesperline,
                }],
            })
        }
    }
}

/// One plane of a buffer handed to `VIDIOC_QBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlane {
    /// DMA-BUF descriptor backing the plane.
    pub fd: RawFd,
    /// Allocated size of the plane.
    pub length: u32,
    /// Bytes of payload.
    pub bytesused: u32,
}

/// A buffer to queue on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBuffer {
    /// Queue to put the buffer on.
    pub buf_type: BufType,
    /// Kernel slot index.
    pub index: u32,
    /// Planes; single-planar buffers carry exactly one.
    pub planes: Vec<QueuePlane>,
    /// `V4L2_BUF_FLAG_*` bits.
    pub flags: u32,
    /// Request the buffer is bound to, if any.
    pub request_fd: Option<RawFd>,
    /// Timestamp copied through to the matching capture buffer.
    pub timestamp: Duration,
}

/// A buffer returned by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Kernel slot index.
    pub index: u32,
    /// Descriptor of the first plane, the identity used to find the entry.
    pub fd: RawFd,
    /// `V4L2_BUF_FLAG_*` bits.
    pub flags: u32,
    /// Timestamp carried by the buffer.
    pub timestamp: Duration,
    /// Bytes of payload per plane.
    pub bytesused: Vec<u32>,
}

impl DequeuedBuffer {
    /// Whether the driver flagged the buffer as corrupt.
    pub fn is_error(&self) -> bool {
        self.flags & sys::V4L2_BUF_FLAG_ERROR != 0
    }
}

/// Value of an extended control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlValue {
    /// 32-bit integer control.
    I32(i32),
    /// 64-bit integer control.
    I64(i64),
    /// Compound control payload (codec parameter structures).
    Compound(Vec<u8>),
}

/// An extended control to set or get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtControl {
    /// Control id.
    pub id: u32,
    /// Control value.
    pub value: CtrlValue,
}

impl ExtControl {
    /// A compound control carrying `data`.
    pub fn compound(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            value: CtrlValue::Compound(data.to_vec()),
        }
    }

    /// A 32-bit integer control.
    pub fn int(id: u32, value: i32) -> Self {
        Self {
            id,
            value: CtrlValue::I32(value),
        }
    }
}

/// Result of `VIDIOC_QUERY_EXT_CTRL`.
///
/// A `ctrl_type` of 0 marks a control the driver does not know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryExtCtrl {
    /// Control id that was queried.
    pub id: u32,
    /// `V4L2_CTRL_TYPE_*`, or 0 if unknown.
    pub ctrl_type: u32,
    /// Driver-supplied name.
    pub name: String,
    /// Minimum value.
    pub minimum: i64,
    /// Maximum value.
    pub maximum: i64,
    /// Value step.
    pub step: u64,
    /// Default value.
    pub default_value: i64,
    /// `V4L2_CTRL_FLAG_*`.
    pub flags: u32,
    /// Size of one element in bytes.
    pub elem_size: u32,
    /// Number of elements.
    pub elems: u32,
    /// Array dimensions; empty for scalars.
    pub dims: Vec<u32>,
}

/// The ioctl surface of a V4L2 M2M video node.
///
/// Every method is a single kernel call. Implementations retry interrupted
/// calls internally, so `Errno::INTR` is never returned.
pub trait VideoDevice: Send + Sync {
    /// Descriptor to poll for buffer completion.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// `VIDIOC_QUERYCAP`.
    fn query_caps(&self) -> Result<Capability, Errno>;

    /// `VIDIOC_ENUM_FMT`; `Errno::INVAL` past the last format.
    fn enum_format(&self, buf_type: BufType, index: u32) -> Result<FormatDesc, Errno>;

    /// `VIDIOC_S_FMT`; returns what the driver actually selected.
    fn set_format(&self, format: &Format) -> Result<Format, Errno>;

    /// `VIDIOC_REQBUFS`; returns the number of buffers granted.
    fn request_buffers(&self, buf_type: BufType, memory: Memory, count: u32) -> Result<u32, Errno>;

    /// `VIDIOC_CREATE_BUFS` for a single buffer; returns its index.
    fn create_buffer(&self, format: &Format, memory: Memory) -> Result<u32, Errno>;

    /// `VIDIOC_QBUF` with DMA-BUF memory.
    fn queue_buffer(&self, buffer: &QueueBuffer) -> Result<(), Errno>;

    /// `VIDIOC_DQBUF` with DMA-BUF memory.
    fn dequeue_buffer(&self, buf_type: BufType, num_planes: usize) -> Result<DequeuedBuffer, Errno>;

    /// `VIDIOC_STREAMON` / `VIDIOC_STREAMOFF`.
    fn set_stream(&self, buf_type: BufType, enable: bool) -> Result<(), Errno>;

    /// `VIDIOC_S_EXT_CTRLS`, scoped to `request_fd` when given.
    fn set_ext_ctrls(&self, request_fd: Option<RawFd>, controls: &mut [ExtControl]) -> Result<(), Errno>;

    /// `VIDIOC_G_EXT_CTRLS` for current values.
    fn get_ext_ctrls(&self, controls: &mut [ExtControl]) -> Result<(), Errno>;

    /// `VIDIOC_QUERY_EXT_CTRL`.
    fn query_ext_ctrl(&self, id: u32) -> Result<QueryExtCtrl, Errno>;

    /// `VIDIOC_SUBSCRIBE_EVENT`.
    fn subscribe_event(&self, event_type: u32, id: u32) -> Result<(), Errno>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc() {
        let nv12 = FourCc::new(b"NV12");
        assert_eq!(nv12.0, 0x3231_564e);
        assert_eq!(nv12.to_string(), "NV12");
        assert_eq!(nv12.to_bytes(), *b"NV12");
    }

    #[test]
    fn test_buf_type_raw_roundtrip() {
        for ty in [
            BufType::VideoCapture,
            BufType::VideoOutput,
            BufType::VideoCaptureMplane,
            BufType::VideoOutputMplane,
        ] {
            assert_eq!(BufType::from_raw(ty.raw()), Some(ty));
        }
        assert_eq!(BufType::from_raw(3), None);
        assert!(BufType::VideoOutputMplane.is_multiplanar());
        assert!(!BufType::VideoCapture.is_multiplanar());
    }

    #[test]
    fn test_effective_caps() {
        let caps = Capability {
            capabilities: sys::V4L2_CAP_DEVICE_CAPS | sys::V4L2_CAP_VIDEO_M2M,
            device_caps: sys::V4L2_CAP_VIDEO_M2M_MPLANE,
            ..Default::default()
        };
        assert_eq!(caps.effective_caps(), sys::V4L2_CAP_VIDEO_M2M_MPLANE);

        let legacy = Capability {
            capabilities: sys::V4L2_CAP_VIDEO_M2M,
            ..Default::default()
        };
        assert_eq!(legacy.effective_caps(), sys::V4L2_CAP_VIDEO_M2M);
    }

    #[test]
    fn test_mplane_format_raw() {
        let fmt = Format {
            buf_type: BufType::VideoCaptureMplane,
            width: 1920,
            height: 1088,
            pixelformat: FourCc::new(b"NV12"),
            planes: vec![
                PlaneFormat {
                    sizeimage: 1920 * 1088,
                    bytesperline: 1920,
                },
                PlaneFormat {
                    sizeimage: 1920 * 1088 / 2,
                    bytesperline: 1920,
                },
            ],
        };

        let raw = fmt.to_raw();
        assert_eq!(raw.type_, sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);
        assert_eq!(Format::from_raw(&raw), Some(fmt));
    }

    #[test]
    fn test_single_plane_format_raw() {
        let fmt = Format {
            buf_type: BufType::VideoOutput,
            width: 640,
            height: 480,
            pixelformat: FourCc::new(b"S264"),
            planes: vec![PlaneFormat {
                sizeimage: 256 * 1024,
                bytesperline: 0,
            }],
        };

        let raw = fmt.to_raw();
        // SAFETY: written as `pix` above.
        let pix = unsafe { raw.fmt.pix };
        assert_eq!(pix.sizeimage, 256 * 1024);
        assert_eq!(Format::from_raw(&raw), Some(fmt));
    }
}
