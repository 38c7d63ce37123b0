//! Raw V4L2, media-request and DMA-BUF kernel ABI.
//!
//! Only the structures and ioctls this crate issues are declared. Layouts
//! follow `linux/videodev2.h`, `linux/media.h`, `linux/dma-buf.h` and
//! `linux/dma-heap.h` for 64-bit targets; the size assertions at the bottom
//! pin them to the values the kernel encodes in the ioctl numbers.
//! See: https://www.kernel.org/doc/html/latest/userspace-api/media/v4l/user-func.html

#![allow(missing_docs)]

use rustix::io::Errno;
use std::os::fd::RawFd;

/// ioctl request number type as taken by `libc::ioctl`.
pub type IoctlNr = libc::c_ulong;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> IoctlNr {
    ((dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32) as IoctlNr
}

const fn io(ty: u8, nr: u8) -> IoctlNr {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn ior<T>(ty: u8, nr: u8) -> IoctlNr {
    ioc(IOC_READ, ty, nr, std::mem::size_of::<T>())
}

const fn iow<T>(ty: u8, nr: u8) -> IoctlNr {
    ioc(IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> IoctlNr {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

// ============================================================================
// Constants
// ============================================================================

pub const VIDEO_MAX_PLANES: usize = 8;

pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_FMT_FLAG_COMPRESSED: u32 = 0x0001;
pub const V4L2_FMT_FLAG_EMULATED: u32 = 0x0002;

pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF: u32 = 0x0000_0200;
pub const V4L2_BUF_FLAG_REQUEST_FD: u32 = 0x0080_0000;

pub const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;
pub const V4L2_CTRL_WHICH_REQUEST_VAL: u32 = 0x0f01_0000;

pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
pub const DMA_BUF_SYNC_START: u64 = 0;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

// ============================================================================
// Structures
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Fmtdesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// The `fmt` union of `struct v4l2_format`. The kernel union contains
/// pointer-bearing members, hence the 8-byte alignment.
#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub pix_mp: V4l2PixFormatMplane,
    pub raw_data: [u8; 200],
    _align: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2CreateBuffers {
    pub index: u32,
    pub count: u32,
    pub memory: u32,
    pub format: V4l2Format,
    pub capabilities: u32,
    pub flags: u32,
    pub max_num_buffers: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2PlaneM {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: V4l2PlaneM,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut V4l2Plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2ExtControlValue {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut libc::c_void,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub u: V4l2ExtControlValue,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut V4l2ExtControl,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2QueryExtCtrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; 4],
    pub reserved: [u32; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DmaBufSync {
    pub flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DmaHeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

// ============================================================================
// ioctl numbers
// ============================================================================

pub const VIDIOC_QUERYCAP: IoctlNr = ior::<V4l2Capability>(b'V', 0);
pub const VIDIOC_ENUM_FMT: IoctlNr = iowr::<V4l2Fmtdesc>(b'V', 2);
pub const VIDIOC_G_FMT: IoctlNr = iowr::<V4l2Format>(b'V', 4);
pub const VIDIOC_S_FMT: IoctlNr = iowr::<V4l2Format>(b'V', 5);
pub const VIDIOC_REQBUFS: IoctlNr = iowr::<V4l2RequestBuffers>(b'V', 8);
pub const VIDIOC_QBUF: IoctlNr = iowr::<V4l2Buffer>(b'V', 15);
pub const VIDIOC_DQBUF: IoctlNr = iowr::<V4l2Buffer>(b'V', 17);
pub const VIDIOC_STREAMON: IoctlNr = iow::<libc::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: IoctlNr = iow::<libc::c_int>(b'V', 19);
pub const VIDIOC_G_EXT_CTRLS: IoctlNr = iowr::<V4l2ExtControls>(b'V', 71);
pub const VIDIOC_S_EXT_CTRLS: IoctlNr = iowr::<V4l2ExtControls>(b'V', 72);
pub const VIDIOC_SUBSCRIBE_EVENT: IoctlNr = iow::<V4l2EventSubscription>(b'V', 90);
pub const VIDIOC_CREATE_BUFS: IoctlNr = iowr::<V4l2CreateBuffers>(b'V', 92);
pub const VIDIOC_QUERY_EXT_CTRL: IoctlNr = iowr::<V4l2QueryExtCtrl>(b'V', 103);

pub const MEDIA_IOC_REQUEST_ALLOC: IoctlNr = ior::<libc::c_int>(b'|', 0x05);
pub const MEDIA_REQUEST_IOC_QUEUE: IoctlNr = io(b'|', 0x80);
pub const MEDIA_REQUEST_IOC_REINIT: IoctlNr = io(b'|', 0x81);

pub const DMA_BUF_IOCTL_SYNC: IoctlNr = iow::<DmaBufSync>(b'b', 0);
pub const DMA_HEAP_IOCTL_ALLOC: IoctlNr = iowr::<DmaHeapAllocationData>(b'H', 0);

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(std::mem::size_of::<V4l2Capability>() == 104);
    assert!(std::mem::size_of::<V4l2Fmtdesc>() == 64);
    assert!(std::mem::size_of::<V4l2PixFormatMplane>() == 192);
    assert!(std::mem::size_of::<V4l2Format>() == 208);
    assert!(std::mem::size_of::<V4l2RequestBuffers>() == 20);
    assert!(std::mem::size_of::<V4l2CreateBuffers>() == 256);
    assert!(std::mem::size_of::<V4l2Plane>() == 64);
    assert!(std::mem::size_of::<V4l2Buffer>() == 88);
    assert!(std::mem::size_of::<V4l2ExtControl>() == 20);
    assert!(std::mem::size_of::<V4l2ExtControls>() == 32);
    assert!(std::mem::size_of::<V4l2QueryExtCtrl>() == 232);
    assert!(std::mem::size_of::<V4l2EventSubscription>() == 32);
    assert!(std::mem::size_of::<DmaHeapAllocationData>() == 24);
};

// ============================================================================
// Helpers
// ============================================================================

/// Zero-initialise one of the plain-old-data ABI structures above.
///
/// # Safety
///
/// `T` must be a `#[repr(C)]` type made only of integers, arrays, unions of
/// those and raw pointers, for which the all-zero bit pattern is valid.
pub unsafe fn zeroed<T: Copy>() -> T {
    // SAFETY: guaranteed by the caller.
    unsafe { std::mem::zeroed() }
}

/// Issue an ioctl, retrying while it is interrupted by a signal.
///
/// # Safety
///
/// `arg` must point to a value of the type the request number encodes (or be
/// null for argument-less requests) and stay valid for the call.
pub unsafe fn xioctl<T>(fd: RawFd, request: IoctlNr, arg: *mut T) -> Result<(), Errno> {
    loop {
        // SAFETY: upheld by the caller.
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret != -1 {
            return Ok(());
        }
        let errno = Errno::from_raw_os_error(
            std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO),
        );
        if errno != Errno::INTR {
            return Err(errno);
        }
    }
}

/// Decode a NUL-padded fixed-size kernel string.
pub fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
