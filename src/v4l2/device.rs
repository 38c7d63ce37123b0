//! ioctl-backed [`VideoDevice`].

use super::sys::{self, xioctl};
use super::{
    BufType, Capability, CtrlValue, DequeuedBuffer, ExtControl, Format, FormatDesc, FourCc,
    Memory, QueryExtCtrl, QueueBuffer, VideoDevice, VIDEO_MAX_PLANES,
};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An open V4L2 video node.
#[derive(Debug)]
pub struct V4l2Device {
    fd: OwnedFd,
    path: PathBuf,
}

impl V4l2Device {
    /// Open the video node at `path` read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Errno> {
        let path = path.as_ref();
        let fd = loop {
            match rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Err(Errno::INTR) => continue,
                other => break other?,
            }
        };
        tracing::debug!(path = %path.display(), "opened video device");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn timeval(ts: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: ts.as_secs() as libc::time_t,
        tv_usec: ts.subsec_micros() as libc::suseconds_t,
    }
}

fn duration(tv: &libc::timeval) -> Duration {
    if tv.tv_sec < 0 || tv.tv_usec < 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

/// Marshal controls into the kernel layout. Compound payloads are pointed at
/// in place, so `controls` must outlive the returned vector's use.
fn raw_controls(controls: &mut [ExtControl]) -> Vec<sys::V4l2ExtControl> {
    controls
        .iter_mut()
        .map(|ctrl| {
            // SAFETY: plain data.
            let mut raw: sys::V4l2ExtControl = unsafe { sys::zeroed() };
            raw.id = ctrl.id;
            match &mut ctrl.value {
                CtrlValue::I32(v) => raw.u = sys::V4l2ExtControlValue { value: *v },
                CtrlValue::I64(v) => raw.u = sys::V4l2ExtControlValue { value64: *v },
                CtrlValue::Compound(data) => {
                    raw.size = data.len() as u32;
                    raw.u = sys::V4l2ExtControlValue {
                        ptr: data.as_mut_ptr().cast(),
                    };
                }
            }
            raw
        })
        .collect()
}

impl V4l2Device {
    fn ext_ctrls(
        &self,
        request: sys::IoctlNr,
        which: u32,
        request_fd: Option<RawFd>,
        controls: &mut [ExtControl],
    ) -> Result<(), Errno> {
        let mut raw = raw_controls(controls);

        // SAFETY: plain data.
        let mut arg: sys::V4l2ExtControls = unsafe { sys::zeroed() };
        arg.which = which;
        arg.count = raw.len() as u32;
        arg.request_fd = request_fd.unwrap_or(0);
        arg.controls = raw.as_mut_ptr();

        // SAFETY: `arg` points at `raw`, which points at `controls`; all live
        // for the duration of the call.
        unsafe { xioctl(self.raw(), request, &mut arg)? };

        for (ctrl, r) in controls.iter_mut().zip(raw.iter()) {
            let u = r.u;
            match &mut ctrl.value {
                // SAFETY: the kernel wrote the member matching the control type.
                CtrlValue::I32(v) => *v = unsafe { u.value },
                // SAFETY: as above.
                CtrlValue::I64(v) => *v = unsafe { u.value64 },
                CtrlValue::Compound(_) => {}
            }
        }
        Ok(())
    }
}

impl VideoDevice for V4l2Device {
    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn query_caps(&self) -> Result<Capability, Errno> {
        // SAFETY: plain data.
        let mut cap: sys::V4l2Capability = unsafe { sys::zeroed() };
        // SAFETY: VIDIOC_QUERYCAP takes a v4l2_capability.
        unsafe { xioctl(self.raw(), sys::VIDIOC_QUERYCAP, &mut cap)? };
        Ok(Capability {
            driver: sys::c_str(&cap.driver),
            card: sys::c_str(&cap.card),
            bus_info: sys::c_str(&cap.bus_info),
            capabilities: cap.capabilities,
            device_caps: cap.device_caps,
        })
    }

    fn enum_format(&self, buf_type: BufType, index: u32) -> Result<FormatDesc, Errno> {
        // SAFETY: plain data.
        let mut desc: sys::V4l2Fmtdesc = unsafe { sys::zeroed() };
        desc.index = index;
        desc.type_ = buf_type.raw();
        // SAFETY: VIDIOC_ENUM_FMT takes a v4l2_fmtdesc.
        unsafe { xioctl(self.raw(), sys::VIDIOC_ENUM_FMT, &mut desc)? };
        Ok(FormatDesc {
            index,
            buf_type,
            flags: desc.flags,
            description: sys::c_str(&desc.description),
            pixelformat: FourCc(desc.pixelformat),
        })
    }

    fn set_format(&self, format: &Format) -> Result<Format, Errno> {
        let mut raw = format.to_raw();
        // SAFETY: VIDIOC_S_FMT takes a v4l2_format.
        unsafe { xioctl(self.raw(), sys::VIDIOC_S_FMT, &mut raw)? };
        Format::from_raw(&raw).ok_or(Errno::INVAL)
    }

    fn request_buffers(&self, buf_type: BufType, memory: Memory, count: u32) -> Result<u32, Errno> {
        // SAFETY: plain data.
        let mut req: sys::V4l2RequestBuffers = unsafe { sys::zeroed() };
        req.count = count;
        req.type_ = buf_type.raw();
        req.memory = memory.raw();
        // SAFETY: VIDIOC_REQBUFS takes a v4l2_requestbuffers.
        unsafe { xioctl(self.raw(), sys::VIDIOC_REQBUFS, &mut req)? };
        Ok(req.count)
    }

    fn create_buffer(&self, format: &Format, memory: Memory) -> Result<u32, Errno> {
        // SAFETY: plain data.
        let mut create: sys::V4l2CreateBuffers = unsafe { sys::zeroed() };
        create.count = 1;
        create.memory = memory.raw();
        create.format = format.to_raw();
        // SAFETY: VIDIOC_CREATE_BUFS takes a v4l2_create_buffers.
        unsafe { xioctl(self.raw(), sys::VIDIOC_CREATE_BUFS, &mut create)? };
        if create.count == 0 {
            return Err(Errno::NOMEM);
        }
        Ok(create.index)
    }

    fn queue_buffer(&self, buffer: &QueueBuffer) -> Result<(), Errno> {
        // SAFETY: plain data.
        let mut buf: sys::V4l2Buffer = unsafe { sys::zeroed() };
        // SAFETY: plain data.
        let mut planes: [sys::V4l2Plane; VIDEO_MAX_PLANES] = unsafe { sys::zeroed() };

        buf.index = buffer.index;
        buf.type_ = buffer.buf_type.raw();
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        buf.flags = buffer.flags;
        buf.timestamp = timeval(buffer.timestamp);
        if let Some(fd) = buffer.request_fd {
            buf.request_fd = fd;
            buf.flags |= sys::V4L2_BUF_FLAG_REQUEST_FD;
        }

        if buffer.buf_type.is_multiplanar() {
            let n = buffer.planes.len().min(VIDEO_MAX_PLANES);
            for (raw, plane) in planes.iter_mut().zip(buffer.planes.iter()) {
                raw.bytesused = plane.bytesused;
                raw.length = plane.length;
                raw.m.fd = plane.fd;
            }
            buf.length = n as u32;
            buf.m.planes = planes.as_mut_ptr();
        } else {
            let plane = buffer.planes.first().ok_or(Errno::INVAL)?;
            buf.bytesused = plane.bytesused;
            buf.length = plane.length;
            buf.m.fd = plane.fd;
        }

        // SAFETY: VIDIOC_QBUF takes a v4l2_buffer; `planes` outlives the call.
        unsafe { xioctl(self.raw(), sys::VIDIOC_QBUF, &mut buf) }
    }

    fn dequeue_buffer(&self, buf_type: BufType, num_planes: usize) -> Result<DequeuedBuffer, Errno> {
        // SAFETY: plain data.
        let mut buf: sys::V4l2Buffer = unsafe { sys::zeroed() };
        // SAFETY: plain data.
        let mut planes: [sys::V4l2Plane; VIDEO_MAX_PLANES] = unsafe { sys::zeroed() };

        buf.type_ = buf_type.raw();
        buf.memory = sys::V4L2_MEMORY_DMABUF;
        if buf_type.is_multiplanar() {
            buf.length = num_planes.clamp(1, VIDEO_MAX_PLANES) as u32;
            buf.m.planes = planes.as_mut_ptr();
        }

        // SAFETY: VIDIOC_DQBUF takes a v4l2_buffer; `planes` outlives the call.
        unsafe { xioctl(self.raw(), sys::VIDIOC_DQBUF, &mut buf)? };

        let (fd, bytesused) = if buf_type.is_multiplanar() {
            let n = (buf.length as usize).min(VIDEO_MAX_PLANES);
            // SAFETY: the kernel fills `m.fd` for DMA-BUF planes.
            let fd = unsafe { planes[0].m.fd };
            (fd, planes[..n].iter().map(|p| p.bytesused).collect())
        } else {
            // SAFETY: the kernel fills `m.fd` for DMA-BUF buffers.
            (unsafe { buf.m.fd }, vec![buf.bytesused])
        };

        Ok(DequeuedBuffer {
            index: buf.index,
            fd,
            flags: buf.flags,
            timestamp: duration(&buf.timestamp),
            bytesused,
        })
    }

    fn set_stream(&self, buf_type: BufType, enable: bool) -> Result<(), Errno> {
        let mut ty = buf_type.raw() as libc::c_int;
        let request = if enable {
            sys::VIDIOC_STREAMON
        } else {
            sys::VIDIOC_STREAMOFF
        };
        // SAFETY: STREAMON/STREAMOFF take an int buffer type.
        unsafe { xioctl(self.raw(), request, &mut ty) }
    }

    fn set_ext_ctrls(&self, request_fd: Option<RawFd>, controls: &mut [ExtControl]) -> Result<(), Errno> {
        let which = if request_fd.is_some() {
            sys::V4L2_CTRL_WHICH_REQUEST_VAL
        } else {
            sys::V4L2_CTRL_WHICH_CUR_VAL
        };
        self.ext_ctrls(sys::VIDIOC_S_EXT_CTRLS, which, request_fd, controls)
    }

    fn get_ext_ctrls(&self, controls: &mut [ExtControl]) -> Result<(), Errno> {
        self.ext_ctrls(sys::VIDIOC_G_EXT_CTRLS, sys::V4L2_CTRL_WHICH_CUR_VAL, None, controls)
    }

    fn query_ext_ctrl(&self, id: u32) -> Result<QueryExtCtrl, Errno> {
        // SAFETY: plain data.
        let mut q: sys::V4l2QueryExtCtrl = unsafe { sys::zeroed() };
        q.id = id;
        // SAFETY: VIDIOC_QUERY_EXT_CTRL takes a v4l2_query_ext_ctrl.
        unsafe { xioctl(self.raw(), sys::VIDIOC_QUERY_EXT_CTRL, &mut q)? };
        let ndims = (q.nr_of_dims as usize).min(q.dims.len());
        Ok(QueryExtCtrl {
            id: q.id,
            ctrl_type: q.type_,
            name: sys::c_str(&q.name),
            minimum: q.minimum,
            maximum: q.maximum,
            step: q.step,
            default_value: q.default_value,
            flags: q.flags,
            elem_size: q.elem_size,
            elems: q.elems,
            dims: q.dims[..ndims].to_vec(),
        })
    }

    fn subscribe_event(&self, event_type: u32, id: u32) -> Result<(), Errno> {
        // SAFETY: plain data.
        let mut sub: sys::V4l2EventSubscription = unsafe { sys::zeroed() };
        sub.type_ = event_type;
        sub.id = id;
        // SAFETY: VIDIOC_SUBSCRIBE_EVENT takes a v4l2_event_subscription.
        unsafe { xioctl(self.raw(), sys::VIDIOC_SUBSCRIBE_EVENT, &mut sub) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_conversion() {
        let ts = Duration::from_micros(3_000_042);
        let tv = timeval(ts);
        assert_eq!(tv.tv_sec, 3);
        assert_eq!(tv.tv_usec, 42);
        assert_eq!(duration(&tv), ts);
    }

    #[test]
    fn test_open_missing_node() {
        assert!(V4l2Device::open("/nonexistent/video99").is_err());
    }

    #[test]
    fn test_raw_controls_marshal() {
        let mut ctrls = vec![ExtControl::int(1, 7), ExtControl::compound(2, &[1, 2, 3])];
        let raw = raw_controls(&mut ctrls);
        assert_eq!(raw.len(), 2);
        let (id0, size1) = (raw[0].id, raw[1].size);
        assert_eq!(id0, 1);
        assert_eq!(size1, 3);
    }
}
