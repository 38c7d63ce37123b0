//! ioctl-backed [`MediaDevice`].

use super::MediaDevice;
use crate::v4l2::sys::{self, xioctl};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/// An open media controller node (`/dev/mediaN`).
#[derive(Debug)]
pub struct MediaNode {
    fd: OwnedFd,
    path: PathBuf,
}

impl MediaNode {
    /// Open the node read-write and non-blocking.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Errno> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        tracing::debug!(path = %path.display(), "opened media device");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Path this node was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MediaDevice for MediaNode {
    fn alloc_request(&self) -> Result<OwnedFd, Errno> {
        let mut fd: libc::c_int = -1;
        // SAFETY: MEDIA_IOC_REQUEST_ALLOC writes an int.
        unsafe { xioctl(self.fd.as_raw_fd(), sys::MEDIA_IOC_REQUEST_ALLOC, &mut fd)? };
        if fd < 0 {
            return Err(Errno::BADF);
        }
        // SAFETY: the kernel returned a new descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn queue_request(&self, request: BorrowedFd<'_>) -> Result<(), Errno> {
        // SAFETY: MEDIA_REQUEST_IOC_QUEUE takes no argument.
        unsafe {
            xioctl::<libc::c_void>(
                request.as_raw_fd(),
                sys::MEDIA_REQUEST_IOC_QUEUE,
                std::ptr::null_mut(),
            )
        }
    }

    fn reinit_request(&self, request: BorrowedFd<'_>) -> Result<(), Errno> {
        // SAFETY: MEDIA_REQUEST_IOC_REINIT takes no argument.
        unsafe {
            xioctl::<libc::c_void>(
                request.as_raw_fd(),
                sys::MEDIA_REQUEST_IOC_REINIT,
                std::ptr::null_mut(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MediaNode::open(dir.path().join("media0")).is_err());
    }

    #[test]
    fn test_request_ioctls_rejected_on_plain_file() {
        let file = tempfile::tempfile().unwrap();
        let node = MediaNode {
            fd: file.into(),
            path: PathBuf::from("plain"),
        };
        assert!(node.alloc_request().is_err());
    }
}
