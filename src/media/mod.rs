//! Media controller requests.
//!
//! A stateless codec consumes one *request* per frame: an opaque kernel
//! object that bundles the frame's controls and its source buffer, and that
//! is queued atomically. [`MediaPool`] owns a fixed set of them and hands
//! them out as [`MediaRequest`]s.

mod node;
mod pool;

pub use node::MediaNode;
pub use pool::{MediaPool, MediaRequest, PoolStats};

use rustix::io::Errno;
use std::os::fd::{BorrowedFd, OwnedFd};

/// Request operations of a media controller node.
pub trait MediaDevice: Send + Sync {
    /// `MEDIA_IOC_REQUEST_ALLOC`: create a new request object.
    fn alloc_request(&self) -> Result<OwnedFd, Errno>;

    /// `MEDIA_REQUEST_IOC_QUEUE`: submit a request to the driver.
    fn queue_request(&self, request: BorrowedFd<'_>) -> Result<(), Errno>;

    /// `MEDIA_REQUEST_IOC_REINIT`: return a completed request to the empty state.
    fn reinit_request(&self, request: BorrowedFd<'_>) -> Result<(), Errno>;
}
