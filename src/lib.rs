//! # mediabufs
//!
//! Request and buffer pooling for V4L2 stateless (request API) hardware
//! decoders.
//!
//! A stateless decoder is fed one media *request* per slice or frame. Each
//! request carries the codec parameters as controls and binds one source
//! (bitstream) buffer; decoded pictures come back in destination buffers.
//! This crate owns the bookkeeping around that:
//!
//! - **Zero-copy buffers**: every buffer is a DMA-BUF, allocated from a DMA
//!   heap and shared with the driver and with downstream consumers
//! - **Bounded pools**: a fixed [`MediaPool`](media::MediaPool) of requests
//!   and per-direction free/in-use queues with blocking acquisition
//! - **Asynchronous completion**: a single poll thread reaps finished
//!   requests and buffers and wakes whoever waits on them
//! - **Safe teardown**: destination buffers outlive their controller and
//!   release their memory themselves once it is gone
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediabufs::prelude::*;
//!
//! let config = MediaConfig::default();
//! let poll: Arc<dyn PollQueue> = Arc::new(ThreadPollQueue::new()?);
//! let heap = DmaHeapAllocator::new()?;
//!
//! let ctl = MediaBufsCtl::open(&config, &poll)?;
//! ctl.src_fmt_set(ctl.src_type(), FourCc::new(b"S264"), 1920, 1080, 0)?;
//! ctl.dst_fmt_set(1920, 1080, |desc| desc.pixelformat == FourCc::new(b"NV12"))?;
//! ctl.src_pool_create(&heap, config.src_buffer_count)?;
//! ctl.stream_on()?;
//!
//! let requests = MediaPool::new(&config, &poll)?;
//! let req = requests.acquire();
//! let mut src = ctl.src_qent_get();
//! src.copy_in(0, &slice_data, &heap)?;
//! let dst = ctl.dst_qent_alloc(&heap)?;
//! ctl.set_ext_ctrls(Some(&req), &mut controls)?;
//! ctl.start_request(req, src, Some(&dst), true)?;
//! dst.wait()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bufs;
pub mod config;
pub mod error;
pub mod media;
pub mod memory;
pub mod poll;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod v4l2;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bufs::{MediaBufsCtl, QentDst, QentSrc, QentStatus};
    pub use crate::config::MediaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::media::{MediaPool, MediaRequest};
    pub use crate::memory::{DmaBuf, DmaBufAllocator, DmaHeapAllocator, MemfdAllocator};
    pub use crate::poll::{PollQueue, ThreadPollQueue};
    pub use crate::v4l2::{BufType, ExtControl, FormatDesc, FourCc};
}

pub use error::{Error, Result};
