//! Buffer entries, queues and the transaction controller.
//!
//! A [`MediaBufsCtl`] owns one [`BufQueue`] per direction. Source entries
//! carry bitstream into the decoder and come back to the free list when the
//! driver is done with them. Destination entries are handed out to
//! consumers, who [`wait`](QentDst::wait) for the decoded frame and then
//! give the entry back by dropping it.

mod ctl;
mod qent;
mod queue;

pub use ctl::MediaBufsCtl;
pub use qent::{QentDst, QentSrc, QentStatus};
pub use queue::{BufQueue, QueueEntry};
