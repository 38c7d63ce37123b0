//! Readiness-poll task queue.
//!
//! A [`PollQueue`] watches file descriptors on behalf of registered tasks.
//! A task is registered once with its descriptor, its interest mask and a
//! callback, and is then *armed* for each wait it needs: every arm produces
//! exactly one callback invocation, carrying the ready flags, or empty flags
//! when the arm's timeout elapsed first.
//!
//! [`PollTask`] is the owning handle for a registration; dropping it
//! unregisters the task. Once unregistration returns, the callback will not
//! start again, and if it was running on another thread it has finished.

mod thread;

pub use rustix::event::PollFlags;
pub use thread::{EventFd, ThreadPollQueue};

use crate::error::Result;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of a registered task.
pub type TaskId = u64;

/// Completion callback. Empty flags mean the arm timed out.
pub type PollCallback = Box<dyn FnMut(PollFlags) + Send>;

/// A queue that runs callbacks on descriptor readiness or timeout.
pub trait PollQueue: Send + Sync {
    /// Register a task. It is not armed.
    ///
    /// `fd` must stay open until the task is unregistered.
    fn register(&self, fd: BorrowedFd<'_>, events: PollFlags, callback: PollCallback) -> Result<TaskId>;

    /// Arm a task for one callback, after readiness or `timeout`.
    ///
    /// Arming an already armed task restarts its timeout. May be called from
    /// inside the task's own callback.
    fn arm(&self, task: TaskId, timeout: Duration) -> Result<()>;

    /// Remove a task. Unknown ids are ignored.
    fn unregister(&self, task: TaskId);
}

/// Owning handle for a registered task.
pub struct PollTask {
    queue: Arc<dyn PollQueue>,
    id: TaskId,
}

impl PollTask {
    /// Register `callback` for `events` on `fd`.
    pub fn new(
        queue: &Arc<dyn PollQueue>,
        fd: BorrowedFd<'_>,
        events: PollFlags,
        callback: PollCallback,
    ) -> Result<Self> {
        let id = queue.register(fd, events, callback)?;
        Ok(Self {
            queue: Arc::clone(queue),
            id,
        })
    }

    /// Arm for one callback.
    pub fn arm(&self, timeout: Duration) -> Result<()> {
        self.queue.arm(self.id, timeout)
    }

    /// Task id within its queue.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.queue.unregister(self.id);
    }
}

impl std::fmt::Debug for PollTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollTask").field("id", &self.id).finish()
    }
}
