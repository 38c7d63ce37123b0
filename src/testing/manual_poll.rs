//! A [`PollQueue`] whose readiness is driven by the test.

use crate::error::{Error, Result};
use crate::poll::{PollCallback, PollFlags, PollQueue, TaskId};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Task {
    fd: RawFd,
    callback: Option<PollCallback>,
    armed: Option<Duration>,
}

#[derive(Default)]
struct State {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
    registrations_left: Option<usize>,
    fail_arm: bool,
}

/// Poll queue that never polls: callbacks run on the calling thread when
/// the test calls [`fire`](Self::fire).
///
/// Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct ManualPollQueue {
    state: Arc<Mutex<State>>,
}

impl ManualPollQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// This queue as a trait object.
    pub fn shared(&self) -> Arc<dyn PollQueue> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `flags` to the armed task watching `fd`. Empty flags act as
    /// a timeout. Returns `false` if no task on `fd` is armed.
    pub fn fire(&self, fd: RawFd, flags: PollFlags) -> bool {
        let (id, mut callback) = {
            let mut st = self.lock();
            let Some((&id, task)) = st
                .tasks
                .iter_mut()
                .find(|(_, t)| t.fd == fd && t.armed.is_some())
            else {
                return false;
            };
            task.armed = None;
            match task.callback.take() {
                Some(cb) => (id, cb),
                None => return false,
            }
        };

        callback(flags);

        // An unregistered task's callback is dropped outside the lock
        let orphan = {
            let mut st = self.lock();
            match st.tasks.get_mut(&id) {
                Some(task) => {
                    task.callback.get_or_insert(callback);
                    None
                }
                None => Some(callback),
            }
        };
        drop(orphan);
        true
    }

    /// Whether a task on `fd` is armed.
    pub fn is_armed(&self, fd: RawFd) -> bool {
        self.lock()
            .tasks
            .values()
            .any(|t| t.fd == fd && t.armed.is_some())
    }

    /// Timeout of the armed task on `fd`.
    pub fn armed_timeout(&self, fd: RawFd) -> Option<Duration> {
        self.lock()
            .tasks
            .values()
            .find(|t| t.fd == fd)
            .and_then(|t| t.armed)
    }

    /// Let `n` more registrations succeed, then fail the rest.
    pub fn fail_register_after(&self, n: usize) {
        self.lock().registrations_left = Some(n);
    }

    /// Make every arm fail.
    pub fn fail_arm(&self, fail: bool) {
        self.lock().fail_arm = fail;
    }

    /// Registered tasks.
    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }
}

impl PollQueue for ManualPollQueue {
    fn register(&self, fd: BorrowedFd<'_>, _events: PollFlags, callback: PollCallback) -> Result<TaskId> {
        let mut st = self.lock();
        if let Some(left) = st.registrations_left.as_mut() {
            if *left == 0 {
                return Err(Error::op("poll registration refused"));
            }
            *left -= 1;
        }
        let id = st.next_id;
        st.next_id += 1;
        st.tasks.insert(
            id,
            Task {
                fd: fd.as_raw_fd(),
                callback: Some(callback),
                armed: None,
            },
        );
        Ok(id)
    }

    fn arm(&self, task: TaskId, timeout: Duration) -> Result<()> {
        let mut st = self.lock();
        if st.fail_arm {
            return Err(Error::op("poll arm refused"));
        }
        match st.tasks.get_mut(&task) {
            Some(t) => {
                t.armed = Some(timeout);
                Ok(())
            }
            None => Err(Error::op(format!("unknown poll task {}", task))),
        }
    }

    fn unregister(&self, task: TaskId) {
        let removed = self.lock().tasks.remove(&task);
        drop(removed);
    }
}

impl std::fmt::Debug for ManualPollQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualPollQueue")
            .field("tasks", &self.task_count())
            .finish()
    }
}
