//! Single-threaded `poll(2)` implementation of [`PollQueue`].

use super::{PollCallback, PollFlags, PollQueue, TaskId};
use crate::error::{Error, Result};
use rustix::event::{EventfdFlags, PollFd, eventfd};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::io::Errno;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

// ============================================================================
// EventFd Wrapper
// ============================================================================

/// Non-blocking eventfd used to wake a thread sleeping in `poll(2)`.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a new eventfd with initial value 0.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)
            .map_err(|e| Error::op(format!("eventfd: {}", e)))?;
        Ok(Self { fd })
    }

    /// Increment the counter, making the descriptor readable.
    pub fn notify(&self) -> Result<()> {
        rustix::io::write(&self.fd, &1u64.to_ne_bytes())
            .map_err(|e| Error::op(format!("eventfd write: {}", e)))?;
        Ok(())
    }

    /// Read and reset the counter.
    ///
    /// Returns `true` if it was signalled, `false` if it would block.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(true),
            Ok(_) => Ok(false),
            Err(Errno::WOULDBLOCK) => Ok(false),
            Err(e) => Err(Error::op(format!("eventfd read: {}", e))),
        }
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFd").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

// ============================================================================
// ThreadPollQueue
// ============================================================================

struct Task {
    fd: RawFd,
    events: PollFlags,
    /// Taken out while the callback runs.
    callback: Option<PollCallback>,
    /// `Some` while armed.
    deadline: Option<Instant>,
    /// Bumped on every arm so a stale readiness result is not delivered to a
    /// newer arm.
    seq: u64,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    next_id: TaskId,
    running: Option<TaskId>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a callback finishes.
    idle: Condvar,
    wake: EventFd,
    thread: OnceLock<ThreadId>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_poll_thread(&self) -> bool {
        self.thread.get() == Some(&std::thread::current().id())
    }
}

/// A [`PollQueue`] served by one dedicated thread.
///
/// Callbacks run on that thread, one at a time. A callback may arm or
/// unregister its own task, and may drop the last handle to the queue.
pub struct ThreadPollQueue {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadPollQueue {
    /// Start the poll thread.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            idle: Condvar::new(),
            wake: EventFd::new()?,
            thread: OnceLock::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("mediabufs-poll".to_string())
            .spawn(move || run(thread_shared))
            .map_err(|e| Error::op(format!("failed to spawn poll thread: {}", e)))?;
        let _ = shared.thread.set(thread.thread().id());

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }
}

impl PollQueue for ThreadPollQueue {
    fn register(&self, fd: BorrowedFd<'_>, events: PollFlags, callback: PollCallback) -> Result<TaskId> {
        let mut st = self.shared.lock();
        if st.shutdown {
            return Err(Error::op("poll queue is shut down"));
        }
        let id = st.next_id;
        st.next_id += 1;
        st.tasks.insert(
            id,
            Task {
                fd: fd.as_raw_fd(),
                events,
                callback: Some(callback),
                deadline: None,
                seq: 0,
            },
        );
        Ok(id)
    }

    fn arm(&self, task: TaskId, timeout: Duration) -> Result<()> {
        {
            let mut st = self.shared.lock();
            if st.shutdown {
                return Err(Error::op("poll queue is shut down"));
            }
            let entry = st
                .tasks
                .get_mut(&task)
                .ok_or_else(|| Error::op(format!("poll task {} not registered", task)))?;
            entry.seq += 1;
            entry.deadline = Some(Instant::now() + timeout);
        }
        if !self.shared.on_poll_thread() {
            self.shared.wake.notify()?;
        }
        Ok(())
    }

    fn unregister(&self, task: TaskId) {
        let mut st = self.shared.lock();
        let removed = st.tasks.remove(&task);
        if !self.shared.on_poll_thread() {
            while st.running == Some(task) {
                st = self
                    .shared
                    .idle
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        drop(st);
        // Dropped unlocked: the callback may own handles that unregister.
        drop(removed);
    }
}

impl Drop for ThreadPollQueue {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        if let Err(e) = self.shared.wake.notify() {
            tracing::warn!("failed to wake poll thread: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            if self.shared.on_poll_thread() {
                // Last handle dropped from a callback; the thread exits on
                // its own once the callback returns.
                return;
            }
            if thread.join().is_err() {
                tracing::error!("poll thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadPollQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPollQueue")
            .field("tasks", &self.task_count())
            .finish()
    }
}

struct Armed {
    id: TaskId,
    seq: u64,
    fd: RawFd,
    events: PollFlags,
    deadline: Instant,
}

fn poll_timeout_ms(nearest: Option<Instant>, now: Instant) -> i32 {
    match nearest {
        None => -1,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(now);
            remaining.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32
        }
    }
}

fn run(shared: Arc<Shared>) {
    tracing::debug!("poll thread started");
    loop {
        let armed: Vec<Armed> = {
            let st = shared.lock();
            if st.shutdown {
                break;
            }
            st.tasks
                .iter()
                .filter_map(|(&id, t)| {
                    t.deadline.map(|deadline| Armed {
                        id,
                        seq: t.seq,
                        fd: t.fd,
                        events: t.events,
                        deadline,
                    })
                })
                .collect()
        };

        let timeout = poll_timeout_ms(armed.iter().map(|a| a.deadline).min(), Instant::now());

        let revents: Vec<PollFlags> = {
            let mut fds = Vec::with_capacity(armed.len() + 1);
            fds.push(PollFd::new(&shared.wake, PollFlags::IN));
            for a in &armed {
                // SAFETY: registrants keep the descriptor open until they
                // unregister. A descriptor closed since the snapshot only
                // yields POLLNVAL or readiness for a task that is gone.
                let fd = unsafe { BorrowedFd::borrow_raw(a.fd) };
                fds.push(PollFd::from_borrowed_fd(fd, a.events));
            }
            match rustix::event::poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::INTR) => continue,
                Err(e) => {
                    tracing::error!("poll failed: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
            fds.iter().map(|f| f.revents()).collect()
        };

        if revents[0].contains(PollFlags::IN) {
            let _ = shared.wake.try_wait();
        }

        let now = Instant::now();
        for (a, &r) in armed.iter().zip(&revents[1..]) {
            let ready = r & (a.events | PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL);
            if !ready.is_empty() {
                fire(&shared, a, ready);
            } else if now >= a.deadline {
                fire(&shared, a, PollFlags::empty());
            }
        }
    }
    tracing::debug!("poll thread exiting");
}

fn fire(shared: &Shared, armed: &Armed, flags: PollFlags) {
    let mut callback = {
        let mut st = shared.lock();
        if st.shutdown {
            return;
        }
        let callback = match st.tasks.get_mut(&armed.id) {
            Some(task) if task.seq == armed.seq && task.deadline.is_some() => {
                task.deadline = None;
                task.callback.take()
            }
            _ => None,
        };
        match callback {
            Some(cb) => {
                st.running = Some(armed.id);
                cb
            }
            None => return,
        }
    };

    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(flags))).is_err() {
        tracing::error!(task = armed.id, "poll callback panicked");
    }

    let leftover = {
        let mut st = shared.lock();
        st.running = None;
        match st.tasks.get_mut(&armed.id) {
            Some(task) => {
                task.callback = Some(callback);
                None
            }
            None => Some(callback),
        }
    };
    shared.idle.notify_all();
    drop(leftover);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_notify_and_wait() {
        let efd = EventFd::new().unwrap();
        assert!(!efd.try_wait().unwrap());
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert!(efd.try_wait().unwrap());
        assert!(!efd.try_wait().unwrap());
    }

    #[test]
    fn test_poll_timeout_ms() {
        let now = Instant::now();
        assert_eq!(poll_timeout_ms(None, now), -1);
        assert_eq!(poll_timeout_ms(Some(now), now), 0);
        assert_eq!(
            poll_timeout_ms(Some(now + Duration::from_micros(1500)), now),
            2
        );
    }

    #[test]
    fn test_register_and_unregister() {
        let queue = ThreadPollQueue::new().unwrap();
        let efd = EventFd::new().unwrap();
        let id = queue
            .register(efd.as_fd(), PollFlags::IN, Box::new(|_| {}))
            .unwrap();
        assert_eq!(queue.task_count(), 1);
        queue.unregister(id);
        assert_eq!(queue.task_count(), 0);
        assert!(queue.arm(id, Duration::from_millis(1)).is_err());
    }
}
