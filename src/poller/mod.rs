//! Readiness pollers.
//!
//! One implementation per kernel interface (epoll on Linux, kqueue on the
//! BSD family) behind the same contract:
//!
//! - interests are one-shot: they auto-disarm after firing and must be
//!   re-armed to fire again;
//! - the kernel stores each [`Slot`](crate::slot::Slot)'s address as opaque
//!   user data and hands it back with the event;
//! - a waker descriptor (eventfd / pipe) is registered for reads with a
//!   null user-data sentinel and is excluded from the pending count;
//! - `pending` equals the number of armed non-waker one-shots plus the
//!   number of posts not yet executed.
//!
//! Handlers are *not* invoked inside the poller: `poll` returns a
//! [`ReadySet`] and the owning [`IoContext`](crate::context::IoContext)
//! runs it once the poller borrow is released, so a completion handler can
//! re-arm interests without re-entering the poller mid-dispatch.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::slot::Completion;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Poller;

/// A handler queued from any thread to run on the poller thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Everything `poll` collected for one iteration: fd completions in
/// kernel-reported order, then posted handlers in FIFO order.
pub(crate) struct ReadySet {
    pub completions: Vec<(Completion, Result<()>)>,
    pub posts: Vec<Task>,
    pub count: usize,
}

impl ReadySet {
    pub(crate) fn with_event_count(count: usize) -> Self {
        ReadySet {
            completions: Vec::new(),
            posts: Vec::new(),
            count,
        }
    }
}

struct PostQueue {
    posts: Vec<Task>,
    /// Armed one-shot interests (waker excluded) + unexecuted posts.
    pending: i64,
}

/// State shared between the poller thread and cross-thread posters.
///
/// The queue and the pending counter live under one lock; the enqueue path
/// performs the counter update, and the waker write happens outside the
/// lock, strictly after the enqueue.
pub(crate) struct Shared {
    queue: Mutex<PostQueue>,
    closed: AtomicBool,
    waker_fd: RawFd,
}

impl Shared {
    pub(crate) fn new(waker_fd: RawFd) -> Shared {
        Shared {
            queue: Mutex::new(PostQueue {
                posts: Vec::new(),
                pending: 0,
            }),
            closed: AtomicBool::new(false),
            waker_fd,
        }
    }

    /// Enqueue a handler and kick the poller awake. Safe from any thread.
    pub(crate) fn post(&self, task: Task) -> Result<()> {
        if self.closed() {
            return Err(Error::Closed);
        }

        {
            let mut queue = self.queue.lock();
            queue.posts.push(task);
            queue.pending += 1;
        }

        self.wake()
    }

    /// Write one token to the waker. Idempotent: repeated writes before a
    /// drain coalesce into a single wake-up.
    fn wake(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        let n = {
            let one: u64 = 1;
            unsafe {
                libc::write(
                    self.waker_fd,
                    &one as *const u64 as *const libc::c_void,
                    8,
                )
            }
        };

        #[cfg(not(target_os = "linux"))]
        let n = {
            let one: u8 = 1;
            unsafe {
                libc::write(self.waker_fd, &one as *const u8 as *const libc::c_void, 1)
            }
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            // A full pipe or saturated eventfd counter means a wake-up is
            // already pending.
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Swap out every queued post, debiting the pending counter.
    pub(crate) fn take_posts(&self) -> Vec<Task> {
        let mut queue = self.queue.lock();
        let posts = std::mem::take(&mut queue.posts);
        queue.pending -= posts.len() as i64;
        posts
    }

    pub(crate) fn add_pending(&self, delta: i64) {
        self.queue.lock().pending += delta;
    }

    pub(crate) fn pending(&self) -> i64 {
        self.queue.lock().pending
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag. Returns false if it was already set.
    pub(crate) fn set_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
