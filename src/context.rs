//! The I/O execution context: a thin facade over the readiness poller.
//!
//! An [`IoContext`] owns one poller and runs every completion handler on
//! the thread that calls its `run*`/`poll*` methods. It is deliberately
//! `!Send`: the only cross-thread surface is [`Poster`] (and
//! [`IoContext::post`] / [`IoContext::dispatch`] built on it).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
#[cfg(not(target_os = "linux"))]
use std::time::Duration;

use crate::error::{Error, Result};
use crate::poller::{Poller, Shared};
use crate::slot::Slot;

thread_local! {
    /// Identity of the poller whose handlers are currently running on this
    /// thread. Lets `dispatch` decide inline-vs-post without a syscall.
    static ACTIVE_POLLER: Cell<usize> = const { Cell::new(0) };
}

struct Inner {
    poller: RefCell<Poller>,
    shared: Arc<Shared>,
    timeout_ms: i64,
}

/// Single-threaded I/O execution context.
///
/// Cloning is cheap and yields another handle to the same context.
#[derive(Clone)]
pub struct IoContext {
    inner: Rc<Inner>,
}

impl IoContext {
    /// Create a context whose polls return immediately (`timeout = -1`).
    pub fn new() -> Result<IoContext> {
        IoContext::with_timeout(-1)
    }

    /// Create a context whose blocking polls wait up to `timeout_ms`.
    /// Negative means "return immediately".
    pub fn with_timeout(timeout_ms: i64) -> Result<IoContext> {
        let poller = Poller::new()?;
        let shared = poller.shared();
        Ok(IoContext {
            inner: Rc::new(Inner {
                poller: RefCell::new(poller),
                shared,
                timeout_ms,
            }),
        })
    }

    /// One poll iteration: wait (per `timeout_ms`), then run every ready
    /// completion handler followed by every queued post.
    ///
    /// Returns the number of kernel events. The poller borrow is released
    /// before any handler runs, so handlers may freely re-arm interests.
    fn poll_with(&self, timeout_ms: i64) -> Result<usize> {
        let ready = self.inner.poller.borrow_mut().poll(timeout_ms)?;

        let token = Arc::as_ptr(&self.inner.shared) as usize;
        let _guard = ActiveGuard::enter(token);

        for (handler, result) in ready.completions {
            handler(result);
        }
        for post in ready.posts {
            post();
        }
        Ok(ready.count)
    }

    /// Run the event processing loop until a non-timeout error (e.g. the
    /// context is closed).
    pub fn run(&self) -> Result<()> {
        loop {
            match self.run_one() {
                Ok(_) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one poll iteration with the configured timeout.
    pub fn run_one(&self) -> Result<usize> {
        self.poll_with(self.inner.timeout_ms)
    }

    /// Run until every pending operation (armed interest or queued post)
    /// has executed.
    pub fn run_pending(&self) -> Result<()> {
        while self.pending() > 0 {
            match self.run_one() {
                Ok(_) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run every handler that is ready right now, without blocking.
    pub fn poll(&self) -> Result<()> {
        loop {
            match self.poll_one() {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(Error::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// One non-blocking poll iteration.
    pub fn poll_one(&self) -> Result<usize> {
        self.poll_with(-1)
    }

    /// Queue `handler` to run on the poller thread. Safe from any thread.
    pub fn post<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.shared.post(Box::new(handler))
    }

    /// Run `handler` inline when called from a handler already executing
    /// on this context's thread; otherwise equivalent to [`post`].
    ///
    /// [`post`]: IoContext::post
    pub fn dispatch<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = Arc::as_ptr(&self.inner.shared) as usize;
        if ACTIVE_POLLER.with(|active| active.get()) == token {
            handler();
            Ok(())
        } else {
            self.post(handler)
        }
    }

    /// A `Send + Sync` handle for posting from other threads.
    pub fn poster(&self) -> Poster {
        Poster {
            shared: self.inner.shared.clone(),
        }
    }

    /// Armed one-shot interests plus queued posts.
    pub fn pending(&self) -> i64 {
        self.inner.shared.pending()
    }

    /// Close the poller and its waker. A second call fails with
    /// [`Error::Eof`].
    pub fn close(&self) -> Result<()> {
        self.inner.poller.borrow_mut().close()
    }

    /// Arm a one-shot read interest for `slot`.
    pub fn set_read(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().set_read(slot)
    }

    /// Arm a one-shot write interest for `slot`.
    pub fn set_write(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().set_write(slot)
    }

    /// Unarm the read interest for `slot`.
    pub fn del_read(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().del_read(slot)
    }

    /// Unarm the write interest for `slot`.
    pub fn del_write(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().del_write(slot)
    }

    /// Unarm every interest for `slot`.
    pub fn del(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().del(slot)
    }

    /// Arm a one-shot timer delivered through `slot`'s read handler.
    #[cfg(not(target_os = "linux"))]
    pub(crate) fn set_timer(&self, slot: &mut Slot, delay: Duration) -> Result<()> {
        self.inner.poller.borrow_mut().set_timer(slot, delay)
    }

    /// Cancel an armed kqueue timer.
    #[cfg(not(target_os = "linux"))]
    pub(crate) fn del_timer(&self, slot: &mut Slot) -> Result<()> {
        self.inner.poller.borrow_mut().del_timer(slot)
    }
}

/// Cross-thread posting handle for an [`IoContext`].
#[derive(Clone)]
pub struct Poster {
    shared: Arc<Shared>,
}

impl Poster {
    /// Queue `handler` to run on the context's poller thread.
    pub fn post<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(handler))
    }
}

/// Marks this thread as running handlers for a given poller, restoring the
/// previous marker when dropped.
struct ActiveGuard {
    previous: usize,
}

impl ActiveGuard {
    fn enter(token: usize) -> ActiveGuard {
        let previous = ACTIVE_POLLER.with(|active| active.replace(token));
        ActiveGuard { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        ACTIVE_POLLER.with(|active| active.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_post_runs_exactly_once() {
        let io = IoContext::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = hits.clone();
            io.post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(io.pending(), 1);

        io.poll_one().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(io.pending(), 0);

        io.poll_one().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_posts_run_in_fifo_order() {
        let io = IoContext::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            io.post(move || order.lock().push(i)).unwrap();
        }
        io.run_pending().unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cross_thread_posts_all_execute() {
        let io = IoContext::new().unwrap();
        let collected = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for i in 0..10 {
            let poster = io.poster();
            let collected = collected.clone();
            producers.push(std::thread::spawn(move || {
                poster.post(move || collected.lock().push(i)).unwrap();
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        io.run_pending().unwrap();

        let mut seen = collected.lock().clone();
        assert_eq!(seen.len(), 10);
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_per_producer_order_is_preserved() {
        let io = IoContext::new().unwrap();
        let collected = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for producer_id in 0..4 {
            let poster = io.poster();
            let collected = collected.clone();
            producers.push(std::thread::spawn(move || {
                for seq in 0..5 {
                    let collected = collected.clone();
                    poster
                        .post(move || collected.lock().push((producer_id, seq)))
                        .unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        io.run_pending().unwrap();

        let seen = collected.lock().clone();
        assert_eq!(seen.len(), 20);
        for producer_id in 0..4 {
            let seqs: Vec<_> = seen
                .iter()
                .filter(|(p, _)| *p == producer_id)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_blocking_poll_times_out() {
        let io = IoContext::with_timeout(10).unwrap();
        assert!(matches!(io.run_one(), Err(Error::Timeout)));
    }

    #[test]
    fn test_close_twice() {
        let io = IoContext::new().unwrap();
        io.close().unwrap();
        assert!(matches!(io.close(), Err(Error::Eof)));
        assert!(matches!(io.poll_one(), Err(Error::Closed)));
    }

    #[test]
    fn test_dispatch_outside_poll_is_posted() {
        let io = IoContext::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = hits.clone();
            io.dispatch(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        // Not run inline: it waits for the next poll.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(io.pending(), 1);

        io.run_pending().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_del_read_disarms_and_drops_handler() {
        use crate::slot::{EventKind, Slot};

        let io = IoContext::new().unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let mut slot = Slot::new(fds[0]);
        {
            let hits = hits.clone();
            slot.set_handler(
                EventKind::Read,
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        io.set_read(&mut slot).unwrap();
        assert_eq!(io.pending(), 1);

        io.del_read(&mut slot).unwrap();
        assert!(slot.is_idle());
        assert_eq!(io.pending(), 0);

        // Readiness after the delete must not fire the dropped handler.
        assert_eq!(
            unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let _ = io.poll_one();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_slot_handler_sees_inline_dispatch_and_disarms() {
        use crate::slot::{EventKind, Slot};

        let io = IoContext::new().unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mut slot = Slot::new(fds[0]);
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let io2 = io.clone();
            let order = order.clone();
            let inline_order = order.clone();
            slot.set_handler(
                EventKind::Read,
                Box::new(move |result| {
                    result.unwrap();
                    // Running on the poller thread: dispatch is inline and
                    // must execute before the next line.
                    io2.dispatch(move || inline_order.lock().push("inline"))
                        .unwrap();
                    order.lock().push("after");
                }),
            );
        }
        io.set_read(&mut slot).unwrap();
        assert_eq!(io.pending(), 1);
        assert!(slot.is_armed(EventKind::Read));

        assert_eq!(
            unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );

        io.run_pending().unwrap();
        assert_eq!(*order.lock(), vec!["inline", "after"]);

        // One-shot: the interest auto-disarmed and the mask reflects it.
        assert!(slot.is_idle());
        assert_eq!(io.pending(), 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
