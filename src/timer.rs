//! One-shot reactor timers.
//!
//! Backed by `timerfd` on Linux and `EVFILT_TIMER` on kqueue systems. An
//! armed timer counts toward the context's pending operations like any
//! other one-shot interest, so `run_pending` waits for it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::context::IoContext;
use crate::error::Result;
use crate::slot::{EventKind, Slot};

#[cfg(not(target_os = "linux"))]
use std::sync::atomic::{AtomicI32, Ordering};

/// kqueue timers need an identity; it shares a namespace only with other
/// EVFILT_TIMER events, so a plain counter is enough.
#[cfg(not(target_os = "linux"))]
static NEXT_TIMER_IDENT: AtomicI32 = AtomicI32::new(1);

struct TimerInner {
    io: IoContext,
    fd: libc::c_int,
    slot: RefCell<Box<Slot>>,
    armed: Cell<bool>,
    closed: Cell<bool>,
}

/// A one-shot timer driven by the reactor.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    /// Create a disarmed timer on the given context.
    pub fn new(io: &IoContext) -> Result<Timer> {
        #[cfg(target_os = "linux")]
        let fd = {
            let fd = unsafe {
                libc::timerfd_create(
                    libc::CLOCK_MONOTONIC,
                    libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                )
            };
            if fd < 0 {
                return Err(crate::error::Error::last_os_error());
            }
            fd
        };

        #[cfg(not(target_os = "linux"))]
        let fd = NEXT_TIMER_IDENT.fetch_add(1, Ordering::Relaxed);

        Ok(Timer {
            inner: Rc::new(TimerInner {
                io: io.clone(),
                fd,
                slot: RefCell::new(Slot::new(fd)),
                armed: Cell::new(false),
                closed: Cell::new(false),
            }),
        })
    }

    /// Arm the timer to fire once after `delay`. Re-arming replaces the
    /// previous schedule and its callback.
    pub fn arm<F>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        if self.inner.closed.get() {
            return Err(crate::error::Error::Closed);
        }
        if self.inner.armed.get() {
            self.cancel()?;
        }

        let inner = self.inner.clone();
        let completion: crate::slot::Completion = Box::new(move |result| {
            inner.armed.set(false);
            if result.is_err() {
                return;
            }
            #[cfg(target_os = "linux")]
            {
                // Drain the expiration count so the fd is quiet again.
                let mut expirations = [0u8; 8];
                unsafe {
                    libc::read(
                        inner.fd,
                        expirations.as_mut_ptr() as *mut libc::c_void,
                        8,
                    );
                }
            }
            callback();
        });

        let mut slot = self.inner.slot.borrow_mut();
        slot.set_handler(EventKind::Read, completion);

        #[cfg(target_os = "linux")]
        {
            let spec = libc::itimerspec {
                it_interval: libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                },
                it_value: libc::timespec {
                    tv_sec: delay.as_secs() as libc::time_t,
                    tv_nsec: delay.subsec_nanos().max(1) as libc::c_long,
                },
            };
            if unsafe {
                libc::timerfd_settime(self.inner.fd, 0, &spec, std::ptr::null_mut())
            } < 0
            {
                slot.take_handler(EventKind::Read);
                return Err(crate::error::Error::last_os_error());
            }
            self.inner.io.set_read(&mut slot)?;
        }

        #[cfg(not(target_os = "linux"))]
        self.inner.io.set_timer(&mut slot, delay)?;

        self.inner.armed.set(true);
        Ok(())
    }

    /// Cancel a pending schedule. No-op when disarmed.
    pub fn cancel(&self) -> Result<()> {
        if !self.inner.armed.replace(false) {
            return Ok(());
        }
        let mut slot = self.inner.slot.borrow_mut();

        #[cfg(target_os = "linux")]
        {
            self.inner.io.del_read(&mut slot)?;
            let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
            unsafe {
                libc::timerfd_settime(self.inner.fd, 0, &spec, std::ptr::null_mut());
            }
        }

        #[cfg(not(target_os = "linux"))]
        self.inner.io.del_timer(&mut slot)?;

        Ok(())
    }

    /// Whether a schedule is outstanding.
    pub fn is_armed(&self) -> bool {
        self.inner.armed.get()
    }

    /// Cancel and release the timer's kernel resources.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Ok(());
        }
        self.cancel()?;
        #[cfg(target_os = "linux")]
        unsafe {
            libc::close(self.inner.fd);
        }
        Ok(())
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if !self.closed.get() {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_timer_fires_once() {
        let io = IoContext::with_timeout(1000).unwrap();
        let timer = Timer::new(&io).unwrap();
        let fired = Rc::new(Cell::new(0u32));

        {
            let fired = fired.clone();
            timer
                .arm(Duration::from_millis(5), move || {
                    fired.set(fired.get() + 1);
                })
                .unwrap();
        }
        assert!(timer.is_armed());
        assert_eq!(io.pending(), 1);

        while fired.get() == 0 {
            match io.run_one() {
                Ok(_) | Err(Error::Timeout) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_armed());
        assert_eq!(io.pending(), 0);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let io = IoContext::with_timeout(20).unwrap();
        let timer = Timer::new(&io).unwrap();
        let fired = Rc::new(Cell::new(false));

        {
            let fired = fired.clone();
            timer
                .arm(Duration::from_millis(1), move || fired.set(true))
                .unwrap();
        }
        timer.cancel().unwrap();
        assert_eq!(io.pending(), 0);

        // Give the (cancelled) deadline ample room to pass.
        std::thread::sleep(Duration::from_millis(10));
        let _ = io.run_one();
        assert!(!fired.get());
    }

    #[test]
    fn test_arm_after_close_fails() {
        let io = IoContext::new().unwrap();
        let timer = Timer::new(&io).unwrap();
        timer.close().unwrap();
        assert!(matches!(
            timer.arm(Duration::from_millis(1), || {}),
            Err(Error::Closed)
        ));
    }
}
