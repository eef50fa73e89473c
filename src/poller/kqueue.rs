//! kqueue backend (macOS and the BSDs).
//!
//! Interests are `EV_ADD | EV_ONESHOT` kevents carrying the slot address in
//! `udata`; deletions use `EV_DELETE`. Changes accumulate in a change list
//! that is flushed in the same `kevent` call that waits for events. The
//! waker is a pipe whose read end is registered with a null `udata`.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::slot::{EventKind, Slot};

use super::{ReadySet, Shared};

const EVENT_CAPACITY: usize = 128;

/// kqueue-backed readiness poller.
pub struct Poller {
    kq: RawFd,
    waker_rd: RawFd,
    waker_wr: RawFd,
    changes: Vec<libc::kevent>,
    events: Vec<libc::kevent>,
    shared: Arc<Shared>,
}

fn empty_kevent() -> libc::kevent {
    // Safety: kevent is a plain C struct; all-zero is a valid value.
    unsafe { std::mem::zeroed() }
}

fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }
        let (waker_rd, waker_wr) = (pipe[0], pipe[1]);

        let close_pipe = || unsafe {
            libc::close(waker_rd);
            libc::close(waker_wr);
        };

        if let Err(e) = set_nonblock_cloexec(waker_rd).and_then(|_| set_nonblock_cloexec(waker_wr))
        {
            close_pipe();
            return Err(e);
        }

        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            let err = Error::last_os_error();
            close_pipe();
            return Err(err);
        }

        // Register the waker's read end up front, with a null udata
        // sentinel and without one-shot: it lives as long as the poller
        // and is excluded from `pending`.
        let mut ev = empty_kevent();
        ev.ident = waker_rd as _;
        ev.filter = libc::EVFILT_READ as _;
        ev.flags = libc::EV_ADD as _;
        let rc = unsafe {
            libc::kevent(
                kq,
                &ev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            let err = Error::last_os_error();
            close_pipe();
            unsafe {
                libc::close(kq);
            }
            return Err(err);
        }

        Ok(Poller {
            kq,
            waker_rd,
            waker_wr,
            changes: Vec::with_capacity(EVENT_CAPACITY),
            events: vec![empty_kevent(); EVENT_CAPACITY],
            shared: Arc::new(Shared::new(waker_wr)),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Arm a one-shot read interest. No-op if already armed.
    pub fn set_read(&mut self, slot: &mut Slot) -> Result<()> {
        self.arm(slot, EventKind::Read, libc::EVFILT_READ as i32)
    }

    /// Arm a one-shot write interest. No-op if already armed.
    pub fn set_write(&mut self, slot: &mut Slot) -> Result<()> {
        self.arm(slot, EventKind::Write, libc::EVFILT_WRITE as i32)
    }

    /// Arm a one-shot timer firing after `delay`, delivered through the
    /// slot's read handler. The slot's fd doubles as the timer identity.
    pub fn set_timer(&mut self, slot: &mut Slot, delay: Duration) -> Result<()> {
        if slot.is_armed(EventKind::Read) {
            return Ok(());
        }
        debug_assert!(slot.handlers[EventKind::Read as usize].is_some());

        slot.events |= EventKind::Read.bit();
        let mut ev = empty_kevent();
        ev.ident = slot.fd as _;
        ev.filter = libc::EVFILT_TIMER as _;
        ev.flags = (libc::EV_ADD | libc::EV_ONESHOT) as _;
        // Default EVFILT_TIMER unit is milliseconds on every kqueue system.
        ev.data = (delay.as_millis().max(1) as i64) as _;
        ev.udata = slot as *mut Slot as *mut _;
        self.changes.push(ev);
        self.shared.add_pending(1);
        Ok(())
    }

    /// Cancel an armed timer.
    pub fn del_timer(&mut self, slot: &mut Slot) -> Result<()> {
        if !slot.is_armed(EventKind::Read) {
            return Ok(());
        }
        slot.events &= !EventKind::Read.bit();
        slot.take_handler(EventKind::Read);
        self.shared.add_pending(-1);

        let mut ev = empty_kevent();
        ev.ident = slot.fd as _;
        ev.filter = libc::EVFILT_TIMER as _;
        ev.flags = libc::EV_DELETE as _;
        self.changes.push(ev);
        Ok(())
    }

    fn arm(&mut self, slot: &mut Slot, kind: EventKind, filter: i32) -> Result<()> {
        if slot.is_armed(kind) {
            return Ok(());
        }
        debug_assert!(
            slot.handlers[kind as usize].is_some(),
            "arming {:?} without a handler",
            kind
        );

        slot.events |= kind.bit();
        let mut ev = empty_kevent();
        ev.ident = slot.fd as _;
        ev.filter = filter as _;
        ev.flags = (libc::EV_ADD | libc::EV_ONESHOT) as _;
        ev.udata = slot as *mut Slot as *mut _;
        self.changes.push(ev);
        self.shared.add_pending(1);
        Ok(())
    }

    /// Unarm the read interest, dropping its handler.
    pub fn del_read(&mut self, slot: &mut Slot) -> Result<()> {
        self.unarm(slot, EventKind::Read, libc::EVFILT_READ as i32)
    }

    /// Unarm the write interest, dropping its handler.
    pub fn del_write(&mut self, slot: &mut Slot) -> Result<()> {
        self.unarm(slot, EventKind::Write, libc::EVFILT_WRITE as i32)
    }

    /// Unarm every interest on the slot.
    pub fn del(&mut self, slot: &mut Slot) -> Result<()> {
        self.del_read(slot)?;
        self.del_write(slot)
    }

    fn unarm(&mut self, slot: &mut Slot, kind: EventKind, filter: i32) -> Result<()> {
        if !slot.is_armed(kind) {
            return Ok(());
        }
        slot.events &= !kind.bit();
        slot.take_handler(kind);
        self.shared.add_pending(-1);

        let mut ev = empty_kevent();
        ev.ident = slot.fd as _;
        ev.filter = filter as _;
        ev.flags = libc::EV_DELETE as _;
        self.changes.push(ev);
        Ok(())
    }

    /// Flush pending changes, wait for readiness, and collect what became
    /// runnable.
    ///
    /// `timeout_ms < 0` returns immediately; otherwise blocks up to the
    /// deadline and reports `Timeout` on a zero-event wake.
    pub(crate) fn poll(&mut self, timeout_ms: i64) -> Result<ReadySet> {
        if self.shared.closed() {
            return Err(Error::Closed);
        }

        let ms = timeout_ms.max(0);
        let ts = libc::timespec {
            tv_sec: (ms / 1000) as _,
            tv_nsec: ((ms % 1000) * 1_000_000) as _,
        };

        let changes = std::mem::take(&mut self.changes);
        let mut submitted = false;

        let n = loop {
            let (chg_ptr, chg_len) = if submitted {
                (std::ptr::null(), 0)
            } else {
                (changes.as_ptr(), changes.len() as libc::c_int)
            };
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    chg_ptr,
                    chg_len,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    &ts,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                // The change list is applied before the wait, so a retry
                // must not re-submit it.
                submitted = true;
                continue;
            }
            return Err(Error::Io(err));
        };

        if n == 0 && timeout_ms >= 0 {
            return Err(Error::Timeout);
        }

        let mut ready = ReadySet::with_event_count(n);
        for i in 0..n {
            let ev = self.events[i];

            if ev.udata.is_null() {
                if ev.flags as u32 & libc::EV_ERROR as u32 != 0 {
                    trace!(errno = ev.data as i64, "kevent change failed");
                } else {
                    self.drain_waker();
                    ready.posts = self.shared.take_posts();
                    trace!(posts = ready.posts.len(), "waker fired");
                }
                continue;
            }

            // Safety: udata is the address of a live, pinned Slot armed by
            // this poller; slots are only touched on the poller thread and
            // the arm-time borrow has ended.
            let slot = unsafe { &mut *(ev.udata as *mut Slot) };

            let filter = ev.filter as i32;
            let kind = if filter == libc::EVFILT_READ as i32
                || filter == libc::EVFILT_TIMER as i32
            {
                EventKind::Read
            } else if filter == libc::EVFILT_WRITE as i32 {
                EventKind::Write
            } else {
                continue;
            };

            if slot.is_armed(kind) {
                slot.events &= !kind.bit();
                self.shared.add_pending(-1);
                if let Some(handler) = slot.take_handler(kind) {
                    let result = if ev.flags as u32 & libc::EV_ERROR as u32 != 0 {
                        Err(Error::Io(std::io::Error::from_raw_os_error(ev.data as i32)))
                    } else {
                        Ok(())
                    };
                    ready.completions.push((handler, result));
                }
            }
        }

        Ok(ready)
    }

    fn drain_waker(&self) {
        let mut byte = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.waker_rd,
                    byte.as_mut_ptr() as *mut libc::c_void,
                    byte.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Close the waker pipe and the kqueue descriptor. The second call
    /// fails.
    pub(crate) fn close(&mut self) -> Result<()> {
        if !self.shared.set_closed() {
            return Err(Error::Eof);
        }
        unsafe {
            libc::close(self.waker_rd);
            libc::close(self.waker_wr);
            libc::close(self.kq);
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.shared.set_closed() {
            unsafe {
                libc::close(self.waker_rd);
                libc::close(self.waker_wr);
                libc::close(self.kq);
            }
        }
    }
}
