//! epoll backend (Linux).
//!
//! Interests are `EPOLLIN`/`EPOLLOUT | EPOLLONESHOT`; the slot address
//! travels in the event's user-data word. One-shot on epoll disarms the
//! *descriptor*, not the filter, so after dispatch any interest the slot
//! still holds is re-armed with `EPOLL_CTL_MOD`. The waker is an eventfd.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::slot::{EventKind, Slot, READABLE, WRITABLE};

use super::{ReadySet, Shared};

const EVENT_CAPACITY: usize = 128;

/// epoll-backed readiness poller.
pub struct Poller {
    epfd: RawFd,
    waker: RawFd,
    events: Vec<libc::epoll_event>,
    shared: Arc<Shared>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os_error());
        }

        let waker = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if waker < 0 {
            let err = Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }

        // The waker is recognised by a null user-data word. It stays
        // registered level-style for the poller's whole life and is not
        // counted in `pending`.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, waker, &mut ev) } < 0 {
            let err = Error::last_os_error();
            unsafe {
                libc::close(waker);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Poller {
            epfd,
            waker,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY],
            shared: Arc::new(Shared::new(waker)),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Arm a one-shot read interest. No-op if already armed.
    pub fn set_read(&mut self, slot: &mut Slot) -> Result<()> {
        self.arm(slot, EventKind::Read)
    }

    /// Arm a one-shot write interest. No-op if already armed.
    pub fn set_write(&mut self, slot: &mut Slot) -> Result<()> {
        self.arm(slot, EventKind::Write)
    }

    fn arm(&mut self, slot: &mut Slot, kind: EventKind) -> Result<()> {
        if slot.is_armed(kind) {
            return Ok(());
        }
        debug_assert!(
            slot.handlers[kind as usize].is_some(),
            "arming {:?} without a handler",
            kind
        );

        slot.events |= kind.bit();
        if let Err(e) = self.update(slot) {
            slot.events &= !kind.bit();
            return Err(e);
        }
        self.shared.add_pending(1);
        Ok(())
    }

    /// Unarm the read interest, dropping its handler.
    pub fn del_read(&mut self, slot: &mut Slot) -> Result<()> {
        self.unarm(slot, EventKind::Read)
    }

    /// Unarm the write interest, dropping its handler.
    pub fn del_write(&mut self, slot: &mut Slot) -> Result<()> {
        self.unarm(slot, EventKind::Write)
    }

    /// Unarm every interest on the slot.
    pub fn del(&mut self, slot: &mut Slot) -> Result<()> {
        self.del_read(slot)?;
        self.del_write(slot)
    }

    fn unarm(&mut self, slot: &mut Slot, kind: EventKind) -> Result<()> {
        if !slot.is_armed(kind) {
            return Ok(());
        }
        slot.events &= !kind.bit();
        slot.take_handler(kind);
        self.shared.add_pending(-1);
        self.update(slot)
    }

    /// Push the slot's current interest set to the kernel.
    fn update(&self, slot: &mut Slot) -> Result<()> {
        if slot.events == 0 {
            let rc = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, slot.fd, std::ptr::null_mut())
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                // Already gone: the fd was closed or never added.
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(Error::Io(err));
                }
            }
            return Ok(());
        }

        let mut events = libc::EPOLLONESHOT as u32;
        if slot.events & READABLE != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if slot.events & WRITABLE != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: slot as *mut Slot as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, slot.fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            // Known descriptor (a previous one-shot left it registered but
            // disabled): re-arm in place.
            if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, slot.fd, &mut ev) } == 0 {
                return Ok(());
            }
            return Err(Error::last_os_error());
        }
        Err(Error::Io(err))
    }

    /// Wait for readiness and collect what became runnable.
    ///
    /// `timeout_ms < 0` returns immediately; otherwise blocks up to the
    /// deadline and reports `Timeout` on a zero-event wake.
    pub(crate) fn poll(&mut self, timeout_ms: i64) -> Result<ReadySet> {
        if self.shared.closed() {
            return Err(Error::Closed);
        }

        let timeout = if timeout_ms < 0 {
            0
        } else {
            timeout_ms.min(i32::MAX as i64) as i32
        };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
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
            if ev.u64 == 0 {
                self.drain_waker();
                ready.posts = self.shared.take_posts();
                trace!(posts = ready.posts.len(), "waker fired");
                continue;
            }

            // Safety: the user-data word is the address of a live, pinned
            // Slot armed by this poller; slots are only touched on the
            // poller thread and the arm-time borrow has ended.
            let slot = unsafe { &mut *(ev.u64 as usize as *mut Slot) };

            let err_mask = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
            let readable = ev.events & (libc::EPOLLIN as u32 | err_mask) != 0;
            let writable = ev.events & (libc::EPOLLOUT as u32 | err_mask) != 0;

            for (kind, hit) in [(EventKind::Read, readable), (EventKind::Write, writable)] {
                if hit && slot.is_armed(kind) {
                    slot.events &= !kind.bit();
                    self.shared.add_pending(-1);
                    if let Some(handler) = slot.take_handler(kind) {
                        ready.completions.push((handler, Ok(())));
                    }
                }
            }

            // EPOLLONESHOT disarmed the whole descriptor; put back any
            // interest the slot still holds.
            if slot.events != 0 {
                self.update(slot)?;
            }
        }

        Ok(ready)
    }

    fn drain_waker(&self) {
        let mut counter = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.waker, counter.as_mut_ptr() as *mut libc::c_void, 8)
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Close the waker and the epoll descriptor. The second call fails.
    pub(crate) fn close(&mut self) -> Result<()> {
        if !self.shared.set_closed() {
            return Err(Error::Eof);
        }
        unsafe {
            libc::close(self.waker);
            libc::close(self.epfd);
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.shared.set_closed() {
            unsafe {
                libc::close(self.waker);
                libc::close(self.epfd);
            }
        }
    }
}
