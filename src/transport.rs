//! Byte-stream transports beneath the WebSocket layer.
//!
//! [`Transport`] is the seam the stream reads and writes through. TLS and
//! any other wrapped byte stream plug in here: implement the trait and
//! hand the object to the stream, and the codec never knows the
//! difference. [`TcpTransport`] is the plain-TCP implementation: a
//! non-blocking socket with one embedded [`Slot`] per direction, armed
//! one-shot against the reactor.
//!
//! The async calls pass buffer ownership through the completion handler:
//! the handler gets the buffer back together with the result, so no
//! borrow has to survive a suspension.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bytes::Bytes;
use tracing::trace;

use crate::context::IoContext;
use crate::error::{Error, Result};
use crate::slot::{EventKind, Slot};

/// Completion for an async read: bytes read plus the buffer handed back.
pub type ReadHandler = Box<dyn FnOnce(Result<usize>, Vec<u8>)>;

/// Completion for an async write: total bytes written.
pub type WriteHandler = Box<dyn FnOnce(Result<usize>)>;

/// Completion for an async connect.
pub type ConnectHandler = Box<dyn FnOnce(Result<TcpTransport>)>;

/// A byte stream the WebSocket layer can suspend on.
pub trait Transport {
    /// Read at least one byte into `buf`, blocking if nothing is ready.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf`, blocking while the kernel buffer is full.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Read at least one byte into `buf`, suspending on the reactor when
    /// nothing is ready. At most one read may be outstanding.
    fn async_read(&self, buf: Vec<u8>, handler: ReadHandler);

    /// Write all of `buf`, suspending on the reactor when the kernel
    /// buffer is full. At most one write may be outstanding.
    fn async_write(&self, buf: Bytes, handler: WriteHandler);

    /// Cancel armed interests and close the underlying descriptor.
    /// Pending handlers complete with an error.
    fn close(&self);
}

struct TcpInner {
    io: IoContext,
    fd: RawFd,
    read_slot: RefCell<Box<Slot>>,
    write_slot: RefCell<Box<Slot>>,
    closed: Cell<bool>,
}

/// Plain TCP transport over the reactor.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Rc<TcpInner>,
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

/// Convert a socket address into kernel form.
fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr_storage is a plain C struct; all-zero is valid and
    // large enough for both families.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Block until `fd` reports the given poll events.
fn wait_for(fd: RawFd, events: libc::c_short) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if rc > 0 {
            return Ok(());
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(err));
        }
    }
}

impl TcpTransport {
    /// Wrap an already-connected descriptor. The fd is switched to
    /// non-blocking mode and owned by the transport from here on.
    pub fn from_fd(io: &IoContext, fd: RawFd) -> Result<TcpTransport> {
        set_nonblock_cloexec(fd)?;

        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
        unsafe {
            // Suppress SIGPIPE per-socket where MSG_NOSIGNAL is missing.
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        Ok(TcpTransport {
            inner: Rc::new(TcpInner {
                io: io.clone(),
                fd,
                read_slot: RefCell::new(Slot::new(fd)),
                write_slot: RefCell::new(Slot::new(fd)),
                closed: Cell::new(false),
            }),
        })
    }

    /// Open a non-blocking connection to `addr`; the handler fires once
    /// the connect completes or fails.
    pub fn async_connect(io: &IoContext, addr: SocketAddr, handler: ConnectHandler) {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            handler(Err(Error::last_os_error()));
            return;
        }

        let transport = match TcpTransport::from_fd(io, fd) {
            Ok(t) => t,
            Err(e) => {
                unsafe { libc::close(fd) };
                handler(Err(e));
                return;
            }
        };

        let (storage, len) = to_sockaddr(&addr);
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc == 0 {
            trace!(fd, %addr, "connected immediately");
            handler(Ok(transport));
            return;
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            transport.close();
            handler(Err(Error::Io(err)));
            return;
        }

        // In progress: writability signals the outcome, SO_ERROR tells
        // which one it was.
        let inner = transport.inner.clone();
        let mut slot = transport.inner.write_slot.borrow_mut();
        slot.set_handler(
            EventKind::Write,
            Box::new(move |result| {
                if let Err(e) = result {
                    inner.closed.set(true);
                    unsafe { libc::close(inner.fd) };
                    handler(Err(e));
                    return;
                }

                let mut so_error: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        inner.fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc < 0 {
                    so_error = std::io::Error::last_os_error()
                        .raw_os_error()
                        .unwrap_or(libc::EIO);
                }
                if so_error != 0 {
                    inner.closed.set(true);
                    unsafe { libc::close(inner.fd) };
                    handler(Err(Error::Io(std::io::Error::from_raw_os_error(so_error))));
                    return;
                }

                trace!(fd = inner.fd, "connect completed");
                handler(Ok(TcpTransport { inner: inner.clone() }));
            }),
        );
        if let Err(e) = transport.inner.io.set_write(&mut slot) {
            if let Some(completion) = slot.take_handler(EventKind::Write) {
                drop(slot);
                completion(Err(e));
            }
        }
    }

    /// The raw descriptor, for socket-option tweaks.
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }
}

fn read_attempt(inner: Rc<TcpInner>, mut buf: Vec<u8>, handler: ReadHandler) {
    if inner.closed.get() {
        handler(Err(Error::Closed), buf);
        return;
    }
    debug_assert!(!buf.is_empty(), "async_read with an empty buffer");

    loop {
        let n = unsafe {
            libc::read(
                inner.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n > 0 {
            handler(Ok(n as usize), buf);
            return;
        }
        if n == 0 {
            handler(Err(Error::Eof), buf);
            return;
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                // Suspend: re-enter this function when the fd is readable.
                let retry_inner = inner.clone();
                let mut slot = inner.read_slot.borrow_mut();
                slot.set_handler(
                    EventKind::Read,
                    Box::new(move |result| match result {
                        Ok(()) => read_attempt(retry_inner, buf, handler),
                        Err(e) => handler(Err(e), buf),
                    }),
                );
                if let Err(e) = inner.io.set_read(&mut slot) {
                    if let Some(completion) = slot.take_handler(EventKind::Read) {
                        drop(slot);
                        completion(Err(e));
                    }
                }
                return;
            }
            _ => {
                handler(Err(Error::Io(err)), buf);
                return;
            }
        }
    }
}

fn send_some(fd: RawFd, buf: &[u8]) -> isize {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    }
}

fn write_attempt(inner: Rc<TcpInner>, buf: Bytes, mut offset: usize, handler: WriteHandler) {
    if inner.closed.get() {
        handler(Err(Error::Closed));
        return;
    }

    loop {
        if offset == buf.len() {
            handler(Ok(offset));
            return;
        }

        let n = send_some(inner.fd, &buf[offset..]);
        if n >= 0 {
            offset += n as usize;
            continue;
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let retry_inner = inner.clone();
                let mut slot = inner.write_slot.borrow_mut();
                slot.set_handler(
                    EventKind::Write,
                    Box::new(move |result| match result {
                        Ok(()) => write_attempt(retry_inner, buf, offset, handler),
                        Err(e) => handler(Err(e)),
                    }),
                );
                if let Err(e) = inner.io.set_write(&mut slot) {
                    if let Some(completion) = slot.take_handler(EventKind::Write) {
                        drop(slot);
                        completion(Err(e));
                    }
                }
                return;
            }
            _ => {
                handler(Err(Error::Io(err)));
                return;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                return Err(Error::Eof);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EAGAIN) => wait_for(self.inner.fd, libc::POLLIN)?,
                _ => return Err(Error::Io(err)),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        let mut offset = 0;
        while offset < buf.len() {
            let n = send_some(self.inner.fd, &buf[offset..]);
            if n >= 0 {
                offset += n as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EAGAIN) => wait_for(self.inner.fd, libc::POLLOUT)?,
                _ => return Err(Error::Io(err)),
            }
        }
        Ok(offset)
    }

    fn async_read(&self, buf: Vec<u8>, handler: ReadHandler) {
        read_attempt(self.inner.clone(), buf, handler);
    }

    fn async_write(&self, buf: Bytes, handler: WriteHandler) {
        write_attempt(self.inner.clone(), buf, 0, handler);
    }

    fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        // Dropping the armed handlers also breaks their Rc back-references
        // into this transport.
        let _ = self.inner.io.del_read(&mut self.inner.read_slot.borrow_mut());
        let _ = self
            .inner
            .io
            .del_write(&mut self.inner.write_slot.borrow_mut());
        unsafe {
            libc::close(self.inner.fd);
        }
    }
}

impl Drop for TcpInner {
    fn drop(&mut self) {
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
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn run_until<F: Fn() -> bool>(io: &IoContext, done: F) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            match io.run_one() {
                Ok(_) | Err(Error::Timeout) => {}
                Err(e) => panic!("unexpected run error: {e}"),
            }
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_connect_read_write_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"hello").unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            tx.send(buf.to_vec()).unwrap();
        });

        let io = IoContext::with_timeout(100).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let echoed = Rc::new(Cell::new(false));

        {
            let got = got.clone();
            let echoed = echoed.clone();
            TcpTransport::async_connect(
                &io,
                addr,
                Box::new(move |result| {
                    let transport = result.unwrap();
                    let inner_got = got.clone();
                    let transport2 = transport.clone();
                    transport.async_read(
                        vec![0; 64],
                        Box::new(move |result, buf| {
                            let n = result.unwrap();
                            inner_got.borrow_mut().extend_from_slice(&buf[..n]);
                            let echoed = echoed.clone();
                            transport2.async_write(
                                Bytes::from_static(b"world"),
                                Box::new(move |result| {
                                    assert_eq!(result.unwrap(), 5);
                                    echoed.set(true);
                                }),
                            );
                        }),
                    );
                }),
            );
        }

        run_until(&io, || echoed.get() && got.borrow().len() == 5);
        assert_eq!(got.borrow().as_slice(), b"hello");
        assert_eq!(rx.recv().unwrap(), b"world");
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with (very likely) nothing on it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let io = IoContext::with_timeout(100).unwrap();
        let failed = Rc::new(Cell::new(false));

        {
            let failed = failed.clone();
            TcpTransport::async_connect(
                &io,
                addr,
                Box::new(move |result| {
                    assert!(result.is_err());
                    failed.set(true);
                }),
            );
        }

        run_until(&io, || failed.get());
    }

    #[test]
    fn test_sync_read_after_peer_close_is_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });

        let io = IoContext::with_timeout(100).unwrap();
        let connected = Rc::new(RefCell::new(None));

        {
            let connected = connected.clone();
            TcpTransport::async_connect(
                &io,
                addr,
                Box::new(move |result| {
                    *connected.borrow_mut() = Some(result.unwrap());
                }),
            );
        }
        run_until(&io, || connected.borrow().is_some());
        server.join().unwrap();

        let transport = connected.borrow_mut().take().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(transport.read(&mut buf), Err(Error::Eof)));
    }
}
