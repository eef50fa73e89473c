//! WebSocket stream state machine.
//!
//! A [`WebsocketStream`] layers RFC 6455 framing over a [`Transport`]:
//! the HTTP upgrade, frame decoding with fragmentation assembly, automatic
//! control-frame replies, and the close handshake. Every operation exists
//! in a blocking form and a completion-handler form over the same source
//! buffer.
//!
//! Control frames interleaved with a message read are validated, replied
//! to (Pong echo, Close echo), reported through the control callback and
//! flushed; the read that observed them then completes with EOF.

use std::cell::RefCell;
use std::fmt;
use std::io::Write as _;
use std::net::ToSocketAddrs;
use std::rc::Rc;

use bytes::BytesMut;
use http::Uri;
use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::context::IoContext;
use crate::error::{CloseCode, Error, Result};
use crate::frame::{acquire_frame, encode_close_payload, release_frame, Frame, OpCode};
use crate::handshake::{self, ExtraHeader, UpgradeRequest, UpgradeResponse};
use crate::transport::{TcpTransport, Transport};
use crate::StreamConfig;

/// WebSocket endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: sent frames are masked.
    Client,
    /// Server: sent frames are not masked.
    Server,
}

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Upgrade not performed yet.
    Handshake,
    /// Upgrade succeeded; data may flow.
    Active,
    /// We sent a Close and await the peer's echo.
    ClosedByUs,
    /// Peer sent a Close; our reply is queued or in flight.
    ClosedByPeer,
    /// The peer acknowledged the Close we initiated.
    CloseAcked,
    /// Nothing more will flow. Terminal.
    Terminated,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Handshake => "handshake",
            StreamState::Active => "active",
            StreamState::ClosedByUs => "closed-by-us",
            StreamState::ClosedByPeer => "closed-by-peer",
            StreamState::CloseAcked => "close-acked",
            StreamState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Message kind delivered by reads and the control callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// No message (errors).
    None,
    /// Text message.
    Text,
    /// Binary message.
    Binary,
    /// Close control message.
    Close,
    /// Ping control message.
    Ping,
    /// Pong control message.
    Pong,
}

impl MessageType {
    fn from_opcode(opcode: OpCode) -> MessageType {
        match opcode {
            OpCode::Text => MessageType::Text,
            OpCode::Binary => MessageType::Binary,
            OpCode::Close => MessageType::Close,
            OpCode::Ping => MessageType::Ping,
            OpCode::Pong => MessageType::Pong,
            OpCode::Continuation => MessageType::None,
        }
    }

    fn opcode(self) -> Option<OpCode> {
        match self {
            MessageType::Text => Some(OpCode::Text),
            MessageType::Binary => Some(OpCode::Binary),
            MessageType::Close => Some(OpCode::Close),
            MessageType::Ping => Some(OpCode::Ping),
            MessageType::Pong => Some(OpCode::Pong),
            MessageType::None => None,
        }
    }
}

/// Callback observing every control frame: `(kind, unmasked payload)`.
pub type ControlCallback = Box<dyn FnMut(MessageType, &[u8])>;

/// Completion for the upgrade handshake.
pub type HandshakeHandler = Box<dyn FnOnce(Result<()>)>;

/// Completion for an async message read: `(kind, bytes)` plus the caller's
/// buffer handed back.
pub type MessageHandler = Box<dyn FnOnce(Result<(MessageType, usize)>, Vec<u8>)>;

/// Completion for an async frame read.
pub type FrameHandler = Box<dyn FnOnce(Result<Frame>)>;

/// Completion for async writes and the async close.
pub type DoneHandler = Box<dyn FnOnce(Result<()>)>;

struct StreamInner {
    io: IoContext,
    role: Role,
    state: StreamState,
    config: StreamConfig,
    /// Source buffer frames are decoded from.
    src: ByteBuffer,
    transport: Option<Rc<dyn Transport>>,
    /// Control-frame replies awaiting a flush, in order.
    pending: Vec<Frame>,
    /// Opcode of the in-progress fragmented message.
    frag_opcode: Option<OpCode>,
    control_cb: Option<ControlCallback>,
    upgrade_request_cb: Option<Box<dyn FnMut(&UpgradeRequest)>>,
    upgrade_response_cb: Option<Box<dyn FnMut(&UpgradeResponse)>>,
    handshake_key: Option<String>,
    read_busy: bool,
    write_busy: bool,
}

impl StreamInner {
    fn set_state(&mut self, next: StreamState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "stream state");
            self.state = next;
        }
    }

    /// Queue a control reply, masked when we are the client.
    fn enqueue_reply(&mut self, mut frame: Frame) {
        if self.role == Role::Client {
            frame.mask();
        }
        self.pending.push(frame);
    }

    fn enqueue_protocol_close(&mut self) {
        let mut reply = acquire_frame();
        reply.set_fin();
        reply.set_close();
        reply.set_payload(&encode_close_payload(CloseCode::ProtocolError, ""));
        self.enqueue_reply(reply);
    }
}

/// Outcome of trying to decode one frame from the source buffer.
enum Parse {
    Frame(Frame),
    NeedMore,
}

/// A WebSocket stream over a byte transport.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct WebsocketStream {
    inner: Rc<RefCell<StreamInner>>,
}

impl WebsocketStream {
    /// Create a stream in the `Handshake` state with default limits.
    pub fn new(io: &IoContext, role: Role) -> Result<WebsocketStream> {
        WebsocketStream::with_config(io, role, StreamConfig::default())
    }

    /// Create a stream with explicit limits.
    pub fn with_config(io: &IoContext, role: Role, config: StreamConfig) -> Result<WebsocketStream> {
        Ok(WebsocketStream {
            inner: Rc::new(RefCell::new(StreamInner {
                io: io.clone(),
                role,
                state: StreamState::Handshake,
                config,
                src: ByteBuffer::new(),
                transport: None,
                pending: Vec::new(),
                frag_opcode: None,
                control_cb: None,
                upgrade_request_cb: None,
                upgrade_response_cb: None,
                handshake_key: None,
                read_busy: false,
                write_busy: false,
            })),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    /// Number of control replies queued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Install the byte stream beneath the codec. This is how a TLS (or
    /// any other wrapped) transport plugs in.
    pub fn set_transport(&self, transport: Rc<dyn Transport>) {
        self.inner.borrow_mut().transport = Some(transport);
    }

    /// Observe every control frame: `(kind, unmasked payload)`.
    pub fn set_control_callback<F>(&self, callback: F)
    where
        F: FnMut(MessageType, &[u8]) + 'static,
    {
        self.inner.borrow_mut().control_cb = Some(Box::new(callback));
    }

    /// Inspect the upgrade request just before it is sent.
    pub fn set_upgrade_request_callback<F>(&self, callback: F)
    where
        F: FnMut(&UpgradeRequest) + 'static,
    {
        self.inner.borrow_mut().upgrade_request_cb = Some(Box::new(callback));
    }

    /// Inspect the upgrade response once it is received.
    pub fn set_upgrade_response_callback<F>(&self, callback: F)
    where
        F: FnMut(&UpgradeResponse) + 'static,
    {
        self.inner.borrow_mut().upgrade_response_cb = Some(Box::new(callback));
    }

    fn terminate(&self) {
        self.inner.borrow_mut().set_state(StreamState::Terminated);
    }

    // ---------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------

    /// Perform the client upgrade against `url` (`ws://host[:port]/path`),
    /// dialing a TCP transport through the reactor.
    ///
    /// `wss://` needs an externally-built TLS transport: dial it yourself
    /// and use [`async_handshake_over`].
    ///
    /// [`async_handshake_over`]: WebsocketStream::async_handshake_over
    pub fn async_handshake(&self, url: &str, extra: Vec<ExtraHeader>, handler: HandshakeHandler) {
        if self.state() != StreamState::Handshake {
            handler(Err(Error::Closed));
            return;
        }
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(_) => {
                self.terminate();
                handler(Err(Error::InvalidAddress));
                return;
            }
        };
        let (host, port, tls) = match handshake::resolve_target(&uri) {
            Ok(target) => target,
            Err(e) => {
                self.terminate();
                handler(Err(e));
                return;
            }
        };
        if tls {
            self.terminate();
            handler(Err(Error::HandshakeFailed(
                "wss needs an external tls transport; use async_handshake_over",
            )));
            return;
        }

        let addr = match (host.as_str(), port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.terminate();
                    handler(Err(Error::InvalidAddress));
                    return;
                }
            },
            Err(e) => {
                self.terminate();
                handler(Err(Error::Io(e)));
                return;
            }
        };

        let io = self.inner.borrow().io.clone();
        let ws = self.clone();
        TcpTransport::async_connect(
            &io,
            addr,
            Box::new(move |result| match result {
                Ok(transport) => {
                    ws.set_transport(Rc::new(transport));
                    send_upgrade(ws, uri, host_header(&host, port, false), extra, handler);
                }
                Err(e) => {
                    ws.terminate();
                    handler(Err(e));
                }
            }),
        );
    }

    /// Perform the client upgrade over an already-connected transport
    /// (TLS collaborator, unix socket, test double).
    pub fn async_handshake_over(
        &self,
        transport: Rc<dyn Transport>,
        url: &str,
        extra: Vec<ExtraHeader>,
        handler: HandshakeHandler,
    ) {
        if self.state() != StreamState::Handshake {
            handler(Err(Error::Closed));
            return;
        }
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(_) => {
                self.terminate();
                handler(Err(Error::InvalidAddress));
                return;
            }
        };
        let (host, port, tls) = match handshake::resolve_target(&uri) {
            Ok(target) => target,
            Err(e) => {
                self.terminate();
                handler(Err(e));
                return;
            }
        };
        self.set_transport(transport);
        send_upgrade(
            self.clone(),
            uri,
            host_header(&host, port, tls),
            extra,
            handler,
        );
    }

    // ---------------------------------------------------------------
    // Read pipeline, blocking
    // ---------------------------------------------------------------

    /// Read one frame. Close frames drive the close-handshake transitions
    /// but are handed to the caller instead of completing with EOF.
    pub fn next_frame(&self) -> Result<Frame> {
        if self.state() == StreamState::Terminated {
            return Err(Error::Eof);
        }
        let frame = self.read_frame()?;
        if frame.is_close() {
            self.inner.borrow_mut().on_close_frame(&frame);
        }
        Ok(frame)
    }

    /// Assemble exactly one logical message into `buf`.
    ///
    /// Interleaved control frames are validated, replied to, reported
    /// through the control callback, flushed, and complete this read with
    /// EOF.
    pub fn next_message(&self, buf: &mut [u8]) -> Result<(MessageType, usize)> {
        if self.state() == StreamState::Terminated {
            return Err(Error::Eof);
        }

        let mut written = 0;
        let mut mtype = MessageType::None;
        loop {
            let frame = self.read_frame()?;
            if frame.is_control() {
                return self.finish_control(frame);
            }
            if self.data_frame_step(frame, buf, &mut written, &mut mtype)? {
                return Ok((mtype, written));
            }
        }
    }

    /// Decode one frame, refilling the source buffer from the transport
    /// as needed. Structural errors queue a protocol-error Close.
    fn read_frame(&self) -> Result<Frame> {
        loop {
            match self.parse_frame()? {
                Parse::Frame(frame) => return Ok(frame),
                Parse::NeedMore => {
                    let (transport, chunk) = {
                        let inner = self.inner.borrow();
                        (inner.transport.clone(), inner.config.read_chunk_size)
                    };
                    let Some(transport) = transport else {
                        self.terminate();
                        return Err(Error::Eof);
                    };
                    let mut tmp = vec![0u8; chunk];
                    match transport.read(&mut tmp) {
                        Ok(n) => {
                            let mut inner = self.inner.borrow_mut();
                            inner.src.write_all(&tmp[..n]).expect("buffer write");
                        }
                        Err(e) => {
                            self.terminate();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// One decode attempt against the bytes already buffered.
    fn parse_frame(&self) -> Result<Parse> {
        let mut inner = self.inner.borrow_mut();
        let max_payload = inner.config.max_payload_size;
        let mut frame = acquire_frame();
        match frame.read_from(&mut inner.src, max_payload) {
            Ok(Some(_)) => {
                // All downstream handling works on cleartext payloads.
                frame.unmask();
                Ok(Parse::Frame(frame))
            }
            Ok(None) => {
                release_frame(frame);
                Ok(Parse::NeedMore)
            }
            Err(e) => {
                release_frame(frame);
                if inner.state == StreamState::Active {
                    inner.enqueue_protocol_close();
                    inner.set_state(StreamState::ClosedByUs);
                }
                Err(e)
            }
        }
    }

    /// Handle a control frame seen by a message read: validate, reply,
    /// notify, flush. Always completes the read with an error, EOF for
    /// the well-formed cases.
    fn finish_control(&self, frame: Frame) -> Result<(MessageType, usize)> {
        self.control_prelude(frame)?;

        // Flush the queued replies through the write pipeline.
        if let Err(e) = self.flush_pending() {
            self.terminate();
            return Err(e);
        }

        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                // Our echo of the peer's Close has been flushed.
                StreamState::ClosedByPeer => inner.set_state(StreamState::Terminated),
                // Plain Ping/Pong: the read still terminates, and a read
                // that terminated while active terminates the stream.
                StreamState::Active => inner.set_state(StreamState::Terminated),
                _ => {}
            }
        }
        Err(Error::Eof)
    }

    /// Shared control-frame bookkeeping: validity, reply queueing, state
    /// transition, and the user callback. Returns the control kind, or
    /// `InvalidControlFrame` after queueing a 1002 Close.
    fn control_prelude(&self, frame: Frame) -> Result<MessageType> {
        if !frame.is_valid_control() {
            let mut inner = self.inner.borrow_mut();
            if inner.state == StreamState::Active {
                inner.enqueue_protocol_close();
                inner.set_state(StreamState::ClosedByUs);
            }
            release_frame(frame);
            return Err(Error::InvalidControlFrame);
        }

        let opcode = frame.opcode().ok_or(Error::Protocol("invalid opcode"))?;
        let mtype = MessageType::from_opcode(opcode);

        {
            let mut inner = self.inner.borrow_mut();
            match opcode {
                OpCode::Ping => {
                    let mut pong = acquire_frame();
                    pong.set_fin();
                    pong.set_pong();
                    pong.set_payload(frame.payload());
                    inner.enqueue_reply(pong);
                }
                OpCode::Close => inner.on_close_frame(&frame),
                _ => {}
            }
        }

        // The callback runs with the stream lock released so it can query
        // state() and pending().
        let callback = self.inner.borrow_mut().control_cb.take();
        if let Some(mut callback) = callback {
            callback(mtype, frame.payload());
            self.inner.borrow_mut().control_cb = Some(callback);
        }

        release_frame(frame);
        Ok(mtype)
    }

    /// Copy one data frame into the caller's buffer, enforcing the
    /// fragmentation rules. Returns true when the message is complete.
    fn data_frame_step(
        &self,
        frame: Frame,
        buf: &mut [u8],
        written: &mut usize,
        mtype: &mut MessageType,
    ) -> Result<bool> {
        let opcode = frame.opcode().ok_or(Error::Protocol("invalid opcode"))?;

        {
            let mut inner = self.inner.borrow_mut();
            match opcode {
                OpCode::Continuation => match inner.frag_opcode {
                    Some(stored) => *mtype = MessageType::from_opcode(stored),
                    None => {
                        // Continuation with no message in progress.
                        if inner.state == StreamState::Active {
                            inner.enqueue_protocol_close();
                            inner.set_state(StreamState::ClosedByUs);
                        }
                        release_frame(frame);
                        return Err(Error::UnexpectedOpcode);
                    }
                },
                _ => {
                    if inner.frag_opcode.is_some() {
                        // A fresh data opcode while a fragmented message is
                        // still open.
                        if inner.state == StreamState::Active {
                            inner.enqueue_protocol_close();
                            inner.set_state(StreamState::ClosedByUs);
                        }
                        release_frame(frame);
                        return Err(Error::UnexpectedOpcode);
                    }
                    inner.frag_opcode = Some(opcode);
                    *mtype = MessageType::from_opcode(opcode);
                }
            }

            let room = buf.len() - *written;
            let n = frame.payload_len().min(room);
            buf[*written..*written + n].copy_from_slice(&frame.payload()[..n]);
            *written += n;

            if frame.is_fin() {
                inner.frag_opcode = None;
                release_frame(frame);
                return Ok(true);
            }
        }
        release_frame(frame);
        Ok(false)
    }

    /// Write every queued control reply, in order, through the transport.
    fn flush_pending(&self) -> Result<()> {
        loop {
            let (transport, wire) = {
                let mut inner = self.inner.borrow_mut();
                if inner.pending.is_empty() {
                    return Ok(());
                }
                let Some(transport) = inner.transport.clone() else {
                    return Err(Error::Closed);
                };
                let frame = inner.pending.remove(0);
                let mut wire = BytesMut::new();
                frame.write_to(&mut wire);
                release_frame(frame);
                (transport, wire.freeze())
            };
            transport.write(&wire)?;
        }
    }

    // ---------------------------------------------------------------
    // Write pipeline, blocking
    // ---------------------------------------------------------------

    /// Send `payload` as a single FIN frame of the given kind.
    pub fn write(&self, payload: &[u8], mtype: MessageType) -> Result<()> {
        let Some(opcode) = mtype.opcode() else {
            return Err(Error::UnexpectedOpcode);
        };
        let mut frame = acquire_frame();
        frame.set_fin();
        frame.set_opcode(opcode);
        frame.set_payload(payload);
        self.write_frame(frame)
    }

    /// Send a caller-built frame verbatim, stamping the mask key when the
    /// role is client. Queued control replies are drained first.
    pub fn write_frame(&self, mut frame: Frame) -> Result<()> {
        {
            let inner = self.inner.borrow();
            match inner.state {
                StreamState::Handshake | StreamState::Terminated => {
                    release_frame(frame);
                    return Err(Error::Closed);
                }
                _ => {}
            }
            if inner.role == Role::Client {
                frame.mask();
            }
        }

        if let Err(e) = self.flush_pending() {
            self.terminate();
            release_frame(frame);
            return Err(e);
        }

        let transport = {
            let inner = self.inner.borrow();
            inner.transport.clone().ok_or(Error::Closed)?
        };
        let mut wire = BytesMut::new();
        frame.write_to(&mut wire);
        release_frame(frame);

        match transport.write(&wire) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.terminate();
                Err(e)
            }
        }
    }

    /// Initiate the close handshake: send `Close(code, reason)` and move
    /// to `ClosedByUs`.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.state() != StreamState::Active {
            return Err(Error::Closed);
        }

        let mut frame = acquire_frame();
        frame.set_fin();
        frame.set_close();
        frame.set_payload(&encode_close_payload(code, reason));

        self.inner.borrow_mut().set_state(StreamState::ClosedByUs);
        self.write_frame(frame)
    }

    // ---------------------------------------------------------------
    // Read pipeline, completion-style
    // ---------------------------------------------------------------

    /// Async variant of [`next_frame`].
    ///
    /// [`next_frame`]: WebsocketStream::next_frame
    pub fn async_next_frame(&self, handler: FrameHandler) {
        if self.state() == StreamState::Terminated {
            handler(Err(Error::Eof));
            return;
        }
        async_frame_loop(self.clone(), handler);
    }

    /// Async variant of [`next_message`]: the handler receives the result
    /// and the buffer back. At most one read may be outstanding.
    ///
    /// [`next_message`]: WebsocketStream::next_message
    pub fn async_next_message(&self, buf: Vec<u8>, handler: MessageHandler) {
        if self.state() == StreamState::Terminated {
            handler(Err(Error::Eof), buf);
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(!inner.read_busy, "one async read at a time");
            inner.read_busy = true;
        }
        async_message_loop(self.clone(), buf, 0, MessageType::None, handler);
    }

    // ---------------------------------------------------------------
    // Write pipeline, completion-style
    // ---------------------------------------------------------------

    /// Async variant of [`write`].
    ///
    /// [`write`]: WebsocketStream::write
    pub fn async_write(&self, payload: &[u8], mtype: MessageType, handler: DoneHandler) {
        let Some(opcode) = mtype.opcode() else {
            handler(Err(Error::UnexpectedOpcode));
            return;
        };
        let mut frame = acquire_frame();
        frame.set_fin();
        frame.set_opcode(opcode);
        frame.set_payload(payload);
        self.async_write_frame(frame, handler);
    }

    /// Async variant of [`write_frame`]. At most one write may be
    /// outstanding; queued control replies are drained first, in order.
    ///
    /// [`write_frame`]: WebsocketStream::write_frame
    pub fn async_write_frame(&self, mut frame: Frame, handler: DoneHandler) {
        let (transport, wire) = {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                StreamState::Handshake | StreamState::Terminated => {
                    release_frame(frame);
                    handler(Err(Error::Closed));
                    return;
                }
                _ => {}
            }
            let Some(transport) = inner.transport.clone() else {
                release_frame(frame);
                handler(Err(Error::Closed));
                return;
            };
            debug_assert!(!inner.write_busy, "one async write at a time");
            inner.write_busy = true;

            if inner.role == Role::Client {
                frame.mask();
            }

            // Strict ordering: replies queued before this frame go first,
            // in the same transport write.
            let mut wire = BytesMut::new();
            for reply in inner.pending.drain(..) {
                reply.write_to(&mut wire);
                release_frame(reply);
            }
            frame.write_to(&mut wire);
            release_frame(frame);
            (transport, wire.freeze())
        };

        let ws = self.clone();
        transport.async_write(
            wire,
            Box::new(move |result| {
                ws.inner.borrow_mut().write_busy = false;
                match result {
                    Ok(_) => handler(Ok(())),
                    Err(e) => {
                        ws.terminate();
                        handler(Err(e));
                    }
                }
            }),
        );
    }

    /// Async variant of [`close`].
    ///
    /// [`close`]: WebsocketStream::close
    pub fn async_close(&self, code: CloseCode, reason: &str, handler: DoneHandler) {
        if self.state() != StreamState::Active {
            handler(Err(Error::Closed));
            return;
        }

        let mut frame = acquire_frame();
        frame.set_fin();
        frame.set_close();
        frame.set_payload(&encode_close_payload(code, reason));

        self.inner.borrow_mut().set_state(StreamState::ClosedByUs);
        self.async_write_frame(frame, handler);
    }
}

impl StreamInner {
    /// Close-frame transitions shared by frame- and message-level reads:
    /// the peer's Close either opens their side of the handshake (echo
    /// queued) or acknowledges ours.
    fn on_close_frame(&mut self, frame: &Frame) {
        match self.state {
            StreamState::Active => {
                let mut reply = acquire_frame();
                reply.set_fin();
                reply.set_close();
                reply.set_payload(frame.payload());
                self.enqueue_reply(reply);
                self.set_state(StreamState::ClosedByPeer);
            }
            StreamState::ClosedByUs => self.set_state(StreamState::CloseAcked),
            _ => {}
        }
    }
}

fn host_header(host: &str, port: u16, tls: bool) -> String {
    let default = if tls { 443 } else { 80 };
    if port == default {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

// -------------------------------------------------------------------
// Completion-style drivers
// -------------------------------------------------------------------

fn send_upgrade(
    ws: WebsocketStream,
    uri: Uri,
    host_header: String,
    extra: Vec<ExtraHeader>,
    handler: HandshakeHandler,
) {
    let key = handshake::generate_key();
    let (wire, request) = handshake::build_request(&uri, &host_header, &key, &extra);
    ws.inner.borrow_mut().handshake_key = Some(key);

    let callback = ws.inner.borrow_mut().upgrade_request_cb.take();
    if let Some(mut callback) = callback {
        callback(&request);
        ws.inner.borrow_mut().upgrade_request_cb = Some(callback);
    }

    let transport = match ws.inner.borrow().transport.clone() {
        Some(t) => t,
        None => {
            handler(Err(Error::Closed));
            return;
        }
    };
    let ws2 = ws.clone();
    transport.async_write(
        wire,
        Box::new(move |result| match result {
            Ok(_) => read_upgrade_response(ws2, handler),
            Err(e) => {
                ws2.terminate();
                handler(Err(e));
            }
        }),
    );
}

fn read_upgrade_response(ws: WebsocketStream, handler: HandshakeHandler) {
    let (transport, chunk) = {
        let inner = ws.inner.borrow();
        match inner.transport.clone() {
            Some(t) => (t, inner.config.read_chunk_size),
            None => {
                drop(inner);
                ws.terminate();
                handler(Err(Error::Closed));
                return;
            }
        }
    };

    let ws2 = ws.clone();
    transport.async_read(
        vec![0u8; chunk],
        Box::new(move |result, tmp| {
            let n = match result {
                Ok(n) => n,
                Err(e) => {
                    ws2.terminate();
                    handler(Err(e));
                    return;
                }
            };

            let parsed = {
                let mut inner = ws2.inner.borrow_mut();
                inner.src.write_all(&tmp[..n]).expect("buffer write");
                let limit = inner.config.max_handshake_size;
                if inner.src.read_len() > limit {
                    Err(Error::InvalidHttp("response too large"))
                } else {
                    handshake::parse_response(inner.src.data())
                }
            };

            match parsed {
                Err(e) => {
                    ws2.terminate();
                    handler(Err(e));
                }
                Ok(None) => read_upgrade_response(ws2, handler),
                Ok(Some((response, consumed))) => {
                    finish_upgrade(ws2, response, consumed, handler);
                }
            }
        }),
    );
}

fn finish_upgrade(
    ws: WebsocketStream,
    response: UpgradeResponse,
    consumed: usize,
    handler: HandshakeHandler,
) {
    let key = {
        let mut inner = ws.inner.borrow_mut();
        // Frame bytes pipelined behind the response stay in the source
        // buffer.
        inner.src.consume(consumed);
        inner.handshake_key.take().unwrap_or_default()
    };

    if response.status() != 101 {
        ws.terminate();
        handler(Err(Error::HandshakeFailed("expected 101 Switching Protocols")));
        return;
    }
    match response.header("sec-websocket-accept") {
        Some(accept) if handshake::validate_accept(&key, accept) => {}
        Some(_) => {
            ws.terminate();
            handler(Err(Error::HandshakeFailed("Sec-WebSocket-Accept mismatch")));
            return;
        }
        None => {
            ws.terminate();
            handler(Err(Error::HandshakeFailed("missing Sec-WebSocket-Accept")));
            return;
        }
    }

    let callback = ws.inner.borrow_mut().upgrade_response_cb.take();
    if let Some(mut callback) = callback {
        callback(&response);
        ws.inner.borrow_mut().upgrade_response_cb = Some(callback);
    }

    ws.inner.borrow_mut().set_state(StreamState::Active);
    handler(Ok(()));
}

fn async_frame_loop(ws: WebsocketStream, handler: FrameHandler) {
    match ws.parse_frame() {
        Ok(Parse::Frame(frame)) => {
            if frame.is_close() {
                ws.inner.borrow_mut().on_close_frame(&frame);
            }
            handler(Ok(frame));
        }
        Ok(Parse::NeedMore) => refill_async(ws, handler, async_frame_loop, |h, e| h(Err(e))),
        Err(e) => handler(Err(e)),
    }
}

fn async_message_loop(
    ws: WebsocketStream,
    mut buf: Vec<u8>,
    mut written: usize,
    mut mtype: MessageType,
    handler: MessageHandler,
) {
    loop {
        match ws.parse_frame() {
            Ok(Parse::Frame(frame)) => {
                if frame.is_control() {
                    finish_control_async(ws, frame, buf, handler);
                    return;
                }
                match ws.data_frame_step(frame, &mut buf, &mut written, &mut mtype) {
                    Ok(true) => {
                        finish_read(&ws, handler, Ok((mtype, written)), buf);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        finish_read(&ws, handler, Err(e), buf);
                        return;
                    }
                }
            }
            Ok(Parse::NeedMore) => {
                let ws2 = ws.clone();
                refill_async(
                    ws,
                    (buf, written, mtype, handler),
                    move |ws, (buf, written, mtype, handler)| {
                        async_message_loop(ws, buf, written, mtype, handler)
                    },
                    move |(buf, _, _, handler), e| finish_read(&ws2, handler, Err(e), buf),
                );
                return;
            }
            Err(e) => {
                finish_read(&ws, handler, Err(e), buf);
                return;
            }
        }
    }
}

/// Control-frame tail of an async message read: bookkeeping, async flush,
/// post-flush transition, EOF completion.
fn finish_control_async(ws: WebsocketStream, frame: Frame, buf: Vec<u8>, handler: MessageHandler) {
    match ws.control_prelude(frame) {
        Err(e) => finish_read(&ws, handler, Err(e), buf),
        Ok(_) => {
            let ws2 = ws.clone();
            async_flush(ws, Box::new(move |result| {
                if let Err(e) = result {
                    ws2.terminate();
                    finish_read(&ws2, handler, Err(e), buf);
                    return;
                }
                {
                    let mut inner = ws2.inner.borrow_mut();
                    match inner.state {
                        StreamState::ClosedByPeer => inner.set_state(StreamState::Terminated),
                        StreamState::Active => inner.set_state(StreamState::Terminated),
                        _ => {}
                    }
                }
                finish_read(&ws2, handler, Err(Error::Eof), buf);
            }));
        }
    }
}

fn finish_read(
    ws: &WebsocketStream,
    handler: MessageHandler,
    result: Result<(MessageType, usize)>,
    buf: Vec<u8>,
) {
    ws.inner.borrow_mut().read_busy = false;
    handler(result, buf);
}

/// Pull one transport chunk into the source buffer, then continue with
/// `resume`; transport failures terminate the stream and go to `fail`.
fn refill_async<T: 'static>(
    ws: WebsocketStream,
    carry: T,
    resume: impl FnOnce(WebsocketStream, T) + 'static,
    fail: impl FnOnce(T, Error) + 'static,
) {
    let (transport, chunk) = {
        let inner = ws.inner.borrow();
        (inner.transport.clone(), inner.config.read_chunk_size)
    };
    let Some(transport) = transport else {
        ws.terminate();
        fail(carry, Error::Eof);
        return;
    };

    transport.async_read(
        vec![0u8; chunk],
        Box::new(move |result, tmp| match result {
            Ok(n) => {
                ws.inner
                    .borrow_mut()
                    .src
                    .write_all(&tmp[..n])
                    .expect("buffer write");
                resume(ws, carry);
            }
            Err(e) => {
                ws.terminate();
                fail(carry, e);
            }
        }),
    );
}

/// Drain the reply queue one frame at a time through async writes.
fn async_flush(ws: WebsocketStream, done: DoneHandler) {
    let (transport, wire) = {
        let mut inner = ws.inner.borrow_mut();
        if inner.pending.is_empty() {
            drop(inner);
            done(Ok(()));
            return;
        }
        let Some(transport) = inner.transport.clone() else {
            drop(inner);
            done(Err(Error::Closed));
            return;
        };
        let frame = inner.pending.remove(0);
        let mut wire = BytesMut::new();
        frame.write_to(&mut wire);
        release_frame(frame);
        (transport, wire.freeze())
    };

    let ws2 = ws.clone();
    transport.async_write(
        wire,
        Box::new(move |result| match result {
            Ok(_) => async_flush(ws2, done),
            Err(e) => done(Err(e)),
        }),
    );
}
