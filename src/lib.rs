//! # Sirocco: single-threaded non-blocking I/O runtime with a WebSocket codec
//!
//! A readiness-based reactor for network-intensive programs, plus an
//! RFC 6455 WebSocket stream layered on it.
//!
//! ## Design
//!
//! - **One thread, completion handlers**: the reactor blocks on the kernel
//!   (epoll on Linux, kqueue on the BSD family), dispatches ready events to
//!   one-shot completion handlers in-line, then drains a cross-thread post
//!   queue. Handlers run to completion; anything that wants to wait arms a
//!   new interest and returns.
//! - **Cross-thread posting**: [`Poster`] is the only `Send` surface. A
//!   posted handler wakes the reactor through an eventfd (Linux) or a pipe
//!   (BSD) and runs on the reactor thread in FIFO order.
//! - **WebSocket client**: [`WebsocketStream`] decodes and encodes RFC 6455
//!   frames, assembles fragmented messages, answers Pings, and drives the
//!   close handshake, exposing both blocking and completion-style calls
//!   over the same source buffer.
//!
//! ## Example
//!
//! ```no_run
//! use sirocco::IoContext;
//!
//! let io = IoContext::new().unwrap();
//! for i in 0..10 {
//!     io.post(move || println!("posted: {i}")).unwrap();
//! }
//! io.run_pending().unwrap();
//! ```

pub mod buffer;
pub mod context;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod poller;
pub mod slot;
pub mod stream;
pub mod timer;
pub mod transport;

pub use buffer::ByteBuffer;
pub use context::{IoContext, Poster};
pub use error::{CloseCode, Error, Result};
pub use frame::{
    acquire_frame, decode_close_payload, encode_close_payload, release_frame, Frame, OpCode,
};
pub use handshake::{extra_header, ExtraHeader, UpgradeRequest, UpgradeResponse};
pub use slot::{EventKind, Slot};
pub use stream::{MessageType, Role, StreamState, WebsocketStream};
pub use timer::Timer;
pub use transport::{TcpTransport, Transport};

/// GUID concatenated with the client key when computing `Sec-WebSocket-Accept`.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes).
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable in the 7-bit length field.
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload encodable with the 16-bit length extension.
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Configuration for WebSocket streams.
///
/// # Example
///
/// ```
/// use sirocco::StreamConfig;
///
/// let config = StreamConfig::builder()
///     .max_payload_size(16 * 1024)
///     .read_chunk_size(8 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum accepted frame payload length (default: 16MB).
    pub max_payload_size: usize,
    /// How many bytes each refill asks the transport for (default: 4KB).
    pub read_chunk_size: usize,
    /// Maximum size of the HTTP upgrade response (default: 8KB).
    pub max_handshake_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 16 * 1024 * 1024,
            read_chunk_size: 4096,
            max_handshake_size: 8192,
        }
    }
}

impl StreamConfig {
    /// Create a new config builder.
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::new()
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: StreamConfig::default(),
        }
    }

    /// Set the maximum accepted frame payload length.
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the transport refill chunk size.
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    /// Set the maximum HTTP upgrade response size.
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StreamConfig {
        self.config
    }
}

impl Default for StreamConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::{IoContext, Poster};
    pub use crate::error::{CloseCode, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::stream::{MessageType, Role, StreamState, WebsocketStream};
    pub use crate::StreamConfig;
}
