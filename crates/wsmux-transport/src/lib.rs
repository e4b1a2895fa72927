//! Physical message-stream abstraction for wsmux.
//!
//! The multiplexing engine never touches sockets directly. It consumes a
//! connection that has already been split into a [`MessageReceiver`] half and
//! a [`MessageSender`] half, each delivering whole messages:
//! - [`stream`] adapts any `Read`/`Write` byte stream using a small record codec
//! - [`memory`] provides an in-process connected pair for tests and embedding
//! - [`uds`] binds and connects Unix domain sockets (Linux/macOS)

pub mod error;
pub mod memory;
pub mod record;
pub mod stream;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{memory_pair, MemoryEndpoint, MemoryReceiver, MemorySender};
pub use record::{RecordConfig, RecordHeader, DEFAULT_MAX_MESSAGE, RECORD_HEADER_SIZE};
pub use stream::{CloseWrite, StreamReceiver, StreamSender};
pub use traits::{
    MessageReceiver, MessageSender, PhysicalMessage, STATUS_GOING_AWAY,
    STATUS_INTERNAL_ENDPOINT_ERROR, STATUS_NORMAL_CLOSURE,
};

#[cfg(unix)]
pub use uds::{UnixConnection, UnixDomainSocket};
