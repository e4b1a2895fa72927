//! Logical channel multiplexing over a single physical connection.
//!
//! [`MuxEngine`] owns both halves of a physical connection. It runs one
//! reader thread and one writer thread, plus one worker thread per logical
//! channel. Each worker hands its channel's [`ChannelIo`] to the
//! application [`Dispatcher`].
//!
//! ```no_run
//! use wsmux_engine::{EchoDispatcher, MuxEngine};
//! use wsmux_frame::RequestHead;
//! use wsmux_transport::UnixDomainSocket;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = UnixDomainSocket::bind("/tmp/wsmux.sock")?;
//! let (receiver, sender) = listener.accept()?;
//! let request = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
//! MuxEngine::builder(EchoDispatcher).serve(receiver, sender, request)?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handshake;
mod table;
mod writer;

pub use channel::{ChannelIo, ClosingState};
pub use config::{HandshakeConfig, MuxConfig};
pub use dispatch::{Dispatcher, EchoDispatcher};
pub use engine::{EngineState, MuxEngine, MuxEngineBuilder};
pub use error::{MuxError, Result};
pub use handshake::{HandshakeDecision, HandshakeValidator, LogicalRequest, StandardValidator};
