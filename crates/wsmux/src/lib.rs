//! WebSocket-style logical channel multiplexing over one physical connection.
//!
//! A physical connection carries a control channel (0), a default channel
//! (1) created from the opening handshake, and any number of channels the
//! peer opens with AddChannelRequest blocks. Each channel has credit-based
//! flow control and its own worker thread.
//!
//! # Crate Structure
//!
//! - [`transport`]: physical message traits, stream and in-memory adapters, UDS listener
//! - [`frame`]: channel ids, control blocks, inner frames, handshake text
//! - [`engine`]: the multiplexing engine, channel I/O, validators, configuration
//! - [`physical`]: opening handshake exchanged before multiplexing starts

/// Re-export transport types.
pub mod transport {
    pub use wsmux_transport::*;
}

/// Re-export wire format types.
pub mod frame {
    pub use wsmux_frame::*;
}

/// Re-export engine types.
pub mod engine {
    pub use wsmux_engine::*;
}

pub mod physical;

pub use physical::{accept_physical_handshake, connect_physical_handshake};
