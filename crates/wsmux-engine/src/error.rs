use std::time::Duration;

use wsmux_frame::{ChannelId, Opcode};

/// Errors that can occur in engine and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Physical transport error.
    #[error("transport error: {0}")]
    Transport(#[from] wsmux_transport::TransportError),

    /// Wire format or protocol violation.
    #[error("wire error: {0}")]
    Wire(#[from] wsmux_frame::WireError),

    /// The channel has started closing; no more frames may be sent on it.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// The channel was torn down without a closing handshake.
    #[error("channel {0} terminated")]
    ConnectionTerminated(ChannelId),

    /// The writer has stopped; nothing more reaches the physical connection.
    #[error("writer stopped")]
    WriterStopped,

    /// The handshake validator refused the default channel.
    #[error("default channel rejected with status {0}")]
    DefaultChannelRejected(u16),

    /// A fragmented message was continued with a different data opcode.
    #[error("cannot continue a {expected:?} message with {actual:?}")]
    MessageTypeMismatch { expected: Opcode, actual: Opcode },

    /// `send` only accepts text and binary opcodes.
    #[error("opcode {0:?} cannot be sent as a data message")]
    UnsupportedOpcode(Opcode),

    /// Configuration rejected by `MuxConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker, reader, or writer thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    /// Waiting for the engine to finish timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, MuxError>;
