use bytes::Bytes;

use crate::error::Result;

/// Closing status: the purpose of the connection has been fulfilled.
pub const STATUS_NORMAL_CLOSURE: u16 = 1000;
/// Closing status: the endpoint is going away.
pub const STATUS_GOING_AWAY: u16 = 1001;
/// Closing status: the endpoint hit a condition that prevented it from continuing.
pub const STATUS_INTERNAL_ENDPOINT_ERROR: u16 = 1011;

/// A complete message received from the physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalMessage {
    /// Reassembled message payload.
    pub payload: Bytes,
    /// Whether the message was sent as binary (as opposed to text).
    pub is_binary: bool,
}

impl PhysicalMessage {
    /// Create a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            is_binary: true,
        }
    }

    /// Create a text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            is_binary: false,
        }
    }
}

/// Send half of a physical connection.
///
/// Implementations are not required to tolerate concurrent use; the engine
/// funnels every outbound message through a single writer thread.
pub trait MessageSender: Send {
    /// Send one message (or one fragment of it when `is_final` is false).
    fn send_message(&mut self, payload: &[u8], is_final: bool, is_binary: bool) -> Result<()>;

    /// Close the physical connection with a status code and reason.
    fn close_connection(&mut self, status_code: u16, reason: &str) -> Result<()>;
}

/// Receive half of a physical connection.
pub trait MessageReceiver: Send {
    /// Block until a complete message arrives.
    ///
    /// Returns `Ok(None)` once the connection has been closed by either side.
    fn receive_message(&mut self) -> Result<Option<PhysicalMessage>>;
}

impl<T: MessageSender + ?Sized> MessageSender for Box<T> {
    fn send_message(&mut self, payload: &[u8], is_final: bool, is_binary: bool) -> Result<()> {
        (**self).send_message(payload, is_final, is_binary)
    }

    fn close_connection(&mut self, status_code: u16, reason: &str) -> Result<()> {
        (**self).close_connection(status_code, reason)
    }
}

impl<T: MessageReceiver + ?Sized> MessageReceiver for Box<T> {
    fn receive_message(&mut self) -> Result<Option<PhysicalMessage>> {
        (**self).receive_message()
    }
}
