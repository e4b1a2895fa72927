//! In-process connected message streams.
//!
//! Each endpoint of a [`memory_pair`] delivers whole messages to the other
//! endpoint over an unbounded queue. Closing either side, or dropping a
//! sender, ends the stream for both receivers.

use std::sync::mpsc;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{MessageReceiver, MessageSender, PhysicalMessage};

#[derive(Debug)]
enum Event {
    Message(PhysicalMessage),
    Close { status_code: u16, reason: String },
    LocalClose,
    PeerGone,
}

/// One side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryEndpoint {
    receiver: MemoryReceiver,
    sender: MemorySender,
}

/// Receive half of a [`MemoryEndpoint`].
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::Receiver<Event>,
    closed: bool,
    close_status: Option<(u16, String)>,
}

/// Send half of a [`MemoryEndpoint`].
#[derive(Debug)]
pub struct MemorySender {
    peer_tx: mpsc::Sender<Event>,
    local_tx: mpsc::Sender<Event>,
    partial: Option<(bool, BytesMut)>,
    closed: bool,
}

/// Create two connected endpoints.
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (left_tx, left_rx) = mpsc::channel();
    let (right_tx, right_rx) = mpsc::channel();

    let left = MemoryEndpoint {
        receiver: MemoryReceiver::new(left_rx),
        sender: MemorySender::new(right_tx.clone(), left_tx.clone()),
    };
    let right = MemoryEndpoint {
        receiver: MemoryReceiver::new(right_rx),
        sender: MemorySender::new(left_tx, right_tx),
    };
    (left, right)
}

impl MemoryEndpoint {
    /// Split into independently owned receive and send halves.
    pub fn split(self) -> (MemoryReceiver, MemorySender) {
        (self.receiver, self.sender)
    }
}

impl MemoryReceiver {
    fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            rx,
            closed: false,
            close_status: None,
        }
    }

    /// Status code and reason sent by the peer when it closed, if any.
    pub fn close_status(&self) -> Option<(u16, &str)> {
        self.close_status
            .as_ref()
            .map(|(code, reason)| (*code, reason.as_str()))
    }
}

impl MessageReceiver for MemoryReceiver {
    fn receive_message(&mut self) -> Result<Option<PhysicalMessage>> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(Event::Message(message)) => Ok(Some(message)),
            Ok(Event::Close {
                status_code,
                reason,
            }) => {
                debug!(status_code, %reason, "memory peer closed connection");
                self.closed = true;
                self.close_status = Some((status_code, reason));
                Ok(None)
            }
            Ok(Event::LocalClose) | Ok(Event::PeerGone) | Err(_) => {
                self.closed = true;
                Ok(None)
            }
        }
    }
}

impl MemorySender {
    fn new(peer_tx: mpsc::Sender<Event>, local_tx: mpsc::Sender<Event>) -> Self {
        Self {
            peer_tx,
            local_tx,
            partial: None,
            closed: false,
        }
    }
}

impl MessageSender for MemorySender {
    fn send_message(&mut self, payload: &[u8], is_final: bool, is_binary: bool) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let (binary, mut assembled) = self
            .partial
            .take()
            .unwrap_or_else(|| (is_binary, BytesMut::new()));
        assembled.put_slice(payload);

        if !is_final {
            self.partial = Some((binary, assembled));
            return Ok(());
        }

        let message = PhysicalMessage {
            payload: assembled.freeze(),
            is_binary: binary,
        };
        self.peer_tx
            .send(Event::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    fn close_connection(&mut self, status_code: u16, reason: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.peer_tx.send(Event::Close {
            status_code,
            reason: reason.to_string(),
        });
        let _ = self.local_tx.send(Event::LocalClose);
        Ok(())
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.peer_tx.send(Event::PeerGone);
        }
    }
}
