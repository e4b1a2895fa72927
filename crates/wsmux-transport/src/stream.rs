use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::record::{decode_record, encode_close_payload, encode_record, RecordConfig, RecordHeader};
use crate::traits::{MessageReceiver, MessageSender, PhysicalMessage};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Byte streams that can be shut down once the closing record is flushed.
///
/// Shutting down a socket also wakes a reader blocked on a cloned handle,
/// which is how the engine's reader thread observes a local close.
pub trait CloseWrite {
    /// Shut the stream down. The default does nothing.
    fn close_write(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl CloseWrite for std::os::unix::net::UnixStream {
    fn close_write(&mut self) -> std::io::Result<()> {
        match self.shutdown(std::net::Shutdown::Both) {
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl CloseWrite for std::net::TcpStream {
    fn close_write(&mut self) -> std::io::Result<()> {
        match self.shutdown(std::net::Shutdown::Both) {
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl CloseWrite for Vec<u8> {}

impl<T> CloseWrite for std::io::Cursor<T> {}

/// Reads complete physical messages from any `Read` stream.
///
/// Handles partial reads and fragmented records internally; callers always
/// get whole messages.
pub struct StreamReceiver<T> {
    inner: T,
    buf: BytesMut,
    partial: Option<(bool, BytesMut)>,
    config: RecordConfig,
    closed: bool,
    close_status: Option<(u16, String)>,
}

impl<T: Read> StreamReceiver<T> {
    /// Create a new receiver with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, RecordConfig::default())
    }

    /// Create a new receiver with explicit configuration.
    pub fn with_config(inner: T, config: RecordConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            partial: None,
            config,
            closed: false,
            close_status: None,
        }
    }

    /// Status code and reason carried by the peer's closing record, if any.
    pub fn close_status(&self) -> Option<(u16, &str)> {
        self.close_status
            .as_ref()
            .map(|(code, reason)| (*code, reason.as_str()))
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the receiver and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn read_record(&mut self) -> Result<Option<(RecordHeader, Bytes)>> {
        loop {
            if let Some(record) = decode_record(&mut self.buf, self.config.max_message_size)? {
                return Ok(Some(record));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            };

            if read == 0 {
                if self.buf.is_empty() && self.partial.is_none() {
                    return Ok(None);
                }
                return Err(TransportError::Truncated);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn record_close(&mut self, payload: &[u8]) {
        self.closed = true;
        if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
            debug!(code, %reason, "peer closed physical connection");
            self.close_status = Some((code, reason));
        } else {
            debug!("peer closed physical connection without status");
        }
    }
}

impl<T: Read + Send> MessageReceiver for StreamReceiver<T> {
    fn receive_message(&mut self) -> Result<Option<PhysicalMessage>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            let Some((header, payload)) = self.read_record()? else {
                self.closed = true;
                return Ok(None);
            };

            if header.close {
                self.record_close(&payload);
                return Ok(None);
            }

            let (binary, mut assembled) = match self.partial.take() {
                Some((binary, assembled)) => (binary, assembled),
                None => (header.binary, BytesMut::new()),
            };

            if assembled.len() + payload.len() > self.config.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    size: assembled.len() + payload.len(),
                    max: self.config.max_message_size,
                });
            }
            assembled.put_slice(&payload);

            if header.fin {
                return Ok(Some(PhysicalMessage {
                    payload: assembled.freeze(),
                    is_binary: binary,
                }));
            }
            self.partial = Some((binary, assembled));
        }
    }
}

/// Writes physical messages to any `Write` stream.
pub struct StreamSender<T> {
    inner: T,
    buf: BytesMut,
    closed: bool,
}

impl<T: Write + CloseWrite> StreamSender<T> {
    /// Create a new sender.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            closed: false,
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the sender and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn write_record(&mut self, header: RecordHeader, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_record(header, payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

impl<T: Write + CloseWrite + Send> MessageSender for StreamSender<T> {
    fn send_message(&mut self, payload: &[u8], is_final: bool, is_binary: bool) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.write_record(RecordHeader::data(is_final, is_binary), payload)
    }

    fn close_connection(&mut self, status_code: u16, reason: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let payload = encode_close_payload(status_code, reason);
        let written = self.write_record(RecordHeader::close(), &payload);
        self.inner.close_write()?;
        written
    }
}
