//! The single writer thread that owns the physical send half.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};
use wsmux_frame::{encode_channel_id, encoded_channel_id_len, ChannelId};
use wsmux_transport::MessageSender;

use crate::error::{MuxError, Result};

/// Signalled by the writer once an item has reached the physical connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteCompletion {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl WriteCompletion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn complete(&self, written: bool) {
        let (done, cond) = &*self.inner;
        *lock(done) = Some(written);
        cond.notify_all();
    }

    /// Block until the writer has handled the item.
    pub(crate) fn wait(&self) -> Result<()> {
        let (done, cond) = &*self.inner;
        let mut guard = lock(done);
        loop {
            match *guard {
                Some(true) => return Ok(()),
                Some(false) => return Err(MuxError::WriterStopped),
                None => guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner),
            }
        }
    }
}

struct WriteItem {
    channel_id: ChannelId,
    payload: Bytes,
    completion: Option<WriteCompletion>,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<WriteItem>,
    stop_code: Option<u16>,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// Handle to the writer thread. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Writer {
    shared: Arc<Shared>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Writer {
    /// Start the writer thread; it becomes the only user of `sender`.
    pub(crate) fn spawn(sender: Box<dyn MessageSender>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("wsmux-writer".to_string())
            .spawn(move || run(thread_shared, sender))
            .map_err(|source| MuxError::Spawn {
                name: "writer",
                source,
            })?;
        Ok(Self {
            shared,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Queue `payload` for `channel_id`.
    ///
    /// Items go out strictly in enqueue order, one physical message each.
    pub(crate) fn enqueue(
        &self,
        channel_id: ChannelId,
        payload: Bytes,
        completion: Option<WriteCompletion>,
    ) -> Result<()> {
        let mut queue = lock(&self.shared.queue);
        if queue.stop_code.is_some() {
            return Err(MuxError::WriterStopped);
        }
        queue.items.push_back(WriteItem {
            channel_id,
            payload,
            completion,
        });
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Queue `payload` and block until it has been written.
    pub(crate) fn write(&self, channel_id: ChannelId, payload: Bytes) -> Result<()> {
        let completion = WriteCompletion::new();
        self.enqueue(channel_id, payload, Some(completion.clone()))?;
        completion.wait()
    }

    /// Stop accepting items; the thread drains what is queued, then closes
    /// the physical connection with `status_code`. Only the first call counts.
    pub(crate) fn stop(&self, status_code: u16) {
        let mut queue = lock(&self.shared.queue);
        if queue.stop_code.is_none() {
            debug!(status_code, "stopping writer");
            queue.stop_code = Some(status_code);
        }
        self.shared.cond.notify_all();
    }

    /// Wait for the writer thread to exit. Call after `stop`.
    pub(crate) fn join(&self) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("writer thread panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>, mut sender: Box<dyn MessageSender>) {
    let mut failed = false;
    let mut buf = BytesMut::new();

    let status_code = loop {
        let item = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(item) = queue.items.pop_front() {
                    break Some(item);
                }
                if queue.stop_code.is_some() {
                    break None;
                }
                queue = shared
                    .cond
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(item) = item else {
            break lock(&shared.queue).stop_code.unwrap_or_default();
        };

        if failed {
            if let Some(completion) = item.completion {
                completion.complete(false);
            }
            continue;
        }

        buf.clear();
        let written = encode_item(&item, &mut buf)
            .map_err(MuxError::from)
            .and_then(|()| sender.send_message(&buf, true, true).map_err(MuxError::from));
        if let Err(err) = &written {
            warn!(channel_id = item.channel_id, error = %err, "physical send failed");
            failed = true;
        }
        if let Some(completion) = item.completion {
            completion.complete(written.is_ok());
        }
    };

    if let Err(err) = sender.close_connection(status_code, "") {
        debug!(error = %err, "closing physical connection failed");
    }
    debug!(status_code, "writer exited");
}

fn encode_item(item: &WriteItem, buf: &mut BytesMut) -> wsmux_frame::Result<()> {
    buf.reserve(encoded_channel_id_len(item.channel_id)? + item.payload.len());
    encode_channel_id(item.channel_id, buf)?;
    buf.put_slice(&item.payload);
    Ok(())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use wsmux_transport::{TransportError, STATUS_NORMAL_CLOSURE};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Message(Vec<u8>),
        Close(u16),
    }

    struct RecordingSender {
        tx: mpsc::Sender<Sent>,
        fail_after: Option<usize>,
    }

    impl MessageSender for RecordingSender {
        fn send_message(
            &mut self,
            payload: &[u8],
            _is_final: bool,
            is_binary: bool,
        ) -> wsmux_transport::Result<()> {
            assert!(is_binary);
            if let Some(remaining) = self.fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(TransportError::Closed);
                }
                *remaining -= 1;
            }
            let _ = self.tx.send(Sent::Message(payload.to_vec()));
            Ok(())
        }

        fn close_connection(&mut self, status_code: u16, _reason: &str) -> wsmux_transport::Result<()> {
            let _ = self.tx.send(Sent::Close(status_code));
            Ok(())
        }
    }

    fn recording(fail_after: Option<usize>) -> (Writer, mpsc::Receiver<Sent>) {
        let (tx, rx) = mpsc::channel();
        let writer = Writer::spawn(Box::new(RecordingSender { tx, fail_after }))
            .expect("writer should spawn");
        (writer, rx)
    }

    #[test]
    fn writes_in_order_with_channel_prefix() {
        let (writer, rx) = recording(None);
        writer
            .write(3, Bytes::from_static(b"\x81a"))
            .expect("write should complete");
        writer
            .enqueue(200, Bytes::from_static(b"\x82b"), None)
            .expect("enqueue should succeed");
        writer.stop(STATUS_NORMAL_CLOSURE);
        writer.join();

        let sent: Vec<_> = rx.iter().collect();
        assert_eq!(
            sent,
            vec![
                Sent::Message(b"\x03\x81a".to_vec()),
                Sent::Message(b"\x80\xc8\x82b".to_vec()),
                Sent::Close(STATUS_NORMAL_CLOSURE),
            ]
        );
    }

    #[test]
    fn stop_drains_queue_then_rejects() {
        let (writer, rx) = recording(None);
        for _ in 0..10 {
            writer
                .enqueue(1, Bytes::from_static(b"x"), None)
                .expect("enqueue should succeed");
        }
        writer.stop(1011);
        assert!(matches!(
            writer.enqueue(1, Bytes::new(), None),
            Err(MuxError::WriterStopped)
        ));
        writer.join();

        let sent: Vec<_> = rx.iter().collect();
        assert_eq!(sent.len(), 11);
        assert_eq!(sent.last(), Some(&Sent::Close(1011)));
    }

    #[test]
    fn send_failure_fails_later_completions() {
        let (writer, _rx) = recording(Some(1));
        writer
            .write(1, Bytes::from_static(b"ok"))
            .expect("first write should succeed");
        assert!(matches!(
            writer.write(1, Bytes::from_static(b"boom")),
            Err(MuxError::WriterStopped)
        ));
        assert!(matches!(
            writer.write(1, Bytes::from_static(b"after")),
            Err(MuxError::WriterStopped)
        ));
        writer.stop(1000);
        writer.join();
    }
}
