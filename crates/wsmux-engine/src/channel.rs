//! Logical channels: quota accounting, inbound queues, and the I/O object
//! handed to application workers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use wsmux_frame::{
    encode_control_blocks, encode_inner_frame, ChannelId, ControlBlock, DropCode, FlowControl,
    InnerFrame, InnerMessage, InnerMessageReassembler, Opcode, WireError, CONTROL_CHANNEL_ID,
    MAX_NUMBER,
};

use crate::error::{MuxError, Result};
use crate::handshake::LogicalRequest;
use crate::writer::{lock, Writer};

/// Where a channel is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingState {
    Open,
    /// Sending has stopped (closing handshake sent or channel failed).
    Closing,
    /// Nothing more will be received.
    Closed,
}

struct ChannelState {
    send_quota: u64,
    receive_quota: u64,
    reassembler: InnerMessageReassembler,
    inbound: VecDeque<InnerMessage>,
    send_stopped: bool,
    terminated: bool,
    close_sent: bool,
    close_received: bool,
    drop_reason: Option<(DropCode, String)>,
}

/// One virtual full-duplex stream.
pub(crate) struct LogicalChannel {
    id: ChannelId,
    request: LogicalRequest,
    writer: Writer,
    max_frame_payload: Option<usize>,
    /// Held for the whole of one outgoing message; carries the data opcode
    /// of a message continued across `send` calls.
    transmit: Mutex<Option<Opcode>>,
    state: Mutex<ChannelState>,
    cond: Condvar,
}

impl LogicalChannel {
    pub(crate) fn new(
        request: LogicalRequest,
        writer: Writer,
        send_quota: u64,
        receive_quota: u64,
        max_frame_payload: Option<usize>,
    ) -> Self {
        Self {
            id: request.channel_id,
            request,
            writer,
            max_frame_payload,
            transmit: Mutex::new(None),
            state: Mutex::new(ChannelState {
                send_quota,
                receive_quota,
                reassembler: InnerMessageReassembler::new(),
                inbound: VecDeque::new(),
                send_stopped: false,
                terminated: false,
                close_sent: false,
                close_received: false,
                drop_reason: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn send_quota(&self) -> u64 {
        lock(&self.state).send_quota
    }

    pub(crate) fn receive_quota(&self) -> u64 {
        lock(&self.state).receive_quota
    }

    pub(crate) fn closing_state(&self) -> ClosingState {
        let state = lock(&self.state);
        if state.terminated || state.close_received {
            ClosingState::Closed
        } else if state.send_stopped || state.close_sent {
            ClosingState::Closing
        } else {
            ClosingState::Open
        }
    }

    /// Whether this side already sent its closing handshake.
    pub(crate) fn close_sent(&self) -> bool {
        lock(&self.state).close_sent
    }

    /// Reason to report in the DropChannel sent when the worker exits.
    pub(crate) fn drop_reason(&self) -> Option<(DropCode, String)> {
        lock(&self.state).drop_reason.clone()
    }

    /// Keep the first recorded reason.
    pub(crate) fn record_drop(&self, code: DropCode, message: &str) {
        lock(&self.state)
            .drop_reason
            .get_or_insert_with(|| (code, message.to_string()));
    }

    /// Apply an incoming FlowControl grant.
    ///
    /// Overflowing the representable maximum zeroes the quota and fails
    /// the channel.
    pub(crate) fn replenish_send_quota(&self, delta: u64) -> std::result::Result<(), WireError> {
        let mut state = lock(&self.state);
        match state.send_quota.checked_add(delta).filter(|q| *q <= MAX_NUMBER) {
            Some(quota) => {
                state.send_quota = quota;
                trace!(channel_id = self.id, delta, quota, "send quota replenished");
                self.cond.notify_all();
                Ok(())
            }
            None => {
                state.send_quota = 0;
                Err(WireError::logical(
                    self.id,
                    DropCode::SendQuotaOverflow,
                    format!("send quota overflow after grant of {delta}"),
                ))
            }
        }
    }

    /// Charge `amount` units against the receive quota.
    fn consume_receive_quota(state: &mut ChannelState, amount: u64) -> bool {
        if amount > state.receive_quota {
            return false;
        }
        state.receive_quota -= amount;
        true
    }

    /// Return `units` of receive quota to the peer with a FlowControl block.
    pub(crate) fn replenish_receive_quota(&self, units: u64) {
        if units == 0 {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.receive_quota = state.receive_quota.saturating_add(units).min(MAX_NUMBER);
        }
        let block = ControlBlock::from(FlowControl {
            channel_id: self.id,
            send_quota: units,
        });
        let queued = encode_control_blocks([&block])
            .map_err(MuxError::from)
            .and_then(|payload| self.writer.enqueue(CONTROL_CHANNEL_ID, payload, None));
        if let Err(err) = queued {
            debug!(channel_id = self.id, error = %err, "could not replenish receive quota");
        }
    }

    /// Account for and reassemble one inbound frame.
    ///
    /// Returns the units the engine hands back to the peer once the frame
    /// has been delivered, so the peer's window stays constant.
    pub(crate) fn receive_frame(&self, frame: InnerFrame) -> std::result::Result<u64, WireError> {
        let mut state = lock(&self.state);
        if state.terminated {
            return Ok(0);
        }

        let units = frame.payload.len() as u64 + u64::from(frame.opcode != Opcode::Continuation);
        if !Self::consume_receive_quota(&mut state, units) {
            return Err(WireError::logical(
                self.id,
                DropCode::SendQuotaViolation,
                format!(
                    "frame of {units} units exceeds receive quota {}",
                    state.receive_quota
                ),
            ));
        }

        match state.reassembler.push(frame) {
            Ok(Some(message)) => {
                trace!(channel_id = self.id, opcode = ?message.opcode, len = message.payload.len(), "inner message complete");
                state.inbound.push_back(message);
                self.cond.notify_all();
                Ok(units)
            }
            Ok(None) => Ok(units),
            Err(err) => Err(WireError::logical(
                self.id,
                DropCode::BadFragmentation,
                err.to_string(),
            )),
        }
    }

    /// End the channel: wakes every blocked `receive` and quota wait.
    pub(crate) fn terminate(&self) {
        let mut state = lock(&self.state);
        state.terminated = true;
        self.cond.notify_all();
    }

    pub(crate) fn stop_sending(&self) {
        let mut state = lock(&self.state);
        state.send_stopped = true;
        self.cond.notify_all();
    }

    fn ensure_sendable(&self, state: &ChannelState) -> Result<()> {
        if state.terminated || state.send_stopped || state.close_sent {
            return Err(MuxError::ChannelClosed(self.id));
        }
        Ok(())
    }

    /// Wait for positive send quota and take up to `max` units of it.
    fn acquire_send_quota(&self, max: u64) -> Result<u64> {
        let mut state = lock(&self.state);
        loop {
            self.ensure_sendable(&state)?;
            if state.send_quota > 0 {
                let taken = state.send_quota.min(max);
                state.send_quota -= taken;
                return Ok(taken);
            }
            trace!(channel_id = self.id, "waiting for send quota");
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Send `payload` as one or more inner frames, never exceeding the send
    /// quota. The caller holds the transmit lock.
    fn write_frames(&self, opcode: Opcode, payload: &Bytes, end: bool) -> Result<()> {
        self.ensure_sendable(&lock(&self.state))?;

        if opcode != Opcode::Continuation {
            self.acquire_send_quota(1)?;
        }

        let mut opcode = opcode;
        let mut offset = 0usize;
        loop {
            let remaining = payload.len() - offset;
            let chunk = if remaining == 0 {
                0
            } else {
                let cap = self.max_frame_payload.unwrap_or(usize::MAX).min(remaining);
                self.acquire_send_quota(cap as u64)? as usize
            };
            let last = offset + chunk == payload.len();
            let frame = InnerFrame::new(end && last, opcode, payload.slice(offset..offset + chunk));

            let mut buf = BytesMut::with_capacity(1 + chunk);
            encode_inner_frame(&frame, &mut buf);
            self.writer.write(self.id, buf.freeze())?;

            offset += chunk;
            opcode = Opcode::Continuation;
            if last {
                return Ok(());
            }
        }
    }

    fn send_data(&self, opcode: Opcode, payload: Bytes, is_final: bool) -> Result<()> {
        if !opcode.is_data() {
            return Err(MuxError::UnsupportedOpcode(opcode));
        }
        let mut transmit = lock(&self.transmit);
        let frame_opcode = match *transmit {
            Some(current) if current != opcode => {
                return Err(MuxError::MessageTypeMismatch {
                    expected: current,
                    actual: opcode,
                })
            }
            Some(_) => Opcode::Continuation,
            None => opcode,
        };
        self.write_frames(frame_opcode, &payload, is_final)?;
        *transmit = if is_final { None } else { Some(opcode) };
        Ok(())
    }

    fn send_control(&self, opcode: Opcode, payload: Bytes) -> Result<()> {
        let _transmit = lock(&self.transmit);
        self.write_frames(opcode, &payload, true)
    }

    fn send_close(&self, payload: Bytes) -> Result<()> {
        let _transmit = lock(&self.transmit);
        self.write_frames(Opcode::Close, &payload, true)?;
        lock(&self.state).close_sent = true;
        debug!(channel_id = self.id, "closing handshake sent");
        Ok(())
    }

    /// Next complete message.
    ///
    /// `None` after the closing handshake; `ConnectionTerminated` when the
    /// channel was torn down otherwise.
    fn next_message(&self) -> Result<Option<InnerMessage>> {
        let mut state = lock(&self.state);
        loop {
            if let Some(message) = state.inbound.pop_front() {
                return Ok(Some(message));
            }
            if state.close_received {
                return Ok(None);
            }
            if state.terminated {
                return Err(MuxError::ConnectionTerminated(self.id));
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn receive(&self) -> Result<Option<InnerMessage>> {
        loop {
            let Some(message) = self.next_message()? else {
                return Ok(None);
            };

            match message.opcode {
                Opcode::Ping => match self.send_control(Opcode::Pong, message.payload) {
                    Ok(()) | Err(MuxError::ChannelClosed(_)) => {}
                    Err(err) => return Err(err),
                },
                Opcode::Pong => trace!(channel_id = self.id, "pong received"),
                Opcode::Close => {
                    lock(&self.state).close_received = true;
                    if !self.close_sent() {
                        let reply = message.payload.slice(..message.payload.len().min(2));
                        match self.send_close(reply) {
                            Ok(()) | Err(MuxError::ChannelClosed(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    debug!(channel_id = self.id, "closing handshake received");
                    return Ok(None);
                }
                _ => return Ok(Some(message)),
            }
        }
    }
}

/// Per-channel I/O handed to the application dispatcher.
///
/// Sends block while the channel has no send quota; they fail with
/// [`MuxError::ChannelClosed`] once the channel starts closing.
#[derive(Clone)]
pub struct ChannelIo {
    channel: Arc<LogicalChannel>,
}

impl ChannelIo {
    pub(crate) fn new(channel: Arc<LogicalChannel>) -> Self {
        Self { channel }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    /// The opening handshake that created this channel.
    pub fn request(&self) -> &LogicalRequest {
        &self.channel.request
    }

    /// Send a data message, or one part of it when `is_final` is false.
    ///
    /// Parts of a message continue across calls; all parts must use the
    /// same data opcode.
    pub fn send(&self, opcode: Opcode, payload: impl Into<Bytes>, is_final: bool) -> Result<()> {
        self.channel.send_data(opcode, payload.into(), is_final)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()), true)
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Opcode::Binary, data, true)
    }

    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.channel.send_control(Opcode::Ping, payload.into())
    }

    /// Block until the next text or binary message.
    ///
    /// Pings are answered and pongs dropped along the way. Returns `None`
    /// once the closing handshake completes, and
    /// [`MuxError::ConnectionTerminated`] if the channel was dropped.
    pub fn receive(&self) -> Result<Option<InnerMessage>> {
        self.channel.receive()
    }

    /// Start the closing handshake and wait for the peer's close frame.
    ///
    /// Data messages still arriving meanwhile are discarded.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !self.channel.close_sent() {
            let mut payload = BytesMut::with_capacity(2 + reason.len());
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
            self.channel.send_close(payload.freeze())?;
        }
        loop {
            match self.channel.receive() {
                Ok(Some(message)) => {
                    trace!(channel_id = self.channel.id, opcode = ?message.opcode, "discarding message while closing");
                }
                Ok(None) | Err(MuxError::ConnectionTerminated(_)) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn closing_state(&self) -> ClosingState {
        self.channel.closing_state()
    }

    /// Units this side may still send before the peer grants more.
    pub fn send_quota(&self) -> u64 {
        self.channel.send_quota()
    }

    /// Units the peer may still send before this side replenishes.
    pub fn receive_quota(&self) -> u64 {
        self.channel.receive_quota()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use wsmux_frame::{decode_channel_id, decode_inner_frame, ControlBlockParser, Headers};
    use wsmux_transport::MessageSender;

    use super::*;

    struct ChannelSender(mpsc::Sender<Bytes>);

    impl MessageSender for ChannelSender {
        fn send_message(&mut self, payload: &[u8], _: bool, _: bool) -> wsmux_transport::Result<()> {
            let _ = self.0.send(Bytes::copy_from_slice(payload));
            Ok(())
        }

        fn close_connection(&mut self, _: u16, _: &str) -> wsmux_transport::Result<()> {
            Ok(())
        }
    }

    fn channel(send_quota: u64, receive_quota: u64) -> (Arc<LogicalChannel>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel();
        let writer = Writer::spawn(Box::new(ChannelSender(tx))).expect("writer should spawn");
        let request = LogicalRequest {
            channel_id: 5,
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: Headers::new(),
        };
        let channel = LogicalChannel::new(request, writer, send_quota, receive_quota, None);
        (Arc::new(channel), rx)
    }

    fn inner(wire: &Bytes) -> InnerFrame {
        let (channel_id, offset) = decode_channel_id(wire, 0).expect("channel id");
        assert_eq!(channel_id, 5);
        decode_inner_frame(wire, offset).expect("inner frame")
    }

    #[test]
    fn send_splits_by_quota() {
        let (channel, wire) = channel(4, 0);
        let io = ChannelIo::new(Arc::clone(&channel));

        let sender = thread::spawn(move || io.send_binary(&b"abcdef"[..]));

        let first = inner(&wire.recv().expect("first frame"));
        assert_eq!(first.opcode, Opcode::Binary);
        assert!(!first.fin);
        assert_eq!(first.payload.as_ref(), b"abc");
        assert_eq!(channel.send_quota(), 0);

        channel.replenish_send_quota(10).expect("grant");
        let second = inner(&wire.recv().expect("second frame"));
        assert_eq!(second.opcode, Opcode::Continuation);
        assert!(second.fin);
        assert_eq!(second.payload.as_ref(), b"def");

        sender.join().expect("sender thread").expect("send should finish");
        assert_eq!(channel.send_quota(), 7);
    }

    #[test]
    fn empty_message_costs_one_unit() {
        let (channel, wire) = channel(1, 0);
        let io = ChannelIo::new(Arc::clone(&channel));
        io.send_text("").expect("empty send");

        let frame = inner(&wire.recv().expect("frame"));
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.payload.is_empty());
        assert_eq!(channel.send_quota(), 0);
    }

    #[test]
    fn continued_message_uses_continuation_opcode() {
        let (channel, wire) = channel(100, 0);
        let io = ChannelIo::new(channel);
        io.send(Opcode::Text, &b"he"[..], false).expect("first part");
        assert!(matches!(
            io.send(Opcode::Binary, &b"x"[..], true),
            Err(MuxError::MessageTypeMismatch { .. })
        ));
        io.send(Opcode::Text, &b"llo"[..], true).expect("last part");

        let first = inner(&wire.recv().expect("first"));
        let second = inner(&wire.recv().expect("second"));
        assert_eq!((first.opcode, first.fin), (Opcode::Text, false));
        assert_eq!((second.opcode, second.fin), (Opcode::Continuation, true));
    }

    #[test]
    fn quota_overflow_zeroes_quota() {
        let (channel, _wire) = channel(10, 0);
        let err = channel
            .replenish_send_quota(MAX_NUMBER)
            .expect_err("overflow should fail");
        assert_eq!(err.drop_code(), Some(DropCode::SendQuotaOverflow));
        assert_eq!(channel.send_quota(), 0);
    }

    #[test]
    fn terminate_wakes_quota_waiters() {
        let (channel, _wire) = channel(0, 0);
        let io = ChannelIo::new(Arc::clone(&channel));
        let sender = thread::spawn(move || io.send_text("blocked"));
        thread::sleep(Duration::from_millis(50));
        channel.terminate();
        assert!(matches!(
            sender.join().expect("sender thread"),
            Err(MuxError::ChannelClosed(5))
        ));
    }

    #[test]
    fn receive_quota_is_enforced() {
        let (channel, _wire) = channel(0, 4);
        let ok = channel
            .receive_frame(InnerFrame::new(true, Opcode::Text, &b"abc"[..]))
            .expect("within quota");
        assert_eq!(ok, 4);
        assert_eq!(channel.receive_quota(), 0);

        let err = channel
            .receive_frame(InnerFrame::new(true, Opcode::Text, &b""[..]))
            .expect_err("quota exhausted");
        assert_eq!(err.drop_code(), Some(DropCode::SendQuotaViolation));
    }

    fn flow_grants(wire: &mpsc::Receiver<Bytes>) -> u64 {
        let mut granted = 0;
        while let Ok(sent) = wire.recv_timeout(Duration::from_millis(100)) {
            let (channel_id, offset) = decode_channel_id(&sent, 0).expect("channel id");
            assert_eq!(channel_id, CONTROL_CHANNEL_ID, "only grants expected");
            for block in ControlBlockParser::new(sent.slice(offset..)) {
                if let Ok(ControlBlock::FlowControl(grant)) = block {
                    assert_eq!(grant.channel_id, 5);
                    granted += grant.send_quota;
                }
            }
        }
        granted
    }

    #[test]
    fn delivered_frames_are_granted_back_before_the_worker_reads() {
        let (channel, wire) = channel(10, 100);
        for frame in [
            InnerFrame::new(false, Opcode::Binary, &b"0123"[..]),
            InnerFrame::new(true, Opcode::Continuation, &b"456789"[..]),
            InnerFrame::new(true, Opcode::Ping, &b"p"[..]),
        ] {
            let units = channel.receive_frame(frame).expect("within quota");
            channel.replenish_receive_quota(units);
        }

        assert_eq!(flow_grants(&wire), 5 + 6 + 2);
        assert_eq!(channel.receive_quota(), 100);

        let io = ChannelIo::new(Arc::clone(&channel));
        let message = io.receive().expect("receive").expect("message");
        assert_eq!(message.payload.as_ref(), b"0123456789");
        assert_eq!(channel.receive_quota(), 100);
    }

    #[test]
    fn queued_ping_is_answered_on_receive() {
        let (channel, wire) = channel(10, 100);
        channel
            .receive_frame(InnerFrame::new(true, Opcode::Ping, &b"p"[..]))
            .expect("ping");
        channel
            .receive_frame(InnerFrame::new(true, Opcode::Text, &b"data"[..]))
            .expect("data");

        let io = ChannelIo::new(Arc::clone(&channel));
        let message = io.receive().expect("receive").expect("message");
        assert_eq!(message.payload.as_ref(), b"data");

        let pong = inner(&wire.recv_timeout(Duration::from_secs(1)).expect("pong"));
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload.as_ref(), b"p");
    }

    #[test]
    fn close_frame_is_answered_and_ends_stream() {
        let (channel, wire) = channel(10, 100);
        channel
            .receive_frame(InnerFrame::new(true, Opcode::Close, &b"\x03\xe8bye"[..]))
            .expect("close");
        let io = ChannelIo::new(Arc::clone(&channel));

        assert!(io.receive().expect("receive").is_none());
        assert!(io.receive().expect("receive again").is_none());
        assert!(channel.close_sent());
        assert_eq!(channel.closing_state(), ClosingState::Closed);
        assert!(matches!(io.send_text("late"), Err(MuxError::ChannelClosed(5))));

        let reply = loop {
            let sent = wire.recv_timeout(Duration::from_secs(1)).expect("reply");
            if sent[0] == 5 {
                break inner(&sent);
            }
        };
        assert_eq!(reply.opcode, Opcode::Close);
        assert_eq!(reply.payload.as_ref(), b"\x03\xe8");
    }

    #[test]
    fn terminated_channel_reports_termination_after_draining() {
        let (channel, _wire) = channel(0, 100);
        channel
            .receive_frame(InnerFrame::new(true, Opcode::Text, &b"last"[..]))
            .expect("data");
        channel.terminate();

        let io = ChannelIo::new(channel);
        assert!(io.receive().expect("queued message").is_some());
        assert!(matches!(
            io.receive(),
            Err(MuxError::ConnectionTerminated(5))
        ));
    }

    fn frame_units(frame: &InnerFrame) -> u64 {
        frame.payload.len() as u64 + u64::from(frame.opcode != Opcode::Continuation)
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn transmitted_units_never_exceed_granted_quota(
            initial in 0u64..8,
            grants in proptest::collection::vec(0u64..40, 1..8),
            messages in proptest::collection::vec(0usize..64, 1..6),
        ) {
            let (channel, wire) = channel(initial, 0);
            let io = ChannelIo::new(Arc::clone(&channel));
            let sender = thread::spawn(move || {
                for len in messages {
                    if io.send_binary(vec![0x5a; len]).is_err() {
                        break;
                    }
                }
            });

            let mut granted = initial;
            let mut transmitted = 0u64;
            for grant in grants {
                granted += grant;
                channel.replenish_send_quota(grant).expect("grant");
                thread::sleep(Duration::from_millis(5));
                while let Ok(sent) = wire.try_recv() {
                    transmitted += frame_units(&inner(&sent));
                }
                proptest::prop_assert!(transmitted <= granted);
            }

            channel.terminate();
            channel.stop_sending();
            sender.join().expect("sender thread");
            while let Ok(sent) = wire.try_recv() {
                transmitted += frame_units(&inner(&sent));
            }
            proptest::prop_assert!(transmitted <= granted);
        }
    }
}
