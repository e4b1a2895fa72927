//! The multiplexing engine: one reader thread, one writer thread, and a
//! worker thread per logical channel.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wsmux_frame::{
    decode_channel_id, decode_inner_frame, encode_control_blocks, AddChannelRequest,
    AddChannelResponse, ChannelId, ControlBlock, ControlBlockParser, DropChannel, DropCode,
    DropReason, FlowControl, HandshakeBase, HandshakeEncoding, NewChannelSlot, RequestHead,
    ResponseHead, WireError, CONTROL_CHANNEL_ID, DEFAULT_CHANNEL_ID,
};
use wsmux_transport::{
    MessageReceiver, MessageSender, PhysicalMessage, STATUS_GOING_AWAY,
    STATUS_INTERNAL_ENDPOINT_ERROR, STATUS_NORMAL_CLOSURE,
};

use crate::channel::{ChannelIo, LogicalChannel};
use crate::config::MuxConfig;
use crate::dispatch::Dispatcher;
use crate::error::{MuxError, Result};
use crate::handshake::{HandshakeValidator, LogicalRequest, StandardValidator};
use crate::table::{AdmissionError, ChannelTable};
use crate::writer::{lock, Writer};

/// Lifecycle of a [`MuxEngine`]. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Starting,
    Running,
    /// No new channels; waiting for workers and flushing writes.
    Draining,
    Stopped,
}

/// Configures and starts a [`MuxEngine`].
pub struct MuxEngineBuilder {
    config: MuxConfig,
    validator: Option<Arc<dyn HandshakeValidator>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl MuxEngineBuilder {
    /// Override the engine configuration.
    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom handshake validator instead of [`StandardValidator`].
    pub fn with_validator(mut self, validator: impl HandshakeValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Open the default channel from `request` (the physical connection's
    /// handshake), advertise the initial slots, and start the reader.
    pub fn start<R, S>(self, receiver: R, sender: S, request: RequestHead) -> Result<MuxEngine>
    where
        R: MessageReceiver + 'static,
        S: MessageSender + 'static,
    {
        self.config.validate()?;
        let validator: Arc<dyn HandshakeValidator> = match self.validator {
            Some(validator) => validator,
            None => Arc::new(StandardValidator::new(self.config.handshake.clone())),
        };
        let writer = Writer::spawn(Box::new(sender))?;

        let shared = Arc::new(Shared {
            table: ChannelTable::new(),
            writer: writer.clone(),
            validator,
            dispatcher: self.dispatcher,
            base: Mutex::new(HandshakeBase::new(request.headers.clone())),
            state: Mutex::new(EngineState::Starting),
            reader_done: Mutex::new(false),
            reader_cond: Condvar::new(),
            config: self.config,
        });

        let opened = shared.open_default_channel(request).and_then(|()| {
            shared.add_channel_slots(
                shared.config.initial_slots,
                shared.config.initial_slot_quota,
            )
        });
        if let Err(err) = opened {
            warn!(error = %err, "failed to start multiplexing");
            shared.terminate_all();
            writer.stop(STATUS_GOING_AWAY);
            writer.join();
            shared.advance(EngineState::Stopped);
            return Err(err);
        }

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("wsmux-reader".to_string())
            .spawn(move || run_reader(reader_shared, receiver));
        let reader = match reader {
            Ok(handle) => handle,
            Err(source) => {
                shared.terminate_all();
                writer.stop(STATUS_INTERNAL_ENDPOINT_ERROR);
                shared.advance(EngineState::Stopped);
                return Err(MuxError::Spawn {
                    name: "reader",
                    source,
                });
            }
        };

        shared.advance(EngineState::Running);
        info!(
            initial_slots = shared.config.initial_slots,
            "multiplexing engine running"
        );
        shared.drain_if_idle();
        Ok(MuxEngine {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Start the engine and block until every channel has finished.
    pub fn serve<R, S>(self, receiver: R, sender: S, request: RequestHead) -> Result<()>
    where
        R: MessageReceiver + 'static,
        S: MessageSender + 'static,
    {
        self.start(receiver, sender, request)?.join()
    }
}

/// A running multiplexed connection.
///
/// The engine starts draining on its own once every worker has finished or
/// the physical connection ends. Call [`MuxEngine::join`] or
/// [`MuxEngine::shutdown`] to wait for that; dropping the handle leaves the
/// threads running.
pub struct MuxEngine {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MuxEngine {
    pub fn builder(dispatcher: impl Dispatcher) -> MuxEngineBuilder {
        MuxEngineBuilder {
            config: MuxConfig::default(),
            validator: None,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.shared.state)
    }

    /// Number of logical channels currently open.
    pub fn channel_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Slots granted to the peer and not yet used.
    pub fn slots_available(&self) -> u64 {
        self.shared.table.slots_available()
    }

    /// Grant the peer `count` more channel slots, each with `send_quota`
    /// units of initial quota.
    pub fn add_channel_slots(&self, count: u64, send_quota: u64) -> Result<()> {
        self.shared.add_channel_slots(count, send_quota)
    }

    /// Wait until every channel's worker has finished. After that no new
    /// channel is accepted. Returns false on timeout.
    pub fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        self.shared.table.wait_until_empty(timeout)
    }

    /// Wait for all workers to finish on their own, then flush and close
    /// the physical connection.
    pub fn join(&self) -> Result<()> {
        self.wait_until_done(None);
        self.finish(STATUS_NORMAL_CLOSURE)
    }

    /// Stop accepting channels, terminate the open ones, give workers up to
    /// `drain_timeout` to return, then flush and close the physical
    /// connection.
    pub fn shutdown(&self) -> Result<()> {
        info!("shutting down multiplexing engine");
        self.shared.table.stop_accepting();
        self.shared.advance(EngineState::Draining);
        self.shared.terminate_all();

        let drain_timeout = self.shared.config.drain_timeout();
        if !self.wait_until_done(Some(drain_timeout)) {
            warn!(
                remaining = self.shared.table.len(),
                ?drain_timeout,
                "workers still running after drain timeout"
            );
        }
        self.finish(STATUS_GOING_AWAY)
    }

    fn finish(&self, status_code: u16) -> Result<()> {
        self.shared.advance(EngineState::Draining);
        self.shared.writer.stop(status_code);
        self.shared.writer.join();

        let timeout = self.shared.config.reader_join_timeout();
        let reader_exited = self.shared.wait_for_reader(timeout);
        if reader_exited {
            if let Some(handle) = lock(&self.reader).take() {
                if handle.join().is_err() {
                    warn!("reader thread panicked");
                }
            }
        }
        self.shared.advance(EngineState::Stopped);
        info!("multiplexing engine stopped");

        if reader_exited {
            Ok(())
        } else {
            warn!(?timeout, "reader thread did not exit");
            Err(MuxError::Timeout(timeout))
        }
    }
}

struct Shared {
    config: MuxConfig,
    table: ChannelTable,
    writer: Writer,
    validator: Arc<dyn HandshakeValidator>,
    dispatcher: Arc<dyn Dispatcher>,
    /// Headers delta-encoded requests are resolved against.
    base: Mutex<HandshakeBase>,
    state: Mutex<EngineState>,
    reader_done: Mutex<bool>,
    reader_cond: Condvar,
}

impl Shared {
    fn advance(&self, next: EngineState) {
        let mut state = lock(&self.state);
        if next > *state {
            debug!(from = ?*state, to = ?next, "engine state");
            *state = next;
        }
    }

    fn send_control(&self, blocks: &[ControlBlock]) -> Result<()> {
        let payload = encode_control_blocks(blocks)?;
        self.writer.enqueue(CONTROL_CHANNEL_ID, payload, None)
    }

    /// Queue a control block, logging instead of failing when the writer is gone.
    fn send_control_best_effort(&self, block: ControlBlock) {
        if let Err(err) = self.send_control(std::slice::from_ref(&block)) {
            debug!(block = block.name(), error = %err, "control block not sent");
        }
    }

    fn send_drop_channel(&self, channel_id: ChannelId, code: DropCode, message: &str) {
        debug!(channel_id, %code, "sending DropChannel");
        self.send_control_best_effort(ControlBlock::from(DropChannel {
            channel_id,
            reason: Some(DropReason::new(code, message)),
        }));
    }

    fn send_add_channel_response(&self, channel_id: ChannelId, response: &ResponseHead, rejected: bool) {
        self.send_control_best_effort(ControlBlock::from(AddChannelResponse {
            channel_id,
            encoding: HandshakeEncoding::Identity,
            rejected,
            encoded_handshake: response.encode().into(),
        }));
    }

    fn reject_channel(&self, channel_id: ChannelId, status: u16) {
        info!(channel_id, status, "rejecting AddChannelRequest");
        self.send_add_channel_response(channel_id, &ResponseHead::rejection(status), true);
    }

    fn add_channel_slots(&self, count: u64, send_quota: u64) -> Result<()> {
        self.table.add_slots(count, send_quota);
        self.send_control(&[ControlBlock::from(NewChannelSlot {
            slots: count,
            send_quota,
            fallback: false,
        })])?;
        debug!(count, send_quota, "channel slots granted");
        Ok(())
    }

    fn build_channel(&self, request: LogicalRequest, send_quota: u64, receive_quota: u64) -> LogicalChannel {
        LogicalChannel::new(
            request,
            self.writer.clone(),
            send_quota,
            receive_quota,
            self.config.max_inner_frame_payload,
        )
    }

    /// The default channel goes through the same table path as any other,
    /// on a slot granted just for it. No AddChannelResponse is sent.
    fn open_default_channel(self: &Arc<Self>, request: RequestHead) -> Result<()> {
        let request = LogicalRequest::from_head(DEFAULT_CHANNEL_ID, request);
        let decision = self.validator.validate(&request);
        if !decision.accept {
            return Err(MuxError::DefaultChannelRejected(decision.status));
        }

        let quota = self.config.default_channel_quota;
        let send_quota = self.config.default_channel_send_quota;
        let channel = self
            .table
            .add_channel_with_slot(DEFAULT_CHANNEL_ID, quota, |receive_quota| {
                self.build_channel(request, send_quota, receive_quota)
            })
            .map_err(|err| match err {
                AdmissionError::Protocol(err) => MuxError::Wire(err),
                AdmissionError::NotAccepting => MuxError::ChannelClosed(DEFAULT_CHANNEL_ID),
            })?;

        self.send_control(&[ControlBlock::from(FlowControl {
            channel_id: DEFAULT_CHANNEL_ID,
            send_quota: quota,
        })])?;
        self.spawn_worker(channel);
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, channel: Arc<LogicalChannel>) {
        let channel_id = channel.id();
        let io = ChannelIo::new(channel);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("wsmux-worker-{channel_id}"))
            .spawn(move || {
                let _guard = WorkerGuard {
                    shared: Arc::clone(&shared),
                    channel_id,
                };
                if let Err(err) = shared.dispatcher.run(io) {
                    debug!(channel_id, error = %err, "dispatcher returned an error");
                }
            });
        match spawned {
            Ok(_) => debug!(channel_id, "worker started"),
            Err(err) => {
                warn!(channel_id, error = %err, "failed to spawn worker");
                self.finish_channel(channel_id);
            }
        }
    }

    /// Called once per channel when its worker exits.
    ///
    /// The id stays reserved until the peer acknowledges our DropChannel,
    /// unless the DropChannel is itself the acknowledgment.
    fn finish_channel(&self, channel_id: ChannelId) {
        let Some(channel) = self.table.get(channel_id) else {
            return;
        };
        channel.terminate();
        let drop = (!channel.close_sent()).then(|| {
            channel
                .drop_reason()
                .unwrap_or((DropCode::NormalClosure, String::new()))
        });
        let await_ack = matches!(&drop, Some((code, _)) if *code != DropCode::Acknowledged);
        if self.table.remove_channel(channel_id, await_ack).is_none() {
            return;
        }
        if let Some((code, message)) = drop {
            self.send_drop_channel(channel_id, code, &message);
        }
        self.table.finish_removal();
        info!(channel_id, "channel finished");

        self.drain_if_idle();
        self.stop_if_finished();
    }

    /// Start draining once the last worker of a running engine is gone.
    fn drain_if_idle(&self) {
        let running = *lock(&self.state) == EngineState::Running;
        if !running || !self.table.stop_accepting_if_empty() {
            return;
        }
        info!("all channels finished, draining");
        self.advance(EngineState::Draining);
        self.writer.stop(STATUS_NORMAL_CLOSURE);
    }

    /// Once the reader has exited and no worker is left, flush the writer
    /// and settle in `Stopped`.
    fn stop_if_finished(&self) {
        let reader_done = *lock(&self.reader_done);
        if !reader_done || !self.table.is_idle() {
            return;
        }
        self.writer.stop(STATUS_NORMAL_CLOSURE);
        self.writer.join();
        self.advance(EngineState::Stopped);
    }

    fn terminate_all(&self) {
        for channel in self.table.channels() {
            channel.terminate();
            channel.stop_sending();
        }
    }

    /// Tear down one channel; the others keep running.
    fn fail_logical_channel(&self, channel_id: ChannelId, code: DropCode, message: &str) {
        warn!(channel_id, %code, message, "logical channel failed");
        match self.table.get(channel_id) {
            Some(channel) => {
                channel.record_drop(code, message);
                channel.terminate();
                channel.stop_sending();
            }
            None => self.send_drop_channel(channel_id, code, message),
        }
    }

    /// Tear down the whole connection.
    fn fail_physical_connection(&self, code: DropCode, message: &str) {
        warn!(%code, message, "physical connection failed");
        self.send_drop_channel(CONTROL_CHANNEL_ID, code, message);
        self.writer.stop(STATUS_INTERNAL_ENDPOINT_ERROR);
        self.table.stop_accepting();
        self.advance(EngineState::Stopped);
    }

    fn dispatch_message(self: &Arc<Self>, message: PhysicalMessage) -> std::result::Result<(), WireError> {
        if !message.is_binary {
            return Err(WireError::physical(
                DropCode::InvalidEncapsulatingMessage,
                "multiplexed payloads must be binary messages",
            ));
        }
        let payload = message.payload;
        let (channel_id, offset) = decode_channel_id(&payload, 0)?;
        if channel_id == CONTROL_CHANNEL_ID {
            return self.process_control_blocks(ControlBlockParser::new(payload.slice(offset..)));
        }

        let frame = decode_inner_frame(&payload, offset)?;
        let Some(channel) = self.table.get(channel_id) else {
            debug!(channel_id, "ignoring frame for inactive channel");
            return Ok(());
        };
        match channel.receive_frame(frame) {
            Ok(units) => channel.replenish_receive_quota(units),
            Err(WireError::LogicalChannel {
                channel,
                code,
                message,
            }) => self.fail_logical_channel(channel, code, &message),
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn process_control_blocks(self: &Arc<Self>, parser: ControlBlockParser) -> std::result::Result<(), WireError> {
        for block in parser {
            let block = match block {
                Ok(block) => block,
                Err(WireError::LogicalChannel {
                    channel,
                    code,
                    message,
                }) => {
                    self.fail_logical_channel(channel, code, &message);
                    continue;
                }
                Err(err) => return Err(err),
            };
            debug!(block = block.name(), "control block received");
            match block {
                ControlBlock::AddChannelRequest(request) => self.process_add_channel_request(request)?,
                ControlBlock::FlowControl(flow) => self.process_flow_control(flow),
                ControlBlock::DropChannel(drop) => self.process_drop_channel(drop),
                ControlBlock::AddChannelResponse(_) | ControlBlock::NewChannelSlot(_) => {
                    return Err(WireError::physical(
                        DropCode::InvalidMuxControlBlock,
                        format!("{} is not valid from a client", block.name()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn process_add_channel_request(self: &Arc<Self>, block: AddChannelRequest) -> std::result::Result<(), WireError> {
        let channel_id = block.channel_id;
        if let HandshakeEncoding::Unknown(bits) = block.encoding {
            return Err(WireError::physical(
                DropCode::UnknownRequestEncoding,
                format!("unknown handshake encoding {bits}"),
            ));
        }
        match self.table.check_admission(channel_id) {
            Ok(()) => {}
            Err(AdmissionError::NotAccepting) => {
                self.reject_channel(channel_id, 503);
                return Ok(());
            }
            Err(AdmissionError::Protocol(err)) => return Err(err),
        }

        let mut head = match RequestHead::parse(&block.encoded_handshake) {
            Ok(head) => head,
            Err(err) => {
                warn!(channel_id, error = %err, "malformed AddChannelRequest handshake");
                self.table.discard_slot();
                self.reject_channel(channel_id, 400);
                return Ok(());
            }
        };
        if block.encoding == HandshakeEncoding::Delta {
            let mut base = lock(&self.base);
            if base.is_chained() {
                warn!(
                    channel_id,
                    "delta-encoded request follows another delta; resolving against the last identity request"
                );
            } else {
                debug!(channel_id, "resolving delta-encoded handshake");
            }
            head.headers = base.resolve(&head.headers);
        }

        let request = LogicalRequest::from_head(channel_id, head);
        let decision = self.validator.validate(&request);
        if !decision.accept {
            self.table.discard_slot();
            self.reject_channel(channel_id, decision.status);
            return Ok(());
        }

        let identity_headers =
            (block.encoding == HandshakeEncoding::Identity).then(|| request.headers.clone());
        let path = request.path.clone();
        let send_quota = self.config.initial_send_quota;
        let added = self.table.add_channel(channel_id, |receive_quota| {
            self.build_channel(request, send_quota, receive_quota)
        });
        let channel = match added {
            Ok(channel) => channel,
            Err(AdmissionError::NotAccepting) => {
                self.reject_channel(channel_id, 503);
                return Ok(());
            }
            Err(AdmissionError::Protocol(err)) => return Err(err),
        };

        let response = ResponseHead::switching_protocols(&decision.response_headers);
        self.send_add_channel_response(channel_id, &response, false);
        if let Some(headers) = identity_headers {
            lock(&self.base).update(headers);
        }
        info!(channel_id, %path, "channel accepted");
        self.spawn_worker(channel);
        Ok(())
    }

    fn process_flow_control(&self, flow: FlowControl) {
        let Some(channel) = self.table.get(flow.channel_id) else {
            debug!(channel_id = flow.channel_id, "FlowControl for inactive channel");
            return;
        };
        if let Err(WireError::LogicalChannel {
            channel: channel_id,
            code,
            message,
        }) = channel.replenish_send_quota(flow.send_quota)
        {
            self.fail_logical_channel(channel_id, code, &message);
        }
    }

    fn process_drop_channel(&self, drop: DropChannel) {
        let channel_id = drop.channel_id;
        if self.table.acknowledge_drop(channel_id) {
            debug!(channel_id, "DropChannel acknowledged, id released");
            return;
        }
        let Some(channel) = self.table.get(channel_id) else {
            debug!(channel_id, "DropChannel for inactive channel");
            return;
        };
        match &drop.reason {
            Some(reason) => info!(channel_id, code = reason.code, message = %reason.message, "peer dropped channel"),
            None => info!(channel_id, "peer dropped channel"),
        }
        channel.record_drop(DropCode::Acknowledged, "");
        channel.terminate();
        channel.stop_sending();
    }

    fn wait_for_reader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = lock(&self.reader_done);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = self
                .reader_cond
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Runs `finish_channel` when a worker exits, including by panic.
struct WorkerGuard {
    shared: Arc<Shared>,
    channel_id: ChannelId,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.shared.finish_channel(self.channel_id);
    }
}

fn run_reader<R: MessageReceiver>(shared: Arc<Shared>, mut receiver: R) {
    loop {
        match receiver.receive_message() {
            Ok(Some(message)) => {
                if let Err(err) = shared.dispatch_message(message) {
                    let code = err.drop_code().unwrap_or(DropCode::InvalidMuxControlBlock);
                    shared.fail_physical_connection(code, &err.to_string());
                    break;
                }
            }
            Ok(None) => {
                info!("physical connection closed");
                break;
            }
            Err(err) => {
                warn!(error = %err, "physical receive failed");
                break;
            }
        }
    }

    *lock(&shared.reader_done) = true;
    shared.reader_cond.notify_all();
    debug!("reader exited");

    shared.table.stop_accepting();
    shared.advance(EngineState::Draining);
    shared.terminate_all();
    shared.stop_if_finished();
}
