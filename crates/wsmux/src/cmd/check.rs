use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use wsmux::connect_physical_handshake;
use wsmux_frame::{
    decode_channel_id, decode_inner_frame, encode_channel_id, encode_control_blocks,
    encode_inner_frame, AddChannelRequest, ChannelId, ControlBlock, ControlBlockParser,
    FlowControl, HandshakeEncoding, Headers, InnerFrame, InnerMessage, InnerMessageReassembler,
    Opcode, RequestHead, ResponseHead, CONTROL_CHANNEL_ID, DEFAULT_CHANNEL_ID, MAX_CHANNEL_ID,
};
use wsmux_transport::{
    MessageReceiver, MessageSender, StreamReceiver, StreamSender, UnixDomainSocket,
    STATUS_NORMAL_CLOSURE,
};

use crate::cmd::{parse_timeout, CheckArgs};
use crate::exit::{
    io_error, mux_error, transport_error, wire_error, CliError, CliResult, FAILURE, SUCCESS,
    USAGE,
};
use crate::output::{payload_preview, print_json, print_table, OutputFormat};

/// Receive quota granted to the server on every checked channel.
const CHECK_RECEIVE_QUOTA: u64 = 65_536;

#[derive(Serialize)]
struct ChannelCheck {
    channel_id: ChannelId,
    status: &'static str,
    http_status: Option<u16>,
    echoed: Option<String>,
    round_trip_ms: Option<f64>,
    drop_code: Option<u16>,
}

impl ChannelCheck {
    fn new(channel_id: ChannelId, status: &'static str) -> Self {
        Self {
            channel_id,
            status,
            http_status: None,
            echoed: None,
            round_trip_ms: None,
            drop_code: None,
        }
    }
}

#[derive(Serialize)]
struct CheckReport {
    socket: String,
    default_channel_quota: u64,
    slots_granted: u64,
    channels: Vec<ChannelCheck>,
}

pub fn run(args: CheckArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let channel_ids = channel_ids(args.first_channel, args.channels)?;

    let (mut receiver, mut sender) = UnixDomainSocket::connect(&args.path)
        .map_err(|err| transport_error("connect failed", err))?;
    receiver
        .get_ref()
        .set_read_timeout(Some(timeout))
        .map_err(|err| io_error("setting read timeout", err))?;

    let mut headers = Headers::new();
    headers.set("Host", "wsmux-check");
    let physical = RequestHead::new("GET", "/", headers);
    connect_physical_handshake(&mut receiver, &mut sender, &physical)
        .map_err(|err| mux_error("physical handshake failed", err))?;

    let mut client = CheckClient::new(receiver, sender);
    client.wait_until(|client| client.slots_seen.then_some(()))?;

    let mut results = Vec::with_capacity(channel_ids.len());
    for channel_id in channel_ids {
        let result = client.check_channel(channel_id, &args.request_path, &args.message)?;
        tracing::info!(channel_id, status = result.status, "channel checked");
        results.push(result);
    }

    let report = CheckReport {
        socket: args.path.display().to_string(),
        default_channel_quota: client.quota(DEFAULT_CHANNEL_ID),
        slots_granted: client.slots_granted,
        channels: results,
    };
    client.close();

    print_report(&report, format);
    if report.channels.iter().all(|channel| channel.status == "ok") {
        Ok(SUCCESS)
    } else {
        Ok(FAILURE)
    }
}

fn channel_ids(first: ChannelId, count: u32) -> CliResult<Vec<ChannelId>> {
    if count == 0 {
        return Err(CliError::new(USAGE, "--channels must be at least 1"));
    }
    if first <= DEFAULT_CHANNEL_ID {
        return Err(CliError::new(USAGE, "--first-channel must be 2 or greater"));
    }
    let last = first
        .checked_add(count - 1)
        .filter(|last| *last <= MAX_CHANNEL_ID)
        .ok_or_else(|| CliError::new(USAGE, format!("channel ids must not exceed {MAX_CHANNEL_ID}")))?;
    Ok((first..=last).collect())
}

struct CheckClient {
    receiver: StreamReceiver<std::os::unix::net::UnixStream>,
    sender: StreamSender<std::os::unix::net::UnixStream>,
    /// Unused slots as (count, quota) runs, oldest first.
    slots: VecDeque<(u64, u64)>,
    slots_granted: u64,
    slots_seen: bool,
    send_quota: HashMap<ChannelId, u64>,
    responses: HashMap<ChannelId, (bool, u16)>,
    drops: HashMap<ChannelId, u16>,
    reassemblers: HashMap<ChannelId, InnerMessageReassembler>,
    messages: HashMap<ChannelId, VecDeque<InnerMessage>>,
}

impl CheckClient {
    fn new(
        receiver: StreamReceiver<std::os::unix::net::UnixStream>,
        sender: StreamSender<std::os::unix::net::UnixStream>,
    ) -> Self {
        Self {
            receiver,
            sender,
            slots: VecDeque::new(),
            slots_granted: 0,
            slots_seen: false,
            send_quota: HashMap::new(),
            responses: HashMap::new(),
            drops: HashMap::new(),
            reassemblers: HashMap::new(),
            messages: HashMap::new(),
        }
    }

    fn quota(&self, channel_id: ChannelId) -> u64 {
        self.send_quota.get(&channel_id).copied().unwrap_or(0)
    }

    fn take_slot(&mut self) -> Option<u64> {
        let (count, quota) = self.slots.front_mut()?;
        let quota = *quota;
        *count -= 1;
        if *count == 0 {
            self.slots.pop_front();
        }
        Some(quota)
    }

    fn check_channel(&mut self, channel_id: ChannelId, path: &str, message: &str) -> CliResult<ChannelCheck> {
        let Some(slot_quota) = self.take_slot() else {
            return Ok(ChannelCheck::new(channel_id, "no-slot"));
        };
        self.send_quota.insert(channel_id, slot_quota);

        let handshake = format!("GET {path} HTTP/1.1\r\nHost: wsmux-check\r\n\r\n");
        self.send_control(&[
            ControlBlock::from(AddChannelRequest {
                channel_id,
                encoding: HandshakeEncoding::Identity,
                encoded_handshake: Bytes::from(handshake),
            }),
            ControlBlock::from(FlowControl {
                channel_id,
                send_quota: CHECK_RECEIVE_QUOTA,
            }),
        ])?;

        let (rejected, status) = self.wait_until(|client| client.responses.get(&channel_id).copied())?;
        if rejected {
            let mut result = ChannelCheck::new(channel_id, "rejected");
            result.http_status = Some(status);
            return Ok(result);
        }

        let mut result = ChannelCheck::new(channel_id, "ok");
        result.http_status = Some(status);
        let cost = message.len() as u64 + 1;
        if self.quota(channel_id) < cost {
            result.status = "no-quota";
            self.close_channel(channel_id)?;
            return Ok(result);
        }

        let started = Instant::now();
        self.send_frame(channel_id, Opcode::Text, Bytes::copy_from_slice(message.as_bytes()))?;
        let reply = self.wait_until(|client| {
            if let Some(code) = client.drops.get(&channel_id) {
                return Some(Err(*code));
            }
            client
                .messages
                .get_mut(&channel_id)
                .and_then(VecDeque::pop_front)
                .map(Ok)
        })?;
        match reply {
            Ok(echoed) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                result.round_trip_ms = Some((elapsed * 100.0).round() / 100.0);
                result.echoed = Some(payload_preview(&echoed.payload));
                if echoed.payload.as_ref() != message.as_bytes() {
                    result.status = "mismatch";
                }
                self.close_channel(channel_id)?;
            }
            Err(code) => {
                result.status = "dropped";
                result.drop_code = Some(code);
            }
        }
        Ok(result)
    }

    /// Closing handshake; waits for the server's close frame or a drop.
    fn close_channel(&mut self, channel_id: ChannelId) -> CliResult<()> {
        if self.quota(channel_id) < 3 {
            return Ok(());
        }
        let status = Bytes::copy_from_slice(&STATUS_NORMAL_CLOSURE.to_be_bytes());
        self.send_frame(channel_id, Opcode::Close, status)?;
        self.wait_until(|client| {
            let closed = client
                .messages
                .get(&channel_id)
                .is_some_and(|queue| queue.iter().any(|m| m.opcode == Opcode::Close));
            (closed || client.drops.contains_key(&channel_id)).then_some(())
        })
    }

    fn close(mut self) {
        if let Err(err) = self.sender.close_connection(STATUS_NORMAL_CLOSURE, "") {
            tracing::debug!(error = %err, "close after check failed");
        }
    }

    fn send_control(&mut self, blocks: &[ControlBlock]) -> CliResult<()> {
        let blocks = encode_control_blocks(blocks).map_err(|err| wire_error("encoding control blocks", err))?;
        let mut payload = BytesMut::with_capacity(1 + blocks.len());
        payload.put_u8(0);
        payload.extend_from_slice(&blocks);
        self.send(&payload)
    }

    fn send_frame(&mut self, channel_id: ChannelId, opcode: Opcode, payload: Bytes) -> CliResult<()> {
        let cost = payload.len() as u64 + 1;
        let mut buf = BytesMut::with_capacity(5 + payload.len());
        encode_channel_id(channel_id, &mut buf).map_err(|err| wire_error("encoding channel id", err))?;
        encode_inner_frame(&InnerFrame::new(true, opcode, payload), &mut buf);
        self.send(&buf)?;
        if let Some(quota) = self.send_quota.get_mut(&channel_id) {
            *quota = quota.saturating_sub(cost);
        }
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> CliResult<()> {
        self.sender
            .send_message(payload, true, true)
            .map_err(|err| transport_error("send failed", err))
    }

    /// Pump messages until `check` yields a value.
    fn wait_until<T>(&mut self, mut check: impl FnMut(&mut Self) -> Option<T>) -> CliResult<T> {
        loop {
            if let Some(value) = check(self) {
                return Ok(value);
            }
            self.pump()?;
        }
    }

    fn pump(&mut self) -> CliResult<()> {
        let message = self
            .receiver
            .receive_message()
            .map_err(|err| transport_error("receive failed", err))?
            .ok_or_else(|| CliError::new(FAILURE, "server closed the connection"))?;
        let payload = message.payload;
        let (channel_id, offset) =
            decode_channel_id(&payload, 0).map_err(|err| wire_error("bad channel id", err))?;

        if channel_id != CONTROL_CHANNEL_ID {
            let frame = decode_inner_frame(&payload, offset).map_err(|err| wire_error("bad frame", err))?;
            let complete = self
                .reassemblers
                .entry(channel_id)
                .or_default()
                .push(frame)
                .map_err(|err| wire_error("bad fragmentation", err))?;
            if let Some(complete) = complete {
                self.messages.entry(channel_id).or_default().push_back(complete);
            }
            return Ok(());
        }

        for block in ControlBlockParser::new(payload.slice(offset..)) {
            match block.map_err(|err| wire_error("bad control block", err))? {
                ControlBlock::NewChannelSlot(slot) => {
                    self.slots_seen = true;
                    self.slots_granted += slot.slots;
                    if slot.slots > 0 {
                        self.slots.push_back((slot.slots, slot.send_quota));
                    }
                }
                ControlBlock::FlowControl(flow) => {
                    *self.send_quota.entry(flow.channel_id).or_default() += flow.send_quota;
                }
                ControlBlock::AddChannelResponse(response) => {
                    let status = ResponseHead::parse(&response.encoded_handshake)
                        .map_err(|err| wire_error("bad AddChannelResponse", err))?
                        .status;
                    self.responses.insert(response.channel_id, (response.rejected, status));
                }
                ControlBlock::DropChannel(drop) => {
                    let code = drop.reason.as_ref().map_or(0, |reason| reason.code);
                    if drop.channel_id == CONTROL_CHANNEL_ID {
                        return Err(CliError::new(
                            FAILURE,
                            format!("server dropped the connection with code {code}"),
                        ));
                    }
                    self.drops.insert(drop.channel_id, code);
                }
                ControlBlock::AddChannelRequest(request) => {
                    tracing::debug!(channel_id = request.channel_id, "ignoring AddChannelRequest from server");
                }
            }
        }
        Ok(())
    }
}

fn print_report(report: &CheckReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let rows = report
                .channels
                .iter()
                .map(|channel| {
                    vec![
                        channel.channel_id.to_string(),
                        channel.status.to_string(),
                        channel.http_status.map(|s| s.to_string()).unwrap_or_default(),
                        channel.round_trip_ms.map(|ms| format!("{ms:.2}")).unwrap_or_default(),
                        channel.echoed.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(&["CHANNEL", "STATUS", "HTTP", "RTT (ms)", "ECHO"], rows);
        }
        OutputFormat::Pretty => {
            println!("Check of {}:", report.socket);
            println!("  Default channel quota: {}", report.default_channel_quota);
            println!("  Slots granted:         {}", report.slots_granted);
            for channel in &report.channels {
                print!("  channel {:<6} {}", channel.channel_id, channel.status);
                if let Some(ms) = channel.round_trip_ms {
                    print!(" rtt={ms:.2}ms");
                }
                if let Some(code) = channel.drop_code {
                    print!(" drop={code}");
                }
                println!();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_count_up_from_first() {
        assert_eq!(channel_ids(2, 3).expect("ids"), vec![2, 3, 4]);
    }

    #[test]
    fn channel_ids_reject_reserved_and_out_of_range() {
        assert_eq!(channel_ids(1, 1).expect_err("default channel").code, USAGE);
        assert_eq!(channel_ids(5, 0).expect_err("zero channels").code, USAGE);
        assert!(channel_ids(MAX_CHANNEL_ID, 2).is_err());
        assert_eq!(channel_ids(MAX_CHANNEL_ID, 1).expect("last id"), vec![MAX_CHANNEL_ID]);
    }
}
