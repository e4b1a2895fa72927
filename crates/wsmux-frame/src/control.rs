//! Control blocks carried on the control channel (id 0).
//!
//! A control payload is a sequence of blocks. Each block starts with a
//! byte whose top three bits select the block type; the remaining five
//! bits hold type-specific flags or must be zero.

use bytes::{BufMut, Bytes, BytesMut};

use crate::channel::{decode_channel_id, encode_channel_id, ChannelId, CONTROL_CHANNEL_ID};
use crate::error::{DropCode, Result, WireError};
use crate::number::{decode_number, encode_number, MAX_NUMBER};

pub const OPCODE_ADD_CHANNEL_REQUEST: u8 = 0;
pub const OPCODE_ADD_CHANNEL_RESPONSE: u8 = 1;
pub const OPCODE_FLOW_CONTROL: u8 = 2;
pub const OPCODE_DROP_CHANNEL: u8 = 3;
pub const OPCODE_NEW_CHANNEL_SLOT: u8 = 4;

/// How the handshake inside an AddChannel block is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEncoding {
    /// Complete request or response text.
    Identity,
    /// Only the headers that differ from the delta base.
    Delta,
    /// Any other value of the two encoding bits.
    Unknown(u8),
}

impl HandshakeEncoding {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Identity,
            1 => Self::Delta,
            other => Self::Unknown(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Identity => 0,
            Self::Delta => 1,
            Self::Unknown(bits) => bits & 0x03,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddChannelRequest {
    pub channel_id: ChannelId,
    pub encoding: HandshakeEncoding,
    pub encoded_handshake: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddChannelResponse {
    pub channel_id: ChannelId,
    pub encoding: HandshakeEncoding,
    pub rejected: bool,
    pub encoded_handshake: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    pub channel_id: ChannelId,
    pub send_quota: u64,
}

/// Status code and message explaining why a channel was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReason {
    pub code: u16,
    pub message: String,
}

impl DropReason {
    pub fn new(code: DropCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropChannel {
    pub channel_id: ChannelId,
    /// `None` when the block carried an empty reason.
    pub reason: Option<DropReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannelSlot {
    pub slots: u64,
    pub send_quota: u64,
    /// Asks the peer to fall back to a plain, non-multiplexed connection.
    pub fallback: bool,
}

impl NewChannelSlot {
    /// The fallback form: zero slots, zero quota, fallback bit set.
    pub fn fallback() -> Self {
        Self {
            slots: 0,
            send_quota: 0,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBlock {
    AddChannelRequest(AddChannelRequest),
    AddChannelResponse(AddChannelResponse),
    FlowControl(FlowControl),
    DropChannel(DropChannel),
    NewChannelSlot(NewChannelSlot),
}

impl ControlBlock {
    /// Block type name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddChannelRequest(_) => "AddChannelRequest",
            Self::AddChannelResponse(_) => "AddChannelResponse",
            Self::FlowControl(_) => "FlowControl",
            Self::DropChannel(_) => "DropChannel",
            Self::NewChannelSlot(_) => "NewChannelSlot",
        }
    }

    /// Append this block's encoding.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::AddChannelRequest(block) => {
                check_target(block.channel_id)?;
                dst.put_u8((OPCODE_ADD_CHANNEL_REQUEST << 5) | block.encoding.bits());
                encode_channel_id(block.channel_id, dst)?;
                put_sized(&block.encoded_handshake, dst)
            }
            Self::AddChannelResponse(block) => {
                check_target(block.channel_id)?;
                let rejected = if block.rejected { 1 << 4 } else { 0 };
                dst.put_u8((OPCODE_ADD_CHANNEL_RESPONSE << 5) | rejected | block.encoding.bits());
                encode_channel_id(block.channel_id, dst)?;
                put_sized(&block.encoded_handshake, dst)
            }
            Self::FlowControl(block) => {
                dst.put_u8(OPCODE_FLOW_CONTROL << 5);
                encode_channel_id(block.channel_id, dst)?;
                encode_number(block.send_quota, dst)
            }
            Self::DropChannel(block) => {
                dst.put_u8(OPCODE_DROP_CHANNEL << 5);
                encode_channel_id(block.channel_id, dst)?;
                match &block.reason {
                    None => encode_number(0, dst),
                    Some(reason) => {
                        let mut body = Vec::with_capacity(2 + reason.message.len());
                        body.extend_from_slice(&reason.code.to_be_bytes());
                        body.extend_from_slice(reason.message.as_bytes());
                        put_sized(&body, dst)
                    }
                }
            }
            Self::NewChannelSlot(block) => {
                dst.put_u8((OPCODE_NEW_CHANNEL_SLOT << 5) | u8::from(block.fallback));
                encode_number(block.slots, dst)?;
                encode_number(block.send_quota, dst)
            }
        }
    }
}

impl From<AddChannelRequest> for ControlBlock {
    fn from(block: AddChannelRequest) -> Self {
        Self::AddChannelRequest(block)
    }
}

impl From<AddChannelResponse> for ControlBlock {
    fn from(block: AddChannelResponse) -> Self {
        Self::AddChannelResponse(block)
    }
}

impl From<FlowControl> for ControlBlock {
    fn from(block: FlowControl) -> Self {
        Self::FlowControl(block)
    }
}

impl From<DropChannel> for ControlBlock {
    fn from(block: DropChannel) -> Self {
        Self::DropChannel(block)
    }
}

impl From<NewChannelSlot> for ControlBlock {
    fn from(block: NewChannelSlot) -> Self {
        Self::NewChannelSlot(block)
    }
}

/// Encode blocks into one control payload (without the channel id prefix).
pub fn encode_control_blocks<'a>(blocks: impl IntoIterator<Item = &'a ControlBlock>) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    for block in blocks {
        block.encode(&mut dst)?;
    }
    Ok(dst.freeze())
}

/// Yields control blocks from a control payload in wire order.
///
/// A physical-connection error ends iteration. A logical-channel error is
/// yielded in place of its block and parsing continues with the next one.
pub struct ControlBlockParser {
    data: Bytes,
    pos: usize,
    failed: bool,
}

impl ControlBlockParser {
    /// `data` is the control payload with the channel id already stripped.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }

    fn next_block(&mut self) -> Result<ControlBlock> {
        let first = self.data[self.pos];
        self.pos += 1;
        let opcode = first >> 5;
        match opcode {
            OPCODE_ADD_CHANNEL_REQUEST => self.add_channel_request(first),
            OPCODE_ADD_CHANNEL_RESPONSE => self.add_channel_response(first),
            OPCODE_FLOW_CONTROL => self.flow_control(first),
            OPCODE_DROP_CHANNEL => self.drop_channel(first),
            OPCODE_NEW_CHANNEL_SLOT => self.new_channel_slot(first),
            _ => Err(WireError::physical(
                DropCode::UnknownMuxOpcode,
                format!("unknown mux opcode {opcode}"),
            )),
        }
    }

    fn add_channel_request(&mut self, first: u8) -> Result<ControlBlock> {
        if first & 0x1c != 0 {
            return Err(invalid("reserved bits set in AddChannelRequest"));
        }
        let channel_id = self.channel_id()?;
        check_target(channel_id)?;
        let encoded_handshake = self.sized()?;
        Ok(ControlBlock::AddChannelRequest(AddChannelRequest {
            channel_id,
            encoding: HandshakeEncoding::from_bits(first),
            encoded_handshake,
        }))
    }

    fn add_channel_response(&mut self, first: u8) -> Result<ControlBlock> {
        if first & 0x0c != 0 {
            return Err(invalid("reserved bits set in AddChannelResponse"));
        }
        let channel_id = self.channel_id()?;
        check_target(channel_id)?;
        let encoded_handshake = self.sized()?;
        Ok(ControlBlock::AddChannelResponse(AddChannelResponse {
            channel_id,
            encoding: HandshakeEncoding::from_bits(first),
            rejected: first & 0x10 != 0,
            encoded_handshake,
        }))
    }

    fn flow_control(&mut self, first: u8) -> Result<ControlBlock> {
        if first & 0x1f != 0 {
            return Err(invalid("reserved bits set in FlowControl"));
        }
        let channel_id = self.channel_id()?;
        let (send_quota, next) = decode_number(&self.data, self.pos)?;
        self.pos = next;
        if send_quota > MAX_NUMBER {
            return Err(WireError::logical(
                channel_id,
                DropCode::SendQuotaOverflow,
                "FlowControl quota exceeds 63 bits",
            ));
        }
        Ok(ControlBlock::FlowControl(FlowControl {
            channel_id,
            send_quota,
        }))
    }

    fn drop_channel(&mut self, first: u8) -> Result<ControlBlock> {
        if first & 0x1f != 0 {
            return Err(invalid("reserved bits set in DropChannel"));
        }
        let channel_id = self.channel_id()?;
        let body = self.sized()?;
        let reason = match body.len() {
            0 => None,
            1 => return Err(invalid("DropChannel reason must be empty or at least 2 bytes")),
            _ => {
                let code = u16::from_be_bytes([body[0], body[1]]);
                let message = std::str::from_utf8(&body[2..])
                    .map_err(|_| invalid("DropChannel reason is not valid UTF-8"))?
                    .to_string();
                Some(DropReason { code, message })
            }
        };
        Ok(ControlBlock::DropChannel(DropChannel { channel_id, reason }))
    }

    fn new_channel_slot(&mut self, first: u8) -> Result<ControlBlock> {
        if first & 0x1e != 0 {
            return Err(invalid("reserved bits set in NewChannelSlot"));
        }
        let slots = self.number()?;
        let send_quota = self.number()?;
        Ok(ControlBlock::NewChannelSlot(NewChannelSlot {
            slots,
            send_quota,
            fallback: first & 0x01 != 0,
        }))
    }

    fn channel_id(&mut self) -> Result<ChannelId> {
        let (channel_id, next) = decode_channel_id(&self.data, self.pos)?;
        self.pos = next;
        Ok(channel_id)
    }

    fn number(&mut self) -> Result<u64> {
        let (value, next) = decode_number(&self.data, self.pos)?;
        if value > MAX_NUMBER {
            return Err(invalid("number exceeds 63 bits"));
        }
        self.pos = next;
        Ok(value)
    }

    fn sized(&mut self) -> Result<Bytes> {
        let size = self.number()?;
        let end = usize::try_from(size)
            .ok()
            .and_then(|size| self.pos.checked_add(size))
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| invalid("control block contents truncated"))?;
        let contents = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(contents)
    }
}

impl Iterator for ControlBlockParser {
    type Item = Result<ControlBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let block = self.next_block();
        if matches!(block, Err(WireError::PhysicalConnection { .. })) {
            self.failed = true;
        }
        Some(block)
    }
}

fn put_sized(contents: &[u8], dst: &mut BytesMut) -> Result<()> {
    let size = u64::try_from(contents.len())
        .map_err(|_| WireError::HandshakeTooLarge(contents.len()))?;
    encode_number(size, dst)?;
    dst.put_slice(contents);
    Ok(())
}

fn check_target(channel_id: ChannelId) -> Result<()> {
    if channel_id == CONTROL_CHANNEL_ID {
        return Err(invalid("AddChannel block targets the control channel"));
    }
    Ok(())
}

fn invalid(message: &str) -> WireError {
    WireError::physical(DropCode::InvalidMuxControlBlock, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Vec<Result<ControlBlock>> {
        ControlBlockParser::new(Bytes::copy_from_slice(data)).collect()
    }

    fn encode(block: impl Into<ControlBlock>) -> Vec<u8> {
        let mut dst = BytesMut::new();
        block.into().encode(&mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn parses_add_channel_request() {
        let mut data = vec![0x01, 0x03, 0x05];
        data.extend_from_slice(b"GET /");
        let blocks = parse(&data);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0].as_ref().unwrap(),
            &ControlBlock::AddChannelRequest(AddChannelRequest {
                channel_id: 3,
                encoding: HandshakeEncoding::Delta,
                encoded_handshake: Bytes::from_static(b"GET /"),
            })
        );
    }

    #[test]
    fn unknown_request_encoding_is_preserved() {
        let blocks = parse(&[0x02, 0x03, 0x00]);
        let Ok(ControlBlock::AddChannelRequest(block)) = &blocks[0] else {
            panic!("expected AddChannelRequest");
        };
        assert_eq!(block.encoding, HandshakeEncoding::Unknown(2));
    }

    #[test]
    fn add_channel_response_flags() {
        let bytes = encode(AddChannelResponse {
            channel_id: 5,
            encoding: HandshakeEncoding::Identity,
            rejected: true,
            encoded_handshake: Bytes::from_static(b"HTTP/1.1 400 Bad Request\r\n\r\n"),
        });
        assert_eq!(bytes[0], (1 << 5) | (1 << 4));
        assert_eq!(bytes[1], 5);

        let blocks = parse(&bytes);
        let Ok(ControlBlock::AddChannelResponse(block)) = &blocks[0] else {
            panic!("expected AddChannelResponse");
        };
        assert!(block.rejected);
        assert_eq!(block.channel_id, 5);
    }

    #[test]
    fn multiple_blocks_in_wire_order() {
        let mut data = encode(FlowControl {
            channel_id: 1,
            send_quota: 1024,
        });
        data.extend(encode(NewChannelSlot {
            slots: 2,
            send_quota: 300,
            fallback: false,
        }));
        data.extend(encode(DropChannel {
            channel_id: 7,
            reason: None,
        }));

        let names: Vec<_> = parse(&data)
            .into_iter()
            .map(|block| block.unwrap().name())
            .collect();
        assert_eq!(names, vec!["FlowControl", "NewChannelSlot", "DropChannel"]);
    }

    #[test]
    fn drop_channel_reason_forms() {
        let with_reason = encode(DropChannel {
            channel_id: 4,
            reason: Some(DropReason::new(DropCode::SendQuotaViolation, "too much")),
        });
        let blocks = parse(&with_reason);
        let Ok(ControlBlock::DropChannel(block)) = &blocks[0] else {
            panic!("expected DropChannel");
        };
        let reason = block.reason.as_ref().unwrap();
        assert_eq!(reason.code, 3005);
        assert_eq!(reason.message, "too much");

        let one_byte = [OPCODE_DROP_CHANNEL << 5, 0x04, 0x01, 0x0b];
        let err = parse(&one_byte).remove(0).unwrap_err();
        assert_eq!(err.drop_code(), Some(DropCode::InvalidMuxControlBlock));
    }

    #[test]
    fn fallback_slot_encoding() {
        assert_eq!(encode(NewChannelSlot::fallback()), vec![0x81, 0x00, 0x00]);
        let blocks = parse(&[0x81, 0x00, 0x00]);
        assert_eq!(
            blocks[0].as_ref().unwrap(),
            &ControlBlock::NewChannelSlot(NewChannelSlot::fallback())
        );
    }

    #[test]
    fn unknown_opcode_stops_parsing() {
        let mut data = vec![5 << 5];
        data.extend(encode(FlowControl {
            channel_id: 1,
            send_quota: 1,
        }));
        let blocks = parse(&data);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0].as_ref().unwrap_err().drop_code(),
            Some(DropCode::UnknownMuxOpcode)
        );
    }

    #[test]
    fn reserved_bits_are_rejected() {
        for first in [0x04u8, (1 << 5) | 0x08, (2 << 5) | 0x01, (3 << 5) | 0x10, (4 << 5) | 0x02] {
            let blocks = parse(&[first, 0x01, 0x00, 0x00]);
            assert_eq!(
                blocks[0].as_ref().unwrap_err().drop_code(),
                Some(DropCode::InvalidMuxControlBlock),
                "first byte {first:#04x}"
            );
        }
    }

    #[test]
    fn truncated_handshake_is_rejected() {
        let blocks = parse(&[0x00, 0x03, 0x10, b'G']);
        assert_eq!(
            blocks[0].as_ref().unwrap_err().drop_code(),
            Some(DropCode::InvalidMuxControlBlock)
        );
    }

    #[test]
    fn add_channel_for_control_channel_is_rejected() {
        let blocks = parse(&[0x00, 0x00, 0x00]);
        assert!(matches!(blocks[0], Err(WireError::PhysicalConnection { .. })));
    }

    #[test]
    fn oversized_flow_control_quota_is_scoped_to_channel() {
        let mut data = vec![OPCODE_FLOW_CONTROL << 5, 0x09, 127];
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.extend(encode(FlowControl {
            channel_id: 1,
            send_quota: 10,
        }));

        let blocks = parse(&data);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(
            blocks[0],
            Err(WireError::LogicalChannel {
                channel: 9,
                code: DropCode::SendQuotaOverflow,
                ..
            })
        ));
        assert!(blocks[1].is_ok());
    }

    #[test]
    fn encode_control_blocks_concatenates() {
        let blocks = [
            ControlBlock::from(FlowControl {
                channel_id: 1,
                send_quota: 5,
            }),
            ControlBlock::from(NewChannelSlot::fallback()),
        ];
        let payload = encode_control_blocks(&blocks).unwrap();
        assert_eq!(payload.as_ref(), &[0x40, 0x01, 0x05, 0x81, 0x00, 0x00]);
    }
}
