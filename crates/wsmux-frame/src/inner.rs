//! Inner frames carried on logical channels, and message reassembly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DropCode, Result, WireError};

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0f;

/// WebSocket frame opcode of an inner frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Opcodes 3-7 and 11-15.
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(bits: u8) -> Self {
        match bits & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xa => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xa,
            Self::Reserved(bits) => bits & OPCODE_MASK,
        }
    }

    /// Close, ping, pong and the reserved control range.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    /// Text or binary.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// One frame on a logical channel.
///
/// The payload runs to the end of the physical message; there is no
/// length field and no masking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl InnerFrame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload: payload.into(),
        }
    }

    fn header(&self) -> u8 {
        let mut header = self.opcode.as_u8();
        if self.fin {
            header |= FIN_BIT;
        }
        if self.rsv1 {
            header |= RSV1_BIT;
        }
        if self.rsv2 {
            header |= RSV2_BIT;
        }
        if self.rsv3 {
            header |= RSV3_BIT;
        }
        header
    }
}

/// Decode the inner frame that starts at `offset` (just past the channel id).
pub fn decode_inner_frame(message: &Bytes, offset: usize) -> Result<InnerFrame> {
    let Some(&header) = message.get(offset) else {
        return Err(WireError::physical(
            DropCode::EncapsulatedFrameTruncated,
            "no inner frame after channel id",
        ));
    };
    Ok(InnerFrame {
        fin: header & FIN_BIT != 0,
        rsv1: header & RSV1_BIT != 0,
        rsv2: header & RSV2_BIT != 0,
        rsv3: header & RSV3_BIT != 0,
        opcode: Opcode::from_u8(header),
        payload: message.slice(offset + 1..),
    })
}

/// Append the header byte and payload of `frame`.
pub fn encode_inner_frame(frame: &InnerFrame, dst: &mut BytesMut) {
    dst.reserve(1 + frame.payload.len());
    dst.put_u8(frame.header());
    dst.put_slice(&frame.payload);
}

/// A complete message reassembled from one or more inner frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    /// Opcode of the first frame; never `Continuation`.
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// What the reassembler is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Idle,
    /// A fragmented control message is open (possibly nested in a data message).
    AccumulatingControl,
    AccumulatingData,
}

/// Reassembles inner frames into messages.
///
/// One control message may be interleaved inside a fragmented data
/// message; while it is open, only continuations for it are accepted.
#[derive(Debug, Default)]
pub struct InnerMessageReassembler {
    control: Option<(Opcode, BytesMut)>,
    data: Option<(Opcode, BytesMut)>,
}

impl InnerMessageReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReassemblyState {
        if self.control.is_some() {
            ReassemblyState::AccumulatingControl
        } else if self.data.is_some() {
            ReassemblyState::AccumulatingData
        } else {
            ReassemblyState::Idle
        }
    }

    /// Feed one frame; returns a message when `frame` completes one.
    pub fn push(&mut self, frame: InnerFrame) -> Result<Option<InnerMessage>> {
        match frame.opcode {
            Opcode::Reserved(_) => Err(WireError::InvalidFragmentation("reserved opcode")),
            Opcode::Continuation => self.push_continuation(frame),
            opcode if opcode.is_control() => {
                if self.control.is_some() {
                    return Err(WireError::InvalidFragmentation(
                        "control frame while a fragmented control message is open",
                    ));
                }
                Ok(Self::start(&mut self.control, frame))
            }
            _ => {
                if self.control.is_some() {
                    return Err(WireError::InvalidFragmentation(
                        "data frame while a fragmented control message is open",
                    ));
                }
                if self.data.is_some() {
                    return Err(WireError::InvalidFragmentation(
                        "new data message while a fragmented data message is open",
                    ));
                }
                Ok(Self::start(&mut self.data, frame))
            }
        }
    }

    fn start(slot: &mut Option<(Opcode, BytesMut)>, frame: InnerFrame) -> Option<InnerMessage> {
        if frame.fin {
            return Some(InnerMessage {
                opcode: frame.opcode,
                payload: frame.payload,
            });
        }
        *slot = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
        None
    }

    /// Continuations go to the open control message first, then to the
    /// open data message.
    fn push_continuation(&mut self, frame: InnerFrame) -> Result<Option<InnerMessage>> {
        let open = if self.control.is_some() {
            &mut self.control
        } else {
            &mut self.data
        };
        let Some((opcode, mut buffer)) = open.take() else {
            return Err(WireError::InvalidFragmentation(
                "continuation frame without an open message",
            ));
        };

        buffer.put_slice(&frame.payload);
        if frame.fin {
            return Ok(Some(InnerMessage {
                opcode,
                payload: buffer.freeze(),
            }));
        }
        *open = Some((opcode, buffer));
        Ok(None)
    }
}
