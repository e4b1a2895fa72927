//! Wire codec for the wsmux multiplexing extension.
//!
//! Every physical message carries one multiplexed payload:
//! - A variable-length channel id (1-4 bytes)
//! - On the control channel (id 0): a sequence of control blocks
//! - On any other channel: one inner frame (header byte + payload)
//!
//! Everything here is pure encoding/decoding; connection state lives in
//! `wsmux-engine`.

pub mod channel;
pub mod control;
pub mod error;
pub mod handshake;
pub mod inner;
pub mod number;

pub use channel::{
    decode_channel_id, encode_channel_id, encoded_channel_id_len, ChannelId, CONTROL_CHANNEL_ID,
    DEFAULT_CHANNEL_ID, MAX_CHANNEL_ID,
};
pub use control::{
    encode_control_blocks, AddChannelRequest, AddChannelResponse, ControlBlock,
    ControlBlockParser, DropChannel, DropReason, FlowControl, HandshakeEncoding, NewChannelSlot,
};
pub use error::{DropCode, Result, WireError};
pub use handshake::{HandshakeBase, Headers, RequestHead, ResponseHead};
pub use inner::{
    decode_inner_frame, encode_inner_frame, InnerFrame, InnerMessage, InnerMessageReassembler,
    Opcode, ReassemblyState,
};
pub use number::{decode_number, encode_number, encoded_number_len, MAX_NUMBER};
