use bytes::BufMut;

use crate::error::{DropCode, Result, WireError};

/// Logical channel identifier.
pub type ChannelId = u32;

/// Channel 0 carries control blocks.
pub const CONTROL_CHANNEL_ID: ChannelId = 0;

/// Channel 1 is the default channel, created from the physical handshake.
pub const DEFAULT_CHANNEL_ID: ChannelId = 1;

/// Largest encodable channel id (2^29 - 1).
pub const MAX_CHANNEL_ID: ChannelId = (1 << 29) - 1;

/// Number of bytes `encode_channel_id` emits for `channel_id`.
pub fn encoded_channel_id_len(channel_id: ChannelId) -> Result<usize> {
    match channel_id {
        0..=0x7f => Ok(1),
        0x80..=0x3fff => Ok(2),
        0x4000..=0x1f_ffff => Ok(3),
        0x20_0000..=MAX_CHANNEL_ID => Ok(4),
        _ => Err(WireError::ChannelIdOutOfRange(u64::from(channel_id))),
    }
}

/// Append the shortest encoding of `channel_id`.
///
/// ```text
/// 0xxxxxxx                             (7 bits)
/// 10xxxxxx xxxxxxxx                    (14 bits)
/// 110xxxxx xxxxxxxx xxxxxxxx           (21 bits)
/// 111xxxxx xxxxxxxx xxxxxxxx xxxxxxxx  (29 bits)
/// ```
pub fn encode_channel_id(channel_id: ChannelId, dst: &mut impl BufMut) -> Result<()> {
    match encoded_channel_id_len(channel_id)? {
        1 => dst.put_u8(channel_id as u8),
        2 => dst.put_u16(0x8000 | channel_id as u16),
        3 => {
            dst.put_u8(0xc0 | (channel_id >> 16) as u8);
            dst.put_u16(channel_id as u16);
        }
        _ => dst.put_u32(0xe000_0000 | channel_id),
    }
    Ok(())
}

/// Decode a channel id starting at `offset`.
///
/// Returns the id and the offset just past it.
pub fn decode_channel_id(buf: &[u8], offset: usize) -> Result<(ChannelId, usize)> {
    let rest = buf.get(offset..).unwrap_or_default();
    let Some(&first) = rest.first() else {
        return Err(truncated());
    };

    let len = if first & 0xe0 == 0xe0 {
        4
    } else if first & 0xc0 == 0xc0 {
        3
    } else if first & 0x80 == 0x80 {
        2
    } else {
        1
    };
    if rest.len() < len {
        return Err(truncated());
    }

    let channel_id = match len {
        1 => ChannelId::from(first),
        2 => ChannelId::from(u16::from_be_bytes([first, rest[1]]) & 0x3fff),
        3 => (ChannelId::from(first & 0x1f) << 16) | ChannelId::from(u16::from_be_bytes([rest[1], rest[2]])),
        _ => u32::from_be_bytes([first, rest[1], rest[2], rest[3]]) & MAX_CHANNEL_ID,
    };
    Ok((channel_id, offset + len))
}

fn truncated() -> WireError {
    WireError::physical(DropCode::ChannelIdTruncated, "channel id truncated")
}
