use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Record header: magic (2) + flags (1) + length (4) = 7 bytes.
pub const RECORD_HEADER_SIZE: usize = 7;

/// Magic bytes: "WM" (0x57 0x4D).
pub const MAGIC: [u8; 2] = [0x57, 0x4D];

/// Default maximum reassembled message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

const FLAG_FIN: u8 = 0x01;
const FLAG_BINARY: u8 = 0x02;
const FLAG_CLOSE: u8 = 0x80;
const KNOWN_FLAGS: u8 = FLAG_FIN | FLAG_BINARY | FLAG_CLOSE;

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Last fragment of a message.
    pub fin: bool,
    /// Payload is binary.
    pub binary: bool,
    /// Closing record; the payload holds a 2-byte status code and a reason.
    pub close: bool,
}

impl RecordHeader {
    /// Header for a data fragment.
    pub fn data(fin: bool, binary: bool) -> Self {
        Self {
            fin,
            binary,
            close: false,
        }
    }

    /// Header for the closing record.
    pub fn close() -> Self {
        Self {
            fin: true,
            binary: true,
            close: true,
        }
    }

    fn flags(self) -> u8 {
        let mut flags = 0;
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.binary {
            flags |= FLAG_BINARY;
        }
        if self.close {
            flags |= FLAG_CLOSE;
        }
        flags
    }

    fn from_flags(flags: u8) -> Result<Self> {
        if flags & !KNOWN_FLAGS != 0 {
            return Err(TransportError::InvalidRecord("reserved flag bits set"));
        }
        Ok(Self {
            fin: flags & FLAG_FIN != 0,
            binary: flags & FLAG_BINARY != 0,
            close: flags & FLAG_CLOSE != 0,
        })
    }
}

/// Encode one record into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────────┬──────────────────┐
/// │ Magic (2B)   │ Flags     │ Length       │ Payload          │
/// │ 0x57 0x4D    │ (1B)      │ (4B BE)      │ (Length bytes)   │
/// │ "WM"         │ F|B|..|C  │              │                  │
/// └──────────────┴───────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_record(header: RecordHeader, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(RECORD_HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u8(header.flags());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Encode the payload of a closing record.
pub fn encode_close_payload(status_code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&status_code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Decode one record from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete record yet.
/// On success, consumes the record bytes from the buffer.
pub fn decode_record(src: &mut BytesMut, max_payload: usize) -> Result<Option<(RecordHeader, Bytes)>> {
    if src.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(TransportError::InvalidRecord("bad magic"));
    }

    let header = RecordHeader::from_flags(src[2])?;
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len > max_payload {
        return Err(TransportError::MessageTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = RECORD_HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(RECORD_HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some((header, payload)))
}

/// Configuration for the record codec.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// Maximum reassembled message size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_data_record() {
        let mut buf = BytesMut::new();
        encode_record(RecordHeader::data(true, true), b"\x01\x81hi", &mut buf).unwrap();
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 4);

        let (header, payload) = decode_record(&mut buf, DEFAULT_MAX_MESSAGE)
            .unwrap()
            .unwrap();
        assert_eq!(header, RecordHeader::data(true, true));
        assert_eq!(payload.as_ref(), b"\x01\x81hi");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x57, 0x4D, 0x03][..]);
        assert!(decode_record(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().is_none());
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_record(RecordHeader::data(true, false), b"hello", &mut buf).unwrap();
        buf.truncate(RECORD_HEADER_SIZE + 2);
        assert!(decode_record(&mut buf, DEFAULT_MAX_MESSAGE).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0x03, 0x00, 0x00, 0x00, 0x00][..]);
        let err = decode_record(&mut buf, DEFAULT_MAX_MESSAGE).unwrap_err();
        assert!(matches!(err, TransportError::InvalidRecord(_)));
    }

    #[test]
    fn decode_rejects_reserved_flags() {
        let mut buf = BytesMut::from(&[0x57, 0x4D, 0x10, 0x00, 0x00, 0x00, 0x00][..]);
        let err = decode_record(&mut buf, DEFAULT_MAX_MESSAGE).unwrap_err();
        assert!(matches!(err, TransportError::InvalidRecord(_)));
    }

    #[test]
    fn decode_rejects_oversized_record() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(0x03);
        buf.put_u32(1024);

        let err = decode_record(&mut buf, 16).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    }

    #[test]
    fn close_record_carries_status() {
        let mut buf = BytesMut::new();
        let payload = encode_close_payload(1011, "boom");
        encode_record(RecordHeader::close(), &payload, &mut buf).unwrap();

        let (header, payload) = decode_record(&mut buf, DEFAULT_MAX_MESSAGE)
            .unwrap()
            .unwrap();
        assert!(header.close);
        assert_eq!(&payload[..2], &1011u16.to_be_bytes());
        assert_eq!(&payload[2..], b"boom");
    }
}
