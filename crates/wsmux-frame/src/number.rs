//! Variable-length unsigned numbers used inside control blocks.
//!
//! Same layout as a WebSocket payload length: values up to 125 fit in one
//! byte, 126 introduces a 16-bit value, 127 a 64-bit value. Only the
//! shortest form is accepted on decode.

use bytes::BufMut;

use crate::error::{DropCode, Result, WireError};

/// Largest encodable number (2^63 - 1).
pub const MAX_NUMBER: u64 = (1 << 63) - 1;

/// Number of bytes `encode_number` emits for `value`.
pub fn encoded_number_len(value: u64) -> usize {
    if value <= 125 {
        1
    } else if value <= 0xffff {
        3
    } else {
        9
    }
}

/// Append the shortest encoding of `value`.
pub fn encode_number(value: u64, dst: &mut impl BufMut) -> Result<()> {
    if value > MAX_NUMBER {
        return Err(WireError::NumberOutOfRange(value));
    }
    match encoded_number_len(value) {
        1 => dst.put_u8(value as u8),
        3 => {
            dst.put_u8(126);
            dst.put_u16(value as u16);
        }
        _ => {
            dst.put_u8(127);
            dst.put_u64(value);
        }
    }
    Ok(())
}

/// Decode a number starting at `offset`.
///
/// Returns the value and the offset just past it. The 64-bit form is
/// returned as-is; callers decide what range is acceptable.
pub fn decode_number(buf: &[u8], offset: usize) -> Result<(u64, usize)> {
    let rest = buf.get(offset..).unwrap_or_default();
    let Some(&first) = rest.first() else {
        return Err(invalid("number truncated"));
    };
    if first & 0x80 != 0 {
        return Err(invalid("number has its first bit set"));
    }

    match first {
        0..=125 => Ok((u64::from(first), offset + 1)),
        126 => {
            let bytes: [u8; 2] = rest
                .get(1..3)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| invalid("number truncated"))?;
            let value = u64::from(u16::from_be_bytes(bytes));
            if value <= 125 {
                return Err(invalid("non-canonical 16-bit number"));
            }
            Ok((value, offset + 3))
        }
        _ => {
            let bytes: [u8; 8] = rest
                .get(1..9)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| invalid("number truncated"))?;
            let value = u64::from_be_bytes(bytes);
            if value <= 0xffff {
                return Err(invalid("non-canonical 64-bit number"));
            }
            Ok((value, offset + 9))
        }
    }
}

fn invalid(message: &str) -> WireError {
    WireError::physical(DropCode::InvalidMuxControlBlock, message)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use proptest::prelude::*;

    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_number(value, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn boundary_encodings() {
        assert_eq!(encode(0), vec![0]);
        assert_eq!(encode(125), vec![125]);
        assert_eq!(encode(126), vec![126, 0x00, 0x7e]);
        assert_eq!(encode(0xffff), vec![126, 0xff, 0xff]);
        assert_eq!(encode(0x1_0000), vec![127, 0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(encode(MAX_NUMBER).len(), 9);
    }

    #[test]
    fn rejects_values_above_63_bits() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_number(MAX_NUMBER + 1, &mut buf),
            Err(WireError::NumberOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_non_canonical_forms() {
        let short_as_16 = [126, 0x00, 0x05];
        let short_as_64 = [127, 0, 0, 0, 0, 0, 0, 0xff, 0xff];
        for buf in [&short_as_16[..], &short_as_64[..]] {
            let err = decode_number(buf, 0).unwrap_err();
            assert_eq!(err.drop_code(), Some(DropCode::InvalidMuxControlBlock));
        }
    }

    #[test]
    fn rejects_first_bit_and_truncation() {
        assert!(decode_number(&[0x80], 0).is_err());
        assert!(decode_number(&[], 0).is_err());
        assert!(decode_number(&[126, 0x01], 0).is_err());
        assert!(decode_number(&[127, 0, 0, 0], 0).is_err());
    }

    proptest! {
        #[test]
        fn number_roundtrip(value in 0u64..=MAX_NUMBER) {
            let encoded = encode(value);
            prop_assert_eq!(encoded.len(), encoded_number_len(value));
            prop_assert_eq!(decode_number(&encoded, 0).unwrap(), (value, encoded.len()));
        }
    }
}
