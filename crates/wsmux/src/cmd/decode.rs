use serde::Serialize;
use wsmux_frame::{
    decode_channel_id, decode_inner_frame, ChannelId, ControlBlock, ControlBlockParser,
    DropCode, WireError, CONTROL_CHANNEL_ID,
};

use crate::cmd::DecodeArgs;
use crate::exit::{CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{payload_preview, print_json, print_table, to_hex, OutputFormat};

#[derive(Debug, Serialize)]
struct DecodedMessage {
    channel_id: ChannelId,
    /// Normalized hex of the whole message.
    raw: String,
    items: Vec<DecodedItem>,
    /// Set when decoding stopped at a protocol error.
    error: Option<DecodeError>,
}

#[derive(Debug, Serialize)]
struct DecodedItem {
    kind: &'static str,
    channel_id: Option<ChannelId>,
    fields: Vec<(&'static str, String)>,
}

#[derive(Debug, Serialize)]
struct DecodeError {
    drop_code: Option<u16>,
    message: String,
}

impl From<WireError> for DecodeError {
    fn from(err: WireError) -> Self {
        Self {
            drop_code: err.drop_code().map(DropCode::as_u16),
            message: err.to_string(),
        }
    }
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = crate::output::from_hex(&args.hex)
        .ok_or_else(|| CliError::new(USAGE, "input is not valid hex"))?;
    let decoded = decode(bytes.into())
        .map_err(|err| CliError::new(DATA_INVALID, format!("cannot decode message: {err}")))?;

    print_decoded(&decoded, format);
    Ok(if decoded.error.is_some() { DATA_INVALID } else { SUCCESS })
}

fn decode(payload: bytes::Bytes) -> Result<DecodedMessage, WireError> {
    let (channel_id, offset) = decode_channel_id(&payload, 0)?;
    let mut decoded = DecodedMessage {
        channel_id,
        raw: to_hex(&payload),
        items: Vec::new(),
        error: None,
    };

    if channel_id != CONTROL_CHANNEL_ID {
        let frame = decode_inner_frame(&payload, offset)?;
        decoded.items.push(DecodedItem {
            kind: "InnerFrame",
            channel_id: Some(channel_id),
            fields: vec![
                ("fin", frame.fin.to_string()),
                ("opcode", format!("{:?}", frame.opcode)),
                ("length", frame.payload.len().to_string()),
                ("payload", payload_preview(&frame.payload)),
            ],
        });
        return Ok(decoded);
    }

    for block in ControlBlockParser::new(payload.slice(offset..)) {
        match block {
            Ok(block) => decoded.items.push(describe(&block)),
            Err(err) => {
                let physical = matches!(err, WireError::PhysicalConnection { .. });
                decoded.error = Some(err.into());
                if physical {
                    break;
                }
            }
        }
    }
    Ok(decoded)
}

fn describe(block: &ControlBlock) -> DecodedItem {
    let (channel_id, fields) = match block {
        ControlBlock::AddChannelRequest(request) => (
            Some(request.channel_id),
            vec![
                ("encoding", format!("{:?}", request.encoding)),
                ("handshake", payload_preview(&request.encoded_handshake)),
            ],
        ),
        ControlBlock::AddChannelResponse(response) => (
            Some(response.channel_id),
            vec![
                ("rejected", response.rejected.to_string()),
                ("encoding", format!("{:?}", response.encoding)),
                ("handshake", payload_preview(&response.encoded_handshake)),
            ],
        ),
        ControlBlock::FlowControl(flow) => (
            Some(flow.channel_id),
            vec![("send_quota", flow.send_quota.to_string())],
        ),
        ControlBlock::DropChannel(drop) => {
            let fields = match &drop.reason {
                Some(reason) => vec![
                    ("code", drop_code_label(reason.code)),
                    ("message", reason.message.clone()),
                ],
                None => Vec::new(),
            };
            (Some(drop.channel_id), fields)
        }
        ControlBlock::NewChannelSlot(slot) => (
            None,
            vec![
                ("slots", slot.slots.to_string()),
                ("send_quota", slot.send_quota.to_string()),
                ("fallback", slot.fallback.to_string()),
            ],
        ),
    };
    DecodedItem {
        kind: block.name(),
        channel_id,
        fields,
    }
}

fn drop_code_label(code: u16) -> String {
    match DropCode::from_u16(code) {
        Some(known) => known.to_string(),
        None => code.to_string(),
    }
}

fn print_decoded(decoded: &DecodedMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(decoded),
        OutputFormat::Table => {
            let rows = decoded
                .items
                .iter()
                .map(|item| {
                    vec![
                        item.kind.to_string(),
                        item.channel_id.map(|id| id.to_string()).unwrap_or_default(),
                        format_fields(&item.fields),
                    ]
                })
                .collect();
            print_table(&["BLOCK", "CHANNEL", "FIELDS"], rows);
            if let Some(error) = &decoded.error {
                println!("error: {}", error.message);
            }
        }
        OutputFormat::Pretty => {
            println!("channel {}", decoded.channel_id);
            for item in &decoded.items {
                match item.channel_id {
                    Some(id) => println!("  {} channel={id} {}", item.kind, format_fields(&item.fields)),
                    None => println!("  {} {}", item.kind, format_fields(&item.fields)),
                }
            }
            if let Some(error) = &decoded.error {
                println!("  error: {}", error.message);
            }
        }
    }
}

fn format_fields(fields: &[(&'static str, String)]) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use wsmux_frame::{encode_control_blocks, DropChannel, DropReason, FlowControl, NewChannelSlot};

    use super::*;

    fn control_message(blocks: &[ControlBlock]) -> bytes::Bytes {
        let mut payload = BytesMut::from(&[0u8][..]);
        payload.extend_from_slice(&encode_control_blocks(blocks).expect("encode"));
        payload.freeze()
    }

    #[test]
    fn decodes_control_blocks_in_order() {
        let payload = control_message(&[
            ControlBlock::from(FlowControl {
                channel_id: 1,
                send_quota: 8192,
            }),
            ControlBlock::from(NewChannelSlot {
                slots: 4,
                send_quota: 1024,
                fallback: false,
            }),
            ControlBlock::from(DropChannel {
                channel_id: 3,
                reason: Some(DropReason::new(DropCode::SendQuotaViolation, "too much")),
            }),
        ]);

        let decoded = decode(payload).expect("decode");
        assert_eq!(decoded.channel_id, 0);
        assert!(decoded.error.is_none());
        let kinds: Vec<_> = decoded.items.iter().map(|item| item.kind).collect();
        assert_eq!(kinds, ["FlowControl", "NewChannelSlot", "DropChannel"]);
        assert_eq!(decoded.items[2].channel_id, Some(3));
        assert!(decoded.items[2].fields[0].1.starts_with("3005"));
    }

    #[test]
    fn decodes_inner_frame() {
        let decoded = decode(bytes::Bytes::from_static(b"\x05\x81hi")).expect("decode");
        assert_eq!(decoded.channel_id, 5);
        assert_eq!(decoded.raw, "05816869");
        let fields = &decoded.items[0].fields;
        assert_eq!(fields[0], ("fin", "true".to_string()));
        assert_eq!(fields[1], ("opcode", "Text".to_string()));
        assert_eq!(fields[3], ("payload", "hi".to_string()));
    }

    #[test]
    fn stops_at_physical_error() {
        let decoded = decode(bytes::Bytes::from_static(&[0x00, 0x40, 0x03, 0x05, 0xe0])).expect("decode");
        assert_eq!(decoded.items.len(), 1);
        let error = decoded.error.expect("unknown opcode should be reported");
        assert_eq!(error.drop_code, Some(2004));
    }

    #[test]
    fn truncated_channel_id_is_an_error() {
        assert!(decode(bytes::Bytes::from_static(&[0x80])).is_err());
    }
}
