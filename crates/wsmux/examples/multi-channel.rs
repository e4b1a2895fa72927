//! Two logical channels over an in-memory connection, driven by hand.
//!
//! The server uppercases text; the client opens channels 3 and 5 with raw
//! control blocks and prints what comes back.
//!
//! Run with:
//!   cargo run --example multi-channel

use bytes::{BufMut, Bytes, BytesMut};
use wsmux::engine::{ChannelIo, MuxConfig, MuxEngine};
use wsmux::frame::{
    decode_channel_id, decode_inner_frame, encode_channel_id, encode_control_blocks,
    encode_inner_frame, AddChannelRequest, ControlBlock, ControlBlockParser, FlowControl,
    HandshakeEncoding, InnerFrame, Opcode, RequestHead,
};
use wsmux::transport::{memory_pair, MessageReceiver, MessageSender};

fn uppercase(io: ChannelIo) -> wsmux::engine::Result<()> {
    while let Some(message) = io.receive()? {
        let text = String::from_utf8_lossy(&message.payload).to_uppercase();
        io.send_text(&text)?;
    }
    Ok(())
}

fn control(blocks: &[ControlBlock]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut payload = BytesMut::new();
    payload.put_u8(0);
    payload.extend_from_slice(&encode_control_blocks(blocks)?);
    Ok(payload.to_vec())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (server, client) = memory_pair();
    let (server_rx, server_tx) = server.split();
    let (mut client_rx, mut client_tx) = client.split();

    let request = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n")?;
    let engine = MuxEngine::builder(uppercase)
        .with_config(MuxConfig {
            initial_slots: 2,
            initial_slot_quota: 1024,
            ..MuxConfig::default()
        })
        .start(server_rx, server_tx, request)?;

    for channel_id in [3, 5] {
        let handshake = format!("GET /chat/{channel_id} HTTP/1.1\r\nHost: example\r\n\r\n");
        let blocks = [
            ControlBlock::from(AddChannelRequest {
                channel_id,
                encoding: HandshakeEncoding::Identity,
                encoded_handshake: Bytes::from(handshake),
            }),
            ControlBlock::from(FlowControl {
                channel_id,
                send_quota: 1024,
            }),
        ];
        client_tx.send_message(&control(&blocks)?, true, true)?;

        let mut frame = BytesMut::new();
        encode_channel_id(channel_id, &mut frame)?;
        let text = format!("hello from channel {channel_id}");
        encode_inner_frame(&InnerFrame::new(true, Opcode::Text, text), &mut frame);
        client_tx.send_message(&frame, true, true)?;
    }

    let mut replies = 0;
    while replies < 2 {
        let Some(message) = client_rx.receive_message()? else {
            break;
        };
        let (channel_id, offset) = decode_channel_id(&message.payload, 0)?;
        if channel_id == 0 {
            for block in ControlBlockParser::new(message.payload.slice(offset..)) {
                println!("control: {}", block?.name());
            }
            continue;
        }
        let frame = decode_inner_frame(&message.payload, offset)?;
        println!(
            "channel {channel_id}: {}",
            String::from_utf8_lossy(&frame.payload)
        );
        replies += 1;
    }

    engine.shutdown()?;
    println!("engine state: {:?}", engine.state());
    Ok(())
}
