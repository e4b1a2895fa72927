use tracing::debug;
use wsmux_frame::Opcode;

use crate::channel::ChannelIo;
use crate::error::Result;

/// Application logic run once per logical channel, on that channel's
/// worker thread.
///
/// `run` may block for as long as it likes. The channel is dropped once
/// it returns.
pub trait Dispatcher: Send + Sync + 'static {
    fn run(&self, io: ChannelIo) -> Result<()>;
}

impl<F> Dispatcher for F
where
    F: Fn(ChannelIo) -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, io: ChannelIo) -> Result<()> {
        self(io)
    }
}

/// Sends every received message back on the same channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    fn run(&self, io: ChannelIo) -> Result<()> {
        let channel_id = io.channel_id();
        let mut echoed = 0u64;
        while let Some(message) = io.receive()? {
            let opcode = match message.opcode {
                Opcode::Text => Opcode::Text,
                _ => Opcode::Binary,
            };
            io.send(opcode, message.payload, true)?;
            echoed += 1;
        }
        debug!(channel_id, echoed, "echo channel finished");
        Ok(())
    }
}
