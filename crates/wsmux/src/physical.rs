//! Opening handshake for the physical connection.
//!
//! Record transports have no HTTP upgrade of their own, so the client sends
//! its request head as the first (text) message and the server answers with
//! a text response head. Everything after that is multiplexed.

use tracing::{debug, info};
use wsmux_engine::{HandshakeValidator, LogicalRequest, MuxError, Result};
use wsmux_frame::{RequestHead, ResponseHead, WireError, DEFAULT_CHANNEL_ID};
use wsmux_transport::{MessageReceiver, MessageSender, TransportError};

/// Server side. Reads the request head, validates it as the default
/// channel's handshake and sends the response.
///
/// The returned request is what [`wsmux_engine::MuxEngineBuilder::start`]
/// expects.
pub fn accept_physical_handshake<R, S>(
    receiver: &mut R,
    sender: &mut S,
    validator: &dyn HandshakeValidator,
) -> Result<RequestHead>
where
    R: MessageReceiver + ?Sized,
    S: MessageSender + ?Sized,
{
    let message = receiver
        .receive_message()?
        .ok_or(TransportError::Closed)?;
    if message.is_binary {
        send_response(sender, &ResponseHead::rejection(400))?;
        return Err(MuxError::Wire(WireError::MalformedHandshake(
            "opening handshake must be a text message".to_string(),
        )));
    }

    let request = match RequestHead::parse(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            send_response(sender, &ResponseHead::rejection(400))?;
            return Err(err.into());
        }
    };

    let decision = validator.validate(&LogicalRequest::from_head(DEFAULT_CHANNEL_ID, request.clone()));
    if !decision.accept {
        info!(status = decision.status, path = %request.path, "physical handshake rejected");
        send_response(sender, &ResponseHead::rejection(decision.status))?;
        return Err(MuxError::DefaultChannelRejected(decision.status));
    }

    send_response(sender, &ResponseHead::switching_protocols(&decision.response_headers))?;
    info!(path = %request.path, "physical handshake accepted");
    Ok(request)
}

/// Client side. Sends `request` and waits for a 101 response.
pub fn connect_physical_handshake<R, S>(
    receiver: &mut R,
    sender: &mut S,
    request: &RequestHead,
) -> Result<ResponseHead>
where
    R: MessageReceiver + ?Sized,
    S: MessageSender + ?Sized,
{
    sender.send_message(request.encode().as_bytes(), true, false)?;
    let message = receiver
        .receive_message()?
        .ok_or(TransportError::Closed)?;
    let response = ResponseHead::parse(&message.payload)?;
    debug!(status = response.status, "physical handshake response");
    if response.status != 101 {
        return Err(MuxError::DefaultChannelRejected(response.status));
    }
    Ok(response)
}

fn send_response<S: MessageSender + ?Sized>(sender: &mut S, response: &ResponseHead) -> Result<()> {
    sender.send_message(response.encode().as_bytes(), true, false)?;
    Ok(())
}
