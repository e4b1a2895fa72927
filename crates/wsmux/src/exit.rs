use std::fmt;
use std::io;

use wsmux_engine::MuxError;
use wsmux_frame::WireError;
use wsmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Closed | TransportError::Truncated => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Transport(err) => transport_error(context, err),
        MuxError::Wire(err) => wire_error(context, err),
        MuxError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        MuxError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        MuxError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        MuxError::Spawn { .. } => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wsmux_frame::DropCode;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = io_error("read", io::Error::new(io::ErrorKind::WouldBlock, "slow"));
        assert_eq!(err.code, TIMEOUT);
        assert_eq!(mux_error("join", MuxError::Timeout(Duration::from_secs(1))).code, TIMEOUT);
    }

    #[test]
    fn protocol_errors_are_invalid_data() {
        let err = mux_error(
            "check",
            MuxError::Wire(WireError::physical(DropCode::UnknownMuxOpcode, "opcode 6")),
        );
        assert_eq!(err.code, DATA_INVALID);
        assert!(err.message.starts_with("check: "));
    }

    #[test]
    fn config_errors_are_usage_errors() {
        let err = mux_error("config", MuxError::InvalidConfig("bad".to_string()));
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn closed_connection_is_a_plain_failure() {
        let err = mux_error("check", MuxError::Transport(TransportError::Closed));
        assert_eq!(err.code, FAILURE);
        let err = transport_error(
            "read",
            TransportError::MessageTooLarge { size: 10, max: 5 },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }
}
