use std::fmt;

use crate::channel::{ChannelId, MAX_CHANNEL_ID};

/// Drop codes carried by DropChannel blocks.
///
/// Codes in the 2000 range fail the whole physical connection; codes in
/// the 3000 range are scoped to a single logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DropCode {
    NormalClosure = 1000,
    InvalidEncapsulatingMessage = 2001,
    ChannelIdTruncated = 2002,
    EncapsulatedFrameTruncated = 2003,
    UnknownMuxOpcode = 2004,
    InvalidMuxControlBlock = 2005,
    ChannelAlreadyExists = 2006,
    NewChannelSlotViolation = 2007,
    UnknownRequestEncoding = 2010,
    SendQuotaViolation = 3005,
    SendQuotaOverflow = 3006,
    Acknowledged = 3008,
    BadFragmentation = 3009,
}

impl DropCode {
    /// Numeric wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Look up a known code.
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::NormalClosure,
            2001 => Self::InvalidEncapsulatingMessage,
            2002 => Self::ChannelIdTruncated,
            2003 => Self::EncapsulatedFrameTruncated,
            2004 => Self::UnknownMuxOpcode,
            2005 => Self::InvalidMuxControlBlock,
            2006 => Self::ChannelAlreadyExists,
            2007 => Self::NewChannelSlotViolation,
            2010 => Self::UnknownRequestEncoding,
            3005 => Self::SendQuotaViolation,
            3006 => Self::SendQuotaOverflow,
            3008 => Self::Acknowledged,
            3009 => Self::BadFragmentation,
            _ => return None,
        })
    }

    /// Whether this code ends the physical connection.
    pub fn is_physical(self) -> bool {
        (2000..3000).contains(&self.as_u16())
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::NormalClosure => "normal closure",
            Self::InvalidEncapsulatingMessage => "invalid encapsulating message",
            Self::ChannelIdTruncated => "channel id truncated",
            Self::EncapsulatedFrameTruncated => "encapsulated frame truncated",
            Self::UnknownMuxOpcode => "unknown mux opcode",
            Self::InvalidMuxControlBlock => "invalid mux control block",
            Self::ChannelAlreadyExists => "channel already exists",
            Self::NewChannelSlotViolation => "new channel slot violation",
            Self::UnknownRequestEncoding => "unknown request encoding",
            Self::SendQuotaViolation => "send quota violation",
            Self::SendQuotaOverflow => "send quota overflow",
            Self::Acknowledged => "acknowledged",
            Self::BadFragmentation => "bad fragmentation",
        }
    }
}

impl fmt::Display for DropCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.description())
    }
}

/// Errors produced while encoding or decoding multiplexed payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("channel id {0} exceeds maximum {MAX_CHANNEL_ID}")]
    ChannelIdOutOfRange(u64),

    #[error("number {0} exceeds 63 bits")]
    NumberOutOfRange(u64),

    #[error("handshake too large to encode: {0} bytes")]
    HandshakeTooLarge(usize),

    /// Fatal for the whole physical connection.
    #[error("physical connection error {code}: {message}")]
    PhysicalConnection { code: DropCode, message: String },

    /// Scoped to one logical channel; the connection survives.
    #[error("logical channel {channel} error {code}: {message}")]
    LogicalChannel {
        channel: ChannelId,
        code: DropCode,
        message: String,
    },

    /// Frame sequence violates the inner fragmentation rules.
    #[error("invalid fragmentation: {0}")]
    InvalidFragmentation(&'static str),

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
}

impl WireError {
    pub fn physical(code: DropCode, message: impl Into<String>) -> Self {
        Self::PhysicalConnection {
            code,
            message: message.into(),
        }
    }

    pub fn logical(channel: ChannelId, code: DropCode, message: impl Into<String>) -> Self {
        Self::LogicalChannel {
            channel,
            code,
            message: message.into(),
        }
    }

    /// Drop code to report for this error, when it maps onto one.
    pub fn drop_code(&self) -> Option<DropCode> {
        match self {
            Self::PhysicalConnection { code, .. } | Self::LogicalChannel { code, .. } => {
                Some(*code)
            }
            Self::InvalidFragmentation(_) => Some(DropCode::BadFragmentation),
            _ => None,
        }
    }
}

/// Convenience alias for codec results.
pub type Result<T> = std::result::Result<T, WireError>;
