//! Opening-handshake validation for logical channels.

use wsmux_frame::{ChannelId, Headers, RequestHead};

use crate::config::HandshakeConfig;

/// The opening handshake of one logical channel, after delta resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRequest {
    pub channel_id: ChannelId,
    pub method: String,
    pub path: String,
    pub headers: Headers,
}

impl LogicalRequest {
    pub fn from_head(channel_id: ChannelId, head: RequestHead) -> Self {
        Self {
            channel_id,
            method: head.method,
            path: head.path,
            headers: head.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Outcome of validating an opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeDecision {
    pub accept: bool,
    /// Headers added to the 101 response when accepted.
    pub response_headers: Headers,
    /// HTTP status sent back when rejected.
    pub status: u16,
}

impl HandshakeDecision {
    pub fn accept() -> Self {
        Self::accept_with_headers(Headers::new())
    }

    pub fn accept_with_headers(response_headers: Headers) -> Self {
        Self {
            accept: true,
            response_headers,
            status: 101,
        }
    }

    pub fn reject(status: u16) -> Self {
        Self {
            accept: false,
            response_headers: Headers::new(),
            status,
        }
    }
}

/// Decides whether a logical channel may open.
///
/// Called on the reader thread, so it should return promptly.
pub trait HandshakeValidator: Send + Sync {
    fn validate(&self, request: &LogicalRequest) -> HandshakeDecision;
}

impl<F> HandshakeValidator for F
where
    F: Fn(&LogicalRequest) -> HandshakeDecision + Send + Sync,
{
    fn validate(&self, request: &LogicalRequest) -> HandshakeDecision {
        self(request)
    }
}

/// Method, path, origin and subprotocol checks driven by [`HandshakeConfig`].
#[derive(Debug, Clone, Default)]
pub struct StandardValidator {
    config: HandshakeConfig,
}

impl StandardValidator {
    pub fn new(config: HandshakeConfig) -> Self {
        Self { config }
    }
}

impl HandshakeValidator for StandardValidator {
    fn validate(&self, request: &LogicalRequest) -> HandshakeDecision {
        if request.method != "GET" {
            return HandshakeDecision::reject(400);
        }
        if !self.config.allowed_paths.is_empty()
            && !self.config.allowed_paths.iter().any(|p| *p == request.path)
        {
            return HandshakeDecision::reject(404);
        }
        if !self.config.allowed_origins.is_empty() {
            let allowed = request
                .header("Origin")
                .is_some_and(|origin| self.config.allowed_origins.iter().any(|o| o == origin));
            if !allowed {
                return HandshakeDecision::reject(403);
            }
        }

        let mut response_headers = Headers::new();
        if let Some(offered) = request.header("Sec-WebSocket-Protocol") {
            let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
            if let Some(selected) = self
                .config
                .subprotocols
                .iter()
                .find(|ours| offered.contains(&ours.as_str()))
            {
                response_headers.append("Sec-WebSocket-Protocol", selected.as_str());
            }
        }
        HandshakeDecision::accept_with_headers(response_headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str, headers: &[(&str, &str)]) -> LogicalRequest {
        LogicalRequest {
            channel_id: 3,
            method: method.to_string(),
            path: path.to_string(),
            headers: headers.iter().copied().collect(),
        }
    }

    #[test]
    fn default_validator_accepts_any_get() {
        let validator = StandardValidator::default();
        let decision = validator.validate(&request("GET", "/anything", &[]));
        assert!(decision.accept);
        assert!(decision.response_headers.is_empty());
        assert_eq!(validator.validate(&request("POST", "/", &[])).status, 400);
    }

    #[test]
    fn path_and_origin_allowlists() {
        let validator = StandardValidator::new(HandshakeConfig {
            allowed_paths: vec!["/chat".to_string()],
            allowed_origins: vec!["https://ok.example".to_string()],
            subprotocols: Vec::new(),
        });

        let missing_path = validator.validate(&request("GET", "/other", &[]));
        assert_eq!((missing_path.accept, missing_path.status), (false, 404));

        let no_origin = validator.validate(&request("GET", "/chat", &[]));
        assert_eq!(no_origin.status, 403);

        let bad_origin =
            validator.validate(&request("GET", "/chat", &[("Origin", "https://evil.example")]));
        assert_eq!(bad_origin.status, 403);

        let good = validator.validate(&request("GET", "/chat", &[("origin", "https://ok.example")]));
        assert!(good.accept);
    }

    #[test]
    fn selects_first_supported_subprotocol() {
        let validator = StandardValidator::new(HandshakeConfig {
            subprotocols: vec!["v2.chat".to_string(), "v1.chat".to_string()],
            ..HandshakeConfig::default()
        });
        let decision = validator.validate(&request(
            "GET",
            "/",
            &[("Sec-WebSocket-Protocol", "v1.chat, v2.chat")],
        ));
        assert_eq!(
            decision.response_headers.get("sec-websocket-protocol"),
            Some("v2.chat")
        );

        let none = validator.validate(&request("GET", "/", &[("Sec-WebSocket-Protocol", "mqtt")]));
        assert!(none.accept);
        assert!(none.response_headers.is_empty());
    }

    #[test]
    fn closures_are_validators() {
        let validator = |request: &LogicalRequest| {
            if request.path == "/private" {
                HandshakeDecision::reject(403)
            } else {
                HandshakeDecision::accept()
            }
        };
        assert!(validator.validate(&request("GET", "/", &[])).accept);
        assert!(!validator.validate(&request("GET", "/private", &[])).accept);
    }
}
