//! Protocol frame definitions
//!
//! A [`Frame`] is the atomic unit exchanged between nodes: a command tag, a
//! session id, and an opaque payload. What the payload means depends on the
//! command; only the login exchange carries a structured document.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BraidError;

/// Command discriminator
///
/// Using explicit u8 values for wire compatibility and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Handshake request from the connecting peer
    Login = 0x10,
    /// Handshake response; an error reply closes the channel
    LoginBack = 0x20,
    /// Resolve the remaining path expression on the receiver
    Dial = 0x30,
    /// Acknowledge a Dial: "OK" or an error string
    DialBack = 0x40,
    /// Opaque stream bytes forwarded along the session
    Data = 0x50,
    /// Half-close of one session
    Closed = 0x60,
    /// Keepalive; empty payload
    Heartbeat = 0x70,
}

impl Command {
    /// Command name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login => "Login",
            Command::LoginBack => "LoginBack",
            Command::Dial => "Dial",
            Command::DialBack => "DialBack",
            Command::Data => "Data",
            Command::Closed => "Closed",
            Command::Heartbeat => "Heartbeat",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = BraidError;

    fn try_from(value: u8) -> Result<Self, BraidError> {
        match value {
            0x10 => Ok(Command::Login),
            0x20 => Ok(Command::LoginBack),
            0x30 => Ok(Command::Dial),
            0x40 => Ok(Command::DialBack),
            0x50 => Ok(Command::Data),
            0x60 => Ok(Command::Closed),
            0x70 => Ok(Command::Heartbeat),
            _ => Err(BraidError::InvalidCommand(value)),
        }
    }
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command tag
    pub cmd: Command,
    /// Session id; zero on Login/LoginBack/Heartbeat
    pub sid: u64,
    /// Command-specific bytes, may be empty
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from parts
    pub fn new(cmd: Command, sid: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            sid,
            payload: payload.into(),
        }
    }

    /// Dial frame carrying the remaining path expression
    pub fn dial(sid: u64, path: &str) -> Self {
        Self::new(Command::Dial, sid, path.as_bytes().to_vec())
    }

    /// Successful DialBack
    pub fn dial_back_ok(sid: u64) -> Self {
        Self::new(Command::DialBack, sid, super::DIAL_BACK_OK.as_bytes())
    }

    /// Failed DialBack carrying an error message
    pub fn dial_back_err(sid: u64, message: &str) -> Self {
        Self::new(Command::DialBack, sid, message.as_bytes().to_vec())
    }

    /// Data frame with stream bytes
    pub fn data(sid: u64, bytes: impl Into<Bytes>) -> Self {
        Self::new(Command::Data, sid, bytes)
    }

    /// Half-close with an optional reason
    pub fn closed(sid: u64, reason: &str) -> Self {
        Self::new(Command::Closed, sid, reason.as_bytes().to_vec())
    }

    /// Empty keepalive frame
    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat, 0, Bytes::new())
    }

    /// Is this DialBack payload a success acknowledgement?
    pub fn is_dial_back_ok(&self) -> bool {
        self.payload.starts_with(super::DIAL_BACK_OK.as_bytes())
    }

    /// Payload interpreted as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encoded body length: command + sid + payload
    pub fn body_len(&self) -> usize {
        super::MIN_FRAME_LEN + self.payload.len()
    }
}

/// Login document sent by the connecting peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Claimed peer name, checked against the acceptor's ACL
    pub name: String,
    /// Shared token for that name
    pub token: String,
    /// Requested slot within the bond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl LoginRequest {
    pub fn new(name: impl Into<String>, token: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            index: Some(index),
        }
    }

    /// Encode into a Login frame
    pub fn to_frame(&self) -> Result<Frame, BraidError> {
        let doc = serde_json::to_vec(self)?;
        Ok(Frame::new(Command::Login, 0, doc))
    }

    /// Decode from a Login frame payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, BraidError> {
        serde_json::from_slice(payload)
            .map_err(|e| BraidError::MalformedPayload(format!("login document: {}", e)))
    }
}

/// Login response from the accepting peer
///
/// Carries the acceptor's name on success so the connecting side learns who
/// it is bonded to; an `error` reply means the channel is about to close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginReply {
    /// Successful reply announcing the acceptor's name
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            error: None,
        }
    }

    /// Rejection carrying an error message
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            name: None,
            error: Some(message.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Encode into a LoginBack frame
    pub fn to_frame(&self) -> Result<Frame, BraidError> {
        let doc = serde_json::to_vec(self)?;
        Ok(Frame::new(Command::LoginBack, 0, doc))
    }

    /// Decode from a LoginBack frame payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, BraidError> {
        serde_json::from_slice(payload)
            .map_err(|e| BraidError::MalformedPayload(format!("login reply: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let cmds = [
            Command::Login,
            Command::LoginBack,
            Command::Dial,
            Command::DialBack,
            Command::Data,
            Command::Closed,
            Command::Heartbeat,
        ];

        for cmd in cmds {
            let value = cmd as u8;
            let parsed = Command::try_from(value).unwrap();
            assert_eq!(cmd, parsed);
        }
    }

    #[test]
    fn test_invalid_command() {
        assert!(Command::try_from(0x00).is_err());
        assert!(Command::try_from(0xFF).is_err());
    }

    #[test]
    fn test_login_document_roundtrip() {
        let req = LoginRequest::new("slaver", "abc", 1);
        let frame = req.to_frame().unwrap();
        assert_eq!(frame.cmd, Command::Login);
        assert_eq!(frame.sid, 0);

        let parsed = LoginRequest::from_payload(&frame.payload).unwrap();
        assert_eq!(parsed.name, "slaver");
        assert_eq!(parsed.token, "abc");
        assert_eq!(parsed.index, Some(1));
    }

    #[test]
    fn test_login_reply_error() {
        let reply = LoginReply::err("auth failed");
        let frame = reply.to_frame().unwrap();
        let parsed = LoginReply::from_payload(&frame.payload).unwrap();
        assert!(parsed.is_err());
        assert_eq!(parsed.error.as_deref(), Some("auth failed"));
    }

    #[test]
    fn test_dial_back_ok_detection() {
        assert!(Frame::dial_back_ok(7).is_dial_back_ok());
        assert!(!Frame::dial_back_err(7, "no route").is_dial_back_ok());
    }

    #[test]
    fn test_malformed_login_payload() {
        assert!(LoginRequest::from_payload(b"not json").is_err());
    }
}
