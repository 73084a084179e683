//! Control-channel message kinds and their payloads.
//!
//! A frame body is `[PAYLOAD_VERSION] ++ bincode(payload)`. The outer frame
//! codec never looks inside the body; only the type code is validated there.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::tether::tunnel::frame::Frame;

pub const PAYLOAD_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum MessageType {
    Auth = 1,
    AuthAck = 2,
    Heartbeat = 3,
    HeartbeatAck = 4,
    OpenDataPort = 5,
    OpenDataPortAck = 6,
    OpenDataConn = 7,
    OpenDataConnAck = 8,
}

impl MessageType {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            1 => Self::Auth,
            2 => Self::AuthAck,
            3 => Self::Heartbeat,
            4 => Self::HeartbeatAck,
            5 => Self::OpenDataPort,
            6 => Self::OpenDataPortAck,
            7 => Self::OpenDataConn,
            8 => Self::OpenDataConnAck,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::AuthAck => "AUTH_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::OpenDataPort => "OPEN_DATA_PORT",
            Self::OpenDataPortAck => "OPEN_DATA_PORT_ACK",
            Self::OpenDataConn => "OPEN_DATA_CONN",
            Self::OpenDataConnAck => "OPEN_DATA_CONN_ACK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("empty payload")]
    Empty,
    #[error("unsupported payload version: {0}")]
    Version(u8),
    #[error("payload: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Echo of the heartbeat's timestamp.
    pub timestamp_ms: u64,
    pub server_time_ms: u64,
}

/// Provisioning request. `encrypted` is a sealed [`DataPortRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataPort {
    pub encrypted: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataPortAck {
    pub success: bool,
    pub message: String,
    /// Heartbeat cadence the client is expected to use.
    pub heartbeat_delay_ms: u64,
    /// Port the data proxy actually bound (0 on failure).
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataConn {
    pub session_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataConnAck {
    pub session_id: u32,
    pub success: bool,
}

/// Plaintext inside [`OpenDataPort::encrypted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPortRequest {
    pub secret: String,
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth(Auth),
    AuthAck(AuthAck),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    OpenDataPort(OpenDataPort),
    OpenDataPortAck(OpenDataPortAck),
    OpenDataConn(OpenDataConn),
    OpenDataConnAck(OpenDataConnAck),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Auth(_) => MessageType::Auth,
            Message::AuthAck(_) => MessageType::AuthAck,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Message::OpenDataPort(_) => MessageType::OpenDataPort,
            Message::OpenDataPortAck(_) => MessageType::OpenDataPortAck,
            Message::OpenDataConn(_) => MessageType::OpenDataConn,
            Message::OpenDataConnAck(_) => MessageType::OpenDataConnAck,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, MessageError> {
        let body = match self {
            Message::Auth(p) => encode_payload(p)?,
            Message::AuthAck(p) => encode_payload(p)?,
            Message::Heartbeat(p) => encode_payload(p)?,
            Message::HeartbeatAck(p) => encode_payload(p)?,
            Message::OpenDataPort(p) => encode_payload(p)?,
            Message::OpenDataPortAck(p) => encode_payload(p)?,
            Message::OpenDataConn(p) => encode_payload(p)?,
            Message::OpenDataConnAck(p) => encode_payload(p)?,
        };
        Ok(Frame::new(self.kind(), body))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let body = &frame.body[..];
        Ok(match frame.kind {
            MessageType::Auth => Message::Auth(decode_payload(body)?),
            MessageType::AuthAck => Message::AuthAck(decode_payload(body)?),
            MessageType::Heartbeat => Message::Heartbeat(decode_payload(body)?),
            MessageType::HeartbeatAck => Message::HeartbeatAck(decode_payload(body)?),
            MessageType::OpenDataPort => Message::OpenDataPort(decode_payload(body)?),
            MessageType::OpenDataPortAck => Message::OpenDataPortAck(decode_payload(body)?),
            MessageType::OpenDataConn => Message::OpenDataConn(decode_payload(body)?),
            MessageType::OpenDataConnAck => Message::OpenDataConnAck(decode_payload(body)?),
        })
    }
}

pub(crate) fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, MessageError> {
    let mut body = Vec::with_capacity(32);
    body.push(PAYLOAD_VERSION);
    bincode::serialize_into(&mut body, payload)?;
    Ok(body)
}

pub(crate) fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, MessageError> {
    let (&version, payload) = body.split_first().ok_or(MessageError::Empty)?;
    if version != PAYLOAD_VERSION {
        return Err(MessageError::Version(version));
    }
    Ok(bincode::deserialize(payload)?)
}
