use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// The only PCM encoding the hub negotiates today.
pub const PCM_S16LE: &str = "pcm_s16le";

/// Role announced in the `register` message.
pub const HOME_ASSISTANT_ROLE: &str = "home_assistant";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Message has no type field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid '{kind}' message: {reason}")]
    InvalidMessage { kind: String, reason: String },

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("Invalid audio data: {0}")]
    InvalidAudioData(#[from] base64::DecodeError),
}

impl ProtocolError {
    /// True when the peer went away rather than sending something bad.
    pub fn is_closed(&self) -> bool {
        match self {
            ProtocolError::Closed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Raw PCM layout of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration of one frame in milliseconds. Never negotiated with the hub.
    pub frame_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: PCM_S16LE.to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_ms: 40,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> Result<usize, ProtocolError> {
        match self.encoding.as_str() {
            PCM_S16LE => Ok(2),
            other => Err(ProtocolError::UnsupportedEncoding(other.to_string())),
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }

    /// Size in bytes of one frame. Always positive and even when `Ok`.
    pub fn frame_bytes(&self) -> Result<usize, ProtocolError> {
        let bytes_per_sample = self.bytes_per_sample()?;
        let bytes = self.samples_per_frame() * self.channels as usize * bytes_per_sample;
        if bytes == 0 || bytes % 2 != 0 {
            return Err(ProtocolError::InvalidFormat(format!(
                "{} Hz, {} channel(s), {} ms gives a {} byte frame",
                self.sample_rate, self.channels, self.frame_ms, bytes
            )));
        }
        Ok(bytes)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToHub,
    HubToClient,
}

/// One `audio_frame` message. `data` holds base64 encoded PCM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub stream_id: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u16,
    pub direction: Direction,
    pub data: String,
}

fn default_encoding() -> String {
    PCM_S16LE.to_string()
}

impl AudioFrame {
    pub fn encode(
        stream_id: &str,
        sequence: u64,
        format: &AudioFormat,
        direction: Direction,
        pcm: &[u8],
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            sequence,
            encoding: format.encoding.clone(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            direction,
            data: BASE64.encode(pcm),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(self.data.as_bytes())?)
    }
}

/// Every message type of the hub protocol, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Client → Hub
    Register {
        role: String,
        client_id: String,
    },
    Command {
        command: String,
        command_id: String,
        #[serde(default, deserialize_with = "object_or_empty")]
        payload: Map<String, Value>,
    },

    // Hub → Client
    CommandAck {
        command_id: String,
    },
    Response {
        command_id: String,
        #[serde(default)]
        status: String,
        #[serde(default, deserialize_with = "object_or_empty")]
        payload: Map<String, Value>,
    },
    Event {
        event: String,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    Error {
        #[serde(default, deserialize_with = "object_or_empty")]
        details: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Close,

    // Both directions
    AudioFrame(AudioFrame),
}

impl Message {
    pub const KNOWN_TYPES: [&'static str; 8] = [
        "register",
        "command",
        "command_ack",
        "response",
        "event",
        "error",
        "close",
        "audio_frame",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Command { .. } => "command",
            Message::CommandAck { .. } => "command_ack",
            Message::Response { .. } => "response",
            Message::Event { .. } => "event",
            Message::Error { .. } => "error",
            Message::Close => "close",
            Message::AudioFrame(_) => "audio_frame",
        }
    }

    /// Classify a received JSON object.
    ///
    /// Unknown types come back as `ProtocolError::UnknownType` so callers can
    /// ignore them without treating them as malformed.
    pub fn from_object(object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        if !Self::KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(Value::Object(object)).map_err(|e| ProtocolError::InvalidMessage {
            kind,
            reason: e.to_string(),
        })
    }

    pub fn to_object(&self) -> Result<Map<String, Value>, ProtocolError> {
        match serde_json::to_value(self)? {
            Value::Object(object) => Ok(object),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    pub fn is_ok_response(&self) -> bool {
        matches!(self, Message::Response { status, .. } if status == "ok")
    }
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}
