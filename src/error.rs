use crate::config::ConfigError;
use intercom_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntercomError>;

/// Failures reported by capture and render capabilities
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Audio device not found: {0}")]
    NotFound(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Audio device not started")]
    NotStarted,

    #[error("Audio file error: {0}")]
    File(String),
}

impl From<cpal::DevicesError> for DeviceError {
    fn from(err: cpal::DevicesError) -> Self {
        DeviceError::NotFound(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for DeviceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        DeviceError::UnsupportedFormat(err.to_string())
    }
}

impl From<hound::Error> for DeviceError {
    fn from(err: hound::Error) -> Self {
        DeviceError::File(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IntercomError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed by hub")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("No connection open")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for IntercomError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Connect { .. } => IntercomError::Connection(err.to_string()),
            err if err.is_closed() => IntercomError::ConnectionClosed,
            err => IntercomError::Protocol(err),
        }
    }
}

impl IntercomError {
    /// Transport failures end the session but a reconnect may succeed
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IntercomError::Connection(_) | IntercomError::ConnectionClosed | IntercomError::Io(_)
        )
    }
}
