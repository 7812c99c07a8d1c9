use intercom_protocol::AudioFormat;
use serde_json::{Map, Value};

/// Observable client activity, delivered through `IntercomClient::subscribe`
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Registered {
        client_id: String,
    },
    CommandAcknowledged {
        command_id: String,
    },
    CommandFailed {
        command_id: String,
        command: String,
        status: String,
        payload: Map<String, Value>,
    },
    CommandExpired {
        command_id: String,
        command: String,
    },
    StreamStarted {
        stream_id: String,
        format: AudioFormat,
    },
    StreamStopping {
        stream_id: String,
    },
    StreamTerminated {
        stream_id: String,
        reason: TerminationReason,
    },
    /// The hub accepted a stream but local audio could not be set up
    StreamFailed {
        stream_id: String,
        error: String,
    },
    HubEvent {
        event: String,
        fields: Map<String, Value>,
    },
    HubError {
        details: Map<String, Value>,
        message: Option<String>,
    },
    /// The session ended; `error` is set when it ended on a transport failure
    Closed {
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TerminationReason {
    Stopped,
    HubError,
    PipelineEnded,
    Shutdown,
}
