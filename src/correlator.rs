use intercom_protocol::{JsonConnection, Message, ProtocolError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display, EnumString};

/// Commands the client issues to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CommandName {
    StartAudio,
    StopAudio,
}

/// A command that has been sent and is waiting for its response
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: String,
    pub command: String,
    pub payload: Map<String, Value>,
    pub sent_at: Instant,
    /// Registry instance of the stream a `stop_audio` was issued for
    pub stream_instance: Option<u64>,
}

impl PendingCommand {
    pub fn is(&self, name: CommandName) -> bool {
        self.command == name.as_ref()
    }

    /// `stream_id` from the original request payload
    pub fn stream_id(&self) -> Option<&str> {
        self.payload.get("stream_id").and_then(Value::as_str)
    }
}

/// Matches responses to the commands that caused them
#[derive(Default)]
pub struct CommandCorrelator {
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a command and return its id without waiting for a response.
    ///
    /// The pending entry is recorded before the line is written; a response
    /// can arrive before `send` returns.
    pub async fn send_command(
        &self,
        connection: &JsonConnection,
        command: CommandName,
        payload: Map<String, Value>,
    ) -> Result<String, ProtocolError> {
        self.send_stream_command(connection, command, payload, None).await
    }

    /// Like `send_command`, remembering which instance of a stream the
    /// command targets
    pub async fn send_stream_command(
        &self,
        connection: &JsonConnection,
        command: CommandName,
        payload: Map<String, Value>,
        stream_instance: Option<u64>,
    ) -> Result<String, ProtocolError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let message = Message::Command {
            command: command.to_string(),
            command_id: command_id.clone(),
            payload: payload.clone(),
        };

        self.pending().insert(
            command_id.clone(),
            PendingCommand {
                command_id: command_id.clone(),
                command: command.to_string(),
                payload,
                sent_at: Instant::now(),
                stream_instance,
            },
        );

        if let Err(e) = connection.send(&message).await {
            self.pending().remove(&command_id);
            return Err(e);
        }

        log::debug!("📤 Sent command {} ({})", command, command_id);
        Ok(command_id)
    }

    pub fn acknowledge(&self, command_id: &str) {
        match self.pending().get(command_id) {
            Some(pending) => {
                log::debug!("📬 Hub acknowledged {} ({})", pending.command, command_id)
            }
            None => log::debug!("📬 Ack for unknown command {}", command_id),
        }
    }

    /// Remove and return the pending command with this id
    pub fn resolve(&self, command_id: &str) -> Option<PendingCommand> {
        let resolved = self.pending().remove(command_id);
        if resolved.is_none() {
            log::debug!("Ignoring response for unknown command {}", command_id);
        }
        resolved
    }

    pub fn contains(&self, command_id: &str) -> bool {
        self.pending().contains_key(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn clear(&self) {
        let mut pending = self.pending();
        if !pending.is_empty() {
            log::debug!("Dropping {} pending commands", pending.len());
        }
        pending.clear();
    }

    /// Remove commands that have waited longer than `max_age`
    pub fn expire(&self, max_age: Duration) -> Vec<PendingCommand> {
        let mut pending = self.pending();
        let expired_ids: Vec<String> = pending
            .values()
            .filter(|p| p.sent_at.elapsed() >= max_age)
            .map(|p| p.command_id.clone())
            .collect();

        expired_ids
            .iter()
            .filter_map(|id| pending.remove(id))
            .collect()
    }
}
