use crate::audio_sink::SinkFactory;
use crate::audio_source::SourceFactory;
use crate::config::ClientConfig;
use crate::correlator::{CommandCorrelator, CommandName, PendingCommand};
use crate::error::{IntercomError, Result};
use crate::events::{ClientEvent, TerminationReason};
use crate::streams::{StreamRegistry, StreamSnapshot};
use intercom_protocol::{AudioFormat, AudioFrame, Direction, JsonConnection, Message, ProtocolError};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

/// What the dispatch loop should do after handling a message
enum Flow {
    Continue,
    Close,
}

/// Intercom client endpoint.
///
/// Holds at most one hub connection at a time. `run` drives a whole session
/// and can be called again after it returns, unless `shutdown` was called.
pub struct IntercomClient {
    config: ClientConfig,
    sources: Arc<dyn SourceFactory>,
    sinks: Arc<dyn SinkFactory>,
    connection: Mutex<Option<Arc<JsonConnection>>>,
    correlator: CommandCorrelator,
    registry: StreamRegistry,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl IntercomClient {
    pub fn new(
        config: ClientConfig,
        sources: impl SourceFactory + 'static,
        sinks: impl SinkFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            registry: StreamRegistry::new(events.clone()),
            config,
            sources: Arc::new(sources),
            sinks: Arc::new(sinks),
            connection: Mutex::new(None),
            correlator: CommandCorrelator::new(),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn active_streams(&self) -> Vec<StreamSnapshot> {
        self.registry.snapshots()
    }

    pub fn pending_commands(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection().is_ok()
    }

    /// Make `run` return after cleaning up. Later calls to `run` return at once.
    pub fn shutdown(&self) {
        log::info!("🛑 Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `shutdown` has been called
    pub async fn shut_down(&self) {
        self.shutdown.cancelled().await
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn connection_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<JsonConnection>>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_connection(&self) -> Result<Arc<JsonConnection>> {
        match self.connection_slot().as_ref() {
            Some(connection) if !connection.is_closed() => Ok(Arc::clone(connection)),
            _ => Err(IntercomError::NotConnected),
        }
    }

    /// Connect to the configured hub and run one session until it ends
    pub async fn run(&self) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }

        let connect =
            JsonConnection::connect(&self.config.hub_address, self.config.connect_timeout);
        let connection = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            connection = connect => connection?,
        };
        self.run_on(connection).await
    }

    /// Run one session over an already established connection
    pub async fn run_on(&self, connection: JsonConnection) -> Result<()> {
        let connection = Arc::new(connection);
        *self.connection_slot() = Some(Arc::clone(&connection));

        let result = self.session(&connection).await;
        self.teardown(&connection).await;

        match &result {
            Ok(()) => log::info!("👋 Session with {} ended", connection.peer()),
            Err(e) => log::error!("❌ Session with {} failed: {}", connection.peer(), e),
        }
        self.emit(ClientEvent::Closed {
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn session(&self, connection: &Arc<JsonConnection>) -> Result<()> {
        connection
            .send(&Message::Register {
                role: self.config.role.clone(),
                client_id: self.config.client_id.clone(),
            })
            .await?;
        log::info!(
            "📝 Registered as {} ({})",
            self.config.client_id,
            self.config.role
        );
        self.emit(ClientEvent::Registered {
            client_id: self.config.client_id.clone(),
        });

        if self.config.auto_start {
            self.request_start_audio(self.config.requested_stream_id.as_deref())
                .await?;
        }

        self.dispatch(connection).await
    }

    async fn dispatch(&self, connection: &Arc<JsonConnection>) -> Result<()> {
        let command_timeout = self.config.command_timeout;
        let mut expiry = command_timeout
            .map(|timeout| tokio::time::interval((timeout / 2).max(Duration::from_millis(10))));

        // Reading is not cancel safe; the same future survives expiry ticks
        let mut receive = Box::pin(connection.receive());

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tick(expiry.as_mut()) => {
                    if let Some(timeout) = command_timeout {
                        self.expire_commands(timeout);
                    }
                    continue;
                }
                received = &mut receive => received,
            };
            receive.set(connection.receive());

            let object = match received {
                Ok(object) => object,
                Err(e) if is_fatal(&e) => return Err(e.into()),
                Err(e) => {
                    log::warn!("⚠️  Dropping unreadable line: {}", e);
                    continue;
                }
            };

            let message = match Message::from_object(object) {
                Ok(message) => message,
                Err(ProtocolError::UnknownType(kind)) => {
                    log::debug!("Ignoring message of unknown type '{}'", kind);
                    continue;
                }
                Err(e) => {
                    log::warn!("⚠️  Skipping invalid message: {}", e);
                    continue;
                }
            };

            if let Flow::Close = self.handle_message(connection, message).await {
                log::info!("🔌 Hub closed the session");
                return Ok(());
            }
        }
    }

    async fn handle_message(&self, connection: &Arc<JsonConnection>, message: Message) -> Flow {
        match message {
            Message::CommandAck { command_id } => {
                self.correlator.acknowledge(&command_id);
                self.emit(ClientEvent::CommandAcknowledged { command_id });
            }
            Message::Response {
                command_id,
                status,
                payload,
            } => self.handle_response(connection, &command_id, status, payload).await,
            Message::Event { event, fields } => {
                log::info!("📣 Hub event: {}", event);
                self.emit(ClientEvent::HubEvent { event, fields });
            }
            Message::AudioFrame(frame) => self.handle_audio_frame(frame).await,
            Message::Error { details, message } => self.handle_hub_error(details, message).await,
            Message::Close => return Flow::Close,
            other => log::debug!("Ignoring unexpected '{}' from hub", other.kind()),
        }
        Flow::Continue
    }

    async fn handle_response(
        &self,
        connection: &Arc<JsonConnection>,
        command_id: &str,
        status: String,
        payload: Map<String, Value>,
    ) {
        let Some(pending) = self.correlator.resolve(command_id) else {
            return;
        };

        if status != "ok" {
            log::warn!(
                "⚠️  Command {} ({}) failed with status '{}'",
                pending.command,
                command_id,
                status
            );
            if pending.is(CommandName::StopAudio) {
                if let Some(stream_id) = response_stream_id(&payload, &pending) {
                    self.registry.revert_active(stream_id, pending.stream_instance);
                }
            }
            self.emit(ClientEvent::CommandFailed {
                command_id: command_id.to_string(),
                command: pending.command,
                status,
                payload,
            });
            return;
        }

        match pending.command.parse::<CommandName>() {
            Ok(CommandName::StartAudio) => self.activate_stream(connection, &payload).await,
            Ok(CommandName::StopAudio) => match response_stream_id(&payload, &pending) {
                Some(stream_id) => {
                    // A stream restarted under the same id is not this stop's target
                    self.registry
                        .terminate_instance(
                            stream_id,
                            pending.stream_instance,
                            TerminationReason::Stopped,
                        )
                        .await;
                }
                None => log::warn!("⚠️  Stop response {} names no stream", command_id),
            },
            Err(_) => log::debug!("Response for unhandled command {}", pending.command),
        }
    }

    async fn activate_stream(
        &self,
        connection: &Arc<JsonConnection>,
        payload: &Map<String, Value>,
    ) {
        let Some(stream_id) = payload.get("stream_id").and_then(Value::as_str) else {
            log::warn!("⚠️  start_audio response carries no stream_id, no stream created");
            return;
        };
        if self.registry.contains(stream_id) {
            log::warn!("⚠️  Stream {} is already active, ignoring start response", stream_id);
            return;
        }

        let format = negotiated_format(&self.config.preferred_format, payload);
        if let Err(e) = format.frame_bytes() {
            self.fail_stream(connection, stream_id, e.to_string()).await;
            return;
        }

        let source = match self.sources.create(&format) {
            Ok(source) => source,
            Err(e) => return self.fail_stream(connection, stream_id, e.to_string()).await,
        };
        let render = match self.sinks.create(&format) {
            Ok(render) => render,
            Err(e) => return self.fail_stream(connection, stream_id, e.to_string()).await,
        };

        self.registry
            .activate(Arc::clone(connection), stream_id, format, source, render);
    }

    /// Report a stream the hub accepted but we cannot serve, and release it
    async fn fail_stream(&self, connection: &JsonConnection, stream_id: &str, error: String) {
        log::error!("❌ Cannot set up audio for stream {}: {}", stream_id, error);
        self.emit(ClientEvent::StreamFailed {
            stream_id: stream_id.to_string(),
            error,
        });

        let mut payload = Map::new();
        payload.insert("stream_id".to_string(), json!(stream_id));
        if let Err(e) = self
            .correlator
            .send_command(connection, CommandName::StopAudio, payload)
            .await
        {
            log::warn!("⚠️  Could not release stream {}: {}", stream_id, e);
        }
    }

    async fn handle_audio_frame(&self, frame: AudioFrame) {
        if frame.direction != Direction::HubToClient {
            log::debug!("Dropping {:?} frame for {}", frame.direction, frame.stream_id);
            return;
        }
        let Some(render) = self.registry.render_for(&frame.stream_id) else {
            log::debug!("Dropping frame for unknown stream {}", frame.stream_id);
            return;
        };

        match frame.decode_data() {
            Ok(pcm) => {
                if let Err(e) = render.play(&pcm).await {
                    log::warn!("⚠️  Render failed on stream {}: {}", frame.stream_id, e);
                }
            }
            Err(e) => log::warn!("⚠️  Bad audio data on stream {}: {}", frame.stream_id, e),
        }
    }

    async fn handle_hub_error(&self, details: Map<String, Value>, message: Option<String>) {
        log::warn!(
            "⚠️  Hub error: {} {:?}",
            message.as_deref().unwrap_or("(no message)"),
            details
        );
        if let Some(stream_id) = details.get("stream_id").and_then(Value::as_str) {
            self.registry
                .terminate(stream_id, TerminationReason::HubError)
                .await;
        }
        self.emit(ClientEvent::HubError { details, message });
    }

    fn expire_commands(&self, timeout: Duration) {
        for expired in self.correlator.expire(timeout) {
            log::warn!(
                "⏰ Command {} ({}) got no response within {:?}",
                expired.command,
                expired.command_id,
                timeout
            );
            if expired.is(CommandName::StopAudio) {
                if let Some(stream_id) = expired.stream_id() {
                    self.registry.revert_active(stream_id, expired.stream_instance);
                }
            }
            self.emit(ClientEvent::CommandExpired {
                command_id: expired.command_id,
                command: expired.command,
            });
        }
    }

    /// Ask the hub for a stream. Returns the command id without waiting.
    pub async fn request_start_audio(&self, stream_id: Option<&str>) -> Result<String> {
        let connection = self.current_connection()?;
        let format = &self.config.preferred_format;

        let mut payload = Map::new();
        payload.insert("encoding".to_string(), json!(format.encoding));
        payload.insert("sample_rate".to_string(), json!(format.sample_rate));
        payload.insert("channels".to_string(), json!(format.channels));
        if let Some(stream_id) = stream_id {
            payload.insert("stream_id".to_string(), json!(stream_id));
        }

        let command_id = self
            .correlator
            .send_command(&connection, CommandName::StartAudio, payload)
            .await?;
        log::info!(
            "▶️  Requested audio stream{} ({})",
            stream_id.map(|id| format!(" {}", id)).unwrap_or_default(),
            command_id
        );
        Ok(command_id)
    }

    /// Ask the hub to stop a stream. Returns the command id without waiting.
    ///
    /// The command is sent even for streams that are not active locally.
    pub async fn request_stop_audio(&self, stream_id: &str) -> Result<String> {
        let connection = self.current_connection()?;
        let stopping = self.registry.mark_stopping(stream_id);
        if stopping.is_none() {
            log::debug!("Stream {} is not active locally, asking the hub anyway", stream_id);
        }
        let instance = stopping.or_else(|| self.registry.instance_of(stream_id));

        let mut payload = Map::new();
        payload.insert("stream_id".to_string(), json!(stream_id));

        match self
            .correlator
            .send_stream_command(&connection, CommandName::StopAudio, payload, instance)
            .await
        {
            Ok(command_id) => {
                log::info!("⏹️  Requested stop of stream {} ({})", stream_id, command_id);
                Ok(command_id)
            }
            Err(e) => {
                if stopping.is_some() {
                    self.registry.revert_active(stream_id, stopping);
                }
                Err(e.into())
            }
        }
    }

    async fn teardown(&self, connection: &Arc<JsonConnection>) {
        self.registry
            .terminate_all(TerminationReason::Shutdown)
            .await;
        self.correlator.clear();
        {
            let mut slot = self.connection_slot();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connection)) {
                *slot = None;
            }
        }
        connection.close().await;
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Errors after which the byte stream cannot be trusted
fn is_fatal(error: &ProtocolError) -> bool {
    match error {
        ProtocolError::Io(e) => e.kind() != std::io::ErrorKind::InvalidData,
        other => other.is_closed(),
    }
}

fn response_stream_id<'a>(
    payload: &'a Map<String, Value>,
    pending: &'a PendingCommand,
) -> Option<&'a str> {
    payload
        .get("stream_id")
        .and_then(Value::as_str)
        .or_else(|| pending.stream_id())
}

/// Format granted by the hub, falling back to the preferred one per field
fn negotiated_format(preferred: &AudioFormat, payload: &Map<String, Value>) -> AudioFormat {
    AudioFormat {
        encoding: payload
            .get("encoding")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| preferred.encoding.clone()),
        sample_rate: payload
            .get("sample_rate")
            .and_then(Value::as_u64)
            .and_then(|rate| u32::try_from(rate).ok())
            .unwrap_or(preferred.sample_rate),
        channels: payload
            .get("channels")
            .and_then(Value::as_u64)
            .and_then(|channels| u16::try_from(channels).ok())
            .unwrap_or(preferred.channels),
        frame_ms: preferred.frame_ms,
    }
}
