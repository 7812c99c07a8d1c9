//! Per-stream lifecycle: registration, the capture pipeline task and
//! termination.

pub mod pipeline;
#[cfg(test)]
pub(crate) mod testing;

use crate::audio_sink::AudioSink;
use crate::audio_source::AudioSource;
use crate::events::{ClientEvent, TerminationReason};
use intercom_protocol::{AudioFormat, JsonConnection};
use pipeline::{CapturePipeline, PipelineExit};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State of a registered stream. A requested stream exists only as a
/// pending `start_audio`; a terminated one is no longer registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamState {
    Active,
    /// `stop_audio` sent, waiting for the hub
    Stopping,
}

/// Point-in-time view of a registered stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub format: AudioFormat,
    pub state: StreamState,
    pub frames_sent: u64,
}

struct StreamEntry {
    format: AudioFormat,
    render: Arc<dyn AudioSink>,
    frames_sent: Arc<AtomicU64>,
    state: StreamState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Distinguishes a stream from a later one reusing its id
    instance: u64,
}

impl StreamEntry {
    /// True for any instance when `instance` is None
    fn is_instance(&self, instance: Option<u64>) -> bool {
        instance.is_none() || instance == Some(self.instance)
    }
}

/// Live streams keyed by hub-assigned id
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
    next_instance: Arc<AtomicU64>,
    events: broadcast::Sender<ClientEvent>,
}

impl StreamRegistry {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_instance: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.streams().contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams().is_empty()
    }

    pub fn state(&self, stream_id: &str) -> Option<StreamState> {
        self.streams().get(stream_id).map(|entry| entry.state)
    }

    /// Register a stream and spawn its capture pipeline.
    ///
    /// Returns false without touching the capabilities if the id is already
    /// registered.
    pub fn activate(
        &self,
        connection: Arc<JsonConnection>,
        stream_id: &str,
        format: AudioFormat,
        source: Box<dyn AudioSource>,
        render: Arc<dyn AudioSink>,
    ) -> bool {
        let mut streams = self.streams();
        if streams.contains_key(stream_id) {
            log::warn!("⚠️  Stream {} is already active, keeping the existing one", stream_id);
            return false;
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let frames_sent = Arc::new(AtomicU64::new(0));
        let pipeline = CapturePipeline {
            stream_id: stream_id.to_string(),
            format: format.clone(),
            connection,
            source,
            render: Arc::clone(&render),
            frames_sent: Arc::clone(&frames_sent),
            cancel: cancel.clone(),
        };

        // The task cannot reach the map before this guard is released
        let registry = self.clone();
        let id = stream_id.to_string();
        let task = tokio::spawn(async move {
            let exit = pipeline.run().await;
            registry.pipeline_finished(&id, instance, exit);
        });

        streams.insert(
            stream_id.to_string(),
            StreamEntry {
                format: format.clone(),
                render,
                frames_sent,
                state: StreamState::Active,
                cancel,
                task: Some(task),
                instance,
            },
        );
        drop(streams);

        log::info!(
            "🎧 Stream {} active ({}, {} Hz, {} ch)",
            stream_id,
            format.encoding,
            format.sample_rate,
            format.channels
        );
        self.emit(ClientEvent::StreamStarted {
            stream_id: stream_id.to_string(),
            format,
        });
        true
    }

    pub fn instance_of(&self, stream_id: &str) -> Option<u64> {
        self.streams().get(stream_id).map(|entry| entry.instance)
    }

    /// Active → Stopping. Returns the instance that changed state, or None
    /// for unknown or already stopping streams.
    pub fn mark_stopping(&self, stream_id: &str) -> Option<u64> {
        let transitioned = match self.streams().get_mut(stream_id) {
            Some(entry) if entry.state == StreamState::Active => {
                entry.state = StreamState::Stopping;
                Some(entry.instance)
            }
            _ => None,
        };
        if transitioned.is_some() {
            self.emit(ClientEvent::StreamStopping {
                stream_id: stream_id.to_string(),
            });
        }
        transitioned
    }

    /// Stopping → Active, after a failed or expired stop request.
    ///
    /// With `Some(instance)` only that instance of the stream is touched.
    pub fn revert_active(&self, stream_id: &str, instance: Option<u64>) -> bool {
        match self.streams().get_mut(stream_id) {
            Some(entry)
                if entry.state == StreamState::Stopping && entry.is_instance(instance) =>
            {
                entry.state = StreamState::Active;
                log::info!("↩️  Stream {} is active again", stream_id);
                true
            }
            _ => false,
        }
    }

    /// Render capability of a registered stream
    pub fn render_for(&self, stream_id: &str) -> Option<Arc<dyn AudioSink>> {
        self.streams()
            .get(stream_id)
            .map(|entry| Arc::clone(&entry.render))
    }

    pub fn snapshots(&self) -> Vec<StreamSnapshot> {
        let mut snapshots: Vec<StreamSnapshot> = self
            .streams()
            .iter()
            .map(|(stream_id, entry)| StreamSnapshot {
                stream_id: stream_id.clone(),
                format: entry.format.clone(),
                state: entry.state,
                frames_sent: entry.frames_sent.load(Ordering::Acquire),
            })
            .collect();
        snapshots.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        snapshots
    }

    /// Remove a stream, cancel its pipeline and wait for it to finish.
    ///
    /// Returns false if the stream was not registered.
    pub async fn terminate(&self, stream_id: &str, reason: TerminationReason) -> bool {
        self.terminate_instance(stream_id, None, reason).await
    }

    /// `terminate`, limited to one instance of the stream when `instance` is
    /// set. A later stream reusing the id is left running.
    pub async fn terminate_instance(
        &self,
        stream_id: &str,
        instance: Option<u64>,
        reason: TerminationReason,
    ) -> bool {
        let removed = {
            let mut streams = self.streams();
            let matches = streams
                .get(stream_id)
                .is_some_and(|entry| entry.is_instance(instance));
            if matches {
                streams.remove(stream_id)
            } else {
                None
            }
        };
        let Some(mut entry) = removed else {
            log::debug!("Stream {} is not registered, nothing to terminate", stream_id);
            return false;
        };

        entry.cancel.cancel();
        if let Some(task) = entry.task.take() {
            if let Err(e) = task.await {
                log::error!("❌ Pipeline for stream {} panicked: {}", stream_id, e);
                if let Err(e) = entry.render.stop().await {
                    log::warn!("⚠️  Failed to stop render for stream {}: {}", stream_id, e);
                }
            }
        }

        log::info!("🛑 Stream {} terminated ({})", stream_id, reason);
        self.emit(ClientEvent::StreamTerminated {
            stream_id: stream_id.to_string(),
            reason,
        });
        true
    }

    pub async fn terminate_all(&self, reason: TerminationReason) {
        let ids: Vec<String> = self.streams().keys().cloned().collect();
        for stream_id in ids {
            self.terminate(&stream_id, reason).await;
        }
    }

    /// Called by a pipeline task after its teardown
    fn pipeline_finished(&self, stream_id: &str, instance: u64, exit: PipelineExit) {
        let removed = {
            let mut streams = self.streams();
            let same_instance = streams
                .get(stream_id)
                .is_some_and(|entry| entry.instance == instance);
            if same_instance {
                streams.remove(stream_id)
            } else {
                None
            }
        };

        // Cancelled pipelines were already removed by `terminate`
        if removed.is_some() {
            match &exit {
                PipelineExit::Cancelled => {}
                PipelineExit::StartFailed(e) => {
                    log::error!("❌ Stream {} ended, audio failed to start: {}", stream_id, e)
                }
                PipelineExit::SendFailed(e) => {
                    log::warn!("⚠️  Stream {} ended, connection lost: {}", stream_id, e)
                }
            }
            self.emit(ClientEvent::StreamTerminated {
                stream_id: stream_id.to_string(),
                reason: TerminationReason::PipelineEnded,
            });
        }
    }
}
