use crate::audio_sink::AudioSink;
use crate::audio_source::AudioSource;
use crate::error::DeviceError;
use intercom_protocol::{AudioFormat, AudioFrame, Direction, JsonConnection, Message, ProtocolError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a capture pipeline stopped
#[derive(Debug)]
pub enum PipelineExit {
    Cancelled,
    StartFailed(DeviceError),
    SendFailed(ProtocolError),
}

/// Pumps captured frames to the hub at the stream's frame rate.
///
/// Owns the capture capability and shares the render capability with the
/// inbound dispatcher. Both are stopped exactly once when `run` returns.
pub struct CapturePipeline {
    pub stream_id: String,
    pub format: AudioFormat,
    pub connection: Arc<JsonConnection>,
    pub source: Box<dyn AudioSource>,
    pub render: Arc<dyn AudioSink>,
    /// Frames sent so far, which is also the next sequence number
    pub frames_sent: Arc<AtomicU64>,
    pub cancel: CancellationToken,
}

impl CapturePipeline {
    pub async fn run(mut self) -> PipelineExit {
        let exit = self.pump().await;
        self.teardown().await;
        exit
    }

    async fn pump(&mut self) -> PipelineExit {
        if let Err(e) = self.source.start().await {
            log::error!("❌ Failed to start capture for stream {}: {}", self.stream_id, e);
            return PipelineExit::StartFailed(e);
        }
        if let Err(e) = self.render.start().await {
            log::error!("❌ Failed to start render for stream {}: {}", self.stream_id, e);
            return PipelineExit::StartFailed(e);
        }

        let frame_duration = self.format.frame_duration();
        let mut sequence = self.frames_sent.load(Ordering::Acquire);
        log::info!(
            "🎙️  Stream {} pumping {} ms frames at {} Hz",
            self.stream_id,
            self.format.frame_ms,
            self.format.sample_rate
        );

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PipelineExit::Cancelled,
                read = self.source.read_frame() => read,
            };

            match read {
                Ok(frame) if frame.is_empty() => {}
                Ok(frame) => {
                    let message = Message::AudioFrame(AudioFrame::encode(
                        &self.stream_id,
                        sequence,
                        &self.format,
                        Direction::ClientToHub,
                        &frame,
                    ));
                    // A started write always completes so the line stays whole
                    if let Err(e) = self.connection.send(&message).await {
                        log::warn!(
                            "⚠️  Stream {} could not send frame {}: {}",
                            self.stream_id,
                            sequence,
                            e
                        );
                        return PipelineExit::SendFailed(e);
                    }
                    sequence += 1;
                    self.frames_sent.store(sequence, Ordering::Release);
                    log::trace!(
                        "Stream {} sent frame {} ({} bytes)",
                        self.stream_id,
                        sequence - 1,
                        frame.len()
                    );
                }
                Err(e) => {
                    log::warn!("⚠️  Capture read failed on stream {}: {}", self.stream_id, e);
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PipelineExit::Cancelled,
                _ = tokio::time::sleep(frame_duration) => {}
            }
        }
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.source.stop().await {
            log::warn!("⚠️  Failed to stop capture for stream {}: {}", self.stream_id, e);
        }
        if let Err(e) = self.render.stop().await {
            log::warn!("⚠️  Failed to stop render for stream {}: {}", self.stream_id, e);
        }
        log::debug!("Stream {} pipeline stopped", self.stream_id);
    }
}
