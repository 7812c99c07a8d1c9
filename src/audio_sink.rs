use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SupportedStreamConfig};
use intercom_protocol::AudioFormat;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

/// Core trait for audio output handling
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    async fn start(&self) -> Result<(), DeviceError>;

    /// Stop audio playback and clear any buffered data
    async fn stop(&self) -> Result<(), DeviceError>;

    /// Play one frame of 16-bit PCM. Empty or odd-sized frames are discarded.
    async fn play(&self, frame: &[u8]) -> Result<(), DeviceError>;
}

/// Creates a render capability for a negotiated format
pub trait SinkFactory: Send + Sync {
    fn create(&self, format: &AudioFormat) -> Result<Arc<dyn AudioSink>, DeviceError>;
}

impl<F> SinkFactory for F
where
    F: Fn(&AudioFormat) -> Result<Arc<dyn AudioSink>, DeviceError> + Send + Sync,
{
    fn create(&self, format: &AudioFormat) -> Result<Arc<dyn AudioSink>, DeviceError> {
        self(format)
    }
}

fn is_playable(frame: &[u8]) -> bool {
    if frame.is_empty() || frame.len() % 2 != 0 {
        log::warn!("AudioSink: Skipping invalid audio frame, size={}", frame.len());
        return false;
    }
    true
}

/// Discards everything it is given
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl AudioSink for NullSink {
    async fn start(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn play(&self, frame: &[u8]) -> Result<(), DeviceError> {
        if is_playable(frame) {
            log::debug!("AudioSink: Discarding {} bytes", frame.len());
        }
        Ok(())
    }
}

pub struct CpalConfig {
    /// Output device name (None = default device)
    pub device_name: Option<String>,
    /// Buffer size in milliseconds before the oldest audio is dropped
    pub buffer_size_ms: u32,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            buffer_size_ms: 2000,
        }
    }
}

struct PlaybackWorker {
    stop_tx: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Speaker output through CPAL.
///
/// Mono streams are copied to every output channel. The device must support
/// the negotiated sample rate; no resampling is done.
pub struct CpalSink {
    device_name: Option<String>,
    format: AudioFormat,
    max_samples: usize,
    queue: Arc<Mutex<VecDeque<i16>>>,
    is_started: Arc<AtomicBool>,
    worker: Mutex<Option<PlaybackWorker>>,
}

impl CpalSink {
    pub fn new(config: CpalConfig, format: &AudioFormat) -> Result<Self, DeviceError> {
        format
            .frame_bytes()
            .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))?;

        let max_samples = (config.buffer_size_ms as usize
            * format.sample_rate as usize
            * format.channels as usize)
            / 1000;

        Ok(Self {
            device_name: config.device_name,
            format: format.clone(),
            max_samples,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            is_started: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Samples waiting to be played
    pub fn queued_samples(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn open_stream(
        device_name: Option<&str>,
        format: &AudioFormat,
        queue: Arc<Mutex<VecDeque<i16>>>,
    ) -> Result<cpal::Stream, DeviceError> {
        let device = find_output_device(device_name)?;
        let supported = select_output_config(&device, format)?;
        let sample_format = supported.sample_format();
        let stream_config = supported.config();
        let output_channels = stream_config.channels as usize;
        let input_channels = format.channels as usize;

        log::debug!(
            "AudioSink: Using output config: {:?}, {} ch, {} Hz",
            sample_format,
            output_channels,
            stream_config.sample_rate.0
        );

        // Fill one output buffer, repeating mono input across all channels
        let fill = move |out: &mut dyn FnMut(usize, i16), frames: usize| {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            for frame in 0..frames {
                if input_channels == output_channels {
                    for channel in 0..output_channels {
                        out(frame * output_channels + channel, queue.pop_front().unwrap_or(0));
                    }
                } else {
                    let sample = queue.pop_front().unwrap_or(0);
                    for channel in 0..output_channels {
                        out(frame * output_channels + channel, sample);
                    }
                }
            }
        };
        let err_fn = |err: cpal::StreamError| log::error!("AudioSink: Stream error: {}", err);

        let stream = match sample_format {
            SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / output_channels;
                    fill(&mut |i, s| data[i] = s, frames);
                },
                err_fn,
                None,
            )?,
            SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / output_channels;
                    fill(&mut |i, s| data[i] = s as f32 / i16::MAX as f32, frames);
                },
                err_fn,
                None,
            )?,
            other => {
                return Err(DeviceError::UnsupportedFormat(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl AudioSink for CpalSink {
    async fn start(&self) -> Result<(), DeviceError> {
        if self.is_started.load(Ordering::Acquire) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let format = self.format.clone();
        let queue = Arc::clone(&self.queue);

        let thread = thread::spawn(move || {
            log::debug!("AudioSink: Audio thread started");
            match Self::open_stream(device_name.as_deref(), &format, queue) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("AudioSink: Audio thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(PlaybackWorker { stop_tx, thread });
                self.is_started.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Stream(
                "playback thread exited during startup".to_string(),
            )),
        }
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        log::debug!("AudioSink: Stopping sink");
        self.is_started.store(false, Ordering::Release);

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let joined = tokio::task::spawn_blocking(move || worker.thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::warn!("AudioSink: Audio thread did not exit cleanly");
            }
        }
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn play(&self, frame: &[u8]) -> Result<(), DeviceError> {
        if !is_playable(frame) {
            return Ok(());
        }
        if !self.is_started.load(Ordering::Acquire) {
            log::warn!("AudioSink: Not started, dropping frame");
            return Ok(());
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        for chunk in frame.chunks_exact(2) {
            queue.push_back(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
        if queue.len() > self.max_samples {
            let excess = queue.len() - self.max_samples;
            log::warn!("AudioSink: Buffer full, dropping {} samples", excess);
            queue.drain(..excess);
        }
        Ok(())
    }
}

fn find_output_device(name: Option<&str>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(name.to_string())),
        None => host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound("default output device".to_string())),
    }
}

fn select_output_config(
    device: &Device,
    format: &AudioFormat,
) -> Result<SupportedStreamConfig, DeviceError> {
    let rate = format.sample_rate;
    let mut candidates: Vec<_> = device
        .supported_output_configs()?
        .filter(|c| {
            let channels_ok = c.channels() == format.channels || format.channels == 1;
            channels_ok
                && c.min_sample_rate().0 <= rate
                && c.max_sample_rate().0 >= rate
                && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
        })
        .collect();

    // Exact channel match first, then native i16
    candidates.sort_by_key(|c| {
        (
            c.channels() != format.channels,
            c.sample_format() != SampleFormat::I16,
        )
    });

    candidates
        .into_iter()
        .next()
        .map(|c| c.with_sample_rate(cpal::SampleRate(rate)))
        .ok_or_else(|| {
            DeviceError::UnsupportedFormat(format!(
                "output device has no {} Hz config for {} ch",
                rate, format.channels
            ))
        })
}

/// Names of the available output devices
pub fn list_output_devices() -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    Ok(host
        .output_devices()?
        .filter_map(|device| device.name().ok())
        .collect())
}
