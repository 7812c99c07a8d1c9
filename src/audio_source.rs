//! Capture capabilities: where outbound audio frames come from.

use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SupportedStreamConfig};
use intercom_protocol::AudioFormat;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

/// Captured audio kept before frames are read, in seconds
const MAX_BUFFERED_SECONDS: usize = 2;

/// Core trait for audio input
#[async_trait::async_trait]
pub trait AudioSource: Send {
    async fn start(&mut self) -> Result<(), DeviceError>;

    async fn stop(&mut self) -> Result<(), DeviceError>;

    /// Read one frame of PCM. Returns an empty vector when no full frame is
    /// available yet.
    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError>;
}

/// Creates a capture capability for a negotiated format
pub trait SourceFactory: Send + Sync {
    fn create(&self, format: &AudioFormat) -> Result<Box<dyn AudioSource>, DeviceError>;
}

impl<F> SourceFactory for F
where
    F: Fn(&AudioFormat) -> Result<Box<dyn AudioSource>, DeviceError> + Send + Sync,
{
    fn create(&self, format: &AudioFormat) -> Result<Box<dyn AudioSource>, DeviceError> {
        self(format)
    }
}

fn frame_bytes(format: &AudioFormat) -> Result<usize, DeviceError> {
    format
        .frame_bytes()
        .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))
}

fn samples_to_bytes(samples: impl Iterator<Item = i16>, capacity: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(capacity);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Produces frames of digital silence
pub struct SilenceSource {
    frame_bytes: usize,
    started: bool,
}

impl SilenceSource {
    pub fn new(format: &AudioFormat) -> Result<Self, DeviceError> {
        Ok(Self {
            frame_bytes: frame_bytes(format)?,
            started: false,
        })
    }
}

#[async_trait::async_trait]
impl AudioSource for SilenceSource {
    async fn start(&mut self) -> Result<(), DeviceError> {
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        self.started = false;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        if !self.started {
            return Err(DeviceError::NotStarted);
        }
        Ok(vec![0u8; self.frame_bytes])
    }
}

/// Streams a 16-bit PCM WAV file frame by frame
pub struct WavSource {
    path: PathBuf,
    reader: Option<hound::WavReader<BufReader<File>>>,
    samples_per_frame: usize,
    loop_audio: bool,
    exhausted: bool,
}

impl WavSource {
    /// Open `path` and check it matches the negotiated format
    pub fn open(path: &Path, format: &AudioFormat, loop_audio: bool) -> Result<Self, DeviceError> {
        let bytes = frame_bytes(format)?;
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} is not 16-bit PCM",
                path.display()
            )));
        }
        if spec.sample_rate != format.sample_rate || spec.channels != format.channels {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} is {} Hz / {} ch, stream wants {} Hz / {} ch",
                path.display(),
                spec.sample_rate,
                spec.channels,
                format.sample_rate,
                format.channels
            )));
        }

        log::info!(
            "📄 WAV source {} ({} samples, loop: {})",
            path.display(),
            reader.len(),
            loop_audio
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            samples_per_frame: bytes / 2,
            loop_audio,
            exhausted: false,
        })
    }

    fn rewind(&mut self) -> Result<(), DeviceError> {
        if let Some(reader) = self.reader.as_mut() {
            reader
                .seek(0)
                .map_err(|e| DeviceError::File(format!("{}: {}", self.path.display(), e)))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioSource for WavSource {
    async fn start(&mut self) -> Result<(), DeviceError> {
        if self.reader.is_none() {
            self.reader = Some(hound::WavReader::open(&self.path)?);
        }
        self.exhausted = false;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        self.reader = None;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let samples_per_frame = self.samples_per_frame;
        let reader = self.reader.as_mut().ok_or(DeviceError::NotStarted)?;

        let mut samples = Vec::with_capacity(samples_per_frame);
        for sample in reader.samples::<i16>().take(samples_per_frame) {
            samples.push(sample?);
        }

        if samples.is_empty() {
            if self.loop_audio {
                log::debug!("📄 Looping {}", self.path.display());
                self.rewind()?;
            } else {
                log::info!("📄 Finished streaming {}", self.path.display());
                self.exhausted = true;
            }
            return Ok(Vec::new());
        }

        // Pad the tail so every frame has the negotiated size
        samples.resize(samples_per_frame, 0);
        Ok(samples_to_bytes(samples.into_iter(), samples_per_frame * 2))
    }
}

/// Capture device settings
#[derive(Debug, Clone, Default)]
pub struct CpalSourceConfig {
    /// Input device name (None = default device)
    pub device_name: Option<String>,
}

struct CaptureWorker {
    stop_tx: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Microphone capture through CPAL.
///
/// The CPAL stream is not `Send` on every platform, so it lives on its own
/// thread; samples reach `read_frame` through a shared buffer.
pub struct CpalSource {
    config: CpalSourceConfig,
    format: AudioFormat,
    samples_per_read: usize,
    buffer: Arc<Mutex<VecDeque<i16>>>,
    worker: Option<CaptureWorker>,
}

impl CpalSource {
    pub fn new(config: CpalSourceConfig, format: &AudioFormat) -> Result<Self, DeviceError> {
        let bytes = frame_bytes(format)?;
        Ok(Self {
            config,
            format: format.clone(),
            samples_per_read: bytes / 2,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            worker: None,
        })
    }

    fn open_stream(
        device_name: Option<&str>,
        format: &AudioFormat,
        buffer: Arc<Mutex<VecDeque<i16>>>,
    ) -> Result<cpal::Stream, DeviceError> {
        let device = find_input_device(device_name)?;
        let supported = select_input_config(&device, format)?;
        let sample_format = supported.sample_format();
        let stream_config = supported.config();
        let max_samples =
            format.sample_rate as usize * format.channels as usize * MAX_BUFFERED_SECONDS;

        log::info!(
            "🎤 CPAL capture: {:?}, {} ch, {} Hz",
            sample_format,
            stream_config.channels,
            stream_config.sample_rate.0
        );

        let push = move |samples: &mut dyn Iterator<Item = i16>| {
            let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.extend(samples);
            if buffer.len() > max_samples {
                let excess = buffer.len() - max_samples;
                buffer.drain(..excess);
            }
        };
        let err_fn = |err: cpal::StreamError| log::error!("CPAL capture stream error: {}", err);

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    push(&mut data.iter().copied());
                },
                err_fn,
                None,
            )?,
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push(&mut data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
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
impl AudioSource for CpalSource {
    async fn start(&mut self) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.config.device_name.clone();
        let format = self.format.clone();
        let buffer = Arc::clone(&self.buffer);

        let thread = thread::spawn(move || {
            match Self::open_stream(device_name.as_deref(), &format, buffer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Keep the stream alive until stop is requested or the source is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("🎤 CPAL capture thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Stream(
                "capture thread exited during startup".to_string(),
            )),
        }
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let joined = tokio::task::spawn_blocking(move || worker.thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::warn!("⚠️ CPAL capture thread did not exit cleanly");
            }
        }
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        if self.worker.is_none() {
            return Err(DeviceError::NotStarted);
        }

        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() < self.samples_per_read {
            return Ok(Vec::new());
        }
        let samples = buffer.drain(..self.samples_per_read);
        Ok(samples_to_bytes(samples, self.samples_per_read * 2))
    }
}

fn find_input_device(name: Option<&str>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(name.to_string())),
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::NotFound("default input device".to_string())),
    }
}

fn select_input_config(
    device: &Device,
    format: &AudioFormat,
) -> Result<SupportedStreamConfig, DeviceError> {
    let rate = format.sample_rate;
    let mut candidates: Vec<_> = device
        .supported_input_configs()?
        .filter(|c| {
            c.channels() == format.channels
                && c.min_sample_rate().0 <= rate
                && c.max_sample_rate().0 >= rate
                && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
        })
        .collect();

    // Prefer native i16 so no conversion is needed
    candidates.sort_by_key(|c| c.sample_format() != SampleFormat::I16);

    candidates
        .into_iter()
        .next()
        .map(|c| c.with_sample_rate(cpal::SampleRate(rate)))
        .ok_or_else(|| {
            DeviceError::UnsupportedFormat(format!(
                "input device has no {} Hz / {} ch i16 or f32 config",
                rate, format.channels
            ))
        })
}

/// Names of the available input devices
pub fn list_input_devices() -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .filter_map(|device| device.name().ok())
        .collect())
}
