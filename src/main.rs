use anyhow::{Context, Result};
use clap::Parser;
use intercom_edge::audio_sink::{list_output_devices, AudioSink, CpalConfig, CpalSink, NullSink};
use intercom_edge::audio_source::{
    list_input_devices, AudioSource, CpalSource, CpalSourceConfig, SilenceSource, WavSource,
};
use intercom_edge::{ClientConfig, ClientEvent, DeviceError, IntercomClient};
use intercom_protocol::AudioFormat;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Hub address as host:port (overrides INTERCOM_HUB_HOST/PORT)
    #[arg(long)]
    hub: Option<String>,

    /// Client id sent on register
    #[arg(long)]
    client_id: Option<String>,

    /// Stream id to resume on auto start
    #[arg(long)]
    stream_id: Option<String>,

    #[arg(long)]
    sample_rate: Option<u32>,

    #[arg(long)]
    channels: Option<u16>,

    /// Frame duration in milliseconds
    #[arg(long)]
    frame_ms: Option<u32>,

    /// Register without requesting a stream
    #[arg(long)]
    no_auto_start: bool,

    /// Input device name (default device if omitted)
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name (default device if omitted)
    #[arg(long)]
    output_device: Option<String>,

    /// Send silence and discard incoming audio instead of using devices
    #[arg(long)]
    null_audio: bool,

    /// Stream a 16-bit PCM WAV file in a loop instead of the microphone
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Give up on commands without a response after this many milliseconds
    #[arg(long)]
    command_timeout_ms: Option<u64>,

    /// Delay between reconnect attempts
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,

    /// Print the available audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[derive(Debug, Clone)]
enum Capture {
    Device(Option<String>),
    Silence,
    Wav(PathBuf),
}

#[derive(Debug, Clone)]
enum Playback {
    Device(Option<String>),
    Discard,
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;

    if let Some(hub) = &args.hub {
        config.hub_address = hub.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(stream_id) = &args.stream_id {
        config.requested_stream_id = Some(stream_id.clone());
    }
    if let Some(sample_rate) = args.sample_rate {
        config.preferred_format.sample_rate = sample_rate;
    }
    if let Some(channels) = args.channels {
        config.preferred_format.channels = channels;
    }
    if let Some(frame_ms) = args.frame_ms {
        config.preferred_format.frame_ms = frame_ms;
    }
    if args.no_auto_start {
        config.auto_start = false;
    }
    if let Some(timeout_ms) = args.command_timeout_ms {
        config.command_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_client(args: &Args, config: ClientConfig) -> Result<IntercomClient> {
    let capture = match (&args.wav, args.null_audio) {
        (Some(path), _) => Capture::Wav(path.clone()),
        (None, true) => Capture::Silence,
        (None, false) => Capture::Device(args.input_device.clone()),
    };
    let playback = if args.null_audio {
        Playback::Discard
    } else {
        Playback::Device(args.output_device.clone())
    };
    log::info!("🎛️  Capture: {:?}, playback: {:?}", capture, playback);

    let sources = move |format: &AudioFormat| -> Result<Box<dyn AudioSource>, DeviceError> {
        let source: Box<dyn AudioSource> = match &capture {
            Capture::Device(name) => Box::new(CpalSource::new(
                CpalSourceConfig {
                    device_name: name.clone(),
                },
                format,
            )?),
            Capture::Silence => Box::new(SilenceSource::new(format)?),
            Capture::Wav(path) => Box::new(WavSource::open(path, format, true)?),
        };
        Ok(source)
    };
    let sinks = move |format: &AudioFormat| -> Result<Arc<dyn AudioSink>, DeviceError> {
        let sink: Arc<dyn AudioSink> = match &playback {
            Playback::Device(name) => Arc::new(CpalSink::new(
                CpalConfig {
                    device_name: name.clone(),
                    ..Default::default()
                },
                format,
            )?),
            Playback::Discard => Arc::new(NullSink),
        };
        Ok(sink)
    };

    IntercomClient::new(config, sources, sinks).context("Failed to create intercom client")
}

fn print_devices() -> Result<()> {
    println!("🎤 Input devices:");
    for name in list_input_devices().context("Failed to list input devices")? {
        println!("   {}", name);
    }
    println!("🔊 Output devices:");
    for name in list_output_devices().context("Failed to list output devices")? {
        println!("   {}", name);
    }
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(ClientEvent::HubEvent { event, fields }) => {
                log::info!("📣 {} {}", event, serde_json::Value::Object(fields))
            }
            Ok(ClientEvent::StreamFailed { stream_id, error }) => {
                log::error!("❌ Stream {} unavailable: {}", stream_id, error)
            }
            Ok(event) => log::debug!("Client event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("⚠️  Event log skipped {} events", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Keep a session open, reconnecting after each one ends
async fn run_with_reconnect(client: Arc<IntercomClient>, delay: Duration) {
    while !client.is_shut_down() {
        match client.run().await {
            Ok(()) => log::info!("👋 Session ended"),
            Err(e) if e.is_transport() => log::warn!("⚠️  Hub unreachable: {}", e),
            Err(e) => log::error!("❌ Session failed: {}", e),
        }
        if client.is_shut_down() {
            break;
        }

        log::info!("🔁 Reconnecting in {:?}", delay);
        tokio::select! {
            _ = client.shut_down() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Ask the hub to release our streams, giving it a moment to answer
async fn stop_streams(client: &IntercomClient, grace: Duration) {
    let streams = client.active_streams();
    if streams.is_empty() {
        return;
    }

    for stream in &streams {
        if let Err(e) = client.request_stop_audio(&stream.stream_id).await {
            log::warn!("⚠️  Could not stop stream {}: {}", stream.stream_id, e);
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while !client.active_streams().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        return print_devices();
    }

    let config = build_config(&args)?;
    log::info!(
        "🚀 Starting intercom-edge as '{}' for hub {}",
        config.client_id,
        config.hub_address
    );

    let client = Arc::new(build_client(&args, config)?);
    tokio::spawn(log_events(client.subscribe()));

    let mut runner = tokio::spawn(run_with_reconnect(
        Arc::clone(&client),
        Duration::from_millis(args.reconnect_delay_ms),
    ));

    tokio::select! {
        result = &mut runner => {
            result.context("Client task failed")?;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            log::info!("Received Ctrl+C, shutting down...");
        }
    }

    stop_streams(&client, Duration::from_secs(1)).await;
    client.shutdown();
    runner.await.context("Client task failed")?;

    println!("\n👋 Goodbye!");
    Ok(())
}
