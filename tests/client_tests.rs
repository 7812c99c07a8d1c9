use intercom_edge::audio_sink::AudioSink;
use intercom_edge::audio_source::AudioSource;
use intercom_edge::{
    ClientConfig, ClientEvent, DeviceError, IntercomClient, IntercomError, StreamState,
    TerminationReason,
};
use intercom_protocol::{
    AudioFormat, AudioFrame, Direction, JsonConnection, Message, MAX_LINE_BYTES,
};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

type CallLog = Arc<Mutex<Vec<String>>>;

/// Emits frames filled with an incrementing byte
struct CountingSource {
    frame_bytes: usize,
    next: u8,
    log: CallLog,
}

#[async_trait::async_trait]
impl AudioSource for CountingSource {
    async fn start(&mut self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("source.start".to_string());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("source.stop".to_string());
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        let frame = vec![self.next; self.frame_bytes];
        self.next = self.next.wrapping_add(1);
        Ok(frame)
    }
}

struct RecordingSink {
    played: Mutex<Vec<Vec<u8>>>,
    log: CallLog,
}

#[async_trait::async_trait]
impl AudioSink for RecordingSink {
    async fn start(&self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("sink.start".to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("sink.stop".to_string());
        Ok(())
    }

    async fn play(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.played.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Capabilities handed out by the client's factories
#[derive(Default)]
struct Devices {
    log: CallLog,
    sinks: Mutex<Vec<Arc<RecordingSink>>>,
    fail_source: bool,
}

impl Devices {
    fn sink(&self, index: usize) -> Arc<RecordingSink> {
        Arc::clone(&self.sinks.lock().unwrap()[index])
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// In-process hub speaking the line protocol
struct MockHub {
    listener: TcpListener,
}

impl MockHub {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn address(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    async fn accept(&self) -> HubSession {
        let (stream, peer) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let (read, write) = stream.into_split();
        HubSession {
            // Reads only; the hub writes raw bytes through `writer`
            connection: JsonConnection::from_io(read, tokio::io::sink(), &peer.to_string()),
            writer: tokio::sync::Mutex::new(write),
        }
    }
}

struct HubSession {
    connection: JsonConnection,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl HubSession {
    async fn next(&self) -> Map<String, Value> {
        tokio::time::timeout(WAIT, self.connection.receive())
            .await
            .expect("timed out waiting for client")
            .unwrap()
    }

    /// Next message that is not an outbound audio frame
    async fn next_control(&self) -> Map<String, Value> {
        loop {
            let object = self.next().await;
            if object["type"] != "audio_frame" {
                return object;
            }
        }
    }

    async fn next_frame(&self) -> AudioFrame {
        loop {
            let object = self.next().await;
            if object["type"] == "audio_frame" {
                match Message::from_object(object).unwrap() {
                    Message::AudioFrame(frame) => return frame,
                    other => panic!("expected audio frame, got {:?}", other),
                }
            }
        }
    }

    /// Write `line` as is, followed by a newline
    async fn send_line(&self, line: &[u8]) {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    async fn send(&self, value: Value) {
        self.send_line(&serde_json::to_vec(&value).unwrap()).await;
    }

    async fn send_message(&self, message: &Message) {
        self.send(serde_json::to_value(message).unwrap()).await;
    }

    /// Read register and the auto start command, then grant `stream_id`
    async fn handshake(&self, stream_id: &str) -> Map<String, Value> {
        let register = self.next().await;
        assert_eq!(register["type"], "register");

        let start = self.next().await;
        assert_eq!(start["command"], "start_audio");
        self.send(json!({
            "type": "response",
            "command_id": start["command_id"],
            "status": "ok",
            "payload": {"stream_id": stream_id},
        }))
        .await;
        start
    }
}

fn test_config(address: String) -> ClientConfig {
    ClientConfig {
        hub_address: address,
        client_id: "kitchen".to_string(),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn start_client(
    config: ClientConfig,
    devices: Arc<Devices>,
) -> (Arc<IntercomClient>, JoinHandle<intercom_edge::Result<()>>) {
    let source_devices = Arc::clone(&devices);
    let sources = move |format: &AudioFormat| -> Result<Box<dyn AudioSource>, DeviceError> {
        if source_devices.fail_source {
            return Err(DeviceError::NotFound("microphone".to_string()));
        }
        Ok(Box::new(CountingSource {
            frame_bytes: format.frame_bytes().unwrap(),
            next: 0,
            log: Arc::clone(&source_devices.log),
        }))
    };
    let sinks = move |_: &AudioFormat| -> Result<Arc<dyn AudioSink>, DeviceError> {
        let sink = Arc::new(RecordingSink {
            played: Mutex::new(Vec::new()),
            log: Arc::clone(&devices.log),
        });
        devices.sinks.lock().unwrap().push(Arc::clone(&sink));
        Ok(sink)
    };

    let client = Arc::new(IntercomClient::new(config, sources, sinks).unwrap());
    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };
    (client, runner)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, mut matches: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test]
async fn test_auto_start_streams_paced_frames() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let session = hub.accept().await;

    let register = session.next().await;
    assert_eq!(register["role"], "home_assistant");
    assert_eq!(register["client_id"], "kitchen");

    let start = session.next().await;
    assert_eq!(start["type"], "command");
    assert_eq!(
        start["payload"],
        json!({"encoding": "pcm_s16le", "sample_rate": 16000, "channels": 1})
    );
    session
        .send(json!({
            "type": "response",
            "command_id": start["command_id"],
            "status": "ok",
            "payload": {
                "stream_id": "s1",
                "encoding": "pcm_s16le",
                "sample_rate": 16000,
                "channels": 1
            },
        }))
        .await;

    let first = session.next_frame().await;
    let started = Instant::now();
    let mut frames = vec![first];
    for _ in 0..3 {
        frames.push(session.next_frame().await);
    }
    let elapsed = started.elapsed();

    for (index, frame) in frames.iter().enumerate() {
        assert_eq!(frame.stream_id, "s1");
        assert_eq!(frame.sequence, index as u64);
        assert_eq!(frame.direction, Direction::ClientToHub);
        assert_eq!(frame.decode_data().unwrap(), vec![index as u8; 1280]);
    }
    // Three 40 ms intervals, with some slack for timer granularity
    assert!(elapsed >= Duration::from_millis(100), "frames came too fast: {:?}", elapsed);

    let streams = client.active_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].state, StreamState::Active);
    assert_eq!(streams[0].format.frame_ms, 40);

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hub_frame_is_rendered_once() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let session = hub.accept().await;
    session.handshake("s1").await;
    session.next_frame().await;

    let format = AudioFormat::default();
    let pcm: Vec<u8> = (0..1280).map(|i| (i % 251) as u8).collect();
    let inbound = AudioFrame::encode("s1", 0, &format, Direction::HubToClient, &pcm);
    let wrong_direction = AudioFrame::encode("s1", 1, &format, Direction::ClientToHub, &pcm);
    let unknown_stream = AudioFrame::encode("s9", 0, &format, Direction::HubToClient, &pcm);
    for frame in [inbound, wrong_direction, unknown_stream] {
        session.send_message(&Message::AudioFrame(frame)).await;
    }
    session
        .send(json!({
            "type": "audio_frame",
            "stream_id": "s1",
            "direction": "hub_to_client",
            "data": "%%%"
        }))
        .await;

    // An event after the frames: once it is seen, all frames were dispatched
    let mut events = client.subscribe();
    session.send(json!({"type": "event", "event": "ring", "room": "hall"})).await;
    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::HubEvent { .. })).await;
    match event {
        ClientEvent::HubEvent { event, fields } => {
            assert_eq!(event, "ring");
            assert_eq!(fields["room"], "hall");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let played = devices.sink(0).played.lock().unwrap().clone();
    assert_eq!(played, vec![pcm]);

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hub_error_terminates_only_that_stream() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let mut events = client.subscribe();
    let session = hub.accept().await;
    session.handshake("s1").await;
    session.next_frame().await;

    session
        .send(json!({"type": "error", "details": {"stream_id": "s1", "reason": "hub busy"}}))
        .await;

    let terminated =
        wait_for(&mut events, |e| matches!(e, ClientEvent::StreamTerminated { .. })).await;
    assert_eq!(
        terminated,
        ClientEvent::StreamTerminated {
            stream_id: "s1".to_string(),
            reason: TerminationReason::HubError,
        }
    );
    wait_for(&mut events, |e| matches!(e, ClientEvent::HubError { .. })).await;
    assert!(client.active_streams().is_empty());

    let calls = devices.calls();
    assert_eq!(calls.iter().filter(|c| *c == "source.stop").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "sink.stop").count(), 1);
    let source_stop = calls.iter().position(|c| c == "source.stop").unwrap();
    let sink_stop = calls.iter().position(|c| c == "sink.stop").unwrap();
    assert!(source_stop < sink_stop);

    // The session is still usable
    let command_id = client.request_start_audio(Some("s1")).await.unwrap();
    let restart = session.next_control().await;
    assert_eq!(restart["command_id"], json!(command_id));
    assert_eq!(restart["payload"]["stream_id"], "s1");
    assert!(!runner.is_finished());

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hub_close_ends_session_cleanly() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let mut events = client.subscribe();
    let session = hub.accept().await;
    session.handshake("s1").await;
    session.next_frame().await;

    session.send(json!({"type": "close"})).await;

    let result = tokio::time::timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(client.active_streams().is_empty());
    assert_eq!(client.pending_commands(), 0);
    assert!(!client.is_connected());
    wait_for(&mut events, |e| *e == ClientEvent::Closed { error: None }).await;

    // The client shut its side down after the last frame
    loop {
        match tokio::time::timeout(WAIT, session.connection.receive()).await.unwrap() {
            Ok(_) => continue,
            Err(e) => {
                assert!(e.is_closed());
                break;
            }
        }
    }
    assert_eq!(devices.calls().iter().filter(|c| *c == "sink.stop").count(), 1);
}

#[tokio::test]
async fn test_unknown_ids_change_nothing() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let session = hub.accept().await;
    let start = session.handshake("s1").await;
    session.next_frame().await;

    session
        .send(json!({
            "type": "response",
            "command_id": "no-such-command",
            "status": "ok",
            "payload": {"stream_id": "s2"}
        }))
        .await;
    session.send(json!({"type": "mystery", "value": 1})).await;
    session.send(json!({"type": "command_ack"})).await;

    let stop_id = client.request_stop_audio("s7").await.unwrap();
    let stop = session.next_control().await;
    assert_eq!(stop["command"], "stop_audio");
    assert_eq!(stop["payload"], json!({"stream_id": "s7"}));
    assert_ne!(json!(stop_id), start["command_id"]);

    let streams = client.active_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id, "s1");
    assert_eq!(streams[0].state, StreamState::Active);

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreadable_lines_do_not_end_session() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let mut events = client.subscribe();
    let session = hub.accept().await;
    session.handshake("s1").await;
    session.next_frame().await;

    session.send_line(b"{not json}").await;
    session.send_line(b"[1]").await;
    session.send_line(b"\"just a string\"").await;
    session.send_line(&vec![b'x'; MAX_LINE_BYTES + 100]).await;
    session.send(json!({"type": "event", "event": "doorbell"})).await;

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::HubEvent { .. })).await;
    assert!(matches!(event, ClientEvent::HubEvent { event, .. } if event == "doorbell"));
    assert!(!runner.is_finished());
    assert!(client.is_connected());

    let streams = client.active_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id, "s1");
    assert_eq!(streams[0].state, StreamState::Active);
    // Frames keep flowing after the bad input
    assert_eq!(session.next_frame().await.stream_id, "s1");

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_request_terminates_stream() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let mut events = client.subscribe();
    let session = hub.accept().await;
    session.handshake("s1").await;
    session.next_frame().await;

    client.request_stop_audio("s1").await.unwrap();
    assert_eq!(client.active_streams()[0].state, StreamState::Stopping);
    let stop = session.next_control().await;
    session
        .send(json!({"type": "command_ack", "command_id": stop["command_id"]}))
        .await;
    // No stream id in the response; the request names it
    session
        .send(json!({"type": "response", "command_id": stop["command_id"], "status": "ok"}))
        .await;

    let terminated =
        wait_for(&mut events, |e| matches!(e, ClientEvent::StreamTerminated { .. })).await;
    assert_eq!(
        terminated,
        ClientEvent::StreamTerminated {
            stream_id: "s1".to_string(),
            reason: TerminationReason::Stopped,
        }
    );
    assert!(client.active_streams().is_empty());

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_device_failure_releases_hub_stream() {
    let hub = MockHub::bind().await;
    let devices = Arc::new(Devices {
        fail_source: true,
        ..Default::default()
    });
    let (client, runner) = start_client(test_config(hub.address()), Arc::clone(&devices));
    let mut events = client.subscribe();
    let session = hub.accept().await;
    session.handshake("s1").await;

    let release = session.next_control().await;
    assert_eq!(release["command"], "stop_audio");
    assert_eq!(release["payload"]["stream_id"], "s1");
    let failed = wait_for(&mut events, |e| matches!(e, ClientEvent::StreamFailed { .. })).await;
    assert!(matches!(failed, ClientEvent::StreamFailed { stream_id, .. } if stream_id == "s1"));
    assert!(client.active_streams().is_empty());

    client.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    // Bind then drop to get a port nobody listens on
    let address = {
        let hub = MockHub::bind().await;
        hub.address()
    };
    let devices = Arc::new(Devices::default());
    let (client, runner) = start_client(test_config(address), devices);

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(IntercomError::Connection(_))));
    assert!(!client.is_connected());
}
