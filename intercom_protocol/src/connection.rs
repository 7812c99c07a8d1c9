use crate::protocol::{Message, ProtocolError};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Upper bound for a single line. Frames at 48 kHz stereo stay far below this.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON over a byte stream.
///
/// `send` may be called from any number of tasks; each line is written and
/// flushed under the writer lock so lines never interleave. `receive` is
/// meant for a single reader.
pub struct JsonConnection {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BufWriter<BoxedWriter>>,
    closed: AtomicBool,
    peer: String,
}

impl JsonConnection {
    /// Connect to the hub over TCP
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        log::info!("📡 Connecting to hub at {}", address);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProtocolError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProtocolError::Connect {
                    address: address.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection after {:?}", timeout),
                    ),
                })
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        log::info!("✅ Connected to hub at {}", address);

        Ok(Self::from_io(read_half, write_half, address))
    }

    /// Wrap an arbitrary reader/writer pair
    pub fn from_io<R, W>(reader: R, writer: W, peer: &str) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(BufReader::new(Box::new(reader) as BoxedReader)),
            writer: Mutex::new(BufWriter::new(Box::new(writer) as BoxedWriter)),
            closed: AtomicBool::new(false),
            peer: peer.to_string(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a typed message as one line
    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let line = serde_json::to_vec(message)?;
        self.write_line(line).await
    }

    /// Send an arbitrary JSON object as one line
    pub async fn send_object(&self, object: &Map<String, Value>) -> Result<(), ProtocolError> {
        let line = serde_json::to_vec(object)?;
        self.write_line(line).await
    }

    async fn write_line(&self, mut line: Vec<u8>) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the next JSON object. Blank lines are skipped.
    pub async fn receive(&self) -> Result<Map<String, Value>, ProtocolError> {
        let mut reader = self.reader.lock().await;
        let mut line = Vec::new();

        loop {
            if self.is_closed() {
                return Err(ProtocolError::Closed);
            }

            line.clear();
            // Room for the content plus a "\r\n" terminator
            let mut limited = (&mut *reader).take(MAX_LINE_BYTES as u64 + 2);
            let read = limited.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(ProtocolError::Closed);
            }
            if content_len(&line) > MAX_LINE_BYTES {
                if !line.ends_with(b"\n") {
                    discard_line(&mut *reader).await?;
                }
                return Err(ProtocolError::LineTooLong {
                    limit: MAX_LINE_BYTES,
                });
            }

            let text = std::str::from_utf8(&line)
                .map_err(|e| {
                    ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?
                .trim();
            if text.is_empty() {
                continue;
            }

            return match serde_json::from_str::<Value>(text)? {
                Value::Object(object) => Ok(object),
                _ => Err(ProtocolError::NotAnObject),
            };
        }
    }

    /// Receive and classify the next message
    pub async fn receive_message(&self) -> Result<Message, ProtocolError> {
        Message::from_object(self.receive().await?)
    }

    /// Shut down the write half. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("🔌 Error shutting down connection to {}: {}", self.peer, e);
        }
        log::info!("🔌 Connection to {} closed", self.peer);
    }
}

/// Length of a line without its terminator
fn content_len(line: &[u8]) -> usize {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line).len()
}

/// Skip the rest of the current line, including its newline
async fn discard_line<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let buf = reader.fill_buf().await?;
            match buf.iter().position(|&b| b == b'\n') {
                Some(newline) => (newline + 1, true),
                None => (buf.len(), buf.is_empty()),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}
