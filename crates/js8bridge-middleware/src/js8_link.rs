//! TCP client for the JS8Call JSON API.
//!
//! JS8Call exposes its API as newline-delimited JSON over a single TCP
//! connection (default port 2442). [`Js8Link`] owns that connection in a
//! background task:
//!
//! * connects with a timeout and keeps retrying until the application is
//!   reachable, and again after every disconnect;
//! * decodes each inbound line into a [`serde_json::Value`] and forwards it
//!   on the event stream, which survives reconnects;
//! * writes outbound commands as one compact JSON object per line.
//!
//! Lines that are not valid JSON are logged and skipped. Line framing goes
//! through a length-capped [`LinesCodec`], so a peer that never sends a
//! newline costs at most [`LinkConfig::max_line_bytes`] of buffer before the
//! rest of its line is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{self, BoxStream, StreamExt};
use js8bridge_types::BridgeError;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::adapter::RadioLink;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default cap on one inbound line; longer lines are discarded undecoded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Connection settings for [`Js8Link`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// `host:port` of the JS8Call API, e.g. `"127.0.0.1:2442"`.
    pub addr: String,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Inbound events buffered before the reader waits for the consumer.
    pub event_capacity: usize,
    pub max_line_bytes: usize,
}

impl LinkConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: 1024,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max.max(1);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Persistent, self-reconnecting connection to JS8Call.
pub struct Js8Link {
    addr: String,
    connected: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    events: Mutex<Option<mpsc::Receiver<Value>>>,
    task: JoinHandle<()>,
}

impl Js8Link {
    /// Start the connection task. Must be called from within a Tokio runtime.
    pub fn spawn(config: LinkConfig) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let writer = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));

        let addr = config.addr.clone();
        let task = tokio::spawn(connection_loop(
            config,
            Arc::clone(&connected),
            Arc::clone(&writer),
            tx,
        ));

        Self {
            addr,
            connected,
            writer,
            events: Mutex::new(Some(rx)),
            task,
        }
    }

    /// The address this link connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop the connection task and close the socket.
    pub fn shutdown(&self) {
        self.task.abort();
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for Js8Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RadioLink for Js8Link {
    async fn send(&self, command: &Value) -> Result<(), BridgeError> {
        let mut line = serde_json::to_vec(command)
            .map_err(|e| BridgeError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };
        let written = writer.write_all(&line).await;
        if let Err(e) = written {
            // Let the reader side notice the broken socket and reconnect.
            *guard = None;
            self.connected.store(false, Ordering::SeqCst);
            return Err(BridgeError::Transport(format!("write to {}: {e}", self.addr)));
        }
        debug!(addr = %self.addr, bytes = line.len(), "command written");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn event_stream(&self) -> BoxStream<'static, Value> {
        match self.events.lock().await.take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => {
                warn!(addr = %self.addr, "event stream already taken");
                stream::empty().boxed()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn connection_loop(
    config: LinkConfig,
    connected: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    tx: mpsc::Sender<Value>,
) {
    loop {
        match connect(&config.addr, config.connect_timeout).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *writer.lock().await = Some(write_half);
                connected.store(true, Ordering::SeqCst);
                info!(addr = %config.addr, "connected to JS8Call API");

                let outcome = read_events(read_half, config.max_line_bytes, &tx).await;

                connected.store(false, Ordering::SeqCst);
                *writer.lock().await = None;
                match outcome {
                    Ok(true) => warn!(addr = %config.addr, "JS8Call closed the connection"),
                    Ok(false) => {
                        debug!(addr = %config.addr, "event consumer gone; stopping link");
                        return;
                    }
                    Err(e) => error!(addr = %config.addr, error = %e, "JS8Call connection lost"),
                }
            }
            Err(e) => {
                error!(
                    addr = %config.addr,
                    error = %e,
                    retry_in_secs = config.reconnect_delay.as_secs_f64(),
                    "cannot reach JS8Call API"
                );
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, BridgeError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BridgeError::Transport(format!("connect to {addr} timed out")))?
        .map_err(|e| BridgeError::Transport(format!("connect to {addr}: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
    }
    Ok(stream)
}

/// Read lines until EOF or error. Returns `Ok(true)` on EOF and `Ok(false)`
/// when the event consumer has gone away.
async fn read_events(
    mut read_half: OwnedReadHalf,
    max_line_bytes: usize,
    tx: &mpsc::Sender<Value>,
) -> Result<bool, BridgeError> {
    let mut codec = LinesCodec::new_with_max_length(max_line_bytes);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(line)) => {
                    if !forward_line(&line, tx).await {
                        return Ok(false);
                    }
                }
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max_bytes = max_line_bytes, "discarding oversized line");
                }
                Err(e) => warn!(error = %e, "discarding undecodable line"),
            }
        }

        let n = read_half
            .read_buf(&mut buf)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        if n == 0 {
            if let Ok(Some(line)) = codec.decode_eof(&mut buf)
                && !forward_line(&line, tx).await
            {
                return Ok(false);
            }
            return Ok(true);
        }
    }
}

/// Decode and forward one line. Returns `false` once the consumer is gone.
async fn forward_line(line: &str, tx: &mpsc::Sender<Value>) -> bool {
    match decode_line(line.as_bytes()) {
        Ok(Some(event)) => tx.send(event).await.is_ok(),
        Ok(None) => true,
        Err(e) => {
            warn!(error = %e, line = %line, "discarding malformed line");
            true
        }
    }
}

/// Decode one newline-terminated line. Blank lines yield `Ok(None)`.
pub fn decode_line(line: &[u8]) -> Result<Option<Value>, BridgeError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| BridgeError::Parsing(format!("invalid JSON line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn wait_connected(link: &Js8Link) {
        for _ in 0..200 {
            if link.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("link never connected");
    }

    #[test]
    fn decode_line_variants() {
        assert_eq!(decode_line(b"\r\n").unwrap(), None);
        assert_eq!(
            decode_line(b"{\"type\":\"RIG.PTT\",\"value\":\"on\"}\n").unwrap(),
            Some(json!({ "type": "RIG.PTT", "value": "on" }))
        );
        assert!(matches!(decode_line(b"not json\n"), Err(BridgeError::Parsing(_))));
    }

    #[tokio::test]
    async fn forwards_decoded_events_and_skips_garbage() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let link = Js8Link::spawn(LinkConfig::new(listener.local_addr()?.to_string()));
        let mut events = link.event_stream().await;

        let (mut server, _) = listener.accept().await?;
        server
            .write_all(b"{\"type\":\"RIG.FREQ\",\"value\":\"\"}\ngarbage\n\n{\"type\":\"RX.ACTIVITY\"}\n")
            .await?;

        let first = events.next().await.ok_or("stream ended")?;
        let second = events.next().await.ok_or("stream ended")?;
        assert_eq!(first["type"], "RIG.FREQ");
        assert_eq!(second["type"], "RX.ACTIVITY");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_without_losing_the_next() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let link = Js8Link::spawn(LinkConfig::new(listener.local_addr()?.to_string()).with_max_line_bytes(64));
        let mut events = link.event_stream().await;

        let (mut server, _) = listener.accept().await?;
        // Far more than the cap, sent in pieces with no newline in between.
        let junk = vec![b'x'; 4096];
        for _ in 0..16 {
            server.write_all(&junk).await?;
        }
        server.write_all(b"\n").await?;
        server.write_all(&[0xff, 0xfe, b'\n']).await?;
        server.write_all(b"{\"type\":\"RIG.PTT\",\"value\":\"off\"}\n").await?;

        let event = events.next().await.ok_or("stream ended")?;
        assert_eq!(event["type"], "RIG.PTT");
        assert_eq!(event["value"], "off");
        Ok(())
    }

    #[tokio::test]
    async fn unterminated_last_line_is_flushed_at_eof() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let link = Js8Link::spawn(
            LinkConfig::new(listener.local_addr()?.to_string()).with_reconnect_delay(Duration::from_secs(60)),
        );
        let mut events = link.event_stream().await;

        let (mut server, _) = listener.accept().await?;
        server.write_all(b"{\"type\":\"CLOSE\",\"value\":\"\"}").await?;
        drop(server);

        let event = events.next().await.ok_or("stream ended")?;
        assert_eq!(event["type"], "CLOSE");
        Ok(())
    }

    #[tokio::test]
    async fn send_writes_one_line_per_command() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let link = Js8Link::spawn(LinkConfig::new(listener.local_addr()?.to_string()));
        let (mut server, _) = listener.accept().await?;
        wait_connected(&link).await;

        link.send(&json!({ "type": "TX.SEND_MESSAGE", "value": "CQ" })).await?;

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await?;
        let text = std::str::from_utf8(&buf[..n])?;
        assert!(text.ends_with('\n'));
        let echoed: Value = serde_json::from_str(text.trim_end())?;
        assert_eq!(echoed["value"], "CQ");
        Ok(())
    }

    #[tokio::test]
    async fn send_without_connection_fails() -> Result<(), Box<dyn std::error::Error>> {
        // Grab a free port, then close it so nothing is listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.to_string()
        };
        let link = Js8Link::spawn(LinkConfig::new(addr).with_reconnect_delay(Duration::from_secs(60)));

        let result = link.send(&json!({ "type": "RIG.GET_FREQ" })).await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
        assert!(!link.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn event_stream_survives_reconnect() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let link = Js8Link::spawn(
            LinkConfig::new(listener.local_addr()?.to_string())
                .with_reconnect_delay(Duration::from_millis(20)),
        );
        let mut events = link.event_stream().await;

        let (first_conn, _) = listener.accept().await?;
        drop(first_conn);

        let (mut second_conn, _) = listener.accept().await?;
        second_conn.write_all(b"{\"type\":\"STATION.CALLSIGN\",\"value\":\"W1AW\"}\n").await?;

        let event = events.next().await.ok_or("stream ended")?;
        assert_eq!(event["value"], "W1AW");
        Ok(())
    }

    #[tokio::test]
    async fn second_event_stream_is_empty() {
        let link = Js8Link::spawn(LinkConfig::new("127.0.0.1:9").with_reconnect_delay(Duration::from_secs(60)));
        let _first = link.event_stream().await;
        let mut second = link.event_stream().await;
        assert!(second.next().await.is_none());
    }
}
