//! Socket transport and stream framing
//!
//! INDI has no framing beyond "a well-formed element". [`FrameDecoder`]
//! accumulates inbound text and only hands out elements once the whole buffer
//! parses as a fragment, then starts over with an empty buffer.
//!
//! [`Transport`] owns one TCP session at a time: a writer task fed through an
//! mpsc channel and a reader task that feeds the decoder and passes every
//! decoded frame to a [`TransportHandler`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::codec::{decode_message, Decoded};
use crate::error::{IndiError, IndiResult};
use crate::xml::{parse_fragment, strip_invalid_chars};
use crate::IndiServer;

/// Bytes requested per socket read
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Outbound elements queued before `send` waits
const COMMAND_QUEUE_SIZE: usize = 100;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Receives every raw inbound chunk, before framing
pub trait RawInputSink: Send + Sync {
    fn received(&self, chunk: &[u8]);
}

/// Logs raw inbound traffic at trace level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RawInputSink for TracingSink {
    fn received(&self, chunk: &[u8]) {
        tracing::trace!("INDI << {}", String::from_utf8_lossy(chunk));
    }
}

/// Hooks the transport calls into its owner
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// The socket is open and outbound messages can be sent
    async fn connection_established(&self);

    /// One top-level element arrived. Called from the read task, in stream order.
    async fn frame_received(&self, frame: Decoded);

    /// The session ended, either through `close` or because the socket failed.
    /// Called exactly once per established session.
    async fn connection_closed(&self);
}

// ============================================================================
// Framing
// ============================================================================

/// Incremental decoder for the server's element stream
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: String,
    /// Trailing bytes of a UTF-8 sequence split across reads
    pending: Vec<u8>,
    incomplete_since: Option<Instant>,
    stall_reported: bool,
    stall_warning: Duration,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl FrameDecoder {
    pub fn new(stall_warning: Duration) -> Self {
        Self {
            buffer: String::new(),
            pending: Vec::new(),
            incomplete_since: None,
            stall_reported: false,
            stall_warning,
        }
    }

    /// Append a chunk and return every frame that became complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.pending.extend_from_slice(bytes);
        self.drain_utf8();

        if self.buffer.trim().is_empty() {
            self.reset();
            return Vec::new();
        }

        // Every complete fragment ends in '>'; skip the parse attempt otherwise
        if !self.buffer.trim_end().ends_with('>') {
            self.mark_incomplete();
            return Vec::new();
        }

        let text = strip_invalid_chars(&self.buffer);
        match parse_fragment(&text) {
            Some(elements) => {
                self.reset();
                elements.iter().map(decode_message).collect()
            }
            None => {
                self.mark_incomplete();
                Vec::new()
            }
        }
    }

    /// Bytes currently held back waiting for the fragment to complete
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// Returns how long the buffer has been incomplete, once, after it passes
    /// the warning threshold
    pub fn check_stall(&mut self) -> Option<Duration> {
        let since = self.incomplete_since?;
        let elapsed = since.elapsed();
        if self.stall_reported || elapsed < self.stall_warning {
            return None;
        }
        self.stall_reported = true;
        Some(elapsed)
    }

    fn drain_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn mark_incomplete(&mut self) {
        if self.incomplete_since.is_none() {
            self.incomplete_since = Some(Instant::now());
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.incomplete_since = None;
        self.stall_reported = false;
    }
}

// ============================================================================
// Transport
// ============================================================================

struct Session {
    id: u64,
    commands: mpsc::Sender<String>,
    // Dropping the sender stops the read task
    _shutdown: oneshot::Sender<()>,
    handler: Weak<dyn TransportHandler>,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    raw_sink: RwLock<Option<Arc<dyn RawInputSink>>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// End the session if it is still the given one
    fn finish(&self, id: u64) -> Option<Session> {
        let mut session = self.session();
        if session.as_ref().map(|s| s.id) != Some(id) {
            return None;
        }
        self.set_state(ConnectionState::Disconnected);
        session.take()
    }

    fn raw_sink(&self) -> Option<Arc<dyn RawInputSink>> {
        self.raw_sink
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// One reconnectable TCP connection to an INDI server
pub struct Transport {
    server: IndiServer,
    connect_timeout: Duration,
    stall_warning: Duration,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("server", &self.server)
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    pub fn new(server: IndiServer, connect_timeout: Duration, stall_warning: Duration) -> Self {
        Self {
            server,
            connect_timeout,
            stall_warning,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn server(&self) -> &IndiServer {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_raw_input_sink(&self, sink: Option<Arc<dyn RawInputSink>>) {
        *self
            .shared
            .raw_sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sink;
    }

    /// Open the socket and start the reader and writer tasks.
    ///
    /// Already connected is a no-op. On failure the state returns to
    /// `Disconnected` and the error is returned.
    pub async fn open(&self, handler: Weak<dyn TransportHandler>) -> IndiResult<()> {
        let addr = self.server.address();
        match self.shared.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) if current == ConnectionState::Connected as u8 => return Ok(()),
            Err(_) => {
                return Err(IndiError::ConnectionFailed(format!(
                    "Connection to {} already in progress",
                    addr
                )))
            }
        }

        tracing::info!("Connecting to INDI server at {}", addr);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(IndiError::ConnectionTimeout {
                    host: self.server.host.clone(),
                    port: self.server.port,
                    duration: self.connect_timeout,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (commands, command_rx) = mpsc::channel::<String>(COMMAND_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(writer_task(write_half, command_rx));

        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        *self.shared.session() = Some(Session {
            id,
            commands,
            _shutdown: shutdown_tx,
            handler: handler.clone(),
        });
        self.shared.set_state(ConnectionState::Connected);
        tracing::info!("Connected to INDI server at {}", addr);

        if let Some(handler) = handler.upgrade() {
            handler.connection_established().await;
        }

        let shared = Arc::clone(&self.shared);
        let decoder = FrameDecoder::new(self.stall_warning);
        tokio::spawn(async move {
            let exit = read_loop(read_half, decoder, &shared, &handler, shutdown_rx).await;
            match &exit {
                ReadExit::Shutdown => tracing::debug!("INDI reader for {} stopped", addr),
                ReadExit::Eof => tracing::info!("INDI server {} closed the connection", addr),
                ReadExit::Failed(e) => tracing::warn!("INDI read from {} failed: {}", addr, e),
            }
            if let Some(session) = shared.finish(id) {
                drop(session.commands);
                if let Some(handler) = session.handler.upgrade() {
                    handler.connection_closed().await;
                }
            }
        });

        Ok(())
    }

    /// Close the current session. Returns false if there was none.
    pub async fn close(&self) -> bool {
        let session = {
            let mut session = self.shared.session();
            let taken = session.take();
            if taken.is_some() {
                self.shared.set_state(ConnectionState::Disconnected);
            }
            taken
        };
        let Some(session) = session else {
            return false;
        };

        tracing::info!("Disconnecting from INDI server {}", self.server);
        let handler = session.handler.clone();
        drop(session);
        if let Some(handler) = handler.upgrade() {
            handler.connection_closed().await;
        }
        true
    }

    /// Queue one serialized element for the writer task
    pub async fn send(&self, xml: String) -> IndiResult<()> {
        let commands = self
            .shared
            .session()
            .as_ref()
            .map(|session| session.commands.clone())
            .ok_or(IndiError::NotConnected)?;
        commands.send(xml).await.map_err(|e| {
            IndiError::ChannelClosed(format!(
                "Failed to send INDI command to {}: {}. The connection may have been lost.",
                self.server, e
            ))
        })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Stops the reader and writer tasks of a session nobody can close anymore
        if self.shared.session().take().is_some() {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }
}

/// Writer task: one element per line
async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
    while let Some(cmd) = rx.recv().await {
        tracing::trace!("INDI >> {}", cmd);
        if let Err(e) = writer.write_all(cmd.as_bytes()).await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

enum ReadExit {
    Shutdown,
    Eof,
    Failed(String),
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut decoder: FrameDecoder,
    shared: &Shared,
    handler: &Weak<dyn TransportHandler>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> ReadExit {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut stall_check = interval(Duration::from_secs(1));
    stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let read = tokio::select! {
            _ = &mut shutdown_rx => return ReadExit::Shutdown,
            _ = stall_check.tick() => {
                if let Some(elapsed) = decoder.check_stall() {
                    tracing::warn!(
                        "INDI fragment incomplete for {:?} ({} bytes buffered); later messages are held back until it closes",
                        elapsed,
                        decoder.buffered_len()
                    );
                }
                continue;
            }
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => return ReadExit::Eof,
            Ok(n) => n,
            Err(e) => return ReadExit::Failed(e.to_string()),
        };

        if let Some(sink) = shared.raw_sink() {
            sink.received(&chunk[..n]);
        }

        for frame in decoder.push(&chunk[..n]) {
            let Some(handler) = handler.upgrade() else {
                return ReadExit::Shutdown;
            };
            handler.frame_received(frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ServerMessage, SkipReason};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_incremental_framing() {
        let mut decoder = FrameDecoder::default();

        assert!(decoder.push(b"<defNumberVect").is_empty());
        assert!(decoder.buffered_len() > 0);

        let frames = decoder.push(
            br#"or device="d" name="n"><defNumber name="v">5</defNumber></defNumberVector>"#,
        );
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Decoded::Message(ServerMessage::DefineProperty {
                device, property, ..
            }) => {
                assert_eq!(device, "d");
                assert_eq!(property, "n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_several_elements_in_one_chunk() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(
            b"<message message=\"hello\"/>\n<getProperties version=\"1.7\"/>\n<delProperty device=\"d\"/>\n",
        );
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Decoded::Message(ServerMessage::Notification { .. })));
        assert!(matches!(frames[1], Decoded::Skipped(SkipReason::UnknownTag(_))));
        assert!(matches!(frames[2], Decoded::Message(ServerMessage::DeleteProperty { .. })));
    }

    #[test]
    fn test_dangling_element_holds_back_the_buffer() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder
            .push(b"<message message=\"a\"/><defTextVector device=\"d\" name=\"p\">")
            .is_empty());
        let frames = decoder.push(b"<defText name=\"t\">x</defText></defTextVector>");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut decoder = FrameDecoder::default();
        let xml = "<message message=\"10°C\"/>".as_bytes();
        let split = xml.iter().position(|b| *b == 0xC2).unwrap() + 1;

        assert!(decoder.push(&xml[..split]).is_empty());
        let frames = decoder.push(&xml[split..]);
        match &frames[..] {
            [Decoded::Message(ServerMessage::Notification { message, .. })] => {
                assert_eq!(message, "10°C")
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_xml_characters_are_dropped() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(b"<message message=\"bad\x01char\"/>");
        match &frames[..] {
            [Decoded::Message(ServerMessage::Notification { message, .. })] => {
                assert_eq!(message, "badchar")
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_stall_is_reported_once() {
        let mut decoder = FrameDecoder::new(Duration::ZERO);
        assert_eq!(decoder.check_stall(), None);

        decoder.push(b"<setNumberVector device=\"d\" name=\"p\">");
        assert!(decoder.check_stall().is_some());
        assert_eq!(decoder.check_stall(), None);

        decoder.push(b"</setNumberVector>");
        assert_eq!(decoder.check_stall(), None);
    }

    #[derive(Default)]
    struct Recorder {
        established: AtomicUsize,
        closed: AtomicUsize,
        frames: Mutex<Vec<Decoded>>,
    }

    #[async_trait]
    impl TransportHandler for Recorder {
        async fn connection_established(&self) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        async fn frame_received(&self, frame: Decoded) {
            self.frames.lock().unwrap().push(frame);
        }

        async fn connection_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn transport_for(port: u16) -> Transport {
        Transport::new(
            IndiServer::new("127.0.0.1", port),
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_open_send_receive_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = transport_for(port);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn TransportHandler> = recorder.clone();

        let (opened, accepted) = tokio::join!(transport.open(Arc::downgrade(&handler)), listener.accept());
        opened.unwrap();
        let (server_side, _) = accepted.unwrap();
        assert!(transport.is_connected());
        assert_eq!(recorder.established.load(Ordering::SeqCst), 1);

        let (read_half, mut write_half) = server_side.into_split();
        transport.send("<getProperties version=\"1.7\"/>".to_string()).await.unwrap();
        let mut lines = tokio::io::BufReader::new(read_half).lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("<getProperties version=\"1.7\"/>")
        );

        write_half
            .write_all(b"<message device=\"Dome\" message=\"ready\"/>")
            .await
            .unwrap();
        wait_for(|| recorder.frames.lock().unwrap().len() == 1).await;

        assert!(transport.close().await);
        assert!(!transport.close().await);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            transport.send("<x/>".to_string()).await,
            Err(IndiError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_server_hangup_fires_closed_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = transport_for(port);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn TransportHandler> = recorder.clone();

        let (opened, accepted) = tokio::join!(transport.open(Arc::downgrade(&handler)), listener.accept());
        opened.unwrap();
        drop(accepted.unwrap());

        wait_for(|| recorder.closed.load(Ordering::SeqCst) == 1).await;
        assert!(!transport.is_connected());
        assert!(!transport.close().await);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_returns_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = transport_for(port);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn TransportHandler> = recorder.clone();

        let result = transport.open(Arc::downgrade(&handler)).await;
        assert!(matches!(result, Err(IndiError::ConnectionFailed(_))));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.established.load(Ordering::SeqCst), 0);
    }
}
