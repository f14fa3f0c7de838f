//! Session transport
//!
//! Owns one TCP session between two devices. The group owner listens and
//! accepts exactly one connection; the other side connects with bounded
//! retries. Once connected, a reader task and a writer task run until the
//! session ends:
//!
//! ```text
//! Idle -> Listening  -> Connected -> Disconnected
//! Idle -> Connecting -> Connected -> Disconnected
//! any  -> Failed(reason) -> Idle (after disconnect)
//! ```
//!
//! All state lives behind one mutex so transitions are never observed half
//! applied. I/O errors never surface to callers of `send_message`; they end
//! the session and produce a single `ConnectionLost` event.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use seatlink_core::{LinkConfig, MessageFrame};

use crate::error::{Error, Result};
use crate::frame::{write_frame, FrameReader};

/// Delay before each connect retry: 250ms, 500ms, 1s, 2s, 4s (capped)
const CONNECT_BACKOFF_MS: &[u64] = &[250, 500, 1000, 2000, 4000];

/// Identifies one transport instance, so events from a finished session can
/// be told apart from the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

impl SessionState {
    fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Listening | SessionState::Connecting | SessionState::Connected
        )
    }
}

/// Events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket is established and both loops are running
    Connected { session: SessionId, remote: SocketAddr },
    /// A frame arrived, in stream order
    Message {
        session: SessionId,
        frame: MessageFrame,
    },
    /// The session ended because of an I/O or protocol failure
    ConnectionLost { session: SessionId, reason: String },
}

impl TransportEvent {
    pub fn session(&self) -> SessionId {
        match self {
            TransportEvent::Connected { session, .. }
            | TransportEvent::Message { session, .. }
            | TransportEvent::ConnectionLost { session, .. } => *session,
        }
    }
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub queue_capacity: usize,
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for TransportConfig {
    fn from(config: &LinkConfig) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            connect_attempts: config.connect_attempts,
            connect_timeout: config.connect_timeout(),
        }
    }
}

struct Inner {
    state: SessionState,
    /// Bumped on every start and disconnect; tasks of an older generation
    /// may no longer change state
    generation: u64,
    outbound: Option<mpsc::Sender<MessageFrame>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    id: SessionId,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!(session = %self.id, "Event receiver dropped");
        }
    }

    /// Move to Connected and start both loops. Returns false if the attempt
    /// was superseded (disconnect or restart) while the socket was being set up.
    fn establish(
        self: &Arc<Self>,
        generation: u64,
        stream: TcpStream,
        remote: SocketAddr,
        queue_capacity: usize,
    ) -> bool {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let mut inner = self.lock();
        if inner.generation != generation
            || !matches!(inner.state, SessionState::Listening | SessionState::Connecting)
        {
            debug!(session = %self.id, remote = %remote, "Dropping superseded connection");
            return false;
        }
        let Some(shutdown_tx) = inner.shutdown.as_ref() else {
            return false;
        };
        let reader_shutdown = shutdown_tx.subscribe();
        let writer_shutdown = shutdown_tx.subscribe();

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(queue_capacity);

        inner.state = SessionState::Connected;
        inner.outbound = Some(tx);
        info!(session = %self.id, remote = %remote, "Session connected");

        // Emitted before the loops start so it precedes any Message event
        self.emit(TransportEvent::Connected {
            session: self.id,
            remote,
        });

        inner.tasks.push(tokio::spawn(reader_task(
            reader,
            self.clone(),
            generation,
            reader_shutdown,
        )));
        inner.tasks.push(tokio::spawn(writer_task(
            writer,
            rx,
            self.clone(),
            generation,
            writer_shutdown,
        )));
        true
    }

    /// Forward a received frame unless the session was superseded while it
    /// was being decoded
    fn deliver(&self, generation: u64, frame: MessageFrame) {
        let inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Connected {
            debug!(session = %self.id, "Dropping frame from superseded session");
            return;
        }
        self.emit(TransportEvent::Message {
            session: self.id,
            frame,
        });
    }

    /// Tear down after a reader or writer failure. Fires `ConnectionLost` at
    /// most once per session.
    fn lose(&self, generation: u64, err: &Error) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Connected {
            return;
        }

        inner.state = SessionState::Disconnected;
        inner.outbound = None;
        if let Some(shutdown_tx) = inner.shutdown.take() {
            let _ = shutdown_tx.send(true);
        }

        warn!(session = %self.id, error = %err, "Connection lost");
        self.emit(TransportEvent::ConnectionLost {
            session: self.id,
            reason: err.to_string(),
        });
    }

    /// Record a terminal failure of a start attempt
    fn fail(&self, generation: u64, reason: String) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        if let Some(shutdown_tx) = inner.shutdown.take() {
            let _ = shutdown_tx.send(true);
        }
        error!(session = %self.id, reason = %reason, "Session failed");
        inner.state = SessionState::Failed(reason);
    }
}

/// One socket session, either end
pub struct SessionTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
}

impl SessionTransport {
    pub fn new(
        id: SessionId,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                id,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    outbound: None,
                    shutdown: None,
                    tasks: Vec::new(),
                }),
                events,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// Claim the transport for a new session
    fn begin(&self, state: SessionState) -> Result<(u64, watch::Receiver<bool>)> {
        let mut inner = self.shared.lock();
        if inner.state.is_active() {
            return Err(Error::AlreadyActive);
        }

        inner.tasks.retain(|task| !task.is_finished());
        inner.generation += 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        inner.shutdown = Some(shutdown_tx);
        inner.outbound = None;
        inner.state = state;
        Ok((inner.generation, shutdown_rx))
    }

    /// Listen on `port` and accept the first incoming connection
    ///
    /// Returns the bound address as soon as the socket is listening; the
    /// `Connected` event follows when a peer connects.
    pub async fn start_as_host(&self, port: u16) -> Result<SocketAddr> {
        let (generation, shutdown_rx) = self.begin(SessionState::Listening)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.shared
                    .fail(generation, format!("Failed to bind port {}: {}", port, source));
                return Err(Error::PortBindFailed { port, source });
            }
        };
        let bound_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.shared.fail(generation, format!("Listener has no address: {}", e));
                return Err(Error::Io(e));
            }
        };

        let mut inner = self.shared.lock();
        if inner.generation != generation || inner.state != SessionState::Listening {
            return Err(Error::Cancelled);
        }
        inner.tasks.push(tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            generation,
            self.config.queue_capacity,
            shutdown_rx,
        )));

        info!(session = %self.shared.id, addr = %bound_addr, "Listening for peer");
        Ok(bound_addr)
    }

    /// Connect to the host, retrying a bounded number of times
    pub async fn connect_as_client(&self, host: IpAddr, port: u16) -> Result<SocketAddr> {
        let (generation, mut shutdown_rx) = self.begin(SessionState::Connecting)?;
        let target = SocketAddr::new(host, port);
        let attempts = self.config.connect_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(session = %self.shared.id, addr = %target, attempt, "Connecting to host");

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown_rx) => return Err(Error::Cancelled),
                result = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)) => result,
            };

            let err = match outcome {
                Ok(Ok(stream)) => {
                    return if self.shared.establish(
                        generation,
                        stream,
                        target,
                        self.config.queue_capacity,
                    ) {
                        Ok(target)
                    } else {
                        Err(Error::Cancelled)
                    };
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    Error::ConnectionRefused
                }
                Ok(Err(e)) => Error::Io(e),
                Err(_) => Error::ConnectionTimeout,
            };

            if attempt >= attempts {
                self.shared.fail(
                    generation,
                    format!("Giving up after {} attempts: {}", attempt, err),
                );
                return Err(err);
            }

            let delay_idx = (attempt as usize - 1).min(CONNECT_BACKOFF_MS.len() - 1);
            let delay = Duration::from_millis(CONNECT_BACKOFF_MS[delay_idx]);
            debug!(error = %err, delay_ms = delay.as_millis() as u64, "Connect attempt failed");

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown_rx) => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Queue a frame for transmission
    ///
    /// Returns false without blocking if the session is not connected or the
    /// queue is full. A true result does not mean the peer received it.
    pub fn send_message(&self, frame: MessageFrame) -> bool {
        let inner = self.shared.lock();
        if inner.state != SessionState::Connected {
            return false;
        }
        let Some(tx) = inner.outbound.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.shared.id, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// End the session and wait until every task has exited and the socket
    /// is closed
    ///
    /// Safe to call at any time, including during a connect attempt. Does not
    /// fire `ConnectionLost`.
    pub async fn disconnect(&self) {
        let tasks = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.outbound = None;
            if let Some(shutdown_tx) = inner.shutdown.take() {
                let _ = shutdown_tx.send(true);
            }
            inner.state = match inner.state {
                SessionState::Idle | SessionState::Failed(_) => SessionState::Idle,
                _ => SessionState::Disconnected,
            };
            std::mem::take(&mut inner.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(session = %self.shared.id, "Session task panicked");
                }
            }
        }
        debug!(session = %self.shared.id, "Session released");
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.outbound = None;
        if let Some(shutdown_tx) = inner.shutdown.take() {
            let _ = shutdown_tx.send(true);
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone
async fn cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Accept the first connection, then turn away everyone else until shutdown
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    generation: u64,
    queue_capacity: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut established = false;
    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown_rx) => {
                debug!(session = %shared.id, "Accept loop shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) if !established => {
                        debug!(addr = %addr, "New connection");
                        established = shared.establish(generation, stream, addr, queue_capacity);
                        if !established {
                            break;
                        }
                    }
                    Ok((stream, addr)) => {
                        warn!(addr = %addr, "Rejecting connection, session already established");
                        drop(stream);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }
}

/// Reader task - decodes frames and forwards them in arrival order
async fn reader_task(
    reader: OwnedReadHalf,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut frames = FrameReader::new(reader);
    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown_rx) => break,
            result = frames.next_frame() => match result {
                Ok(frame) => shared.deliver(generation, frame),
                Err(e) => {
                    shared.lose(generation, &e);
                    break;
                }
            }
        }
    }
    debug!(session = %shared.id, "Reader stopped");
}

/// Writer task - drains the outbound queue in enqueue order
async fn writer_task(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<MessageFrame>,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown_rx) => break,
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown_rx) => break,
            result = write_frame(&mut writer, &frame) => result,
        };
        if let Err(e) = result {
            shared.lose(generation, &e);
            break;
        }
    }
    debug!(session = %shared.id, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> TransportConfig {
        TransportConfig {
            queue_capacity: 64,
            connect_attempts: 2,
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn transport(id: u64) -> (SessionTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionTransport::new(SessionId(id), test_config(), tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn connected_pair() -> (
        SessionTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
        SessionTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
        SocketAddr,
    ) {
        let (host, mut host_rx) = transport(1);
        let (client, mut client_rx) = transport(2);

        let addr = host.start_as_host(0).await.unwrap();
        assert_eq!(host.state(), SessionState::Listening);

        client.connect_as_client(LOCALHOST, addr.port()).await.unwrap();
        assert!(matches!(next_event(&mut host_rx).await, TransportEvent::Connected { .. }));
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Connected { .. }));
        assert_eq!(host.state(), SessionState::Connected);
        assert_eq!(client.state(), SessionState::Connected);

        (host, host_rx, client, client_rx, addr)
    }

    #[tokio::test]
    async fn test_user_info_reaches_client() {
        let (host, _host_rx, client, mut client_rx, _) = connected_pair().await;

        let frame = MessageFrame::user_info("Pixel7", "12A", "Hello");
        assert!(host.send_message(frame.clone()));

        match next_event(&mut client_rx).await {
            TransportEvent::Message { session, frame: received } => {
                assert_eq!(session, SessionId(2));
                assert_eq!(received.sender_name, "Pixel7");
                assert_eq!(received.sender_seat, "12A");
                assert_eq!(received, frame);
            }
            other => panic!("Expected message, got {:?}", other),
        }

        host.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (host, mut host_rx, client, _client_rx, _) = connected_pair().await;

        let count = 50;
        for i in 0..count {
            assert!(client.send_message(MessageFrame::text("c", "1A", format!("{}", i))));
        }

        for i in 0..count {
            match next_event(&mut host_rx).await {
                TransportEvent::Message { frame, .. } => assert_eq!(frame.content, i.to_string()),
                other => panic!("Expected message, got {:?}", other),
            }
        }

        host.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_rejected_unless_connected() {
        let (t, _rx) = transport(1);
        let frame = MessageFrame::text("a", "1A", "x");
        assert_eq!(t.state(), SessionState::Idle);
        assert!(!t.send_message(frame.clone()));

        t.start_as_host(0).await.unwrap();
        assert_eq!(t.state(), SessionState::Listening);
        assert!(!t.send_message(frame.clone()));

        t.disconnect().await;
        assert_eq!(t.state(), SessionState::Disconnected);
        assert!(!t.send_message(frame));
    }

    #[tokio::test]
    async fn test_remote_close_fires_lost_once() {
        let (host, mut host_rx, client, _client_rx, _) = connected_pair().await;

        client.disconnect().await;

        match next_event(&mut host_rx).await {
            TransportEvent::ConnectionLost { session, .. } => assert_eq!(session, SessionId(1)),
            other => panic!("Expected connection lost, got {:?}", other),
        }
        assert_eq!(host.state(), SessionState::Disconnected);
        assert!(!host.send_message(MessageFrame::text("h", "1A", "late")));

        host.disconnect().await;
        assert!(timeout(Duration::from_millis(200), host_rx.recv())
            .await
            .map(|event| event.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_oversized_prefix_closes_connection() {
        let (host, mut host_rx) = transport(1);
        let addr = host.start_as_host(0).await.unwrap();

        let mut raw = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
        assert!(matches!(next_event(&mut host_rx).await, TransportEvent::Connected { .. }));

        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        match next_event(&mut host_rx).await {
            TransportEvent::ConnectionLost { reason, .. } => assert!(reason.contains("too large")),
            other => panic!("Expected connection lost, got {:?}", other),
        }
        host.disconnect().await;
    }

    #[tokio::test]
    async fn test_extra_connection_rejected() {
        let (host, _host_rx, client, _client_rx, addr) = connected_pair().await;

        // The listener stays open; a second peer is dropped right away
        if let Ok(mut extra) = TcpStream::connect((LOCALHOST, addr.port())).await {
            let mut buf = [0u8; 1];
            let n = timeout(WAIT, tokio::io::AsyncReadExt::read(&mut extra, &mut buf))
                .await
                .expect("extra connection was not closed");
            assert!(matches!(n, Ok(0) | Err(_)));
        }
        assert_eq!(host.state(), SessionState::Connected);
        assert!(client.send_message(MessageFrame::text("c", "1A", "still here")));

        host.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_restart_on_same_port() {
        let (host, mut host_rx) = transport(1);
        let (client, _client_rx) = transport(2);

        let addr = host.start_as_host(0).await.unwrap();
        client.connect_as_client(LOCALHOST, addr.port()).await.unwrap();
        assert!(matches!(next_event(&mut host_rx).await, TransportEvent::Connected { .. }));

        host.disconnect().await;
        client.disconnect().await;

        let again = host.start_as_host(addr.port()).await.unwrap();
        assert_eq!(again.port(), addr.port());
        client.connect_as_client(LOCALHOST, addr.port()).await.unwrap();
        assert!(matches!(next_event(&mut host_rx).await, TransportEvent::Connected { .. }));

        host.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused_after_retries() {
        // Reserve a port, then free it so nothing listens there
        let port = {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (client, _rx) = transport(1);
        let result = client.connect_as_client(LOCALHOST, port).await;
        assert!(matches!(result, Err(Error::ConnectionRefused)));
        assert!(matches!(client.state(), SessionState::Failed(_)));

        client.disconnect().await;
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let (host, _rx) = transport(1);
        let result = host.start_as_host(port).await;
        assert!(matches!(result, Err(Error::PortBindFailed { .. })));
        assert!(matches!(host.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect() {
        let port = {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(SessionTransport::new(
            SessionId(1),
            TransportConfig {
                connect_attempts: 10,
                ..test_config()
            },
            tx,
        ));

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect_as_client(LOCALHOST, port).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(WAIT, client.disconnect()).await.unwrap();
        let result = timeout(WAIT, connecting).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_while_active_rejected() {
        let (host, _rx) = transport(1);
        host.start_as_host(0).await.unwrap();
        assert!(matches!(host.start_as_host(0).await, Err(Error::AlreadyActive)));
        assert!(matches!(
            host.connect_as_client(LOCALHOST, 1).await,
            Err(Error::AlreadyActive)
        ));
        host.disconnect().await;
    }

    #[tokio::test]
    async fn test_frames_after_disconnect_dropped() {
        let (t, mut rx) = transport(9);
        let generation = {
            let mut inner = t.shared.lock();
            inner.generation += 1;
            inner.state = SessionState::Connected;
            inner.generation
        };

        t.shared.deliver(generation, MessageFrame::text("Galaxy", "14C", "live"));
        t.disconnect().await;
        // A frame decoded just before the disconnect took effect
        t.shared.deliver(generation, MessageFrame::text("Galaxy", "14C", "stale"));

        match rx.try_recv() {
            Ok(TransportEvent::Message { frame, .. }) => assert_eq!(frame.content, "live"),
            other => panic!("Expected message, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
