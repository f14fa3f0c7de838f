//! Session orchestration
//!
//! Single façade for the front end: discovery controls, connecting to a
//! peer, sending, disconnecting. The role resolved by group formation picks
//! the transport mode (owner listens, the other side connects), and at most
//! one transport exists at a time.
//!
//! Every notification is delivered from one dispatcher task, in order, so
//! listener code never runs concurrently with itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use seatlink_core::{ConnectionRole, LinkConfig, MessageFrame, PeerDescriptor};

use crate::discovery::{
    DiscoveryConfig, DiscoveryCoordinator, DiscoveryEvent, DiscoverySubstrate, SubstrateEvent,
};
use crate::error::{Error, Result};
use crate::transport::{SessionId, SessionState, SessionTransport, TransportConfig, TransportEvent};

/// Receives orchestrator notifications
///
/// All methods are called from the same dispatcher task, one at a time.
/// They should return quickly; hand heavy work to another task.
pub trait SessionListener: Send + Sync + 'static {
    /// Full peer set after any change
    fn on_peers_changed(&self, _peers: &[PeerDescriptor]) {}

    /// The local device as the substrate sees it
    fn on_device_changed(&self, _device: &PeerDescriptor) {}

    fn on_connection_established(&self, _role: &ConnectionRole) {}

    fn on_message_received(&self, _frame: &MessageFrame) {}

    /// The current session ended on an I/O or protocol failure. Not called
    /// for an explicit `disconnect`.
    fn on_connection_lost(&self) {}

    /// A group formed by a remote invitation, but our end of the session
    /// could not be started. The group has already been left.
    fn on_session_failed(&self, _reason: &str) {}

    fn on_discovery_failed(&self, _reason: &str) {}
}

/// Notifications raised by the orchestrator itself
#[derive(Debug)]
enum Notice {
    SessionFailed(String),
}

struct ActiveSession {
    transport: Arc<SessionTransport>,
    role: ConnectionRole,
}

/// Channels that exist between `initialize` and `cleanup`
#[derive(Default)]
struct Links {
    discovery: Option<Arc<DiscoveryCoordinator>>,
    transport_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    notice_tx: Option<mpsc::UnboundedSender<Notice>>,
}

struct Lifecycle {
    substrate_rx: Option<mpsc::UnboundedReceiver<SubstrateEvent>>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Inner {
    config: LinkConfig,
    substrate: Arc<dyn DiscoverySubstrate>,
    listener: Arc<dyn SessionListener>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    links: Mutex<Links>,
    session: Mutex<Option<ActiveSession>>,
    next_session: AtomicU64,
}

/// Façade over discovery and the session transport
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        config: LinkConfig,
        substrate: Arc<dyn DiscoverySubstrate>,
        substrate_rx: mpsc::UnboundedReceiver<SubstrateEvent>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                substrate,
                listener,
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    substrate_rx: Some(substrate_rx),
                    dispatcher: None,
                }),
                links: Mutex::new(Links::default()),
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire discovery and event delivery; no-op if already initialized
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.dispatcher.is_some() {
            return Ok(());
        }
        let substrate_rx = lifecycle
            .substrate_rx
            .take()
            .ok_or_else(|| Error::DiscoveryFailed("Discovery substrate unavailable".into()))?;

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let coordinator = DiscoveryCoordinator::spawn(
            self.inner.substrate.clone(),
            substrate_rx,
            DiscoveryConfig::from(&self.inner.config),
            discovery_tx,
        );

        *self.inner.links() = Links {
            discovery: Some(Arc::new(coordinator)),
            transport_tx: Some(transport_tx),
            notice_tx: Some(notice_tx),
        };
        lifecycle.dispatcher = Some(tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            discovery_rx,
            transport_rx,
            notice_rx,
        )));

        info!("Orchestrator initialized");
        Ok(())
    }

    /// Release everything `initialize` acquired; the orchestrator can be
    /// initialized again afterwards
    pub async fn cleanup(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.disconnect().await;

        let links = std::mem::take(&mut *self.inner.links());
        if let Some(discovery) = links.discovery {
            discovery.stop_discovery().await;
            if let Some(rx) = discovery.shutdown().await {
                lifecycle.substrate_rx = Some(rx);
            }
        }
        drop(links.transport_tx);

        if let Some(dispatcher) = lifecycle.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        info!("Orchestrator cleaned up");
    }

    pub async fn start_discovery(&self) -> Result<()> {
        self.inner.discovery()?.start_discovery().await
    }

    pub async fn stop_discovery(&self) {
        if let Ok(discovery) = self.inner.discovery() {
            discovery.stop_discovery().await;
        }
    }

    /// Current peer set
    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        match self.inner.discovery() {
            Ok(discovery) => discovery.peers().await,
            Err(_) => Vec::new(),
        }
    }

    /// Form a group with `peer` and start the matching session
    ///
    /// Any existing session is disconnected first. Resolves once the role is
    /// known and the transport is listening (host) or connected (client).
    pub async fn connect_to_peer(&self, peer: &PeerDescriptor) -> Result<ConnectionRole> {
        let discovery = self.inner.discovery()?;
        self.disconnect().await;

        info!(peer = %peer.id, name = %peer.name, "Connecting to peer");
        let role = discovery.request_connection(&peer.id).await?;
        self.inner.start_session(role).await?;
        Ok(role)
    }

    /// Queue a frame on the current session; false if there is none or it
    /// is not connected
    pub fn send_message(&self, frame: MessageFrame) -> bool {
        match self.inner.session().as_ref() {
            Some(active) => active.transport.send_message(frame),
            None => false,
        }
    }

    /// End the current session, if any, and leave the group
    pub async fn disconnect(&self) {
        self.inner.end_session().await;
    }

    pub fn session_state(&self) -> SessionState {
        match self.inner.session().as_ref() {
            Some(active) => active.transport.state(),
            None => SessionState::Idle,
        }
    }

    /// Role of the current session
    pub fn role(&self) -> Option<ConnectionRole> {
        self.inner.session().as_ref().map(|active| active.role)
    }
}

impl Inner {
    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discovery(&self) -> Result<Arc<DiscoveryCoordinator>> {
        self.links().discovery.clone().ok_or(Error::NotInitialized)
    }

    fn current_session(&self) -> Option<(SessionId, ConnectionRole)> {
        self.session()
            .as_ref()
            .map(|active| (active.transport.id(), active.role))
    }

    /// Take the slot if it still holds session `id`
    fn take_session(&self, id: SessionId) -> Option<ActiveSession> {
        let mut slot = self.session();
        if slot.as_ref().map(|active| active.transport.id()) == Some(id) {
            slot.take()
        } else {
            None
        }
    }

    fn notify(&self, notice: Notice) {
        let sent = match &self.links().notice_tx {
            Some(tx) => tx.send(notice).is_ok(),
            None => false,
        };
        if !sent {
            debug!("Dispatcher gone, dropping notice");
        }
    }

    async fn end_session(&self) {
        let active = self.session().take();
        if let Some(active) = active {
            self.teardown(active).await;
        }
    }

    /// Shared by explicit disconnects and failures: close the socket and
    /// leave the group
    async fn teardown(&self, active: ActiveSession) {
        info!(session = %active.transport.id(), "Tearing down session");
        active.transport.disconnect().await;
        self.leave_group().await;
    }

    async fn leave_group(&self) {
        if let Ok(discovery) = self.discovery() {
            discovery.remove_group().await;
        }
    }

    /// Create the transport for `role` and start it
    async fn start_session(&self, role: ConnectionRole) -> Result<()> {
        let events = self
            .links()
            .transport_tx
            .clone()
            .ok_or(Error::NotInitialized)?;

        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let transport = Arc::new(SessionTransport::new(
            id,
            TransportConfig::from(&self.config),
            events,
        ));

        let previous = self.session().replace(ActiveSession {
            transport: transport.clone(),
            role,
        });
        if let Some(previous) = previous {
            warn!(session = %previous.transport.id(), "Replacing active session");
            previous.transport.disconnect().await;
        }

        info!(session = %id, role = %role, "Starting session");
        let port = self.config.session_port;
        let result = match role {
            ConnectionRole::Host => transport.start_as_host(port).await.map(|_| ()),
            ConnectionRole::Client(host) => transport.connect_as_client(host, port).await.map(|_| ()),
        };

        if let Err(e) = &result {
            warn!(session = %id, error = %e, "Session failed to start");
            // Only a session still in the slot owns the group; a replaced or
            // disconnected one has already been dealt with
            match self.take_session(id) {
                Some(active) => self.teardown(active).await,
                None => transport.disconnect().await,
            }
        }
        result
    }

    fn on_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeersChanged(peers) => self.listener.on_peers_changed(&peers),
            DiscoveryEvent::DeviceChanged(device) => self.listener.on_device_changed(&device),
            DiscoveryEvent::GroupFormed(role) => {
                // Invited side: start our end without blocking delivery
                let inner = self.clone();
                tokio::spawn(async move {
                    match inner.start_session(role).await {
                        Ok(()) => {}
                        Err(Error::Cancelled) => debug!("Invited session cancelled"),
                        Err(e) => {
                            warn!(error = %e, "Could not start invited session");
                            inner.notify(Notice::SessionFailed(e.to_string()));
                        }
                    }
                });
            }
            DiscoveryEvent::DiscoveryFailed(reason) => self.listener.on_discovery_failed(&reason),
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let Some((current, role)) = self.current_session() else {
            debug!(session = %event.session(), "Dropping event, no active session");
            return;
        };
        if event.session() != current {
            debug!(session = %event.session(), current = %current, "Dropping stale event");
            return;
        }

        match event {
            TransportEvent::Connected { remote, .. } => {
                debug!(remote = %remote, "Connection established");
                self.listener.on_connection_established(&role);
            }
            TransportEvent::Message { frame, .. } => self.listener.on_message_received(&frame),
            TransportEvent::ConnectionLost { session, reason } => {
                // Same teardown as disconnect, off the dispatcher
                if let Some(active) = self.take_session(session) {
                    let inner = self.clone();
                    tokio::spawn(async move { inner.teardown(active).await });
                }
                debug!(reason = %reason, "Notifying connection lost");
                self.listener.on_connection_lost();
            }
        }
    }
}

/// Dispatcher task - the one place listener callbacks run
async fn dispatch_loop(
    inner: Weak<Inner>,
    mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut notice_rx: mpsc::UnboundedReceiver<Notice>,
) {
    let mut discovery_open = true;
    let mut transport_open = true;
    let mut notice_open = true;

    while discovery_open || transport_open || notice_open {
        tokio::select! {
            event = discovery_rx.recv(), if discovery_open => match event {
                Some(event) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_discovery_event(event);
                }
                None => discovery_open = false,
            },
            event = transport_rx.recv(), if transport_open => match event {
                Some(event) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_transport_event(event);
                }
                None => transport_open = false,
            },
            notice = notice_rx.recv(), if notice_open => match notice {
                Some(Notice::SessionFailed(reason)) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.listener.on_session_failed(&reason);
                }
                None => notice_open = false,
            },
        }
    }
    debug!("Dispatcher stopped");
}
