//! Peer discovery and group formation
//!
//! The platform capability that actually finds devices and forms a pairing
//! group is abstracted as a [`DiscoverySubstrate`]: a small synchronous
//! command surface plus a stream of [`SubstrateEvent`]s. The coordinator owns
//! the peer set, re-issues discovery on a fixed interval, ages out peers that
//! stop answering, and turns a group-formed event into a [`ConnectionRole`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use seatlink_core::{ConnectionRole, LinkConfig, PeerDescriptor, PeerId};

use crate::error::{Error, Result};

/// Outcome of group formation as reported by the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Peer the group was formed with, when the substrate knows it
    pub peer: Option<PeerId>,
    pub is_group_owner: bool,
    pub group_owner_address: Option<IpAddr>,
}

impl GroupInfo {
    /// Map to a role: the owner hosts, everyone else connects to the owner
    pub fn role(&self) -> Result<ConnectionRole> {
        if self.is_group_owner {
            return Ok(ConnectionRole::Host);
        }
        self.group_owner_address
            .map(ConnectionRole::Client)
            .ok_or_else(|| Error::DiscoveryFailed("Group formed without owner address".into()))
    }
}

/// Why the substrate could not form a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    Rejected(String),
    PeerVanished,
    Other(String),
}

impl From<ConnectFailure> for Error {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Rejected(reason) => Error::Rejected(reason),
            ConnectFailure::PeerVanished => Error::PeerVanished,
            ConnectFailure::Other(reason) => Error::DiscoveryFailed(reason),
        }
    }
}

/// Notifications from the discovery substrate
#[derive(Debug, Clone)]
pub enum SubstrateEvent {
    /// Peers seen since the last report; peers not listed are not removed
    PeersObserved(Vec<PeerDescriptor>),
    LocalDeviceChanged(PeerDescriptor),
    GroupFormed(GroupInfo),
    ConnectFailed { peer: PeerId, reason: ConnectFailure },
    DiscoveryFailed(String),
}

/// Platform capability that finds nearby devices and forms pairing groups
///
/// Commands return immediately; results arrive as [`SubstrateEvent`]s on the
/// channel handed to the coordinator.
pub trait DiscoverySubstrate: Send + Sync + 'static {
    /// Run one discovery round
    fn discover_peers(&self) -> Result<()>;

    fn stop_peer_discovery(&self);

    /// Start forming a group with `peer`
    fn connect(&self, peer: &PeerId) -> Result<()>;

    fn cancel_connect(&self, peer: &PeerId);

    /// Leave the current group, if any
    fn remove_group(&self);
}

/// Notifications from the coordinator
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Full current peer set, sorted by name
    PeersChanged(Vec<PeerDescriptor>),
    DeviceChanged(PeerDescriptor),
    /// A group formed that this side did not request (it was invited)
    GroupFormed(ConnectionRole),
    DiscoveryFailed(String),
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    pub stale_after_cycles: u64,
    pub group_formation_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for DiscoveryConfig {
    fn from(config: &LinkConfig) -> Self {
        Self {
            interval: config.discovery_interval(),
            stale_after_cycles: u64::from(config.stale_after_cycles),
            group_formation_timeout: config.group_formation_timeout(),
        }
    }
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop,
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<ConnectionRole>>,
    },
    CancelConnect(PeerId),
    RemoveGroup,
    Snapshot(oneshot::Sender<Vec<PeerDescriptor>>),
    Shutdown,
}

/// Handle to the coordinator task
pub struct DiscoveryCoordinator {
    cmd_tx: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<SubstrateEvent>>>>,
}

impl DiscoveryCoordinator {
    /// Spawn the coordinator task
    pub fn spawn(
        substrate: Arc<dyn DiscoverySubstrate>,
        substrate_rx: mpsc::UnboundedReceiver<SubstrateEvent>,
        config: DiscoveryConfig,
        event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let state = CoordinatorState {
            substrate,
            config,
            event_tx,
            active: false,
            cycle: 0,
            peers: BTreeMap::new(),
            pending: HashMap::new(),
            abandoned: HashMap::new(),
        };
        let task = tokio::spawn(coordinator_task(state, cmd_rx, substrate_rx));

        Self {
            cmd_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Begin periodic discovery; no-op if already running
    pub async fn start_discovery(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Start(tx)).await?;
        rx.await.map_err(|_| Error::NotInitialized)?
    }

    /// Halt discovery and forget the peer set
    pub async fn stop_discovery(&self) {
        let _ = self.command(Command::Stop).await;
    }

    /// Current peer set
    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Form a group with `peer` and wait for the resulting role
    ///
    /// The coordinator enforces the group formation timeout itself, so
    /// dropping this future early does not leave the peer blocked.
    pub async fn request_connection(&self, peer: &PeerId) -> Result<ConnectionRole> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect {
            peer: peer.clone(),
            reply: tx,
        })
        .await?;

        rx.await
            .unwrap_or_else(|_| Err(Error::DiscoveryFailed("Coordinator stopped".into())))
    }

    /// Ask the substrate to leave the current group
    pub async fn remove_group(&self) {
        let _ = self.command(Command::RemoveGroup).await;
    }

    /// Stop the task and hand back the substrate event receiver
    ///
    /// Pending connection requests fail with `Cancelled`. Returns `None` if
    /// the coordinator was already shut down.
    pub async fn shutdown(&self) -> Option<mpsc::UnboundedReceiver<SubstrateEvent>> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = self.command(Command::Shutdown).await;
        match task.await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!(error = %e, "Discovery task failed");
                None
            }
        }
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::NotInitialized)
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Result<ConnectionRole>>,
    deadline: Instant,
}

struct TrackedPeer {
    descriptor: PeerDescriptor,
    last_seen_cycle: u64,
}

struct CoordinatorState {
    substrate: Arc<dyn DiscoverySubstrate>,
    config: DiscoveryConfig,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    active: bool,
    cycle: u64,
    peers: BTreeMap<PeerId, TrackedPeer>,
    pending: HashMap<PeerId, PendingRequest>,
    /// Peers whose request timed out or was cancelled, with when. A group
    /// that still forms with one of them is left instead of surfaced.
    abandoned: HashMap<PeerId, Instant>,
}

impl CoordinatorState {
    fn emit(&self, event: DiscoveryEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Discovery event receiver dropped");
        }
    }

    fn snapshot(&self) -> Vec<PeerDescriptor> {
        let mut peers: Vec<PeerDescriptor> =
            self.peers.values().map(|p| p.descriptor.clone()).collect();
        peers.sort_by(|a, b| {
            a.display_name()
                .cmp(b.display_name())
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    fn publish(&self) {
        self.emit(DiscoveryEvent::PeersChanged(self.snapshot()));
    }

    fn start(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        self.substrate.discover_peers()?;
        self.active = true;
        info!("Discovery started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.substrate.stop_peer_discovery();
        if !self.peers.is_empty() {
            self.peers.clear();
            self.publish();
        }
        info!("Discovery stopped");
    }

    /// One discovery cycle: age out silent peers, then ask again
    fn tick(&mut self) {
        self.cycle += 1;

        let cycle = self.cycle;
        let stale_after = self.config.stale_after_cycles;
        let before = self.peers.len();
        self.peers
            .retain(|_, p| cycle.saturating_sub(p.last_seen_cycle) < stale_after);
        if self.peers.len() != before {
            debug!(dropped = before - self.peers.len(), "Dropped stale peers");
            self.publish();
        }

        if let Err(e) = self.substrate.discover_peers() {
            warn!(error = %e, "Discovery round failed");
            self.emit(DiscoveryEvent::DiscoveryFailed(e.to_string()));
        }
    }

    fn observe(&mut self, observed: Vec<PeerDescriptor>) {
        if !self.active {
            return;
        }
        let mut changed = false;
        for descriptor in observed {
            match self.peers.get_mut(&descriptor.id) {
                Some(tracked) => {
                    tracked.last_seen_cycle = self.cycle;
                    if tracked.descriptor != descriptor {
                        tracked.descriptor = descriptor;
                        changed = true;
                    }
                }
                None => {
                    debug!(peer = %descriptor.id, name = %descriptor.name, "Peer discovered");
                    self.peers.insert(
                        descriptor.id.clone(),
                        TrackedPeer {
                            descriptor,
                            last_seen_cycle: self.cycle,
                        },
                    );
                    changed = true;
                }
            }
        }
        if changed {
            self.publish();
        }
    }

    fn connect(&mut self, peer: PeerId, reply: oneshot::Sender<Result<ConnectionRole>>) {
        if let Some(existing) = self.pending.get(&peer) {
            if !existing.reply.is_closed() {
                let _ = reply.send(Err(Error::DuplicateRequest));
                return;
            }
            // Nobody is waiting on the old request any more
            debug!(peer = %peer, "Replacing abandoned request");
            self.pending.remove(&peer);
            self.substrate.cancel_connect(&peer);
        }
        if !self.peers.contains_key(&peer) {
            let _ = reply.send(Err(Error::PeerVanished));
            return;
        }
        if let Err(e) = self.substrate.connect(&peer) {
            let _ = reply.send(Err(e));
            return;
        }
        info!(peer = %peer, "Group formation requested");
        self.abandoned.remove(&peer);
        self.pending.insert(
            peer,
            PendingRequest {
                reply,
                deadline: Instant::now() + self.config.group_formation_timeout,
            },
        );
    }

    /// Cancel with the substrate and remember the peer for a while
    fn abandon(&mut self, peer: &PeerId) {
        self.substrate.cancel_connect(peer);
        let now = Instant::now();
        let grace = self.config.group_formation_timeout;
        self.abandoned.retain(|_, at| now.duration_since(*at) < grace);
        self.abandoned.insert(peer.clone(), now);
    }

    /// True if a group with `peer` belongs to an abandoned request
    fn take_abandoned(&mut self, peer: Option<&PeerId>) -> bool {
        let grace = self.config.group_formation_timeout;
        match peer {
            Some(peer) => self
                .abandoned
                .remove(peer)
                .is_some_and(|at| at.elapsed() < grace),
            None => {
                let late = self.abandoned.values().any(|at| at.elapsed() < grace);
                self.abandoned.clear();
                late
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Fail every request whose group formation deadline has passed
    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in expired {
            if let Some(request) = self.pending.remove(&peer) {
                warn!(peer = %peer, "Group formation timed out");
                let _ = request.reply.send(Err(Error::ConnectionTimeout));
                self.abandon(&peer);
            }
        }
    }

    fn group_formed(&mut self, info: GroupInfo) {
        let role = info.role();

        let requested = match &info.peer {
            Some(peer) => self.pending.remove(peer),
            None if self.pending.len() == 1 => {
                let peer = self.pending.keys().next().cloned();
                peer.and_then(|p| self.pending.remove(&p))
            }
            None => None,
        };

        let late = requested.is_none() && self.take_abandoned(info.peer.as_ref());

        match (requested, role) {
            (Some(request), role) => {
                let formed = role.is_ok();
                if let Ok(role) = &role {
                    info!(role = %role, "Group formed");
                }
                if request.reply.send(role).is_err() && formed {
                    warn!("Requester went away, leaving group");
                    self.substrate.remove_group();
                }
            }
            (None, _) if late => {
                info!(peer = ?info.peer, "Leaving group formed after its request was given up");
                self.substrate.remove_group();
            }
            (None, Ok(role)) => {
                info!(role = %role, "Group formed by remote invitation");
                self.emit(DiscoveryEvent::GroupFormed(role));
            }
            (None, Err(e)) => {
                warn!(error = %e, "Ignoring unusable group");
            }
        }
    }

    /// Returns true when this command just activated discovery
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(reply) => {
                let was_active = self.active;
                let _ = reply.send(self.start());
                return !was_active && self.active;
            }
            Command::Stop => self.stop(),
            Command::Connect { peer, reply } => self.connect(peer, reply),
            Command::CancelConnect(peer) => {
                if self.pending.remove(&peer).is_some() {
                    self.abandon(&peer);
                }
            }
            Command::RemoveGroup => self.substrate.remove_group(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the task loop
            Command::Shutdown => {}
        }
        false
    }

    fn handle_substrate(&mut self, event: SubstrateEvent) {
        match event {
            SubstrateEvent::PeersObserved(peers) => self.observe(peers),
            SubstrateEvent::LocalDeviceChanged(device) => {
                self.emit(DiscoveryEvent::DeviceChanged(device));
            }
            SubstrateEvent::GroupFormed(info) => self.group_formed(info),
            SubstrateEvent::ConnectFailed { peer, reason } => {
                warn!(peer = %peer, reason = ?reason, "Group formation failed");
                if let Some(request) = self.pending.remove(&peer) {
                    let _ = request.reply.send(Err(reason.into()));
                }
            }
            SubstrateEvent::DiscoveryFailed(reason) => {
                warn!(reason = %reason, "Discovery failed");
                self.emit(DiscoveryEvent::DiscoveryFailed(reason));
            }
        }
    }
}

/// Main coordinator task
async fn coordinator_task(
    mut state: CoordinatorState,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut substrate_rx: mpsc::UnboundedReceiver<SubstrateEvent>,
) -> mpsc::UnboundedReceiver<SubstrateEvent> {
    let mut ticker = tokio::time::interval(state.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut substrate_open = true;

    loop {
        let deadline = state.next_deadline();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Shutdown) | None => {
                        debug!("Discovery coordinator shutting down");
                        break;
                    }
                    Some(cmd) => {
                        if state.handle_command(cmd) {
                            ticker.reset();
                        }
                    }
                }
            }

            event = substrate_rx.recv(), if substrate_open => {
                match event {
                    Some(event) => state.handle_substrate(event),
                    None => {
                        warn!("Discovery substrate went away");
                        substrate_open = false;
                    }
                }
            }

            _ = ticker.tick(), if state.active => state.tick(),

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() => state.expire(),
        }
    }

    state.stop();
    for (peer, request) in state.pending.drain() {
        state.substrate.cancel_connect(&peer);
        let _ = request.reply.send(Err(Error::Cancelled));
    }
    substrate_rx
}
