//! LAN discovery substrate
//!
//! Stands in for a radio pairing stack on an ordinary network: devices find
//! each other with UDP broadcast and form a two-device group by exchanging an
//! invitation. Whoever advertises the higher group owner intent hosts the
//! session; equal intents fall back to comparing device ids.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use seatlink_core::{LinkConfig, PeerDescriptor, PeerId, PeerStatus};
use seatlink_net::{ConnectFailure, DiscoverySubstrate, Error, GroupInfo, Result, SubstrateEvent};

/// Largest datagram we expect
const MAX_DATAGRAM: usize = 2048;

/// Announce replies are spread over this window so a query does not get
/// every answer at once
const ANNOUNCE_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LanMessage {
    Query { from: PeerId, name: String },
    Announce { from: PeerId, name: String },
    Invite { from: PeerId, name: String, intent: u8 },
    Accept { from: PeerId, intent: u8 },
    Reject { from: PeerId, reason: String },
    Leave { from: PeerId },
}

impl LanMessage {
    fn sender(&self) -> &PeerId {
        match self {
            LanMessage::Query { from, .. }
            | LanMessage::Announce { from, .. }
            | LanMessage::Invite { from, .. }
            | LanMessage::Accept { from, .. }
            | LanMessage::Reject { from, .. }
            | LanMessage::Leave { from } => from,
        }
    }
}

/// True if the local side becomes group owner
///
/// Both sides evaluate this with the arguments swapped, so exactly one of
/// them wins as long as the ids differ.
pub fn resolve_group_owner(local: (u8, &PeerId), remote: (u8, &PeerId)) -> bool {
    match local.0.cmp(&remote.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => local.1 > remote.1,
    }
}

/// What handling one datagram produced
#[derive(Debug, Default)]
struct Handled {
    events: Vec<SubstrateEvent>,
    /// Sent back to the datagram's source
    reply: Option<LanMessage>,
    /// Reply should be delayed by a random jitter
    jitter: bool,
}

#[derive(Debug, Clone)]
struct KnownPeer {
    name: String,
    addr: SocketAddr,
}

/// Protocol state for one device, independent of the socket
#[derive(Debug)]
struct LanNode {
    id: PeerId,
    name: String,
    intent: u8,
    known: HashMap<PeerId, KnownPeer>,
    /// Peers we invited and have not heard back from
    pending: HashSet<PeerId>,
    group: Option<(PeerId, SocketAddr)>,
}

impl LanNode {
    fn new(id: PeerId, name: String, intent: u8) -> Self {
        Self {
            id,
            name,
            intent,
            known: HashMap::new(),
            pending: HashSet::new(),
            group: None,
        }
    }

    fn descriptor(&self) -> PeerDescriptor {
        let status = if self.group.is_some() {
            PeerStatus::Connected
        } else {
            PeerStatus::Available
        };
        PeerDescriptor::new(self.id.clone(), self.name.clone(), status)
    }

    fn status_of(&self, peer: &PeerId) -> PeerStatus {
        match &self.group {
            Some((grouped, _)) if grouped == peer => PeerStatus::Connected,
            Some(_) => PeerStatus::Available,
            None if self.pending.contains(peer) => PeerStatus::Invited,
            None => PeerStatus::Available,
        }
    }

    fn observed(&mut self, peer: PeerId, name: String, addr: SocketAddr) -> SubstrateEvent {
        self.known.insert(
            peer.clone(),
            KnownPeer {
                name: name.clone(),
                addr,
            },
        );
        let status = self.status_of(&peer);
        SubstrateEvent::PeersObserved(vec![PeerDescriptor::new(peer, name, status)])
    }

    fn group_formed(&mut self, peer: PeerId, intent: u8, addr: SocketAddr) -> SubstrateEvent {
        let is_group_owner = resolve_group_owner((self.intent, &self.id), (intent, &peer));
        info!(peer = %peer, owner = is_group_owner, "Group formed");
        self.group = Some((peer.clone(), addr));
        SubstrateEvent::GroupFormed(GroupInfo {
            peer: Some(peer),
            is_group_owner,
            group_owner_address: (!is_group_owner).then(|| addr.ip()),
        })
    }

    fn handle(&mut self, msg: LanMessage, src: SocketAddr) -> Handled {
        let mut out = Handled::default();
        if msg.sender() == &self.id {
            return out;
        }

        match msg {
            LanMessage::Query { from, name } => {
                out.events.push(self.observed(from, name, src));
                out.reply = Some(LanMessage::Announce {
                    from: self.id.clone(),
                    name: self.name.clone(),
                });
                out.jitter = true;
            }
            LanMessage::Announce { from, name } => {
                out.events.push(self.observed(from, name, src));
            }
            LanMessage::Invite { from, name, intent } => {
                let busy = matches!(&self.group, Some((grouped, _)) if grouped != &from);
                if busy {
                    debug!(peer = %from, "Rejecting invitation, already grouped");
                    out.reply = Some(LanMessage::Reject {
                        from: self.id.clone(),
                        reason: "busy".into(),
                    });
                    return out;
                }

                out.events.push(self.observed(from.clone(), name, src));
                self.pending.remove(&from);
                out.events.push(self.group_formed(from, intent, src));
                out.reply = Some(LanMessage::Accept {
                    from: self.id.clone(),
                    intent: self.intent,
                });
            }
            LanMessage::Accept { from, intent } => {
                if !self.pending.remove(&from) {
                    debug!(peer = %from, "Ignoring unsolicited accept");
                    return out;
                }
                out.events.push(self.group_formed(from, intent, src));
            }
            LanMessage::Reject { from, reason } => {
                if self.pending.remove(&from) {
                    out.events.push(SubstrateEvent::ConnectFailed {
                        peer: from,
                        reason: ConnectFailure::Rejected(reason),
                    });
                }
            }
            LanMessage::Leave { from } => {
                if matches!(&self.group, Some((grouped, _)) if grouped == &from) {
                    info!(peer = %from, "Peer left the group");
                    self.group = None;
                }
            }
        }
        out
    }
}

struct Shared {
    node: Mutex<LanNode>,
    socket: UdpSocket,
    broadcast: SocketAddr,
    events: mpsc::UnboundedSender<SubstrateEvent>,
}

impl Shared {
    fn node(&self) -> std::sync::MutexGuard<'_, LanNode> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SubstrateEvent) {
        if self.events.send(event).is_err() {
            debug!("Substrate event receiver dropped");
        }
    }

    fn send_to(&self, msg: &LanMessage, addr: SocketAddr) -> Result<()> {
        let bytes = serde_json::to_vec(msg)
            .map_err(|e| Error::DiscoveryFailed(format!("Encode failed: {}", e)))?;
        self.socket.try_send_to(&bytes, addr)?;
        Ok(())
    }
}

/// UDP broadcast implementation of [`DiscoverySubstrate`]
pub struct LanSubstrate {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl LanSubstrate {
    /// Bind the discovery port and start listening
    ///
    /// Returns the substrate and the event stream to hand to the orchestrator.
    pub async fn bind(
        config: &LinkConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SubstrateEvent>)> {
        let port = config.discovery_port;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| Error::PortBindFailed { port, source })?;
        socket.set_broadcast(true)?;

        let id = PeerId::new(Uuid::new_v4().to_string());
        info!(device = %id, port, "LAN discovery listening");

        let (events, events_rx) = mpsc::unbounded_channel();
        let node = LanNode::new(id, config.display_name.clone(), config.group_owner_intent);
        let device = node.descriptor();

        let shared = Arc::new(Shared {
            node: Mutex::new(node),
            socket,
            broadcast: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            events,
        });
        shared.emit(SubstrateEvent::LocalDeviceChanged(device));

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(recv_task(shared.clone(), shutdown_rx));

        Ok((Arc::new(Self { shared, shutdown }), events_rx))
    }

    pub fn device_id(&self) -> PeerId {
        self.shared.node().id.clone()
    }
}

impl Drop for LanSubstrate {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl DiscoverySubstrate for LanSubstrate {
    fn discover_peers(&self) -> Result<()> {
        let query = {
            let node = self.shared.node();
            LanMessage::Query {
                from: node.id.clone(),
                name: node.name.clone(),
            }
        };
        self.shared.send_to(&query, self.shared.broadcast)
    }

    fn stop_peer_discovery(&self) {
        // Queries are one-shot; nothing keeps running between rounds
        debug!("LAN discovery idle");
    }

    fn connect(&self, peer: &PeerId) -> Result<()> {
        let (invite, addr) = {
            let mut node = self.shared.node();
            let addr = node
                .known
                .get(peer)
                .map(|known| known.addr)
                .ok_or(Error::PeerVanished)?;
            node.pending.insert(peer.clone());
            let invite = LanMessage::Invite {
                from: node.id.clone(),
                name: node.name.clone(),
                intent: node.intent,
            };
            (invite, addr)
        };

        debug!(peer = %peer, addr = %addr, "Sending invitation");
        if let Err(e) = self.shared.send_to(&invite, addr) {
            self.shared.node().pending.remove(peer);
            return Err(e);
        }
        Ok(())
    }

    fn cancel_connect(&self, peer: &PeerId) {
        self.shared.node().pending.remove(peer);
    }

    fn remove_group(&self) {
        let leave = {
            let mut node = self.shared.node();
            let group = node.group.take();
            let from = node.id.clone();
            group.map(|(_, addr)| (LanMessage::Leave { from }, addr))
        };
        if let Some((msg, addr)) = leave {
            if let Err(e) = self.shared.send_to(&msg, addr) {
                warn!(error = %e, "Could not announce leaving the group");
            }
            let device = self.shared.node().descriptor();
            self.shared.emit(SubstrateEvent::LocalDeviceChanged(device));
        }
    }
}

async fn recv_task(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, src) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = shared.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Discovery receive failed");
                    shared.emit(SubstrateEvent::DiscoveryFailed(e.to_string()));
                    break;
                }
            },
        };

        let msg: LanMessage = match serde_json::from_slice(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(src = %src, error = %e, "Ignoring unreadable datagram");
                continue;
            }
        };

        let (handled, device) = {
            let mut node = shared.node();
            let was_grouped = node.group.is_some();
            let handled = node.handle(msg, src);
            let device = (node.group.is_some() != was_grouped).then(|| node.descriptor());
            (handled, device)
        };

        for event in handled.events {
            shared.emit(event);
        }
        if let Some(device) = device {
            shared.emit(SubstrateEvent::LocalDeviceChanged(device));
        }

        if let Some(reply) = handled.reply {
            if handled.jitter {
                let delay = rand::thread_rng().gen_range(0..ANNOUNCE_JITTER_MS);
                let shared = shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if let Err(e) = shared.send_to(&reply, src) {
                        debug!(error = %e, "Announce failed");
                    }
                });
            } else if let Err(e) = shared.send_to(&reply, src) {
                warn!(src = %src, error = %e, "Reply failed");
            }
        }
    }
    debug!("LAN discovery stopped");
}
