//! Terminal front end
//!
//! Peer list, seat entry and the chat view, driven by slash commands on
//! stdin. Orchestrator notifications arrive as [`AppEvent`]s on a channel so
//! all console state is touched from one task.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use seatlink_core::{
    ChatLine, ConnectionRole, FrameKind, LinkConfig, MessageFrame, PeerDescriptor, SeatNumber,
};
use seatlink_net::{Result, SessionListener, SessionOrchestrator, SessionState};

use crate::lan::LanSubstrate;

/// Greeting carried by the identity frame sent on connect
const GREETING: &str = "Hello";

const HELP: &[&str] = &[
    "Commands:",
    "  /seat <number>   set your seat number",
    "  /scan            look for nearby devices",
    "  /stop            stop looking",
    "  /peers           list devices found so far",
    "  /connect <n>     chat with device n from the list",
    "  /leave           end the current chat",
    "  /quit            exit",
    "Anything else is sent as a message.",
];

/// Orchestrator notification, forwarded to the console task
#[derive(Debug, Clone)]
pub enum AppEvent {
    PeersChanged(Vec<PeerDescriptor>),
    DeviceChanged(PeerDescriptor),
    Connected(ConnectionRole),
    Message(MessageFrame),
    ConnectionLost,
    SessionFailed(String),
    DiscoveryFailed(String),
    /// Outcome of a `/connect` running in the background
    ConnectFinished {
        peer: PeerDescriptor,
        result: std::result::Result<ConnectionRole, String>,
    },
}

/// Forwards every notification to the console task
pub struct ConsoleListener {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl ConsoleListener {
    pub fn new(tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            debug!("Console gone, dropping notification");
        }
    }
}

impl SessionListener for ConsoleListener {
    fn on_peers_changed(&self, peers: &[PeerDescriptor]) {
        self.forward(AppEvent::PeersChanged(peers.to_vec()));
    }

    fn on_device_changed(&self, device: &PeerDescriptor) {
        self.forward(AppEvent::DeviceChanged(device.clone()));
    }

    fn on_connection_established(&self, role: &ConnectionRole) {
        self.forward(AppEvent::Connected(*role));
    }

    fn on_message_received(&self, frame: &MessageFrame) {
        self.forward(AppEvent::Message(frame.clone()));
    }

    fn on_connection_lost(&self) {
        self.forward(AppEvent::ConnectionLost);
    }

    fn on_session_failed(&self, reason: &str) {
        self.forward(AppEvent::SessionFailed(reason.to_string()));
    }

    fn on_discovery_failed(&self, reason: &str) {
        self.forward(AppEvent::DiscoveryFailed(reason.to_string()));
    }
}

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Seat(Option<String>),
    Scan,
    Stop,
    Peers,
    /// 1-based index into the peer list
    Connect(usize),
    Leave,
    Help,
    Quit,
    Say(String),
    Empty,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        if !line.starts_with('/') {
            return Command::Say(line.to_string());
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match name {
            "/seat" => Command::Seat(arg.map(str::to_string)),
            "/scan" => Command::Scan,
            "/stop" => Command::Stop,
            "/peers" => Command::Peers,
            "/connect" => match arg.map(str::parse::<usize>) {
                Some(Ok(n)) if n > 0 => Command::Connect(n),
                _ => Command::Invalid("Usage: /connect <n>".into()),
            },
            "/leave" => Command::Leave,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            other => Command::Invalid(format!("Unknown command {}, try /help", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
    /// Start connecting to this peer without blocking input
    Connect(PeerDescriptor),
}

/// "Chat with NAME (SEAT)"
pub fn chat_title(frame: &MessageFrame) -> String {
    format!("Chat with {} ({})", frame.sender_name, frame.sender_seat)
}

/// "HH:mm SEAT - NAME: content"
pub fn format_incoming(frame: &MessageFrame) -> String {
    let line = ChatLine::incoming(frame);
    format!("{} {}: {}", line.format_time(), line.sender_label(), line.content)
}

/// "HH:mm me: content"
pub fn format_outgoing(frame: &MessageFrame) -> String {
    let line = ChatLine::outgoing(frame);
    format!("{} me: {}", line.format_time(), line.content)
}

fn format_peers(peers: &[PeerDescriptor]) -> Vec<String> {
    if peers.is_empty() {
        return vec!["No devices found".to_string()];
    }
    peers
        .iter()
        .enumerate()
        .map(|(i, peer)| format!("  {}. {} ({})", i + 1, peer.display_name(), peer.status))
        .collect()
}

/// Console state; every method returns the lines to print
pub struct Console {
    name: String,
    seat: Option<SeatNumber>,
    peers: Vec<PeerDescriptor>,
    title: Option<String>,
}

impl Console {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            name: config.display_name.clone(),
            seat: config.seat.clone(),
            peers: Vec::new(),
            title: None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    fn seat_label(&self) -> &str {
        self.seat.as_ref().map(SeatNumber::as_str).unwrap_or_default()
    }

    pub fn banner(&self) -> Vec<String> {
        let mut out = vec![format!("Seatlink - you are {}", self.name)];
        match &self.seat {
            Some(seat) => out.push(format!("Seat {}. Type /scan to find nearby devices.", seat.as_str())),
            None => out.push("Enter your seat number with /seat <number>, then /scan.".into()),
        }
        out.push("Type /help for all commands.".into());
        out
    }

    pub async fn handle_line(
        &mut self,
        line: &str,
        orchestrator: &SessionOrchestrator,
    ) -> (Vec<String>, Flow) {
        let out = match Command::parse(line) {
            Command::Empty => Vec::new(),
            Command::Invalid(message) => vec![message],
            Command::Help => HELP.iter().map(|l| l.to_string()).collect(),
            Command::Quit => return (vec!["Bye".into()], Flow::Quit),
            Command::Seat(None) => match &self.seat {
                Some(seat) => vec![format!("Your seat is {}", seat.as_str())],
                None => vec!["Usage: /seat <number>".into()],
            },
            Command::Seat(Some(input)) => match SeatNumber::parse(&input) {
                Ok(seat) => {
                    let out = vec![format!("Seat set to {}", seat.as_str())];
                    self.seat = Some(seat);
                    out
                }
                Err(e) => vec![e.to_string()],
            },
            Command::Scan => {
                if self.seat.is_none() {
                    vec!["Enter your seat number first: /seat <number>".into()]
                } else {
                    match orchestrator.start_discovery().await {
                        Ok(()) => vec!["Scanning for nearby devices...".into()],
                        Err(e) => vec![format!("Could not scan: {}", e)],
                    }
                }
            }
            Command::Stop => {
                orchestrator.stop_discovery().await;
                vec!["Scanning stopped".into()]
            }
            Command::Peers => format_peers(&self.peers),
            Command::Connect(n) => return self.connect(n),
            Command::Leave => {
                orchestrator.disconnect().await;
                self.title = None;
                vec!["Left the chat".into()]
            }
            Command::Say(text) => self.say(text, orchestrator),
        };
        (out, Flow::Continue)
    }

    fn connect(&mut self, n: usize) -> (Vec<String>, Flow) {
        let Some(peer) = self.peers.get(n - 1).cloned() else {
            return (vec![format!("No device {}, see /peers", n)], Flow::Continue);
        };
        if !peer.status.is_connectable() {
            return (
                vec![format!("{} is {}", peer.display_name(), peer.status)],
                Flow::Continue,
            );
        }
        (
            vec![format!("Connecting to {}...", peer.display_name())],
            Flow::Connect(peer),
        )
    }

    fn say(&mut self, text: String, orchestrator: &SessionOrchestrator) -> Vec<String> {
        if orchestrator.session_state() != SessionState::Connected {
            return vec!["Not connected. Use /scan and /connect <n>.".into()];
        }
        let frame = MessageFrame::text(self.name.clone(), self.seat_label(), text);
        if orchestrator.send_message(frame.clone()) {
            vec![format_outgoing(&frame)]
        } else {
            vec!["Message not sent".into()]
        }
    }

    pub fn on_event(&mut self, event: AppEvent, orchestrator: &SessionOrchestrator) -> Vec<String> {
        match event {
            AppEvent::PeersChanged(peers) => {
                self.peers = peers;
                let mut out = vec!["Nearby devices:".to_string()];
                out.extend(format_peers(&self.peers));
                out
            }
            AppEvent::DeviceChanged(device) => {
                debug!(name = %device.name, status = %device.status, "Local device changed");
                Vec::new()
            }
            AppEvent::Connected(role) => {
                let hello = MessageFrame::user_info(self.name.clone(), self.seat_label(), GREETING);
                if !orchestrator.send_message(hello) {
                    warn!("Could not send identity");
                }
                vec![match role {
                    ConnectionRole::Host => "Connected, you are hosting".to_string(),
                    ConnectionRole::Client(addr) => format!("Connected to {}", addr),
                }]
            }
            AppEvent::Message(frame) => match frame.kind {
                FrameKind::UserInfo => {
                    let title = chat_title(&frame);
                    self.title = Some(title.clone());
                    vec![format!("== {} ==", title)]
                }
                FrameKind::Text => vec![format_incoming(&frame)],
                FrameKind::Unknown => {
                    debug!("Ignoring frame of unknown type");
                    Vec::new()
                }
            },
            AppEvent::ConnectionLost => {
                self.title = None;
                vec!["Connection lost".into()]
            }
            AppEvent::SessionFailed(reason) => {
                self.title = None;
                vec![format!("Could not start the chat: {}", reason)]
            }
            AppEvent::DiscoveryFailed(reason) => vec![format!("Discovery failed: {}", reason)],
            AppEvent::ConnectFinished { peer, result } => match result {
                Ok(ConnectionRole::Host) => {
                    vec![format!("Waiting for {} to join...", peer.display_name())]
                }
                Ok(ConnectionRole::Client(_)) => Vec::new(),
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "Connect failed");
                    vec![format!("Could not connect to {}: {}", peer.display_name(), e)]
                }
            },
        }
    }
}

fn print(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

/// Group formation can take many seconds; input and notifications keep
/// flowing while it runs
fn spawn_connect(
    orchestrator: Arc<SessionOrchestrator>,
    peer: PeerDescriptor,
    events: mpsc::UnboundedSender<AppEvent>,
) {
    tokio::spawn(async move {
        let result = orchestrator
            .connect_to_peer(&peer)
            .await
            .map_err(|e| e.to_string());
        if events.send(AppEvent::ConnectFinished { peer, result }).is_err() {
            debug!("Console gone, dropping connect result");
        }
    });
}

/// Run the console until /quit, end of input or Ctrl+C
pub async fn run(config: LinkConfig) -> Result<()> {
    let (substrate, substrate_rx) = LanSubstrate::bind(&config).await?;
    info!(device = %substrate.device_id(), "Local device ready");

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(SessionOrchestrator::new(
        config.clone(),
        substrate,
        substrate_rx,
        Arc::new(ConsoleListener::new(event_tx.clone())),
    ));
    orchestrator.initialize().await?;

    let mut console = Console::new(&config);
    print(console.banner());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let (out, flow) = console.handle_line(&line, &orchestrator).await;
                    print(out);
                    match flow {
                        Flow::Continue => {}
                        Flow::Quit => break,
                        Flow::Connect(peer) => {
                            spawn_connect(orchestrator.clone(), peer, event_tx.clone())
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Reading input failed");
                    break;
                }
            },
            Some(event) = events.recv() => print(console.on_event(event, &orchestrator)),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    orchestrator.cleanup().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatlink_core::{PeerId, PeerStatus};
    use seatlink_net::{DiscoverySubstrate, SubstrateEvent};

    struct NullSubstrate;

    impl DiscoverySubstrate for NullSubstrate {
        fn discover_peers(&self) -> Result<()> {
            Ok(())
        }
        fn stop_peer_discovery(&self) {}
        fn connect(&self, _peer: &PeerId) -> Result<()> {
            Ok(())
        }
        fn cancel_connect(&self, _peer: &PeerId) {}
        fn remove_group(&self) {}
    }

    async fn orchestrator() -> (SessionOrchestrator, mpsc::UnboundedSender<SubstrateEvent>) {
        let (substrate_tx, substrate_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let orchestrator = SessionOrchestrator::new(
            LinkConfig::default(),
            Arc::new(NullSubstrate),
            substrate_rx,
            Arc::new(ConsoleListener::new(tx)),
        );
        orchestrator.initialize().await.unwrap();
        (orchestrator, substrate_tx)
    }

    fn console() -> Console {
        Console::new(&LinkConfig {
            display_name: "Pixel7".into(),
            ..LinkConfig::default()
        })
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("hello there"), Command::Say("hello there".into()));
        assert_eq!(Command::parse("/seat 12a"), Command::Seat(Some("12a".into())));
        assert_eq!(Command::parse("/seat"), Command::Seat(None));
        assert_eq!(Command::parse("/connect 2"), Command::Connect(2));
        assert!(matches!(Command::parse("/connect 0"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/connect x"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/dance"), Command::Invalid(_)));
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn test_line_formats() {
        let frame = MessageFrame::text("Galaxy", "14C", "window or aisle?");
        let incoming = format_incoming(&frame);
        assert!(incoming.ends_with(" 14C - Galaxy: window or aisle?"));
        assert_eq!(incoming.find(' '), Some(5));

        let outgoing = format_outgoing(&frame);
        assert!(outgoing.ends_with(" me: window or aisle?"));

        let info = MessageFrame::user_info("Galaxy", "14C", "Hello");
        assert_eq!(chat_title(&info), "Chat with Galaxy (14C)");
    }

    #[tokio::test]
    async fn test_scan_requires_seat() {
        let (orchestrator, _substrate) = orchestrator().await;
        let mut console = console();

        let (out, _) = console.handle_line("/scan", &orchestrator).await;
        assert!(out[0].contains("seat number"));

        let (out, _) = console.handle_line("/seat 25a", &orchestrator).await;
        assert_eq!(out, vec!["Seat set to 25A".to_string()]);

        let (out, flow) = console.handle_line("/scan", &orchestrator).await;
        assert_eq!(out, vec!["Scanning for nearby devices...".to_string()]);
        assert_eq!(flow, Flow::Continue);

        let (_, flow) = console.handle_line("/quit", &orchestrator).await;
        assert_eq!(flow, Flow::Quit);
        orchestrator.cleanup().await;
    }

    #[tokio::test]
    async fn test_events_update_view() {
        let (orchestrator, _substrate) = orchestrator().await;
        let mut console = console();

        let peers = vec![
            PeerDescriptor::new("a", "Galaxy", PeerStatus::Available),
            PeerDescriptor::new("b", "", PeerStatus::Connected),
        ];
        let out = console.on_event(AppEvent::PeersChanged(peers), &orchestrator);
        assert_eq!(out[1], "  1. Galaxy (Available)");
        assert_eq!(out[2], "  2. b (Connected)");

        let (out, flow) = console.handle_line("/connect 2", &orchestrator).await;
        assert_eq!(out, vec!["b is Connected".to_string()]);
        assert_eq!(flow, Flow::Continue);
        let (out, _) = console.handle_line("/connect 3", &orchestrator).await;
        assert!(out[0].starts_with("No device 3"));

        let info = MessageFrame::user_info("Galaxy", "14C", "Hello");
        console.on_event(AppEvent::Message(info), &orchestrator);
        assert_eq!(console.title(), Some("Chat with Galaxy (14C)"));

        let out = console.on_event(AppEvent::ConnectionLost, &orchestrator);
        assert_eq!(out, vec!["Connection lost".to_string()]);
        assert!(console.title().is_none());

        let (out, _) = console.handle_line("anyone there?", &orchestrator).await;
        assert!(out[0].starts_with("Not connected"));

        let out = console.on_event(AppEvent::SessionFailed("refused".into()), &orchestrator);
        assert_eq!(out, vec!["Could not start the chat: refused".to_string()]);
        orchestrator.cleanup().await;
    }

    #[tokio::test]
    async fn test_connect_returns_immediately() {
        let (orchestrator, _substrate) = orchestrator().await;
        let mut console = console();
        let galaxy = PeerDescriptor::new("a", "Galaxy", PeerStatus::Available);
        console.on_event(AppEvent::PeersChanged(vec![galaxy.clone()]), &orchestrator);

        // The null substrate never forms a group; the command must not wait
        // for one
        let (out, flow) = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            console.handle_line("/connect 1", &orchestrator),
        )
        .await
        .expect("/connect blocked the console");
        assert_eq!(out, vec!["Connecting to Galaxy...".to_string()]);
        assert_eq!(flow, Flow::Connect(galaxy.clone()));

        let out = console.on_event(
            AppEvent::ConnectFinished {
                peer: galaxy.clone(),
                result: Ok(ConnectionRole::Host),
            },
            &orchestrator,
        );
        assert_eq!(out, vec!["Waiting for Galaxy to join...".to_string()]);

        let out = console.on_event(
            AppEvent::ConnectFinished {
                peer: galaxy,
                result: Err("Connection timed out".into()),
            },
            &orchestrator,
        );
        assert_eq!(
            out,
            vec!["Could not connect to Galaxy: Connection timed out".to_string()]
        );
        orchestrator.cleanup().await;
    }
}
