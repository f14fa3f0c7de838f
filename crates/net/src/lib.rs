//! Seatlink Network Library
//!
//! Peer-to-peer chat sessions between two nearby devices.
//!
//! # Architecture
//!
//! - **Discovery**: finds peers through a platform substrate and forms a
//!   pairing group, which decides who hosts
//! - **Transport**: one TCP session, host listens and client connects
//! - **Orchestrator**: façade tying the two together for the front end
//! - **Protocol**: Length-prefixed JSON frames
//!
//! # Usage
//!
//! ```ignore
//! let orchestrator = SessionOrchestrator::new(config, substrate, substrate_rx, listener);
//! orchestrator.initialize().await?;
//! orchestrator.start_discovery().await?;
//!
//! // Later, with a peer from on_peers_changed
//! let role = orchestrator.connect_to_peer(&peer).await?;
//! orchestrator.send_message(MessageFrame::text("Pixel7", "12A", "hi"));
//! ```

pub mod discovery;
pub mod error;
mod frame;
pub mod orchestrator;
pub mod protocol;
pub mod transport;

pub use discovery::{
    ConnectFailure, DiscoveryConfig, DiscoveryCoordinator, DiscoveryEvent, DiscoverySubstrate,
    GroupInfo, SubstrateEvent,
};
pub use error::{Error, Result};
pub use frame::MAX_FRAME_SIZE;
pub use orchestrator::{SessionListener, SessionOrchestrator};
pub use transport::{SessionId, SessionState, SessionTransport, TransportConfig, TransportEvent};

/// Default session port
pub const DEFAULT_PORT: u16 = seatlink_core::config::DEFAULT_SESSION_PORT;
