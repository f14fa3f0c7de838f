//! Discovered peer model

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier assigned to a peer by the discovery substrate
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Discovery status of a peer as reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    #[default]
    Available,
    Invited,
    Connected,
    Failed,
    Unavailable,
}

impl PeerStatus {
    pub fn label(self) -> &'static str {
        match self {
            PeerStatus::Available => "Available",
            PeerStatus::Invited => "Invited",
            PeerStatus::Connected => "Connected",
            PeerStatus::Failed => "Failed",
            PeerStatus::Unavailable => "Unavailable",
        }
    }

    /// Whether a connection request makes sense for a peer in this status
    pub fn is_connectable(self) -> bool {
        matches!(self, PeerStatus::Available | PeerStatus::Failed)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable snapshot of one discovered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub name: String,
    pub status: PeerStatus,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>, status: PeerStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
        }
    }

    /// Name shown in peer lists, falling back to the id for unnamed devices
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(PeerStatus::Available.to_string(), "Available");
        assert_eq!(PeerStatus::Unavailable.to_string(), "Unavailable");
        assert!(PeerStatus::Failed.is_connectable());
        assert!(!PeerStatus::Connected.is_connectable());
    }

    #[test]
    fn test_display_name_fallback() {
        let peer = PeerDescriptor::new("aa:bb", "  ", PeerStatus::Available);
        assert_eq!(peer.display_name(), "aa:bb");

        let peer = PeerDescriptor::new("aa:bb", "Pixel7", PeerStatus::Invited);
        assert_eq!(peer.display_name(), "Pixel7");
    }
}
