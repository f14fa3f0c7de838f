//! Link configuration
//!
//! Loaded from `seatlink.toml` in the platform config directory, then
//! overridden by `SEATLINK_*` environment variables. Every field has a
//! default, so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::SeatNumber;

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "seatlink.toml";

/// Well-known session port on the ad-hoc link
pub const DEFAULT_SESSION_PORT: u16 = 8988;

/// Port used by the LAN discovery substrate
pub const DEFAULT_DISCOVERY_PORT: u16 = 8989;

/// Highest group owner intent a device may advertise
pub const MAX_GROUP_OWNER_INTENT: u8 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Name shown to nearby devices
    pub display_name: String,
    /// Seat number, if already known
    pub seat: Option<SeatNumber>,
    pub session_port: u16,
    pub discovery_port: u16,
    /// How often discovery is re-issued while active
    pub discovery_interval_ms: u64,
    /// Peers missing from this many consecutive cycles are dropped
    pub stale_after_cycles: u32,
    pub group_formation_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    /// 0..=15, higher prefers becoming the group owner
    pub group_owner_intent: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            seat: None,
            session_port: DEFAULT_SESSION_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_interval_ms: 5000,
            stale_after_cycles: 3,
            group_formation_timeout_ms: 30_000,
            connect_attempts: 5,
            connect_timeout_ms: 3000,
            outbound_queue_capacity: 64,
            group_owner_intent: 7,
        }
    }
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "seatlink".to_string())
}

impl LinkConfig {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            None => {
                warn!("Could not determine config directory, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file without environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// `<config dir>/seatlink.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "seatlink", "seatlink")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Apply `SEATLINK_NAME`, `SEATLINK_SEAT`, `SEATLINK_PORT` and
    /// `SEATLINK_DISCOVERY_PORT`; unparseable values are ignored with a warning
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("SEATLINK_NAME").filter(|n| !n.trim().is_empty()) {
            self.display_name = name.trim().to_string();
        }
        if let Some(seat) = lookup("SEATLINK_SEAT") {
            match SeatNumber::parse(&seat) {
                Ok(seat) => self.seat = Some(seat),
                Err(e) => warn!(error = %e, "Ignoring SEATLINK_SEAT"),
            }
        }
        if let Some(port) = lookup("SEATLINK_PORT") {
            match port.parse() {
                Ok(port) => self.session_port = port,
                Err(_) => warn!(value = %port, "Ignoring SEATLINK_PORT"),
            }
        }
        if let Some(port) = lookup("SEATLINK_DISCOVERY_PORT") {
            match port.parse() {
                Ok(port) => self.discovery_port = port,
                Err(_) => warn!(value = %port, "Ignoring SEATLINK_DISCOVERY_PORT"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(Error::InvalidConfig("display_name must not be empty".into()));
        }
        if self.discovery_interval_ms == 0 {
            return Err(Error::InvalidConfig("discovery_interval_ms must be positive".into()));
        }
        if self.stale_after_cycles == 0 {
            return Err(Error::InvalidConfig("stale_after_cycles must be positive".into()));
        }
        if self.group_formation_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be positive".into()));
        }
        if self.connect_attempts == 0 {
            return Err(Error::InvalidConfig("connect_attempts must be at least 1".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_capacity must be at least 1".into(),
            ));
        }
        if self.group_owner_intent > MAX_GROUP_OWNER_INTENT {
            return Err(Error::InvalidConfig(format!(
                "group_owner_intent must be at most {}",
                MAX_GROUP_OWNER_INTENT
            )));
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn group_formation_timeout(&self) -> Duration {
        Duration::from_millis(self.group_formation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
