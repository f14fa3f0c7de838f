//! Message frames exchanged over a session

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Frame type discriminator
///
/// Discriminators this build does not know about decode to `Unknown`, so a
/// peer running a newer version never tears the session down over a new type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Text,
    UserInfo,
    #[serde(other)]
    Unknown,
}

/// One typed message, immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub kind: FrameKind,
    pub sender_name: String,
    pub sender_seat: String,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl MessageFrame {
    pub fn new(
        kind: FrameKind,
        sender_name: impl Into<String>,
        sender_seat: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender_name: sender_name.into(),
            sender_seat: sender_seat.into(),
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A chat line typed by the user
    pub fn text(
        sender_name: impl Into<String>,
        sender_seat: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(FrameKind::Text, sender_name, sender_seat, content)
    }

    /// Introduces the sender to the remote side right after connecting
    pub fn user_info(
        sender_name: impl Into<String>,
        sender_seat: impl Into<String>,
        greeting: impl Into<String>,
    ) -> Self {
        Self::new(FrameKind::UserInfo, sender_name, sender_seat, greeting)
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// A frame as shown in a conversation view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub sender_name: String,
    pub sender_seat: String,
    pub content: String,
    pub timestamp: i64,
    pub sent_by_me: bool,
}

impl ChatLine {
    pub fn outgoing(frame: &MessageFrame) -> Self {
        Self::from_frame(frame, true)
    }

    pub fn incoming(frame: &MessageFrame) -> Self {
        Self::from_frame(frame, false)
    }

    fn from_frame(frame: &MessageFrame, sent_by_me: bool) -> Self {
        Self {
            sender_name: frame.sender_name.clone(),
            sender_seat: frame.sender_seat.clone(),
            content: frame.content.clone(),
            timestamp: frame.timestamp,
            sent_by_me,
        }
    }

    /// "SEAT - NAME", the heading of a received message
    pub fn sender_label(&self) -> String {
        format!("{} - {}", self.sender_seat, self.sender_name)
    }

    /// Local wall-clock time, "HH:MM"
    pub fn format_time(&self) -> String {
        match DateTime::from_timestamp_millis(self.timestamp) {
            Some(ts) => ts.with_timezone(&Local).format("%H:%M").to_string(),
            None => "--:--".to_string(),
        }
    }
}
