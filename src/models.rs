// Data models for MsgTable

use serde::{Deserialize, Serialize};

/// Partial message as supplied by a caller, before id and timestamps exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub text: String,
}

impl NewMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A stored message
///
/// Immutable once created; the only way it changes is by being deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub text: String,
    /// Creation instant, milliseconds since epoch
    pub ts: i64,
    /// `MM/dd/yyyy` in the local time zone
    pub date: String,
    /// `hh:mma` in the local time zone
    pub time: String,
}

/// Helper function to get current timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
