//! Message identifiers and the published/received variant tag.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Store-assigned identifier of a message record.
///
/// Ids come from the backend's identity sequence on insert. They are never
/// reused, not even when the inserting transaction rolls back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<MessageId> for i64 {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl FromStr for MessageId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = i64::from_str(s)
            .map_err(|e| StoreError::validation(format!("MessageId: {e}")))?;
        Ok(Self(raw))
    }
}

/// Which side of the outbox/inbox a record belongs to.
///
/// Both variants share one record shape; the kind only selects the table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Outgoing message written by business code (outbox).
    Published,
    /// Incoming message accepted from a transport (inbox).
    Received,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::Published, MessageKind::Received];

    /// Table name for this kind inside the configured schema.
    pub fn table_name(&self) -> &'static str {
        match self {
            MessageKind::Published => "published",
            MessageKind::Received => "received",
        }
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_parses_and_displays() {
        let id: MessageId = "42".parse().unwrap();
        assert_eq!(id.as_i64(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn message_id_rejects_garbage() {
        let err = "forty-two".parse::<MessageId>().unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn kinds_map_to_distinct_tables() {
        assert_eq!(MessageKind::Published.table_name(), "published");
        assert_eq!(MessageKind::Received.table_name(), "received");
    }
}
