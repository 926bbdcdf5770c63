//! Message records.
//!
//! A record moves through three shapes:
//!
//! 1. **NewMessage**: what business code hands to the store (no id, no bookkeeping)
//! 2. **StoredMessage**: the persisted row with its id, retry count and status
//! 3. back into the store through status transitions and requeues
//!
//! `content` is opaque to the store. It is written once and never rewritten;
//! only `retries`, `expires_at` and `status` change after insert.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::id::{MessageId, MessageKind};
use crate::options::RetryScan;
use crate::status::MessageStatus;

/// Maximum length of `name` and `group`, in characters.
pub const MAX_NAME_LEN: usize = 200;

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub kind: MessageKind,
    /// Logical message type / route name.
    pub name: String,
    /// Topic or consumer group.
    pub group: String,
    pub content: Vec<u8>,
}

impl NewMessage {
    pub fn new(
        kind: MessageKind,
        name: impl Into<String>,
        group: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            group: group.into(),
            content: content.into(),
        }
    }

    pub fn published(name: impl Into<String>, group: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Published, name, group, content)
    }

    pub fn received(name: impl Into<String>, group: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Received, name, group, content)
    }

    /// Build a message whose content is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        kind: MessageKind,
        name: impl Into<String>,
        group: impl Into<String>,
        payload: &T,
    ) -> Result<Self, StoreError> {
        let content = serde_json::to_vec(payload)
            .map_err(|e| StoreError::validation(format!("payload serialization failed: {e}")))?;
        Ok(Self::new(kind, name, group, content))
    }

    /// Check required fields before anything touches storage.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_label("name", &self.name)?;
        validate_label("group", &self.group)?;
        if self.content.is_empty() {
            return Err(StoreError::validation("content must not be empty"));
        }
        Ok(())
    }
}

fn validate_label(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(format!("{field} is required")));
    }
    let len = value.chars().count();
    if len > MAX_NAME_LEN {
        return Err(StoreError::validation(format!(
            "{field} is {len} characters, limit is {MAX_NAME_LEN}"
        )));
    }
    Ok(())
}

/// A persisted message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub kind: MessageKind,
    pub id: MessageId,
    pub name: String,
    pub group: String,
    pub content: Vec<u8>,
    /// Attempts recorded since creation or the last requeue.
    pub retries: u32,
    pub added: DateTime<Utc>,
    /// Cleanup deadline; set only while the message is `Succeeded`.
    pub expires_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

impl StoredMessage {
    /// Materialise a freshly inserted record.
    pub fn scheduled(id: MessageId, message: NewMessage, added: DateTime<Utc>) -> Self {
        Self {
            kind: message.kind,
            id,
            name: message.name,
            group: message.group,
            content: message.content,
            retries: 0,
            added,
            expires_at: None,
            status: MessageStatus::Scheduled,
        }
    }

    /// Decode the content as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }

    /// Record a dispatch attempt outcome.
    ///
    /// Returns `false` (and leaves the record untouched) when the current status
    /// does not allow the move; callers treat that as a conflict.
    pub fn record_attempt(
        &mut self,
        next: MessageStatus,
        now: DateTime<Utc>,
        succeeded_expiry: Duration,
    ) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.retries = self.retries.saturating_add(1);
        self.expires_at = match next {
            MessageStatus::Succeeded => Some(now + succeeded_expiry),
            _ => None,
        };
        true
    }

    /// Operator reset back to the initial dispatchable state.
    pub fn requeue(&mut self) {
        self.status = MessageStatus::Scheduled;
        self.retries = 0;
        self.expires_at = None;
    }

    /// Whether the retry scanner may hand this record out.
    ///
    /// `cutoff` is `now - age_floor`; the record must have been added strictly before it.
    pub fn is_retry_eligible(&self, scan: &RetryScan, cutoff: DateTime<Utc>) -> bool {
        self.status.is_dispatchable() && self.retries < scan.retry_limit && self.added < cutoff
    }
}
