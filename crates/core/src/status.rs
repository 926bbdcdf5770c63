//! Message status state machine.
//!
//! ```text
//!   store ──► Scheduled ──attempt──► Failed ──attempt──► Failed ...
//!                 │                    │
//!                 └──────attempt───────┴──► Succeeded (terminal, ExpiresAt set)
//!
//!   requeue: Failed | Succeeded ──► Scheduled (Retries = 0, ExpiresAt = NULL)
//! ```

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Delivery status of a stored message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Initial state; dispatchable.
    Scheduled,
    /// An attempt was made and did not succeed; dispatchable while under the retry limit.
    Failed,
    /// Delivered; terminal until an operator requeues it.
    Succeeded,
}

impl MessageStatus {
    /// Statuses a dispatcher may record an attempt against.
    pub const DISPATCHABLE: [MessageStatus; 2] = [MessageStatus::Scheduled, MessageStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "Scheduled",
            MessageStatus::Failed => "Failed",
            MessageStatus::Succeeded => "Succeeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Succeeded)
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Failed)
    }

    /// Whether a recorded attempt may move a message from `self` to `next`.
    ///
    /// Requeue is not covered here; it bypasses the machine.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        self.is_dispatchable() && matches!(next, MessageStatus::Failed | MessageStatus::Succeeded)
    }

    /// Reject targets that `transition` can never reach.
    pub fn ensure_transition_target(next: MessageStatus) -> Result<(), StoreError> {
        if next == MessageStatus::Scheduled {
            return Err(StoreError::validation(
                "Scheduled is only reachable through requeue",
            ));
        }
        Ok(())
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(MessageStatus::Scheduled),
            "Failed" => Ok(MessageStatus::Failed),
            "Succeeded" => Ok(MessageStatus::Succeeded),
            other => Err(StoreError::corrupted(format!("unknown status name '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_move_dispatchable_messages_only() {
        use MessageStatus::*;

        assert!(Scheduled.can_transition_to(Failed));
        assert!(Scheduled.can_transition_to(Succeeded));
        assert!(Failed.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Succeeded));

        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Succeeded));
        assert!(!Scheduled.can_transition_to(Scheduled));
        assert!(!Failed.can_transition_to(Scheduled));
    }

    #[test]
    fn scheduled_is_not_a_transition_target() {
        assert!(MessageStatus::ensure_transition_target(MessageStatus::Scheduled).is_err());
        assert!(MessageStatus::ensure_transition_target(MessageStatus::Failed).is_ok());
        assert!(MessageStatus::ensure_transition_target(MessageStatus::Succeeded).is_ok());
    }

    #[test]
    fn status_names_round_trip_through_text() {
        for status in [MessageStatus::Scheduled, MessageStatus::Failed, MessageStatus::Succeeded] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!(matches!(
            "Delivered".parse::<MessageStatus>(),
            Err(StoreError::Corrupted(_))
        ));
    }
}
