//! `courier-core`: message model for the outbox/inbox store.
//!
//! This crate contains the **pure** parts of the store (no storage engine):
//! record shapes, the status state machine, validation, configuration and the
//! error model shared by every backend.

pub mod clock;
pub mod error;
pub mod id;
pub mod message;
pub mod options;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use id::{MessageId, MessageKind};
pub use message::{MAX_NAME_LEN, NewMessage, StoredMessage};
pub use options::{RetryOptions, RetryScan, StoreOptions};
pub use status::MessageStatus;
