//! Durable outbox/inbox message store.
//!
//! One table per [`MessageKind`](courier_core::MessageKind), identical in
//! shape. Backends:
//!
//! - `PgMessageStore`: Postgres via `sqlx`, row locks for concurrent workers
//! - `InMemoryMessageStore`: process-local, for tests and embedding

pub mod in_memory;
pub mod postgres;
pub(crate) mod queries;
pub mod r#trait;

pub use in_memory::{InMemoryMessageStore, InMemoryTransaction};
pub use postgres::{PgMessageStore, PgMessageTransaction};
pub use r#trait::{MessageStore, MessageStoreExt, StoreTransaction};
