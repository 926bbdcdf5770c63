//! Infrastructure layer: message storage backends, config and the dispatcher.

pub mod config;
pub mod dispatcher;
pub mod message_store;

pub use config::{ConfigError, PgStoreConfig};
pub use dispatcher::{
    DispatchOutcome, DispatchStats, Dispatcher, DispatcherConfig, DispatcherHandle,
    MessageSender, SendError,
};
pub use message_store::{
    InMemoryMessageStore, InMemoryTransaction, MessageStore, MessageStoreExt,
    PgMessageStore, PgMessageTransaction, StoreTransaction,
};
