use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{
    MessageId, MessageKind, MessageStatus, NewMessage, RetryOptions, RetryScan, StoreError,
    StoredMessage,
};

/// Unit of work that persists messages atomically with the caller's own writes.
///
/// Dropping a transaction without calling `commit` discards everything staged
/// in it. A `store` failure poisons the transaction: a later `commit` rolls
/// back and returns that failure, so a half-written outbox can never land.
#[async_trait]
pub trait StoreTransaction: Send + Sized {
    /// Stage a new message in `Scheduled` status and return its id.
    async fn store(&mut self, message: NewMessage) -> Result<MessageId, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Durable outbox/inbox message store.
///
/// Backends share this contract but build their own query text. Every
/// mutating call is a single atomic statement; no partial update is ever
/// observable.
///
/// ## Read Semantics
///
/// `get` and `list_retryable` never wait on rows that an in-flight transition
/// holds. `list_retryable` skips such rows entirely: they are picked up by the
/// next scan.
///
/// ## Ownership
///
/// A scan does not claim anything. Two workers may receive the same record;
/// whoever records an outcome first via `transition` wins, and the other sees
/// either a successful repeat (at-least-once) or `false`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    type Transaction: StoreTransaction;

    /// Policy used by the `*_needing_retry` conveniences.
    fn retry_options(&self) -> &RetryOptions;

    /// Persist a new message outside any caller transaction.
    async fn store(&self, message: NewMessage) -> Result<MessageId, StoreError>;

    /// Single-record lookup. A miss is `Ok(None)`.
    async fn get(&self, kind: MessageKind, id: MessageId)
    -> Result<Option<StoredMessage>, StoreError>;

    /// Up to `scan.limit` records with `retries < scan.retry_limit`, added
    /// before `now - scan.age_floor`, in `Scheduled` or `Failed` status.
    async fn list_retryable(
        &self,
        kind: MessageKind,
        scan: RetryScan,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Record an attempt outcome: set the status, bump `retries`, and set
    /// `expires_at` for `Succeeded` (clear it otherwise).
    ///
    /// `Ok(false)` means no row changed: the id does not exist or the record
    /// already left the dispatchable states.
    async fn transition(
        &self,
        kind: MessageKind,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError>;

    /// Like `transition`, but only applies while the current status is `expected`.
    async fn transition_from(
        &self,
        kind: MessageKind,
        id: MessageId,
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<bool, StoreError>;

    /// Force a record back to `Scheduled` with `retries = 0` and no expiry,
    /// whatever its current state. `Ok(false)` if the id does not exist.
    async fn requeue(&self, kind: MessageKind, id: MessageId) -> Result<bool, StoreError>;

    /// Open a unit of work.
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

#[async_trait]
impl<S> MessageStore for Arc<S>
where
    S: MessageStore,
{
    type Transaction = S::Transaction;

    fn retry_options(&self) -> &RetryOptions {
        (**self).retry_options()
    }

    async fn store(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        (**self).store(message).await
    }

    async fn get(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> Result<Option<StoredMessage>, StoreError> {
        (**self).get(kind, id).await
    }

    async fn list_retryable(
        &self,
        kind: MessageKind,
        scan: RetryScan,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        (**self).list_retryable(kind, scan).await
    }

    async fn transition(
        &self,
        kind: MessageKind,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        (**self).transition(kind, id, next).await
    }

    async fn transition_from(
        &self,
        kind: MessageKind,
        id: MessageId,
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        (**self).transition_from(kind, id, expected, next).await
    }

    async fn requeue(&self, kind: MessageKind, id: MessageId) -> Result<bool, StoreError> {
        (**self).requeue(kind, id).await
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        (**self).begin().await
    }
}

/// Per-variant shorthands over [`MessageStore`].
#[async_trait]
pub trait MessageStoreExt: MessageStore {
    async fn get_published(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        self.get(MessageKind::Published, id).await
    }

    async fn get_received(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        self.get(MessageKind::Received, id).await
    }

    /// Store an incoming message outside any business transaction.
    async fn store_received(
        &self,
        name: String,
        group: String,
        content: Vec<u8>,
    ) -> Result<MessageId, StoreError> {
        self.store(NewMessage::received(name, group, content)).await
    }

    async fn published_needing_retry(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let scan = self.retry_options().scan();
        self.list_retryable(MessageKind::Published, scan).await
    }

    async fn received_needing_retry(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let scan = self.retry_options().scan();
        self.list_retryable(MessageKind::Received, scan).await
    }

    async fn change_published_state(
        &self,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        self.transition(MessageKind::Published, id, next).await
    }

    async fn change_received_state(
        &self,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        self.transition(MessageKind::Received, id, next).await
    }

    async fn requeue_published(&self, id: MessageId) -> Result<bool, StoreError> {
        self.requeue(MessageKind::Published, id).await
    }

    async fn requeue_received(&self, id: MessageId) -> Result<bool, StoreError> {
        self.requeue(MessageKind::Received, id).await
    }
}

impl<S: MessageStore + ?Sized> MessageStoreExt for S {}
