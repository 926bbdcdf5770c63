use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use courier_core::{
    Clock, MessageId, MessageKind, MessageStatus, NewMessage, RetryOptions, RetryScan,
    StoreError, StoredMessage, SystemClock,
};

use super::r#trait::{MessageStore, StoreTransaction};

type Effect = Box<dyn FnOnce() -> Result<(), StoreError> + Send>;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<MessageId, StoredMessage>,
    /// Last identity handed out; ids are burned even if the insert rolls back.
    last_id: i64,
}

impl Table {
    fn next_id(&mut self) -> MessageId {
        self.last_id += 1;
        MessageId::from_raw(self.last_id)
    }
}

#[derive(Debug, Default)]
struct Tables {
    published: Table,
    received: Table,
}

impl Tables {
    fn table(&self, kind: MessageKind) -> &Table {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }

    fn table_mut(&mut self, kind: MessageKind) -> &mut Table {
        match kind {
            MessageKind::Published => &mut self.published,
            MessageKind::Received => &mut self.received,
        }
    }
}

/// In-memory message store.
///
/// Intended for tests/dev. Each operation runs under one lock, which gives the
/// same single-statement atomicity the SQL backends get from the engine. There
/// are no row locks, so nothing is ever skipped by a scan.
#[derive(Clone)]
pub struct InMemoryMessageStore {
    tables: Arc<RwLock<Tables>>,
    options: RetryOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMessageStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl InMemoryMessageStore {
    pub fn new(options: RetryOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: RetryOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            options,
            clock,
        }
    }

    /// Number of committed records of one kind.
    pub fn count(&self, kind: MessageKind) -> Result<usize, StoreError> {
        let tables = self.read()?;
        Ok(tables.table(kind).rows.len())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::storage("lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::storage("lock poisoned"))
    }

    fn apply_attempt(
        &self,
        kind: MessageKind,
        id: MessageId,
        expected: Option<MessageStatus>,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        MessageStatus::ensure_transition_target(next)?;
        let now = self.clock.now();
        let expiry = self.options.succeeded_expiry_delta();

        let mut tables = self.write()?;
        let Some(row) = tables.table_mut(kind).rows.get_mut(&id) else {
            return Ok(false);
        };
        if expected.is_some_and(|status| row.status != status) {
            return Ok(false);
        }
        Ok(row.record_attempt(next, now, expiry))
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    type Transaction = InMemoryTransaction;

    fn retry_options(&self) -> &RetryOptions {
        &self.options
    }

    async fn store(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        message.validate()?;
        let added = self.clock.now();

        let mut tables = self.write()?;
        let table = tables.table_mut(message.kind);
        let id = table.next_id();
        table.rows.insert(id, StoredMessage::scheduled(id, message, added));
        Ok(id)
    }

    async fn get(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let tables = self.read()?;
        Ok(tables.table(kind).rows.get(&id).cloned())
    }

    async fn list_retryable(
        &self,
        kind: MessageKind,
        scan: RetryScan,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let cutoff = scan.cutoff(self.clock.now());
        let tables = self.read()?;

        Ok(tables
            .table(kind)
            .rows
            .values()
            .filter(|m| m.is_retry_eligible(&scan, cutoff))
            .take(scan.limit)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        kind: MessageKind,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        self.apply_attempt(kind, id, None, next)
    }

    async fn transition_from(
        &self,
        kind: MessageKind,
        id: MessageId,
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        self.apply_attempt(kind, id, Some(expected), next)
    }

    async fn requeue(&self, kind: MessageKind, id: MessageId) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        match tables.table_mut(kind).rows.get_mut(&id) {
            Some(row) => {
                row.requeue();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(InMemoryTransaction {
            tables: self.tables.clone(),
            clock: self.clock.clone(),
            staged: Vec::new(),
            effects: Vec::new(),
            failure: None,
        })
    }
}

/// Unit of work over an [`InMemoryMessageStore`].
///
/// Messages are staged until `commit`. Business writes join the unit of work
/// through [`enlist`](Self::enlist): the closure runs on commit and is dropped
/// on rollback.
///
/// `commit` holds the store's write lock while it runs the business writes and
/// then publishes the staged messages, so no reader sees a message before the
/// write it belongs to. An effect that fails or panics aborts the commit
/// before any message lands. Effects that already ran are not undone.
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    clock: Arc<dyn Clock>,
    staged: Vec<StoredMessage>,
    effects: Vec<Effect>,
    failure: Option<StoreError>,
}

impl InMemoryTransaction {
    /// Register a business write that must commit together with the staged messages.
    ///
    /// The closure runs under the store's write lock and must not call back
    /// into the store.
    pub fn enlist(&mut self, effect: impl FnOnce() -> Result<(), StoreError> + Send + 'static) {
        self.effects.push(Box::new(effect));
    }

    fn poison(&mut self, err: StoreError) -> StoreError {
        self.failure.get_or_insert_with(|| err.clone());
        err
    }
}

fn run_effect(effect: Effect) -> Result<(), StoreError> {
    catch_unwind(AssertUnwindSafe(effect))
        .unwrap_or_else(|_| Err(StoreError::storage("business write panicked during commit")))
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn store(&mut self, message: NewMessage) -> Result<MessageId, StoreError> {
        if let Err(e) = message.validate() {
            return Err(self.poison(e));
        }
        let added = self.clock.now();

        let id = self
            .tables
            .write()
            .ok()
            .map(|mut tables| tables.table_mut(message.kind).next_id());
        let Some(id) = id else {
            return Err(self.poison(StoreError::storage("lock poisoned")));
        };
        self.staged.push(StoredMessage::scheduled(id, message, added));
        Ok(id)
    }

    async fn commit(self) -> Result<(), StoreError> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::storage("lock poisoned"))?;

        for effect in self.effects {
            run_effect(effect)?;
        }
        for message in self.staged {
            tables
                .table_mut(message.kind)
                .rows
                .insert(message.id, message);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use std::sync::TryLockError;

    use chrono::Utc;
    use courier_core::ManualClock;
    use tokio::sync::Barrier;

    use super::*;
    use crate::message_store::MessageStoreExt;

    fn store_with_clock(options: RetryOptions) -> (InMemoryMessageStore, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryMessageStore::with_clock(options, Arc::new(clock.clone()));
        (store, clock)
    }

    fn order_created() -> NewMessage {
        NewMessage::published("order.created", "orders", br#"{"order_id":1}"#.to_vec())
    }

    fn past_floor(clock: &ManualClock) {
        clock.advance(chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn store_assigns_increasing_ids_per_kind() {
        let store = InMemoryMessageStore::default();

        let a = store.store(order_created()).await.unwrap();
        let b = store.store(order_created()).await.unwrap();
        let r = store
            .store(NewMessage::received("order.created", "billing", b"x".to_vec()))
            .await
            .unwrap();

        assert!(b > a);
        assert_eq!(r.as_i64(), 1, "received has its own identity");

        let stored = store.get_published(a).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Scheduled);
        assert_eq!(stored.retries, 0);
        assert!(stored.expires_at.is_none());
        assert_eq!(stored.content, br#"{"order_id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn store_rejects_invalid_messages() {
        let store = InMemoryMessageStore::default();
        let err = store
            .store(NewMessage::published("", "orders", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.count(MessageKind::Published).unwrap(), 0);
    }

    #[tokio::test]
    async fn get_misses_are_none() {
        let store = InMemoryMessageStore::default();
        assert!(store.get_received(MessageId::from_raw(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_failures_count_two_retries() {
        let store = InMemoryMessageStore::default();
        let id = store.store(order_created()).await.unwrap();

        assert!(store.change_published_state(id, MessageStatus::Failed).await.unwrap());
        assert!(store.change_published_state(id, MessageStatus::Failed).await.unwrap());

        let msg = store.get_published(id).await.unwrap().unwrap();
        assert_eq!(msg.retries, 2);
        assert_eq!(msg.status, MessageStatus::Failed);
        assert!(msg.expires_at.is_none());
    }

    #[tokio::test]
    async fn transition_of_unknown_id_is_a_no_op() {
        let store = InMemoryMessageStore::default();
        let changed = store
            .transition(MessageKind::Published, MessageId::from_raw(7), MessageStatus::Failed)
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn transition_to_scheduled_is_rejected() {
        let store = InMemoryMessageStore::default();
        let id = store.store(order_created()).await.unwrap();
        let err = store
            .transition(MessageKind::Published, id, MessageStatus::Scheduled)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn expires_at_tracks_succeeded_status() {
        let (store, clock) = store_with_clock(RetryOptions::default());
        let id = store.store(order_created()).await.unwrap();

        assert!(store.change_published_state(id, MessageStatus::Succeeded).await.unwrap());
        let msg = store.get_published(id).await.unwrap().unwrap();
        assert_eq!(msg.expires_at, Some(clock.now() + chrono::Duration::hours(1)));

        // Terminal for attempts: a late failure report does not resurrect it.
        assert!(!store.change_published_state(id, MessageStatus::Failed).await.unwrap());

        assert!(store.requeue_published(id).await.unwrap());
        let msg = store.get_published(id).await.unwrap().unwrap();
        assert!(msg.expires_at.is_none());
        assert_eq!(msg.status, MessageStatus::Scheduled);
    }

    #[tokio::test]
    async fn requeue_resets_exhausted_messages() {
        let options = RetryOptions::default().with_retry_limit(3);
        let (store, clock) = store_with_clock(options);
        let id = store.store(order_created()).await.unwrap();

        for _ in 0..3 {
            store.change_published_state(id, MessageStatus::Failed).await.unwrap();
        }
        past_floor(&clock);
        assert!(store.published_needing_retry().await.unwrap().is_empty());

        assert!(store.requeue_published(id).await.unwrap());
        let msg = store.get_published(id).await.unwrap().unwrap();
        assert_eq!(msg.retries, 0);
        assert_eq!(msg.status, MessageStatus::Scheduled);

        let retry = store.published_needing_retry().await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, id);
    }

    #[tokio::test]
    async fn requeue_of_unknown_id_reports_false() {
        let store = InMemoryMessageStore::default();
        assert!(!store.requeue_received(MessageId::from_raw(1)).await.unwrap());
    }

    #[tokio::test]
    async fn scan_respects_age_floor_limit_and_status() {
        let (store, clock) = store_with_clock(RetryOptions::default());
        let scan = RetryScan::new(3, Duration::from_secs(240), 200);

        let fresh = store.store(order_created()).await.unwrap();
        assert!(
            store.list_retryable(MessageKind::Published, scan).await.unwrap().is_empty(),
            "inside the grace window"
        );

        past_floor(&clock);
        let done = store.store(order_created()).await.unwrap();
        let spent = store.store(order_created()).await.unwrap();
        past_floor(&clock);

        store.change_published_state(done, MessageStatus::Succeeded).await.unwrap();
        for _ in 0..3 {
            store.change_published_state(spent, MessageStatus::Failed).await.unwrap();
        }

        let ids: Vec<_> = store
            .list_retryable(MessageKind::Published, scan)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![fresh]);
    }

    #[tokio::test]
    async fn scan_is_capped_by_limit() {
        let (store, clock) = store_with_clock(RetryOptions::default());
        for _ in 0..5 {
            store.store(order_created()).await.unwrap();
        }
        past_floor(&clock);

        let scan = RetryScan::new(3, Duration::from_secs(240), 2);
        assert_eq!(store.list_retryable(MessageKind::Published, scan).await.unwrap().len(), 2);

        let none = RetryScan::new(3, Duration::from_secs(240), 0);
        assert!(store.list_retryable(MessageKind::Published, none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_scenario_end_to_end() {
        let (store, clock) = store_with_clock(RetryOptions::default());
        let scan = RetryScan::new(3, Duration::from_secs(240), 200);

        let id = store.store(order_created()).await.unwrap();
        assert!(store.change_published_state(id, MessageStatus::Failed).await.unwrap());
        assert_eq!(store.get_published(id).await.unwrap().unwrap().retries, 1);

        past_floor(&clock);
        let candidates = store.list_retryable(MessageKind::Published, scan).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, id);

        assert!(store.change_published_state(id, MessageStatus::Succeeded).await.unwrap());
        assert!(store.get_published(id).await.unwrap().unwrap().expires_at.is_some());
        assert!(store.list_retryable(MessageKind::Published, scan).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_success_reports_are_applied_once() {
        let store = Arc::new(InMemoryMessageStore::default());
        let id = store.store(order_created()).await.unwrap();
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .transition(MessageKind::Published, id, MessageStatus::Succeeded)
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let msg = store.get_published(id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Succeeded);
        assert_eq!(msg.retries, 1);
    }

    #[tokio::test]
    async fn transition_from_only_applies_on_expected_status() {
        let store = InMemoryMessageStore::default();
        let id = store.store(order_created()).await.unwrap();

        assert!(store
            .transition_from(MessageKind::Published, id, MessageStatus::Scheduled, MessageStatus::Failed)
            .await
            .unwrap());
        // A second worker that scanned the same Scheduled row loses the claim.
        assert!(!store
            .transition_from(MessageKind::Published, id, MessageStatus::Scheduled, MessageStatus::Failed)
            .await
            .unwrap());
        assert_eq!(store.get_published(id).await.unwrap().unwrap().retries, 1);
    }

    #[tokio::test]
    async fn committed_transaction_persists_messages_and_business_writes() {
        let store = InMemoryMessageStore::default();
        let orders = Arc::new(Mutex::new(Vec::<u32>::new()));

        let mut tx = store.begin().await.unwrap();
        let sink = orders.clone();
        tx.enlist(move || {
            sink.lock().unwrap().push(1);
            Ok(())
        });
        let id = tx.store(order_created()).await.unwrap();

        assert!(store.get_published(id).await.unwrap().is_none(), "not visible before commit");
        tx.commit().await.unwrap();

        assert!(store.get_published(id).await.unwrap().is_some());
        assert_eq!(*orders.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_nothing_behind() {
        let store = InMemoryMessageStore::default();
        let orders = Arc::new(Mutex::new(Vec::<u32>::new()));

        let mut tx = store.begin().await.unwrap();
        let sink = orders.clone();
        tx.enlist(move || {
            sink.lock().unwrap().push(1);
            Ok(())
        });
        let id = tx.store(order_created()).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_published(id).await.unwrap().is_none());
        assert!(orders.lock().unwrap().is_empty());

        // The burned id is not handed out again.
        let next = store.store(order_created()).await.unwrap();
        assert!(next > id);
    }

    #[tokio::test]
    async fn failed_store_poisons_the_transaction() {
        let store = InMemoryMessageStore::default();
        let orders = Arc::new(Mutex::new(Vec::<u32>::new()));

        let mut tx = store.begin().await.unwrap();
        let sink = orders.clone();
        tx.enlist(move || {
            sink.lock().unwrap().push(1);
            Ok(())
        });
        tx.store(order_created()).await.unwrap();
        assert!(tx.store(NewMessage::published("n", "g", Vec::new())).await.is_err());

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.count(MessageKind::Published).unwrap(), 0);
        assert!(orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn readers_wait_while_business_writes_run() {
        let store = InMemoryMessageStore::default();
        let tables = store.tables.clone();
        let observed = Arc::new(Mutex::new(None));

        let mut tx = store.begin().await.unwrap();
        let seen = observed.clone();
        tx.enlist(move || {
            let blocked = matches!(tables.try_read(), Err(TryLockError::WouldBlock));
            *seen.lock().unwrap() = Some(blocked);
            Ok(())
        });
        let id = tx.store(order_created()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(true));
        assert!(store.get_published(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_business_write_aborts_the_commit() {
        let store = InMemoryMessageStore::default();

        let mut tx = store.begin().await.unwrap();
        tx.enlist(|| Err(StoreError::validation("order already exists")));
        let id = tx.store(order_created()).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err, StoreError::validation("order already exists"));
        assert!(store.get_published(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panicking_business_write_commits_nothing() {
        let store = InMemoryMessageStore::default();

        let mut tx = store.begin().await.unwrap();
        tx.enlist(|| panic!("business write blew up"));
        tx.store(order_created()).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert_eq!(store.count(MessageKind::Published).unwrap(), 0);

        // The lock is not left poisoned.
        store.store(order_created()).await.unwrap();
        assert_eq!(store.count(MessageKind::Published).unwrap(), 1);
    }

    #[tokio::test]
    async fn lock_failure_during_store_poisons_the_transaction() {
        let store = InMemoryMessageStore::default();

        let mut tx = store.begin().await.unwrap();
        tx.store(order_created()).await.unwrap();

        let tables = store.tables.clone();
        let _ = std::thread::spawn(move || {
            let _guard = tables.write().unwrap();
            panic!("poison the tables");
        })
        .join();

        let err = tx.store(order_created()).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        store.tables.clear_poison();
        assert_eq!(tx.commit().await.unwrap_err(), err);
        assert_eq!(store.count(MessageKind::Published).unwrap(), 0);
    }
}
