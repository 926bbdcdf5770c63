//! Postgres-backed message store implementation.
//!
//! This module provides the durable message store on top of PostgreSQL. The
//! `published` and `received` tables live in a configurable schema; their
//! shape is:
//!
//! ```text
//! id          BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY
//! name        VARCHAR(200) NOT NULL
//! "group"     VARCHAR(200) NOT NULL
//! content     BYTEA        NOT NULL
//! retries     INTEGER      NOT NULL
//! added       TIMESTAMPTZ  NOT NULL
//! expires_at  TIMESTAMPTZ  NULL
//! status_name VARCHAR(40)  NOT NULL
//! ```
//!
//! Provisioning the tables is left to the deployment's migration tooling.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `23502`, `23514`, `22001` | `Validation` | NULL, check or length violation |
//! | Database | class `08`, `57P0x`, `53300` | `Unavailable` | Connection lost, server shutting down, too many connections |
//! | Database | `40001`, `40P01`, `55P03`, `57014` | `Unavailable` | Serialization failure, deadlock, lock timeout, statement timeout |
//! | Database | Any other | `Storage` | Other database errors |
//! | PoolTimedOut / PoolClosed / Io / Tls / Protocol | N/A | `Unavailable` | Connectivity loss |
//! | ColumnDecode / Decode | N/A | `Corrupted` | Row does not match the record shape |
//! | Other | N/A | `Storage` | Anything else |
//!
//! Every call is additionally bounded by `StoreOptions::command_timeout`; an
//! expired call is reported as `Unavailable`.
//!
//! ## Thread Safety
//!
//! `PgMessageStore` is `Send + Sync` and cheap to clone. All operations go
//! through the SQLx connection pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgPoolOptions, PgRow};
use sqlx::query::QueryScalar;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};

use courier_core::{
    Clock, MessageId, MessageKind, MessageStatus, NewMessage, RetryOptions, RetryScan,
    StoreError, StoreOptions, StoredMessage, SystemClock,
};

use super::queries::MessageQueries;
use super::r#trait::{MessageStore, StoreTransaction};
use crate::config::PgStoreConfig;

/// Postgres-backed outbox/inbox message store.
///
/// ## Skip-Locked Scans
///
/// `list_retryable` reads with `FOR SHARE SKIP LOCKED` in its own autocommit
/// statement. Rows that a concurrent `transition` is updating are left out of
/// this scan and show up in the next one. Concurrent scanners do not skip each
/// other's rows, since share locks do not conflict.
///
/// ## Atomic Transitions
///
/// `transition` and `requeue` are single `UPDATE` statements. `transition`
/// only matches rows in `Scheduled` or `Failed`, so of several workers
/// reporting success for the same record exactly one sees a changed row.
#[derive(Clone)]
pub struct PgMessageStore {
    pool: Arc<PgPool>,
    queries: Arc<MessageQueries>,
    options: StoreOptions,
    retry: RetryOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PgMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMessageStore")
            .field("options", &self.options)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PgMessageStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool, options: StoreOptions, retry: RetryOptions) -> Result<Self, StoreError> {
        Self::with_clock(pool, options, retry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pool: PgPool,
        options: StoreOptions,
        retry: RetryOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let queries = MessageQueries::new(&options)?;
        Ok(Self {
            pool: Arc::new(pool),
            queries: Arc::new(queries),
            options,
            retry,
            clock,
        })
    }

    /// Build a pool from `config` and wrap it.
    ///
    /// The pool's acquire timeout equals the command timeout, so waiting for a
    /// connection is bounded like every other storage call.
    #[instrument(skip(config), fields(schema = %config.store.schema), err)]
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        config.store.validate()?;
        let timeout = config.store.command_timeout;

        let connect = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(timeout)
            .connect(&config.database_url);
        let pool = bounded("connect", timeout, connect).await?;

        Self::new(pool, config.store.clone(), config.retry.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store_options(&self) -> &StoreOptions {
        &self.options
    }

    fn expires_at(&self, next: MessageStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match next {
            MessageStatus::Succeeded => Some(now + self.retry.succeeded_expiry_delta()),
            _ => None,
        }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    type Transaction = PgMessageTransaction;

    fn retry_options(&self) -> &RetryOptions {
        &self.retry
    }

    #[instrument(
        skip(self, message),
        fields(kind = %message.kind, name = %message.name, id = field::Empty),
        err
    )]
    async fn store(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        message.validate()?;
        let added = self.clock.now();
        let sql = &self.queries.table(message.kind).insert;

        let id = bounded(
            "store",
            self.options.command_timeout,
            bind_insert(sql, &message, added).fetch_one(&*self.pool),
        )
        .await?;

        Span::current().record("id", id);
        Ok(MessageId::from_raw(id))
    }

    #[instrument(skip(self), fields(kind = %kind, id = %id, found = field::Empty), err)]
    async fn get(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let sql = &self.queries.table(kind).select_by_id;

        let row = bounded(
            "get",
            self.options.command_timeout,
            sqlx::query(sql).bind(id.as_i64()).fetch_optional(&*self.pool),
        )
        .await?;

        Span::current().record("found", row.is_some());
        row.map(|row| decode_row(kind, &row)).transpose()
    }

    #[instrument(
        skip(self),
        fields(kind = %kind, retry_limit = scan.retry_limit, limit = scan.limit, count = field::Empty),
        err
    )]
    async fn list_retryable(
        &self,
        kind: MessageKind,
        scan: RetryScan,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if scan.limit == 0 || scan.retry_limit == 0 {
            return Ok(vec![]);
        }

        let cutoff = scan.cutoff(self.clock.now());
        let sql = &self.queries.table(kind).select_retryable;

        let rows = bounded(
            "list_retryable",
            self.options.command_timeout,
            sqlx::query(sql)
                .bind(i32::try_from(scan.retry_limit).unwrap_or(i32::MAX))
                .bind(cutoff)
                .bind(MessageStatus::Failed.as_str())
                .bind(MessageStatus::Scheduled.as_str())
                .bind(i64::try_from(scan.limit).unwrap_or(i64::MAX))
                .fetch_all(&*self.pool),
        )
        .await?;

        Span::current().record("count", rows.len());
        rows.iter().map(|row| decode_row(kind, row)).collect()
    }

    #[instrument(skip(self), fields(kind = %kind, id = %id, next = %next, changed = field::Empty), err)]
    async fn transition(
        &self,
        kind: MessageKind,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        MessageStatus::ensure_transition_target(next)?;
        let sql = &self.queries.table(kind).transition;
        let expires_at = self.expires_at(next, self.clock.now());

        let result = bounded(
            "transition",
            self.options.command_timeout,
            sqlx::query(sql)
                .bind(id.as_i64())
                .bind(expires_at)
                .bind(next.as_str())
                .bind(MessageStatus::Scheduled.as_str())
                .bind(MessageStatus::Failed.as_str())
                .execute(&*self.pool),
        )
        .await?;

        let changed = result.rows_affected() > 0;
        Span::current().record("changed", changed);
        Ok(changed)
    }

    #[instrument(
        skip(self),
        fields(kind = %kind, id = %id, expected = %expected, next = %next, changed = field::Empty),
        err
    )]
    async fn transition_from(
        &self,
        kind: MessageKind,
        id: MessageId,
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        MessageStatus::ensure_transition_target(next)?;
        if !expected.can_transition_to(next) {
            return Ok(false);
        }
        let sql = &self.queries.table(kind).transition_from;
        let expires_at = self.expires_at(next, self.clock.now());

        let result = bounded(
            "transition_from",
            self.options.command_timeout,
            sqlx::query(sql)
                .bind(id.as_i64())
                .bind(expires_at)
                .bind(next.as_str())
                .bind(expected.as_str())
                .execute(&*self.pool),
        )
        .await?;

        let changed = result.rows_affected() > 0;
        Span::current().record("changed", changed);
        Ok(changed)
    }

    #[instrument(skip(self), fields(kind = %kind, id = %id, changed = field::Empty), err)]
    async fn requeue(&self, kind: MessageKind, id: MessageId) -> Result<bool, StoreError> {
        let sql = &self.queries.table(kind).requeue;

        let result = bounded(
            "requeue",
            self.options.command_timeout,
            sqlx::query(sql)
                .bind(id.as_i64())
                .bind(MessageStatus::Scheduled.as_str())
                .execute(&*self.pool),
        )
        .await?;

        let changed = result.rows_affected() > 0;
        Span::current().record("changed", changed);
        Ok(changed)
    }

    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let tx = bounded("begin_transaction", self.options.command_timeout, self.pool.begin()).await?;

        Ok(PgMessageTransaction {
            tx,
            queries: self.queries.clone(),
            clock: self.clock.clone(),
            timeout: self.options.command_timeout,
            failure: None,
        })
    }
}

/// A Postgres transaction that message writes and business writes share.
///
/// Issue business statements on [`connection`](Self::connection); they commit
/// or roll back together with every message stored through this value.
/// Dropping it without `commit` rolls back.
pub struct PgMessageTransaction {
    tx: Transaction<'static, Postgres>,
    queries: Arc<MessageQueries>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    failure: Option<StoreError>,
}

impl PgMessageTransaction {
    /// The underlying connection, for the caller's own statements.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Run a caller statement under the store's command timeout.
    ///
    /// A failure poisons the transaction the same way a failed `store` does.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, StoreError> {
        let result = bounded(
            "execute",
            self.timeout,
            sqlx::query(sql).execute(&mut *self.tx),
        )
        .await;
        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.poison(e)),
        }
    }

    fn poison(&mut self, err: StoreError) -> StoreError {
        self.failure.get_or_insert_with(|| err.clone());
        err
    }
}

#[async_trait]
impl StoreTransaction for PgMessageTransaction {
    #[instrument(
        skip(self, message),
        fields(kind = %message.kind, name = %message.name, id = field::Empty),
        err
    )]
    async fn store(&mut self, message: NewMessage) -> Result<MessageId, StoreError> {
        if let Err(e) = message.validate() {
            return Err(self.poison(e));
        }
        let added = self.clock.now();
        let sql = &self.queries.table(message.kind).insert;

        let result = bounded(
            "store_in_transaction",
            self.timeout,
            bind_insert(sql, &message, added).fetch_one(&mut *self.tx),
        )
        .await;

        match result {
            Ok(id) => {
                Span::current().record("id", id);
                Ok(MessageId::from_raw(id))
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn commit(self) -> Result<(), StoreError> {
        if let Some(failure) = self.failure {
            bounded("rollback", self.timeout, self.tx.rollback()).await?;
            return Err(failure);
        }
        bounded("commit_transaction", self.timeout, self.tx.commit()).await
    }

    #[instrument(skip(self), err)]
    async fn rollback(self) -> Result<(), StoreError> {
        bounded("rollback", self.timeout, self.tx.rollback()).await
    }
}

fn bind_insert<'q>(
    sql: &'q str,
    message: &'q NewMessage,
    added: DateTime<Utc>,
) -> QueryScalar<'q, Postgres, i64, PgArguments> {
    sqlx::query_scalar(sql)
        .bind(&message.name)
        .bind(&message.group)
        .bind(&message.content)
        .bind(added)
        .bind(MessageStatus::Scheduled.as_str())
}

/// Await a storage call under `timeout`, mapping both failure modes to `StoreError`.
async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| map_sqlx_error(operation, e)),
        Err(_) => Err(StoreError::unavailable(format!(
            "{operation} timed out after {timeout:?}"
        ))),
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23502" | "23514" | "22001") => StoreError::Validation(msg),
                Some("40001" | "40P01" | "55P03" | "57014" | "53300") => {
                    StoreError::Unavailable(msg)
                }
                Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::Protocol(e) => {
            StoreError::unavailable(format!("protocol error in {}: {}", operation, e))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::corrupted(format!(
            "failed to decode column {} in {}: {}",
            index, operation, source
        )),
        sqlx::Error::Decode(e) => {
            StoreError::corrupted(format!("decode error in {}: {}", operation, e))
        }
        _ => StoreError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct MessageRow {
    id: i64,
    name: String,
    group: String,
    content: Vec<u8>,
    retries: i32,
    added: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status_name: String,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            group: row.try_get("group")?,
            content: row.try_get("content")?,
            retries: row.try_get("retries")?,
            added: row.try_get("added")?,
            expires_at: row.try_get("expires_at")?,
            status_name: row.try_get("status_name")?,
        })
    }
}

impl MessageRow {
    fn into_message(self, kind: MessageKind) -> Result<StoredMessage, StoreError> {
        let retries = u32::try_from(self.retries).map_err(|_| {
            StoreError::corrupted(format!("message {} has negative retries {}", self.id, self.retries))
        })?;

        Ok(StoredMessage {
            kind,
            id: MessageId::from_raw(self.id),
            name: self.name,
            group: self.group,
            content: self.content,
            retries,
            added: self.added,
            expires_at: self.expires_at,
            status: self.status_name.parse()?,
        })
    }
}

fn decode_row(kind: MessageKind, row: &PgRow) -> Result<StoredMessage, StoreError> {
    MessageRow::from_row(row)
        .map_err(|e| StoreError::corrupted(format!("failed to deserialize message row: {}", e)))?
        .into_message(kind)
}
