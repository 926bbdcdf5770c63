//! Postgres query text for the message tables.
//!
//! Query text is built once per store from the validated schema name. Every
//! value (ids, limits, timestamps, status names) is bound as a parameter;
//! only the identifier is spliced in, because identifiers cannot be bound.

use courier_core::{MessageKind, StoreError, StoreOptions};

const COLUMNS: &str = r#"id, name, "group", content, retries, added, expires_at, status_name"#;

/// Statements for one message table.
#[derive(Debug, Clone)]
pub(crate) struct TableQueries {
    /// `$1 name, $2 group, $3 content, $4 added, $5 status` → `id`
    pub insert: String,
    /// `$1 id`
    pub select_by_id: String,
    /// `$1 retry limit, $2 cutoff, $3/$4 dispatchable statuses, $5 limit`
    pub select_retryable: String,
    /// `$1 id, $2 expires_at, $3 next status, $4/$5 dispatchable statuses`
    pub transition: String,
    /// `$1 id, $2 expires_at, $3 next status, $4 expected status`
    pub transition_from: String,
    /// `$1 id, $2 scheduled status`
    pub requeue: String,
}

impl TableQueries {
    fn new(schema: &str, kind: MessageKind) -> Self {
        let table = format!(r#""{schema}"."{}""#, kind.table_name());

        Self {
            insert: format!(
                r#"
                INSERT INTO {table} (name, "group", content, retries, added, expires_at, status_name)
                VALUES ($1, $2, $3, 0, $4, NULL, $5)
                RETURNING id
                "#
            ),
            // MVCC reads never wait on row locks; the lookup sees the last committed version.
            select_by_id: format!(
                r#"
                SELECT {COLUMNS}
                FROM {table}
                WHERE id = $1
                "#
            ),
            // Rows held by an in-flight transition are skipped, not waited on.
            select_retryable: format!(
                r#"
                SELECT {COLUMNS}
                FROM {table}
                WHERE retries < $1
                    AND added < $2
                    AND status_name IN ($3, $4)
                ORDER BY id ASC
                LIMIT $5
                FOR SHARE SKIP LOCKED
                "#
            ),
            transition: format!(
                r#"
                UPDATE {table}
                SET retries = retries + 1, expires_at = $2, status_name = $3
                WHERE id = $1 AND status_name IN ($4, $5)
                "#
            ),
            transition_from: format!(
                r#"
                UPDATE {table}
                SET retries = retries + 1, expires_at = $2, status_name = $3
                WHERE id = $1 AND status_name = $4
                "#
            ),
            requeue: format!(
                r#"
                UPDATE {table}
                SET retries = 0, expires_at = NULL, status_name = $2
                WHERE id = $1
                "#
            ),
        }
    }
}

/// Statements for both message tables of one schema.
#[derive(Debug, Clone)]
pub(crate) struct MessageQueries {
    published: TableQueries,
    received: TableQueries,
}

impl MessageQueries {
    pub fn new(options: &StoreOptions) -> Result<Self, StoreError> {
        options.validate()?;
        Ok(Self {
            published: TableQueries::new(&options.schema, MessageKind::Published),
            received: TableQueries::new(&options.schema, MessageKind::Received),
        })
    }

    pub fn table(&self, kind: MessageKind) -> &TableQueries {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }
}
