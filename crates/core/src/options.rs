//! Store and retry configuration.
//!
//! Both structs are passed explicitly to stores at construction time. Nothing
//! here is process-global, so tests can run stores with different limits side
//! by side.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Longest schema name accepted (Postgres identifier limit).
pub const MAX_SCHEMA_LEN: usize = 63;

/// Retry scanning policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Attempts after which a message stops being retried automatically.
    pub retry_limit: u32,
    /// Minimum age before a pending message becomes retry-eligible.
    pub age_floor: Duration,
    /// Maximum candidates returned by one scan.
    pub batch_size: usize,
    /// How long a succeeded message is kept before an external cleaner may delete it.
    pub succeeded_expiry: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retry_limit: 50,
            age_floor: Duration::from_secs(4 * 60),
            batch_size: 200,
            succeeded_expiry: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryOptions {
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_age_floor(mut self, age_floor: Duration) -> Self {
        self.age_floor = age_floor;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_succeeded_expiry(mut self, succeeded_expiry: Duration) -> Self {
        self.succeeded_expiry = succeeded_expiry;
        self
    }

    /// Scan parameters derived from this policy.
    pub fn scan(&self) -> RetryScan {
        RetryScan {
            retry_limit: self.retry_limit,
            age_floor: self.age_floor,
            limit: self.batch_size,
        }
    }

    pub fn succeeded_expiry_delta(&self) -> chrono::Duration {
        to_delta(self.succeeded_expiry)
    }
}

/// Parameters of a single retry scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryScan {
    pub retry_limit: u32,
    pub age_floor: Duration,
    pub limit: usize,
}

impl RetryScan {
    pub fn new(retry_limit: u32, age_floor: Duration, limit: usize) -> Self {
        Self {
            retry_limit,
            age_floor,
            limit,
        }
    }

    /// Records added at or after this instant are still inside the grace window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(to_delta(self.age_floor))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 1000))
}

/// Backend-independent store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Logical schema / namespace holding the `published` and `received` tables.
    pub schema: String,
    /// Upper bound on every storage call.
    pub command_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            schema: "courier".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreOptions {
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The schema is spliced into query text (identifiers cannot be bound),
    /// so only plain identifiers are accepted.
    pub fn validate(&self) -> Result<(), StoreError> {
        let schema = self.schema.as_str();
        let mut chars = schema.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !first_ok || !rest_ok || schema.len() > MAX_SCHEMA_LEN {
            return Err(StoreError::validation(format!(
                "schema '{schema}' is not a plain identifier"
            )));
        }
        if self.command_timeout.is_zero() {
            return Err(StoreError::validation("command_timeout must be positive"));
        }
        Ok(())
    }
}
