//! Configuration loading and representation.

use std::time::Duration;

use courier_core::{RetryOptions, StoreOptions};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything needed to open a [`PgMessageStore`](crate::message_store::PgMessageStore).
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub store: StoreOptions,
    pub retry: RetryOptions,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            store: StoreOptions::default(),
            retry: RetryOptions::default(),
        }
    }

    pub fn with_store(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Load from the process environment.
    ///
    /// `DATABASE_URL` is required; every other key falls back to its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(schema) = lookup("COURIER_SCHEMA") {
            config.store.schema = schema;
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_COMMAND_TIMEOUT_SECS")? {
            config.store.command_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<u32>(&lookup, "COURIER_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(limit) = parse::<u32>(&lookup, "COURIER_RETRY_LIMIT")? {
            config.retry.retry_limit = limit;
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_AGE_FLOOR_SECS")? {
            config.retry.age_floor = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(&lookup, "COURIER_BATCH_SIZE")? {
            config.retry.batch_size = size;
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_SUCCEEDED_EXPIRY_SECS")? {
            config.retry.succeeded_expiry = Duration::from_secs(secs);
        }

        config.store.validate().map_err(|e| ConfigError::Invalid {
            key: "COURIER_SCHEMA",
            value: config.store.schema.clone(),
            reason: e.to_string(),
        })?;

        Ok(config)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_url_is_required() {
        let err = PgStoreConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config = PgStoreConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/app")]))
            .unwrap();
        assert_eq!(config.store, StoreOptions::default());
        assert_eq!(config.retry, RetryOptions::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = PgStoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/app"),
            ("COURIER_SCHEMA", "cap"),
            ("COURIER_RETRY_LIMIT", "3"),
            ("COURIER_AGE_FLOOR_SECS", "30"),
            ("COURIER_BATCH_SIZE", "50"),
            ("COURIER_COMMAND_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.store.schema, "cap");
        assert_eq!(config.store.command_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.retry_limit, 3);
        assert_eq!(config.retry.age_floor, Duration::from_secs(30));
        assert_eq!(config.retry.batch_size, 50);
    }

    #[test]
    fn malformed_numbers_are_reported_with_their_key() {
        let err = PgStoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/app"),
            ("COURIER_RETRY_LIMIT", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_RETRY_LIMIT", .. }));
    }

    #[test]
    fn bad_schema_is_rejected() {
        let err = PgStoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/app"),
            ("COURIER_SCHEMA", "public; drop"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_SCHEMA", .. }));
    }
}
