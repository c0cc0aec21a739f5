//! Bus configuration.
//!
//! Defaults are production-ready; every value can be overridden from the
//! environment (`EVENTBUS_*`) or from an explicit key/value map.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use eventbus_events::CommitMode;

use crate::event_store::RetentionScope;
use crate::workers::{CleanupConfig, ConsumerConfig, RelayConfig};

/// Environment keys read by [`BusConfig::from_env`].
pub mod keys {
    pub const RELAY_POLL_INTERVAL_MS: &str = "EVENTBUS_RELAY_POLL_INTERVAL_MS";
    pub const RELAY_BATCH_SIZE: &str = "EVENTBUS_RELAY_BATCH_SIZE";
    pub const RETENTION_SECS: &str = "EVENTBUS_RETENTION_SECS";
    pub const CLEANUP_INTERVAL_SECS: &str = "EVENTBUS_CLEANUP_INTERVAL_SECS";
    pub const RETENTION_SCOPE: &str = "EVENTBUS_RETENTION_SCOPE";
    pub const DEFAULT_COMMIT_MODE: &str = "EVENTBUS_DEFAULT_COMMIT_MODE";
    pub const CONSUMER_BATCH_SIZE: &str = "EVENTBUS_CONSUMER_BATCH_SIZE";
    pub const CONSUMER_POLL_TIMEOUT_MS: &str = "EVENTBUS_CONSUMER_POLL_TIMEOUT_MS";
    pub const CONSUMER_AUTO_COMMIT_INTERVAL_MS: &str = "EVENTBUS_CONSUMER_AUTO_COMMIT_INTERVAL_MS";
    pub const CONSUMER_FAILURE_BACKOFF_MS: &str = "EVENTBUS_CONSUMER_FAILURE_BACKOFF_MS";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Retention shorter than this many relay intervals is flagged at startup.
const RETENTION_WARN_FACTOR: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub relay_poll_interval: Duration,
    pub relay_batch_size: usize,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub retention_scope: RetentionScope,
    pub default_commit_mode: CommitMode,
    pub consumer: ConsumerConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        let cleanup = CleanupConfig::default();
        Self {
            relay_poll_interval: relay.poll_interval,
            relay_batch_size: relay.batch_size,
            retention: cleanup.retention,
            cleanup_interval: cleanup.interval,
            retention_scope: cleanup.scope,
            default_commit_mode: CommitMode::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn with_relay_poll_interval(mut self, interval: Duration) -> Self {
        self.relay_poll_interval = interval;
        self
    }

    pub fn with_relay_batch_size(mut self, batch_size: usize) -> Self {
        self.relay_batch_size = batch_size;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_retention_scope(mut self, scope: RetentionScope) -> Self {
        self.retention_scope = scope;
        self
    }

    pub fn with_default_commit_mode(mut self, mode: CommitMode) -> Self {
        self.default_commit_mode = mode;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Read overrides from `EVENTBUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides from a key/value map using the same keys as [`from_env`](Self::from_env).
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, keys::RELAY_POLL_INTERVAL_MS)? {
            config.relay_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, keys::RELAY_BATCH_SIZE)? {
            config.relay_batch_size = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, keys::RETENTION_SECS)? {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, keys::CLEANUP_INTERVAL_SECS)? {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(scope) = parse::<RetentionScope>(&lookup, keys::RETENTION_SCOPE)? {
            config.retention_scope = scope;
        }
        if let Some(mode) = parse::<CommitMode>(&lookup, keys::DEFAULT_COMMIT_MODE)? {
            config.default_commit_mode = mode;
        }
        if let Some(n) = parse::<usize>(&lookup, keys::CONSUMER_BATCH_SIZE)? {
            config.consumer.batch_size = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, keys::CONSUMER_POLL_TIMEOUT_MS)? {
            config.consumer.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, keys::CONSUMER_AUTO_COMMIT_INTERVAL_MS)? {
            config.consumer.auto_commit_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, keys::CONSUMER_FAILURE_BACKOFF_MS)? {
            config.consumer.failure_backoff = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_poll_interval.is_zero() {
            return Err(ConfigError::Zero("relay poll interval"));
        }
        if self.relay_batch_size == 0 {
            return Err(ConfigError::Zero("relay batch size"));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::Zero("retention"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Zero("cleanup interval"));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Zero("consumer batch size"));
        }
        if self.consumer.poll_timeout.is_zero() {
            return Err(ConfigError::Zero("consumer poll timeout"));
        }
        if self.default_commit_mode.uses_broker_auto_commit()
            && self.consumer.auto_commit_interval.is_zero()
        {
            return Err(ConfigError::Zero("auto-commit interval"));
        }
        Ok(())
    }

    /// Retention short enough that cleanup may delete rows the relay has not
    /// reached yet (only relevant for [`RetentionScope::All`]).
    pub fn retention_is_risky(&self) -> bool {
        self.retention_scope == RetentionScope::All
            && self.retention < self.relay_poll_interval.saturating_mul(RETENTION_WARN_FACTOR)
    }

    pub(crate) fn warn_if_risky(&self) {
        if self.retention_is_risky() {
            warn!(
                retention_ms = self.retention.as_millis() as u64,
                relay_poll_interval_ms = self.relay_poll_interval.as_millis() as u64,
                "retention is shorter than {RETENTION_WARN_FACTOR} relay intervals; \
                 cleanup may delete events before they are published"
            );
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: self.relay_poll_interval,
            batch_size: self.relay_batch_size,
        }
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: self.cleanup_interval,
            retention: self.retention,
            scope: self.retention_scope,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BusConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.relay_poll_interval, Duration::from_millis(100));
        assert_eq!(config.relay_batch_size, 100);
        assert_eq!(config.retention, Duration::from_secs(604_800));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.retention_scope, RetentionScope::All);
        assert_eq!(config.default_commit_mode, CommitMode::EndOfBatchCommit);
        assert_eq!(config.consumer, ConsumerConfig::default());
        assert!(!config.retention_is_risky());
    }

    #[test]
    fn overrides_are_applied() {
        let config = BusConfig::from_map(&map(&[
            (keys::RELAY_POLL_INTERVAL_MS, "25"),
            (keys::RETENTION_SECS, "5"),
            (keys::RETENTION_SCOPE, "published-only"),
            (keys::DEFAULT_COMMIT_MODE, "message-commit"),
            (keys::CONSUMER_FAILURE_BACKOFF_MS, "50"),
        ]))
        .unwrap();

        assert_eq!(config.relay_poll_interval, Duration::from_millis(25));
        assert_eq!(config.retention, Duration::from_secs(5));
        assert_eq!(config.retention_scope, RetentionScope::PublishedOnly);
        assert_eq!(config.default_commit_mode, CommitMode::MessageCommit);
        assert_eq!(config.consumer.failure_backoff, Duration::from_millis(50));
    }

    #[test]
    fn malformed_value_names_the_key() {
        let err = BusConfig::from_map(&map(&[(keys::RELAY_BATCH_SIZE, "lots")])).unwrap_err();
        match err {
            ConfigError::Invalid { key, value, .. } => {
                assert_eq!(key, keys::RELAY_BATCH_SIZE);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = BusConfig::from_map(&map(&[(keys::RETENTION_SECS, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero("retention"));

        let err = BusConfig::default().with_relay_batch_size(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::Zero("relay batch size"));
    }

    #[test]
    fn short_retention_is_flagged_only_for_unguarded_scope() {
        let config = BusConfig::default()
            .with_relay_poll_interval(Duration::from_secs(1))
            .with_retention(Duration::from_secs(5));
        assert!(config.retention_is_risky());
        assert!(!config.with_retention_scope(RetentionScope::PublishedOnly).retention_is_risky());
    }
}
