//! Configuration management for the client runtime.

use grantsync_engine::{DeniedPolicy, ReconcilePlan, TombstonePruning};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default interval between periodic full syncs (five minutes).
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 300_000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory the file-backed tombstone storage writes into
    pub tombstone_dir: PathBuf,
    /// Re-fetch delays after creates, updates and saves
    pub create_plan: ReconcilePlan,
    /// Re-fetch delays after deletes
    pub delete_plan: ReconcilePlan,
    /// Minimum time between periodic full syncs
    pub sync_interval: Duration,
    /// Whether confirmed-absent tombstones are cleared
    pub pruning: TombstonePruning,
    /// Local handling of permission-denied deletes
    pub denied_policy: DeniedPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tombstone_dir: PathBuf::from(".grantsync"),
            create_plan: ReconcilePlan::for_create(),
            delete_plan: ReconcilePlan::for_delete(),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            pruning: TombstonePruning::default(),
            denied_policy: DeniedPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Unset keys fall back to [`Config::default`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tombstone_dir = lookup("GRANTSYNC_TOMBSTONE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.tombstone_dir);

        let create_plan = match lookup("GRANTSYNC_CREATE_DELAYS_MS") {
            Some(raw) => parse_plan("GRANTSYNC_CREATE_DELAYS_MS", &raw)?,
            None => defaults.create_plan,
        };

        let delete_plan = match lookup("GRANTSYNC_DELETE_DELAYS_MS") {
            Some(raw) => parse_plan("GRANTSYNC_DELETE_DELAYS_MS", &raw)?,
            None => defaults.delete_plan,
        };

        let sync_interval = match lookup("GRANTSYNC_SYNC_INTERVAL_MS") {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidSyncInterval(raw))?,
            None => defaults.sync_interval,
        };

        let pruning = match lookup("GRANTSYNC_TOMBSTONE_PRUNING").as_deref().map(str::trim) {
            None => defaults.pruning,
            Some("never") => TombstonePruning::Never,
            Some("confirmed-absence") => TombstonePruning::ConfirmedAbsence,
            Some(other) => return Err(ConfigError::InvalidPruning(other.to_string())),
        };

        let denied_policy = match lookup("GRANTSYNC_PERMISSION_DENIED").as_deref().map(str::trim)
        {
            None => defaults.denied_policy,
            Some("keep-optimistic") => DeniedPolicy::KeepOptimistic,
            Some("rollback") => DeniedPolicy::Rollback,
            Some(other) => return Err(ConfigError::InvalidDeniedPolicy(other.to_string())),
        };

        Ok(Self {
            tombstone_dir,
            create_plan,
            delete_plan,
            sync_interval,
            pruning,
            denied_policy,
        })
    }
}

/// Parse a comma-separated list of millisecond delays.
fn parse_plan(key: &'static str, raw: &str) -> Result<ReconcilePlan, ConfigError> {
    let delays = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidDelays {
            key,
            value: raw.to_string(),
        })?;

    if delays.is_empty() {
        return Err(ConfigError::InvalidDelays {
            key,
            value: raw.to_string(),
        });
    }

    Ok(ReconcilePlan::from_millis(delays))
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a comma-separated list of milliseconds, got {value:?}")]
    InvalidDelays { key: &'static str, value: String },

    #[error("Invalid GRANTSYNC_SYNC_INTERVAL_MS value {0:?}")]
    InvalidSyncInterval(String),

    #[error("GRANTSYNC_TOMBSTONE_PRUNING must be never or confirmed-absence, got {0:?}")]
    InvalidPruning(String),

    #[error("GRANTSYNC_PERMISSION_DENIED must be keep-optimistic or rollback, got {0:?}")]
    InvalidDeniedPolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.create_plan.delays_ms, vec![50, 300, 800, 1_500, 3_000]);
        assert_eq!(config.delete_plan.delays_ms, vec![100, 500, 1_000, 2_000]);
        assert_eq!(config.sync_interval, Duration::from_secs(300));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("GRANTSYNC_TOMBSTONE_DIR", "/tmp/gs"),
            ("GRANTSYNC_DELETE_DELAYS_MS", "10, 20,30"),
            ("GRANTSYNC_SYNC_INTERVAL_MS", "1000"),
            ("GRANTSYNC_TOMBSTONE_PRUNING", "never"),
            ("GRANTSYNC_PERMISSION_DENIED", "rollback"),
        ]))
        .unwrap();

        assert_eq!(config.tombstone_dir, PathBuf::from("/tmp/gs"));
        assert_eq!(config.delete_plan.delays_ms, vec![10, 20, 30]);
        assert_eq!(config.sync_interval, Duration::from_secs(1));
        assert_eq!(config.pruning, TombstonePruning::Never);
        assert_eq!(config.denied_policy, DeniedPolicy::Rollback);
    }

    #[test]
    fn bad_delays_rejected() {
        let err = Config::from_lookup(lookup(&[("GRANTSYNC_CREATE_DELAYS_MS", "50,soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDelays {
                key: "GRANTSYNC_CREATE_DELAYS_MS",
                ..
            }
        ));

        assert!(Config::from_lookup(lookup(&[("GRANTSYNC_DELETE_DELAYS_MS", " , ")])).is_err());
    }

    #[test]
    fn unknown_policies_rejected() {
        assert_eq!(
            Config::from_lookup(lookup(&[("GRANTSYNC_TOMBSTONE_PRUNING", "sometimes")])),
            Err(ConfigError::InvalidPruning("sometimes".into()))
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("GRANTSYNC_PERMISSION_DENIED", "ignore")])),
            Err(ConfigError::InvalidDeniedPolicy("ignore".into()))
        );
    }
}
