//! Key-value settings storage backed by SQLite, and the engine
//! configuration read from it.
//!
//! Shares a database with the stores in [`Stores`](crate::engine::Stores);
//! pass the same path to both.

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::Connection;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::consts::{DEFAULT_LEDGER_RETENTION, DEFAULT_SHARDS, DEFAULT_STORE_TIMEOUT};
use crate::dispatch::retry::RetryPolicy;

pub const MAX_ATTEMPTS: &str = "dispatch.max_attempts";
pub const BASE_DELAY_MS: &str = "dispatch.base_delay_ms";
pub const MAX_DELAY_MS: &str = "dispatch.max_delay_ms";
pub const SHARDS: &str = "dispatch.shards";
pub const STORE_TIMEOUT_MS: &str = "store.timeout_ms";
pub const LEDGER_RETENTION_MS: &str = "store.ledger_retention_ms";
pub const ALLOW_MULTIPLE_TYPES: &str = "reactions.allow_multiple_types";

/// Every key the engine reads.
pub const KEYS: &[&str] = &[
    MAX_ATTEMPTS,
    BASE_DELAY_MS,
    MAX_DELAY_MS,
    SHARDS,
    STORE_TIMEOUT_MS,
    LEDGER_RETENTION_MS,
    ALLOW_MULTIPLE_TYPES,
];

/// Persistent key-value settings store.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open or create the settings table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open settings database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create settings table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("settings connection lock poisoned"))
    }

    /// Get a setting by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a setting (upsert). Only keys in [`KEYS`] are accepted.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if !KEYS.contains(&key) {
            bail!("unknown setting: {key} (known: {})", KEYS.join(", "));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a setting, reverting it to its default.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    /// All stored settings, by key.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key ASC")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn read<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key)? {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid value {raw:?} for {key}: {e}")),
        }
    }
}

/// Runtime knobs for the engine and its dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Number of ordered delivery channels.
    pub shards: usize,
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Minimum age of a dedup ledger entry before it may be pruned.
    pub ledger_retention: Duration,
    pub allow_multiple_types: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            shards: DEFAULT_SHARDS,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            ledger_retention: DEFAULT_LEDGER_RETENTION,
            allow_multiple_types: true,
        }
    }
}

impl EngineConfig {
    /// Reads every known key, falling back to defaults for absent ones.
    pub fn load(config: &Config) -> Result<Self> {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: config.read(MAX_ATTEMPTS, defaults.retry.max_attempts)?,
            base_delay: Duration::from_millis(
                config.read(BASE_DELAY_MS, defaults.retry.base_delay.as_millis() as u64)?,
            ),
            max_delay: Duration::from_millis(
                config.read(MAX_DELAY_MS, defaults.retry.max_delay.as_millis() as u64)?,
            ),
        };
        if retry.max_attempts == 0 {
            bail!("{MAX_ATTEMPTS} must be at least 1");
        }

        let shards = config.read(SHARDS, defaults.shards)?;
        if shards == 0 {
            bail!("{SHARDS} must be at least 1");
        }

        Ok(Self {
            retry,
            shards,
            store_timeout: Duration::from_millis(
                config.read(STORE_TIMEOUT_MS, defaults.store_timeout.as_millis() as u64)?,
            ),
            ledger_retention: Duration::from_millis(config.read(
                LEDGER_RETENTION_MS,
                defaults.ledger_retention.as_millis() as u64,
            )?),
            allow_multiple_types: config
                .read(ALLOW_MULTIPLE_TYPES, defaults.allow_multiple_types)?,
        })
    }

    /// Stores `key = value` only if the resulting configuration still
    /// loads; otherwise the previous value, or its absence, is restored.
    pub fn update(config: &Config, key: &str, value: &str) -> Result<Self> {
        let previous = config.get(key)?;
        config.set(key, value)?;
        match Self::load(config) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                match previous {
                    Some(old) => config.set(key, &old)?,
                    None => config.remove(key)?,
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_config() -> Config {
        Config::open(":memory:").unwrap()
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let config = mem_config();
        assert!(config.get(SHARDS).unwrap().is_none());
    }

    #[test]
    fn set_and_get() {
        let config = mem_config();
        config.set(SHARDS, "8").unwrap();
        assert_eq!(config.get(SHARDS).unwrap().unwrap(), "8");
    }

    #[test]
    fn set_overwrites_existing() {
        let config = mem_config();
        config.set(SHARDS, "2").unwrap();
        config.set(SHARDS, "3").unwrap();
        assert_eq!(config.get(SHARDS).unwrap().unwrap(), "3");
    }

    #[test]
    fn set_rejects_unknown_key() {
        let config = mem_config();
        let err = config.set("model", "sonnet").unwrap_err();
        assert!(err.to_string().contains("unknown setting"));
    }

    #[test]
    fn remove_deletes_key() {
        let config = mem_config();
        config.set(SHARDS, "2").unwrap();
        config.remove(SHARDS).unwrap();
        assert!(config.get(SHARDS).unwrap().is_none());
    }

    #[test]
    fn list_is_sorted() {
        let config = mem_config();
        config.set(STORE_TIMEOUT_MS, "100").unwrap();
        config.set(MAX_ATTEMPTS, "2").unwrap();
        let keys: Vec<_> = config.list().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, [MAX_ATTEMPTS, STORE_TIMEOUT_MS]);
    }

    #[test]
    fn load_uses_defaults_when_empty() {
        let loaded = EngineConfig::load(&mem_config()).unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn load_reads_overrides() {
        let config = mem_config();
        config.set(MAX_ATTEMPTS, "9").unwrap();
        config.set(BASE_DELAY_MS, "10").unwrap();
        config.set(SHARDS, "1").unwrap();
        config.set(ALLOW_MULTIPLE_TYPES, "false").unwrap();

        let loaded = EngineConfig::load(&config).unwrap();
        assert_eq!(loaded.retry.max_attempts, 9);
        assert_eq!(loaded.retry.base_delay, Duration::from_millis(10));
        assert_eq!(loaded.shards, 1);
        assert!(!loaded.allow_multiple_types);
    }

    #[test]
    fn load_reports_bad_value_with_key() {
        let config = mem_config();
        config.set(SHARDS, "many").unwrap();
        let err = EngineConfig::load(&config).unwrap_err();
        assert!(err.to_string().contains(SHARDS));
    }

    #[test]
    fn load_rejects_zero_attempts() {
        let config = mem_config();
        config.set(MAX_ATTEMPTS, "0").unwrap();
        assert!(EngineConfig::load(&config).is_err());
    }

    #[test]
    fn persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings-test.db");
        let path_str = path.to_str().unwrap();

        {
            let config = Config::open(path_str).unwrap();
            config.set(SHARDS, "6").unwrap();
        }

        {
            let config = Config::open(path_str).unwrap();
            assert_eq!(EngineConfig::load(&config).unwrap().shards, 6);
        }
    }

    #[test]
    fn update_applies_valid_value() {
        let config = mem_config();
        let loaded = EngineConfig::update(&config, LEDGER_RETENTION_MS, "0").unwrap();
        assert_eq!(loaded.ledger_retention, Duration::ZERO);
        assert_eq!(config.get(LEDGER_RETENTION_MS).unwrap().unwrap(), "0");
    }

    #[test]
    fn rejected_update_restores_previous_value() {
        let config = mem_config();
        EngineConfig::update(&config, SHARDS, "2").unwrap();

        assert!(EngineConfig::update(&config, SHARDS, "0").is_err());
        assert_eq!(config.get(SHARDS).unwrap().unwrap(), "2");
        assert_eq!(EngineConfig::load(&config).unwrap().shards, 2);
    }

    #[test]
    fn rejected_update_of_unset_key_leaves_it_unset() {
        let config = mem_config();
        assert!(EngineConfig::update(&config, MAX_ATTEMPTS, "zero").is_err());
        assert!(config.get(MAX_ATTEMPTS).unwrap().is_none());
    }
}
