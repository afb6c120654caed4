//! The service option catalog.
//!
//! Options are stored as a typed [`Options`] struct but mutated through the
//! runtime-keyed [`OptionKey`]/[`OptionValue`] surface, so embedders and
//! language bindings can set any option without compile-time knowledge of
//! its type. The serialized form (JSON, keys matching the catalog names) is
//! what the persistence layer writes to the configuration file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Minimum severity emitted to the registered logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

/// Keys of the option catalog.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKey {
    UseBootstraps,
    ConnectionTimeout,
    ConnectionRetryLimit,
    ConnectionRetryInterval,
    LogLevel,
    CoreThreads,
    BasePath,
    ConfigurationFilename,
    PeersFilename,
    NetworkToken,
}

/// A dynamically typed option value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Boolean(bool),
    /// Durations are expressed in milliseconds; counts as plain integers.
    Integer(i64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Boolean(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Integer(value)
    }
}

impl From<Duration> for OptionValue {
    fn from(value: Duration) -> Self {
        OptionValue::Integer(value.as_millis() as i64)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

/// The complete option store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    /// Persist and redial known peer addresses.
    #[serde(default)]
    pub use_bootstraps: bool,
    /// Dial deadline in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout: u64,
    /// Dial attempts before a peer is marked disconnected.
    #[serde(default = "default_connection_retry_limit")]
    pub connection_retry_limit: u32,
    /// Spacing between dial retries in milliseconds.
    #[serde(default = "default_connection_retry_interval_ms")]
    pub connection_retry_interval: u64,
    /// Minimum level forwarded to the registered logger.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Worker pool size; 0 runs inline on a single thread. Defaults to the
    /// hardware parallelism, floored at 2.
    #[serde(default = "default_core_threads")]
    pub core_threads: usize,
    /// Root directory for persisted state. Empty disables the filesystem.
    #[serde(default)]
    pub base_path: String,
    /// Configuration file name under `base_path`.
    #[serde(default = "default_configuration_filename")]
    pub configuration_filename: String,
    /// Bootstrap peers file name under `base_path`.
    #[serde(default = "default_peers_filename")]
    pub peers_filename: String,
    /// Shared token required to join the network; bound into the handshake.
    #[serde(default)]
    pub network_token: String,
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_connection_retry_limit() -> u32 {
    3
}

fn default_connection_retry_interval_ms() -> u64 {
    1_000
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_core_threads() -> usize {
    std::thread::available_parallelism().map_or(2, |threads| threads.get().max(2))
}

fn default_configuration_filename() -> String {
    "brypt.config.json".to_string()
}

fn default_peers_filename() -> String {
    "brypt.peers.json".to_string()
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_bootstraps: false,
            connection_timeout: default_connection_timeout_ms(),
            connection_retry_limit: default_connection_retry_limit(),
            connection_retry_interval: default_connection_retry_interval_ms(),
            log_level: default_log_level(),
            core_threads: default_core_threads(),
            base_path: String::new(),
            configuration_filename: default_configuration_filename(),
            peers_filename: default_peers_filename(),
            network_token: String::new(),
        }
    }
}

impl Options {
    /// Set one option through the runtime-keyed surface.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] when the value's type or
    /// range does not fit the key.
    pub fn set(&mut self, key: OptionKey, value: OptionValue) -> Result<()> {
        match (key, value) {
            (OptionKey::UseBootstraps, OptionValue::Boolean(v)) => self.use_bootstraps = v,
            (OptionKey::ConnectionTimeout, OptionValue::Integer(v)) => {
                self.connection_timeout = to_millis(v)?;
            }
            (OptionKey::ConnectionRetryLimit, OptionValue::Integer(v)) => {
                self.connection_retry_limit =
                    u32::try_from(v).map_err(|_| Error::InvalidConfiguration)?;
            }
            (OptionKey::ConnectionRetryInterval, OptionValue::Integer(v)) => {
                self.connection_retry_interval = to_millis(v)?;
            }
            (OptionKey::LogLevel, OptionValue::Text(v)) => {
                self.log_level = parse_log_level(&v)?;
            }
            (OptionKey::CoreThreads, OptionValue::Integer(v)) => {
                self.core_threads = usize::try_from(v).map_err(|_| Error::InvalidConfiguration)?;
            }
            (OptionKey::BasePath, OptionValue::Text(v)) => self.base_path = v,
            (OptionKey::ConfigurationFilename, OptionValue::Text(v)) => {
                self.configuration_filename = v;
            }
            (OptionKey::PeersFilename, OptionValue::Text(v)) => self.peers_filename = v,
            (OptionKey::NetworkToken, OptionValue::Text(v)) => self.network_token = v,
            _ => return Err(Error::InvalidConfiguration),
        }
        Ok(())
    }

    /// Read one option through the runtime-keyed surface.
    pub fn get(&self, key: OptionKey) -> OptionValue {
        match key {
            OptionKey::UseBootstraps => self.use_bootstraps.into(),
            OptionKey::ConnectionTimeout => (self.connection_timeout as i64).into(),
            OptionKey::ConnectionRetryLimit => i64::from(self.connection_retry_limit).into(),
            OptionKey::ConnectionRetryInterval => (self.connection_retry_interval as i64).into(),
            OptionKey::LogLevel => log_level_name(self.log_level).into(),
            OptionKey::CoreThreads => (self.core_threads as i64).into(),
            OptionKey::BasePath => self.base_path.clone().into(),
            OptionKey::ConfigurationFilename => self.configuration_filename.clone().into(),
            OptionKey::PeersFilename => self.peers_filename.clone().into(),
            OptionKey::NetworkToken => self.network_token.clone().into(),
        }
    }

    /// The dial deadline.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    /// Spacing between dial retries.
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval)
    }

    /// Path of the configuration file, when the filesystem is enabled.
    pub fn configuration_path(&self) -> Option<PathBuf> {
        if self.base_path.is_empty() {
            return None;
        }
        Some(PathBuf::from(&self.base_path).join(&self.configuration_filename))
    }

    /// Path of the bootstrap peers file, when the filesystem is enabled.
    pub fn peers_path(&self) -> Option<PathBuf> {
        if self.base_path.is_empty() {
            return None;
        }
        Some(PathBuf::from(&self.base_path).join(&self.peers_filename))
    }
}

fn to_millis(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidConfiguration)
}

fn parse_log_level(name: &str) -> Result<LogLevel> {
    match name {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        "off" => Ok(LogLevel::Off),
        _ => Err(Error::InvalidConfiguration),
    }
}

fn log_level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
        LogLevel::Off => "off",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(!options.use_bootstraps);
        assert_eq!(options.connection_timeout(), Duration::from_secs(5));
        assert_eq!(options.connection_retry_limit, 3);
        assert_eq!(options.log_level, LogLevel::Info);
        assert_eq!(options.configuration_filename, "brypt.config.json");
        assert!(options.configuration_path().is_none());
    }

    #[test]
    fn test_set_accepts_matching_types() {
        let mut options = Options::default();
        options
            .set(OptionKey::UseBootstraps, true.into())
            .expect("set bool");
        options
            .set(OptionKey::ConnectionTimeout, Duration::from_millis(250).into())
            .expect("set duration");
        options
            .set(OptionKey::NetworkToken, "brypt".into())
            .expect("set text");
        assert!(options.use_bootstraps);
        assert_eq!(options.connection_timeout, 250);
        assert_eq!(options.network_token, "brypt");
    }

    #[test]
    fn test_set_rejects_type_mismatch() {
        let mut options = Options::default();
        assert_eq!(
            options.set(OptionKey::UseBootstraps, OptionValue::Integer(1)),
            Err(Error::InvalidConfiguration)
        );
        assert_eq!(
            options.set(OptionKey::ConnectionTimeout, OptionValue::Integer(-5)),
            Err(Error::InvalidConfiguration)
        );
        assert_eq!(
            options.set(OptionKey::LogLevel, OptionValue::Text("noisy".into())),
            Err(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn test_get_mirrors_set() {
        let mut options = Options::default();
        options
            .set(OptionKey::CoreThreads, OptionValue::Integer(4))
            .expect("set");
        assert_eq!(options.get(OptionKey::CoreThreads), OptionValue::Integer(4));
        assert_eq!(
            options.get(OptionKey::LogLevel),
            OptionValue::Text("info".into())
        );
    }

    #[test]
    fn test_serialized_keys_match_catalog_names() {
        let options = Options::default();
        let json = serde_json::to_value(&options).expect("serialize");
        for key in [
            "use_bootstraps",
            "connection_timeout",
            "connection_retry_interval",
            "log_level",
            "core_threads",
            "base_path",
            "configuration_filename",
            "peers_filename",
            "network_token",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_paths_require_base_path() {
        let mut options = Options::default();
        options
            .set(OptionKey::BasePath, "/tmp/brypt".into())
            .expect("set");
        let peers = options.peers_path().expect("peers path");
        assert_eq!(peers, PathBuf::from("/tmp/brypt/brypt.peers.json"));
    }
}
