//! Server and client configuration.
//!
//! The server binary is configured from environment variables; clients are
//! configured in code through [`ClientConfig`]'s builder methods.
//!
//! # Environment Variables
//!
//! - `ZEO_ADDRESS`: `host:port` or a Unix socket path (default: `127.0.0.1:8100`)
//! - `ZEO_STORAGE_NAME`: name clients register with (default: `1`)
//! - `ZEO_READ_ONLY`: refuse writes (`true`/`false`, default: `false`)
//! - `ZEO_BLOB_DIR`: enable blobs, stored under this directory
//! - `ZEO_TRANSACTION_TIMEOUT`: seconds a transaction may hold the commit lock
//! - `ZEO_INVALIDATION_QUEUE_SIZE`: committed transactions remembered for
//!   quick verification (default: `100`)
//! - `ZEO_INVALIDATION_AGE`: seconds of history the backend is asked for when
//!   the queue does not reach back far enough
//!
//! # Invariants
//!
//! - A validated [`ClientConfig`] is never both `read_only` and
//!   `read_only_fallback`.
//! - `min_disconnect_poll <= max_disconnect_poll`.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{DEFAULT_CACHE_SIZE, MIN_CACHE_SIZE};
use crate::error::StorageError;
use crate::wire::Address;

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for StorageError {
    fn from(e: ConfigError) -> Self {
        Self::StorageSystem(e.to_string())
    }
}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub address: Address,
    pub storage_name: String,
    pub read_only: bool,
    pub blob_dir: Option<PathBuf>,
    /// How long a transaction may hold the commit lock. `None` is forever.
    pub transaction_timeout: Option<Duration>,
    pub invalidation_queue_size: usize,
    /// `None` disables asking the backend for older invalidations.
    pub invalidation_age: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: Address::parse(Self::DEFAULT_ADDRESS),
            storage_name: Self::DEFAULT_STORAGE_NAME.to_string(),
            read_only: false,
            blob_dir: None,
            transaction_timeout: None,
            invalidation_queue_size: Self::DEFAULT_INVALIDATION_QUEUE_SIZE,
            invalidation_age: None,
        }
    }
}

impl ServerConfig {
    pub const DEFAULT_ADDRESS: &'static str = "127.0.0.1:8100";
    pub const DEFAULT_STORAGE_NAME: &'static str = "1";
    pub const DEFAULT_INVALIDATION_QUEUE_SIZE: usize = 100;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(address) = lookup("ZEO_ADDRESS") {
            if address.is_empty() {
                return Err(invalid("ZEO_ADDRESS", "must not be empty"));
            }
            config.address = Address::parse(&address);
        }
        if let Some(name) = lookup("ZEO_STORAGE_NAME") {
            if name.is_empty() {
                return Err(invalid("ZEO_STORAGE_NAME", "must not be empty"));
            }
            config.storage_name = name;
        }
        if let Some(value) = lookup("ZEO_READ_ONLY") {
            config.read_only = parse_bool("ZEO_READ_ONLY", &value)?;
        }
        config.blob_dir = lookup("ZEO_BLOB_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        if let Some(value) = lookup("ZEO_TRANSACTION_TIMEOUT") {
            config.transaction_timeout = Some(parse_seconds("ZEO_TRANSACTION_TIMEOUT", &value)?);
        }
        if let Some(value) = lookup("ZEO_INVALIDATION_QUEUE_SIZE") {
            config.invalidation_queue_size =
                value.parse().map_err(|_| {
                    invalid(
                        "ZEO_INVALIDATION_QUEUE_SIZE",
                        format!("'{value}' is not a non-negative integer"),
                    )
                })?;
        }
        if let Some(value) = lookup("ZEO_INVALIDATION_AGE") {
            config.invalidation_age = Some(parse_seconds("ZEO_INVALIDATION_AGE", &value)?);
        }
        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(name, format!("'{value}' is not a boolean"))),
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value
        .parse()
        .map_err(|_| invalid(name, format!("'{value}' is not a number of seconds")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid(name, format!("'{value}' is not a number of seconds")));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Client storage configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Servers to try, in preference order.
    pub addresses: Vec<Address>,
    /// Storage name to register with.
    pub storage: String,
    /// Cache arena size in bytes.
    pub cache_size: u64,
    /// Names the persistent cache file. Without it the cache lives in memory.
    pub client_name: Option<String>,
    /// Directory for the persistent cache file.
    pub var_dir: PathBuf,
    pub min_disconnect_poll: Duration,
    pub max_disconnect_poll: Duration,
    /// Block in [`crate::client::ClientStorage::open`] until connected.
    pub wait: bool,
    pub wait_timeout: Duration,
    pub read_only: bool,
    /// Accept a read-only connection when no server allows writes.
    pub read_only_fallback: bool,
    /// Enables blobs; the local blob cache lives here.
    pub blob_dir: Option<PathBuf>,
    /// The blob directory is shared with the server, so blobs are handed
    /// over by file name instead of streamed.
    pub shared_blob_dir: bool,
    /// Clear the cache instead of running full verification.
    pub drop_cache_rather_verify: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// How often a fallback connection looks for a writable server.
    pub upgrade_interval: Duration,
}

impl ClientConfig {
    pub const DEFAULT_STORAGE: &'static str = "1";

    #[must_use]
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            storage: Self::DEFAULT_STORAGE.to_string(),
            cache_size: DEFAULT_CACHE_SIZE,
            client_name: None,
            var_dir: PathBuf::from("."),
            min_disconnect_poll: Duration::from_secs(1),
            max_disconnect_poll: Duration::from_secs(30),
            wait: true,
            wait_timeout: Duration::from_secs(30),
            read_only: false,
            read_only_fallback: false,
            blob_dir: None,
            shared_blob_dir: false,
            drop_cache_rather_verify: false,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            upgrade_interval: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    #[must_use]
    pub const fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_var_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.var_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn with_disconnect_poll(mut self, min: Duration, max: Duration) -> Self {
        self.min_disconnect_poll = min;
        self.max_disconnect_poll = max;
        self
    }

    #[must_use]
    pub const fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub const fn with_read_only_fallback(mut self, fallback: bool) -> Self {
        self.read_only_fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_shared_blob_dir(mut self, shared: bool) -> Self {
        self.shared_blob_dir = shared;
        self
    }

    #[must_use]
    pub const fn with_drop_cache_rather_verify(mut self, drop_cache: bool) -> Self {
        self.drop_cache_rather_verify = drop_cache;
        self
    }

    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_upgrade_interval(mut self, interval: Duration) -> Self {
        self.upgrade_interval = interval;
        self
    }

    /// Path of the persistent cache file, `<var_dir>/<client>-<storage>.zec`.
    #[must_use]
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.client_name
            .as_ref()
            .map(|client| self.var_dir.join(format!("{client}-{}.zec", self.storage)))
    }

    /// Check the settings for contradictions.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(invalid("addresses", "at least one server address is required"));
        }
        if self.storage.is_empty() {
            return Err(invalid("storage", "must not be empty"));
        }
        if self.read_only && self.read_only_fallback {
            return Err(invalid(
                "read_only_fallback",
                "cannot be combined with read_only",
            ));
        }
        if self.min_disconnect_poll.is_zero() {
            return Err(invalid("min_disconnect_poll", "must be positive"));
        }
        if self.min_disconnect_poll > self.max_disconnect_poll {
            return Err(invalid(
                "max_disconnect_poll",
                "must not be shorter than min_disconnect_poll",
            ));
        }
        if self.cache_size < MIN_CACHE_SIZE {
            return Err(invalid(
                "cache_size",
                format!("must be at least {MIN_CACHE_SIZE} bytes"),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(invalid(
                "heartbeat_timeout",
                "must be longer than a positive heartbeat_interval",
            ));
        }
        if self.shared_blob_dir && self.blob_dir.is_none() {
            return Err(invalid("shared_blob_dir", "requires blob_dir"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.address, Address::Tcp("127.0.0.1:8100".to_string()));
        assert_eq!(config.invalidation_queue_size, 100);
        assert_eq!(config.transaction_timeout, None);
    }

    #[test]
    fn test_server_from_vars() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("ZEO_ADDRESS", "/tmp/zeo.sock"),
            ("ZEO_STORAGE_NAME", "main"),
            ("ZEO_READ_ONLY", "yes"),
            ("ZEO_BLOB_DIR", "/var/blobs"),
            ("ZEO_TRANSACTION_TIMEOUT", "2.5"),
            ("ZEO_INVALIDATION_QUEUE_SIZE", "7"),
            ("ZEO_INVALIDATION_AGE", "60"),
        ]))
        .unwrap();
        assert_eq!(config.address, Address::Unix(PathBuf::from("/tmp/zeo.sock")));
        assert_eq!(config.storage_name, "main");
        assert!(config.read_only);
        assert_eq!(config.blob_dir, Some(PathBuf::from("/var/blobs")));
        assert_eq!(config.transaction_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.invalidation_queue_size, 7);
        assert_eq!(config.invalidation_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_server_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("ZEO_READ_ONLY", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "ZEO_READ_ONLY"));

        let err =
            ServerConfig::from_lookup(lookup(&[("ZEO_TRANSACTION_TIMEOUT", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ServerConfig::from_lookup(lookup(&[("ZEO_INVALIDATION_QUEUE_SIZE", "many")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for ZEO_INVALIDATION_QUEUE_SIZE: 'many' is not a non-negative integer"
        );
    }

    #[test]
    fn test_client_validate() {
        let addr = vec![Address::parse("127.0.0.1:8100")];
        assert!(ClientConfig::new(addr.clone()).validate().is_ok());
        assert!(ClientConfig::new(Vec::new()).validate().is_err());
        assert!(
            ClientConfig::new(addr.clone())
                .with_read_only(true)
                .with_read_only_fallback(true)
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::new(addr.clone())
                .with_disconnect_poll(Duration::from_secs(5), Duration::from_secs(1))
                .validate()
                .is_err()
        );
        assert!(ClientConfig::new(addr).with_cache_size(10).validate().is_err());
    }

    #[test]
    fn test_cache_path() {
        let config = ClientConfig::new(vec![Address::parse("localhost:1")])
            .with_storage("main")
            .with_var_dir("/var/zeo");
        assert_eq!(config.cache_path(), None);
        assert_eq!(
            config.with_client_name("app").cache_path(),
            Some(PathBuf::from("/var/zeo/app-main.zec"))
        );
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::MissingEnvVar("TEST_VAR".to_string());
        assert_eq!(
            error.to_string(),
            "missing required environment variable: TEST_VAR"
        );
    }
}
