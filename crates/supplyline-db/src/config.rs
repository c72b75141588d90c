//! # Ledger Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SUPPLYLINE_DB_PATH=/var/lib/supplyline/ledger.db                   │
//! │     SUPPLYLINE_SUPERVISOR_ID=central-ops                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/supplyline/supplyline.toml (Linux)                       │
//! │     ~/Library/Application Support/com.supplyline.ledger/... (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "ledger.db"
//! max_connections = 5
//! busy_timeout_ms = 5000
//!
//! [locks]
//! ttl_secs = 300
//! supervisor_id = "central-ops"
//!
//! [retry]
//! max_attempts = 5
//! initial_backoff_ms = 10
//! max_backoff_ms = 500
//!
//! [transfers]
//! supplier_accounting = "debit_supplier"   # trusted | debit_supplier
//! supplier_retailer_id = "central"
//!
//! [queries]
//! default_page_size = 50
//! max_page_size = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use supplyline_core::{PageRequest, DEFAULT_LOCK_TTL_SECS};

use crate::pool::DbConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file is not valid TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Config could not be written as TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Supplier Accounting
// =============================================================================

/// Whether fulfilling a transfer also debits a supplier-side line.
///
/// ```text
/// TRUSTED (default)                     DEBIT_SUPPLIER
/// ─────────────────                     ──────────────
/// retailer line  STOCK_IN +q            supplier line  STOCK_OUT -q
///                                       retailer line  STOCK_IN  +q
/// central supply is authoritative       same transaction; short supplier
///                                       stock fails the whole act
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierAccounting {
    #[default]
    Trusted,
    DebitSupplier,
}

impl std::fmt::Display for SupplierAccounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupplierAccounting::Trusted => write!(f, "trusted"),
            SupplierAccounting::DebitSupplier => write!(f, "debit_supplier"),
        }
    }
}

impl std::str::FromStr for SupplierAccounting {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trusted" => Ok(SupplierAccounting::Trusted),
            "debit_supplier" | "debit" => Ok(SupplierAccounting::DebitSupplier),
            other => Err(ConfigError::Invalid(format!(
                "Unknown supplier accounting: '{}'. Valid options: trusted, debit_supplier",
                other
            ))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits for SQLite's write lock.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("supplyline.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lock lifetime when the caller does not pass one.
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: i64,

    /// Principal allowed to act on, release or take over any lock.
    #[serde(default)]
    pub supervisor_id: Option<String>,
}

fn default_lock_ttl() -> i64 {
    DEFAULT_LOCK_TTL_SECS
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            ttl_secs: default_lock_ttl(),
            supervisor_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    500
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub supplier_accounting: SupplierAccounting,

    /// Retailer id whose lines hold central supply stock.
    /// Required with `debit_supplier`.
    #[serde(default)]
    pub supplier_retailer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_page_size() -> u32 {
    500
}

impl Default for QuerySettings {
    fn default() -> Self {
        QuerySettings {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

// =============================================================================
// LedgerConfig
// =============================================================================

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub locks: LockSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub transfers: TransferSettings,

    #[serde(default)]
    pub queries: QuerySettings,
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (supplyline.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading ledger config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without touching the environment.
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load ledger config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> ConfigResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::Invalid("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Ledger config saved");
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.locks.ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "locks.ttl_secs must be greater than 0".into(),
            ));
        }

        if matches!(self.locks.supervisor_id.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "locks.supervisor_id must not be blank".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }

        if self.transfers.supplier_accounting == SupplierAccounting::DebitSupplier
            && self.transfers.supplier_retailer_id.is_none()
        {
            return Err(ConfigError::Invalid(
                "transfers.supplier_retailer_id is required with debit_supplier".into(),
            ));
        }

        if self.queries.max_page_size == 0
            || self.queries.default_page_size == 0
            || self.queries.default_page_size > self.queries.max_page_size
        {
            return Err(ConfigError::Invalid(
                "queries: need 0 < default_page_size <= max_page_size".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SUPPLYLINE_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(max) = std::env::var("SUPPLYLINE_DB_MAX_CONNECTIONS") {
            if let Ok(m) = max.parse::<u32>() {
                self.database.max_connections = m;
            }
        }

        if let Ok(ttl) = std::env::var("SUPPLYLINE_LOCK_TTL_SECS") {
            match ttl.parse::<i64>() {
                Ok(t) => self.locks.ttl_secs = t,
                Err(_) => warn!(value = %ttl, "Ignoring unparsable SUPPLYLINE_LOCK_TTL_SECS"),
            }
        }

        if let Ok(id) = std::env::var("SUPPLYLINE_SUPERVISOR_ID") {
            debug!(supervisor = %id, "Overriding supervisor from environment");
            self.locks.supervisor_id = Some(id);
        }

        if let Ok(attempts) = std::env::var("SUPPLYLINE_RETRY_MAX_ATTEMPTS") {
            if let Ok(a) = attempts.parse::<u32>() {
                self.retry.max_attempts = a;
            }
        }

        if let Ok(mode) = std::env::var("SUPPLYLINE_SUPPLIER_ACCOUNTING") {
            match mode.parse() {
                Ok(parsed) => self.transfers.supplier_accounting = parsed,
                Err(_) => warn!(mode = %mode, "Unknown supplier accounting in environment"),
            }
        }

        if let Ok(id) = std::env::var("SUPPLYLINE_SUPPLIER_RETAILER_ID") {
            self.transfers.supplier_retailer_id = Some(id);
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "supplyline", "ledger")
            .map(|dirs| dirs.config_dir().join("supplyline.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Pool settings for the configured database file.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database.path)
            .max_connections(self.database.max_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.locks.ttl_secs)
    }

    pub fn is_supervisor(&self, principal: &str) -> bool {
        self.locks.supervisor_id.as_deref() == Some(principal)
    }

    /// The supplier line owner when supplier debits are on.
    pub fn supplier_to_debit(&self) -> Option<&str> {
        match self.transfers.supplier_accounting {
            SupplierAccounting::Trusted => None,
            SupplierAccounting::DebitSupplier => self.transfers.supplier_retailer_id.as_deref(),
        }
    }

    /// `page` clamped to `queries.max_page_size`.
    pub fn clamp_page(&self, page: PageRequest) -> PageRequest {
        page.clamped(self.queries.max_page_size)
    }

    /// First page at the configured default size.
    pub fn first_page(&self) -> PageRequest {
        PageRequest::new(1, self.queries.default_page_size)
    }
}
