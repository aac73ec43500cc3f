// =============================================================================
// Application settings — validated configuration with encrypted credentials
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Plaintext credentials are accepted as input but encrypted before
// every save; they never reach disk. Encrypted byte fields are stored as
// Latin-1-decoded JSON strings so that round-tripping preserves the exact
// byte sequence.
//
// A parse or validation failure on load falls back to defaults in memory but
// leaves the file untouched so the operator can repair it.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{RebalancerError, Result};
use crate::secrets::{hash_password, SecretCipher};

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "MERIDIAN_DATA_DIR";

// =============================================================================
// Filesystem layout
// =============================================================================

/// Locations of everything the rebalancer persists.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub secret_key_file: PathBuf,
    pub db_file: PathBuf,
    pub log_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config_file: data_dir.join("config.json"),
            secret_key_file: data_dir.join("secret.key"),
            db_file: data_dir.join("rebalancer.db"),
            log_dir: data_dir.join("logs"),
            data_dir,
        }
    }

    /// Data directory from `MERIDIAN_DATA_DIR`, defaulting to `./data`.
    pub fn from_env() -> Self {
        let dir = std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| "data".to_string());
        Self::new(dir)
    }
}

// =============================================================================
// Latin-1 byte fields
// =============================================================================

/// Serialise `Option<Vec<u8>>` as a Latin-1-decoded string: every byte maps
/// to the code point of the same value, so arbitrary bytes survive JSON.
pub(crate) mod latin1_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => {
                let s: String = b.iter().map(|&byte| byte as char).collect();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(s) => {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    let cp = c as u32;
                    if cp > 0xFF {
                        return Err(serde::de::Error::custom(format!(
                            "byte field contains non-Latin-1 character U+{cp:04X}"
                        )));
                    }
                    out.push(cp as u8);
                }
                Ok(Some(out))
            }
        }
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_max_cmc_rank() -> u32 {
    100
}

fn default_periodic_hours() -> u32 {
    24
}

fn default_threshold_pct() -> f64 {
    5.0
}

fn default_allocations() -> BTreeMap<String, f64> {
    BTreeMap::from([("BTC".to_string(), 50.0), ("ETH".to_string(), 50.0)])
}

fn default_base_pair() -> String {
    "USDT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_trade_value_usd() -> f64 {
    10.0
}

fn default_trade_fee_pct() -> f64 {
    0.1
}

// =============================================================================
// Settings model
// =============================================================================

/// Exchange API credentials. The plaintext fields carry operator input and
/// are never serialised; only the ciphertext reaches disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinanceCredentials {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub secret_key: String,
    #[serde(default, with = "latin1_bytes", skip_serializing_if = "Option::is_none")]
    pub api_key_encrypted: Option<Vec<u8>>,
    #[serde(default, with = "latin1_bytes", skip_serializing_if = "Option::is_none")]
    pub secret_key_encrypted: Option<Vec<u8>>,
}

/// Ranking provider credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmcCredentials {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default, with = "latin1_bytes", skip_serializing_if = "Option::is_none")]
    pub api_key_encrypted: Option<Vec<u8>>,
}

/// Which trigger drives automatic rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Periodic,
    Threshold,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Periodic => write!(f, "periodic"),
            Self::Threshold => write!(f, "threshold"),
        }
    }
}

/// Top-level application settings, persisted as one JSON record.
///
/// Every field has a serde default so older config files missing new fields
/// still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Username for the web UI operator.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// bcrypt hash of the operator password.
    #[serde(default, with = "latin1_bytes", skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<Vec<u8>>,

    #[serde(default)]
    pub binance: BinanceCredentials,

    #[serde(default)]
    pub cmc: CmcCredentials,

    /// Only assets ranked inside the top N are eligible for trading.
    #[serde(default = "default_max_cmc_rank")]
    pub max_cmc_rank: u32,

    #[serde(default)]
    pub strategy: Strategy,

    /// Interval in hours for the periodic strategy.
    #[serde(default = "default_periodic_hours")]
    pub periodic_hours: u32,

    /// Drift percentage that triggers the threshold strategy.
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: f64,

    /// Target allocation per asset, in percent. Must sum to 100.
    #[serde(default = "default_allocations")]
    pub allocations: BTreeMap<String, f64>,

    /// Quote currency used for valuation and trading.
    #[serde(default = "default_base_pair")]
    pub base_pair: String,

    /// When true, cycles compute and persist the full plan without placing
    /// orders.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Deltas below this USD value are not worth trading.
    #[serde(default = "default_min_trade_value_usd")]
    pub min_trade_value_usd: f64,

    /// Expected exchange fee per trade, in percent.
    #[serde(default = "default_trade_fee_pct")]
    pub trade_fee_pct: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            admin_user: default_admin_user(),
            password_hash: None,
            binance: BinanceCredentials::default(),
            cmc: CmcCredentials::default(),
            max_cmc_rank: default_max_cmc_rank(),
            strategy: Strategy::default(),
            periodic_hours: default_periodic_hours(),
            threshold_pct: default_threshold_pct(),
            allocations: default_allocations(),
            base_pair: default_base_pair(),
            dry_run: true,
            min_trade_value_usd: default_min_trade_value_usd(),
            trade_fee_pct: default_trade_fee_pct(),
        }
    }
}

impl AppSettings {
    /// Uppercase the base pair and allocation keys. Symbols are
    /// case-insensitive at entry and canonical everywhere else.
    pub fn normalized(mut self) -> Self {
        self.base_pair = self.base_pair.trim().to_uppercase();
        self.allocations = self
            .allocations
            .into_iter()
            .map(|(k, v)| (k.trim().to_uppercase(), v))
            .collect();
        self
    }

    /// Enforce the numeric ranges and the allocation-sum invariant.
    pub fn validate(&self) -> Result<()> {
        let total: f64 = self.allocations.values().sum();
        if total.round() as i64 != 100 {
            return Err(RebalancerError::InvalidInput(format!(
                "allocation percentages must sum to 100, got {total}"
            )));
        }
        if self.allocations.values().any(|v| *v < 0.0 || *v > 100.0) {
            return Err(RebalancerError::InvalidInput(
                "allocation weights must lie in [0, 100]".to_string(),
            ));
        }
        if self.periodic_hours == 0 {
            return Err(RebalancerError::InvalidInput(
                "periodic_hours must be greater than zero".to_string(),
            ));
        }
        if self.threshold_pct <= 0.0 || self.threshold_pct >= 100.0 {
            return Err(RebalancerError::InvalidInput(
                "threshold_pct must lie in (0, 100)".to_string(),
            ));
        }
        if self.min_trade_value_usd < 10.0 {
            return Err(RebalancerError::InvalidInput(
                "min_trade_value_usd must be at least 10".to_string(),
            ));
        }
        if !(0.0..=5.0).contains(&self.trade_fee_pct) {
            return Err(RebalancerError::InvalidInput(
                "trade_fee_pct must lie in [0, 5]".to_string(),
            ));
        }
        if self.max_cmc_rank == 0 || self.max_cmc_rank > 5000 {
            return Err(RebalancerError::InvalidInput(
                "max_cmc_rank must lie in (0, 5000]".to_string(),
            ));
        }
        if self.base_pair.is_empty() {
            return Err(RebalancerError::InvalidInput(
                "base_pair must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Settings store
// =============================================================================

/// Owner of the settings file and the master key. Constructed once at startup
/// and shared by reference; every component reads fresh snapshots through
/// [`SettingsStore::current`].
pub struct SettingsStore {
    config_path: PathBuf,
    cipher: SecretCipher,
    settings: RwLock<AppSettings>,
}

impl SettingsStore {
    /// Load the master key, then the settings file. A missing file creates a
    /// default record (operator `admin` / password `admin`) on disk; a broken
    /// file falls back to defaults in memory only.
    pub fn open(paths: &DataPaths) -> Result<Self> {
        let cipher = SecretCipher::load_or_generate(&paths.secret_key_file)?;
        let store = Self {
            config_path: paths.config_file.clone(),
            cipher,
            settings: RwLock::new(AppSettings::default()),
        };
        let initial = store.load_or_default()?;
        *store.settings.write() = initial;
        Ok(store)
    }

    fn load_or_default(&self) -> Result<AppSettings> {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "settings file not found, creating a default one"
            );
            let mut defaults = AppSettings::default();
            defaults.password_hash = Some(hash_password("admin")?);
            self.write_to_disk(&defaults)?;
            info!("default operator 'admin' with password 'admin' has been set");
            return Ok(defaults);
        }

        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "failed to read settings file, falling back to defaults in memory"
                );
                return Ok(AppSettings::default());
            }
        };

        match serde_json::from_str::<AppSettings>(&content) {
            Ok(parsed) => {
                let parsed = parsed.normalized();
                if let Err(e) = parsed.validate() {
                    error!(
                        error = %e,
                        "settings file failed validation, falling back to defaults in memory"
                    );
                    error!("repair or delete the settings file to regenerate a default one");
                    return Ok(AppSettings::default());
                }
                info!(
                    path = %self.config_path.display(),
                    strategy = %parsed.strategy,
                    base_pair = %parsed.base_pair,
                    dry_run = parsed.dry_run,
                    "settings loaded"
                );
                Ok(parsed)
            }
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "failed to parse settings file, falling back to defaults in memory"
                );
                error!("repair or delete the settings file to regenerate a default one");
                Ok(AppSettings::default())
            }
        }
    }

    /// Snapshot of the current in-memory settings.
    pub fn current(&self) -> AppSettings {
        self.settings.read().clone()
    }

    /// Encrypt any plaintext credentials, validate, write atomically, and
    /// replace the in-memory record.
    pub fn save(&self, settings: AppSettings) -> Result<()> {
        let mut settings = settings.normalized();
        settings.validate()?;

        if !settings.binance.api_key.is_empty() {
            settings.binance.api_key_encrypted =
                Some(self.cipher.encrypt(&settings.binance.api_key));
            settings.binance.api_key.clear();
        }
        if !settings.binance.secret_key.is_empty() {
            settings.binance.secret_key_encrypted =
                Some(self.cipher.encrypt(&settings.binance.secret_key));
            settings.binance.secret_key.clear();
        }
        if !settings.cmc.api_key.is_empty() {
            settings.cmc.api_key_encrypted = Some(self.cipher.encrypt(&settings.cmc.api_key));
            settings.cmc.api_key.clear();
        }

        self.write_to_disk(&settings)?;
        *self.settings.write() = settings;
        info!(path = %self.config_path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Atomic write: tmp sibling file, then rename.
    fn write_to_disk(&self, settings: &AppSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| RebalancerError::Unexpected(format!("failed to serialise settings: {e}")))?;

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RebalancerError::Unexpected(format!(
                    "failed to create data directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let tmp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| {
            RebalancerError::Unexpected(format!(
                "failed to write tmp settings to {}: {e}",
                tmp_path.display()
            ))
        })?;
        std::fs::rename(&tmp_path, &self.config_path).map_err(|e| {
            RebalancerError::Unexpected(format!(
                "failed to rename tmp settings to {}: {e}",
                self.config_path.display()
            ))
        })?;
        Ok(())
    }

    /// Decrypt a stored credential; empty string when absent or unreadable.
    pub fn decrypt(&self, ciphertext: Option<&[u8]>) -> String {
        match ciphertext {
            Some(bytes) => self.cipher.decrypt(bytes),
            None => String::new(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        self.cipher.encrypt(plaintext)
    }

    /// Signing key for the session layer; read contract only.
    pub fn jwt_signing_key(&self) -> String {
        self.cipher.jwt_signing_key()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("config_path", &self.config_path)
            .finish()
    }
}
