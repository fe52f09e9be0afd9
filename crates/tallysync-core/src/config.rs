//! Configuration types for tallysync components.
//!
//! Every value has a default and can be overridden through the environment
//! (`from_env`). The list of companies to synchronize lives in a TOML file,
//! by default `~/.config/tallysync/companies.toml`:
//!
//! ```toml
//! [[companies]]
//! name = "Acme Traders"
//!
//! [[companies]]
//! name = "Acme Exports"
//! enabled = false
//! kinds = ["ledger", "voucher"]
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::AppError;
use crate::models::EntityKind;

/// Location of the Tally HTTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
        }
    }
}

impl TallyConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(env_lookup)
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("TALLY_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "TALLY_PORT")?.unwrap_or(defaults.port),
        })
    }

    /// Builds the endpoint URL, failing fast when the host is unusable.
    pub fn endpoint(&self) -> Result<Url, AppError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(AppError::ConfigurationError(
                "Tally host is not configured".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(AppError::ConfigurationError(
                "Tally port must be non-zero".to_string(),
            ));
        }
        let raw = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", host, self.port)
        };
        Url::parse(&raw).map_err(|e| {
            AppError::ConfigurationError(format!("Invalid Tally endpoint '{}': {}", raw, e))
        })
    }
}

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

impl DbConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(env_lookup)
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        Ok(Self {
            max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS")?
                .unwrap_or(Self::default().max_connections),
        })
    }
}

/// HTTP client configuration for calls to Tally.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for master collections (ledgers, groups, ...).
    pub timeout: Duration,
    /// Timeout for voucher fetches, which can be much larger.
    pub voucher_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Bodies shorter than this (after trimming) count as empty.
    pub min_response_len: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            voucher_timeout: Duration::from_secs(90),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            min_response_len: 20,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(env_lookup)
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            timeout: parse_var::<u64>(&lookup, "HTTP_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            voucher_timeout: parse_var::<u64>(&lookup, "HTTP_VOUCHER_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.voucher_timeout),
            max_retries: parse_var(&lookup, "HTTP_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            ..defaults
        };
        if config.max_retries == 0 {
            return Err(AppError::ConfigurationError(
                "HTTP_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn timeout_for(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Voucher => self.voucher_timeout,
            _ => self.timeout,
        }
    }
}

/// Synchronization configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records per bulk write.
    pub batch_size: usize,
    /// Bulk writes in flight for one entity kind.
    pub max_in_flight: usize,
    /// Upper bound on the span of a manual voucher sync, in days.
    pub manual_max_days: u32,
    /// Days of vouchers pulled by a scheduled run, ending today. Two or more
    /// also catches vouchers entered late on the day of the previous run.
    pub scheduled_voucher_days: u32,
    /// Vouchers are fetched in date windows of this many days.
    pub voucher_window_days: u32,
    /// First month (1-12) of the fiscal year.
    pub fiscal_year_start_month: u32,
    /// Failures kept per entity kind in the run summary.
    pub recent_failure_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_in_flight: 3,
            manual_max_days: 30,
            scheduled_voucher_days: 2,
            voucher_window_days: 7,
            fiscal_year_start_month: 4,
            recent_failure_limit: 10,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(env_lookup)
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_var(&lookup, "SYNC_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            max_in_flight: parse_var(&lookup, "SYNC_CONCURRENCY")?
                .unwrap_or(defaults.max_in_flight),
            manual_max_days: parse_var(&lookup, "SYNC_MANUAL_MAX_DAYS")?
                .unwrap_or(defaults.manual_max_days),
            scheduled_voucher_days: parse_var(&lookup, "SYNC_VOUCHER_DAYS")?
                .unwrap_or(defaults.scheduled_voucher_days),
            voucher_window_days: parse_var(&lookup, "SYNC_VOUCHER_WINDOW_DAYS")?
                .unwrap_or(defaults.voucher_window_days),
            fiscal_year_start_month: parse_var(&lookup, "FISCAL_YEAR_START_MONTH")?
                .unwrap_or(defaults.fiscal_year_start_month),
            recent_failure_limit: defaults.recent_failure_limit,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::ConfigurationError(
                "batch size must be at least 1".to_string(),
            ));
        }
        if !(1..=12).contains(&self.fiscal_year_start_month) {
            return Err(AppError::ConfigurationError(format!(
                "fiscal year start month {} is not in 1..=12",
                self.fiscal_year_start_month
            )));
        }
        if self.manual_max_days == 0
            || self.scheduled_voucher_days == 0
            || self.voucher_window_days == 0
        {
            return Err(AppError::ConfigurationError(
                "voucher day limits must be at least 1".to_string(),
            ));
        }
        if self.scheduled_voucher_days > self.manual_max_days {
            return Err(AppError::ConfigurationError(format!(
                "scheduled voucher span ({} days) exceeds the manual cap ({} days)",
                self.scheduled_voucher_days, self.manual_max_days
            )));
        }
        Ok(())
    }

    /// Batches in flight, clamped to the 1..=4 range the store is sized for.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight.clamp(1, 4)
    }
}

/// One company entry of `companies.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CompanyEntry {
    /// Company name exactly as Tally shows it.
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Entity kinds to sync; all kinds when absent.
    #[serde(default)]
    pub kinds: Option<Vec<EntityKind>>,
}

fn default_enabled() -> bool {
    true
}

impl CompanyEntry {
    pub fn kinds(&self) -> Vec<EntityKind> {
        match &self.kinds {
            Some(kinds) => {
                // Keep masters ahead of vouchers regardless of file order
                let mut kinds = kinds.clone();
                kinds.sort_by_key(|k| k.sync_order());
                kinds.dedup();
                kinds
            }
            None => EntityKind::ALL.to_vec(),
        }
    }
}

/// Parsed `companies.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompaniesConfig {
    #[serde(default)]
    pub companies: Vec<CompanyEntry>,
}

impl CompaniesConfig {
    pub fn enabled(&self) -> impl Iterator<Item = &CompanyEntry> {
        self.companies.iter().filter(|c| c.enabled)
    }

    pub fn find(&self, name: &str) -> Option<&CompanyEntry> {
        self.companies
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Default location of the companies file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tallysync").join("companies.toml"))
}

/// Loads the companies file.
///
/// An explicit path must exist. When `path` is `None` the default location is
/// used and a missing file yields an empty configuration.
pub fn load_companies_config(path: Option<&Path>) -> Result<CompaniesConfig, AppError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(CompaniesConfig::default()),
        },
    };

    if !path.exists() {
        if required {
            return Err(AppError::ConfigurationError(format!(
                "companies file not found: {}",
                path.display()
            )));
        }
        return Ok(CompaniesConfig::default());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        AppError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: CompaniesConfig = toml::from_str(&content).map_err(|e| {
        AppError::ConfigurationError(format!("invalid {}: {}", path.display(), e))
    })?;

    if let Some(position) = config.companies.iter().position(|c| c.name.trim().is_empty()) {
        return Err(AppError::ConfigurationError(format!(
            "company entry #{} in {} has an empty name",
            position + 1,
            path.display()
        )));
    }

    Ok(config)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::ConfigurationError(format!("{} has an invalid value: '{}'", key, raw))
        }),
    }
}
