//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use st_core::{DayBoundary, ValidationError};

const MAX_STATS_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// User that new attempts are created for.
    pub user_id: String,
    /// Sync endpoint. Sync is unavailable when unset.
    pub remote_url: Option<String>,
    /// Bearer token sent to the sync endpoint.
    pub remote_token: Option<String>,
    /// Local hour at which one study day ends and the next begins.
    pub day_rollover_hour: u32,
    /// Fixed UTC offset for study days, in minutes.
    pub utc_offset_minutes: i32,
    /// How long cached statistics reads stay fresh.
    pub stats_cache_ttl_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("user_id", &self.user_id)
            .field("remote_url", &self.remote_url)
            .field(
                "remote_token",
                &self.remote_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("day_rollover_hour", &self.day_rollover_hour)
            .field("utc_offset_minutes", &self.utc_offset_minutes)
            .field("stats_cache_ttl_secs", &self.stats_cache_ttl_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("st.db"),
            user_id: "local".to_string(),
            remote_url: None,
            remote_token: None,
            day_rollover_hour: 4,
            utc_offset_minutes: 0,
            stats_cache_ttl_secs: 30,
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (ST_*)
        figment = figment.merge(Env::prefixed("ST_"));

        figment.extract()
    }

    /// Study-day boundary from the rollover and offset settings.
    pub fn day_boundary(&self) -> Result<DayBoundary, ValidationError> {
        DayBoundary::new(self.day_rollover_hour, self.utc_offset_minutes)
    }

    /// Cache TTL, capped at one day.
    pub fn stats_cache_ttl(&self) -> chrono::Duration {
        let secs = self.stats_cache_ttl_secs.min(MAX_STATS_CACHE_TTL_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }
}

/// Returns the platform-specific config directory for st.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("st"))
}

/// Returns the platform-specific data directory for st.
///
/// On Linux: `~/.local/share/st`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("st"))
}
