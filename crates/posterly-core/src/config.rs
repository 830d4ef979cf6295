//! Posterly configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PosterlyError, Result};
use crate::time::CanonicalTz;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PosterlyConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl PosterlyConfig {
    /// Load config from the default path (~/.posterly/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PosterlyError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PosterlyError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PosterlyError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Posterly home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".posterly")
    }

    /// Resolve the configured canonical timezone.
    pub fn canonical_tz(&self) -> Result<CanonicalTz> {
        CanonicalTz::new(&self.scheduler.timezone)
    }

    /// Apply `POSTERLY_*` environment overrides.
    ///
    /// `POSTERLY_GATEWAY_TOKEN` only fills channel tokens left empty in the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("POSTERLY_GATEWAY_TOKEN")
            && !token.is_empty()
        {
            for channel in [
                &mut self.gateway.primary,
                &mut self.gateway.secondary,
                &mut self.gateway.fallback,
            ] {
                if channel.token.is_empty() {
                    channel.token = token.clone();
                }
            }
        }
        if let Ok(db_path) = std::env::var("POSTERLY_DB_PATH")
            && !db_path.is_empty()
        {
            self.storage.db_path = db_path;
        }
        self
    }
}

/// Due-job scanning and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// IANA name of the canonical zone all due strings are written in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_dispatches: usize,
    /// Upper bound for one record's whole fallback chain.
    #[serde(default = "default_dispatch_budget")]
    pub dispatch_budget_secs: u64,
    /// Claims older than this are treated as interrupted.
    #[serde(default = "default_stale_claim")]
    pub stale_claim_secs: u64,
    /// Max records selected per tick.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_tick_secs() -> u64 { 60 }
fn default_timezone() -> String { "Asia/Kolkata".into() }
fn default_max_concurrent() -> usize { 4 }
fn default_dispatch_budget() -> u64 { 90 }
fn default_stale_claim() -> u64 { 600 }
fn default_scan_limit() -> usize { 500 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            timezone: default_timezone(),
            max_concurrent_dispatches: default_max_concurrent(),
            dispatch_budget_secs: default_dispatch_budget(),
            stale_claim_secs: default_stale_claim(),
            scan_limit: default_scan_limit(),
        }
    }
}

/// Persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.posterly/posterly.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

/// Message content and recipient normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Joined with relative poster paths to form the media URL.
    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
    /// Caption used when a poster carries none.
    #[serde(default = "default_caption")]
    pub caption: String,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
    #[serde(default = "default_min_phone_digits")]
    pub min_phone_digits: usize,
}

fn default_media_base_url() -> String { "http://localhost:8080/uploads/".into() }
fn default_caption() -> String { "Here is your poster!".into() }
fn default_country_code() -> String { "91".into() }
fn default_min_phone_digits() -> usize { 10 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            media_base_url: default_media_base_url(),
            caption: default_caption(),
            default_country_code: default_country_code(),
            min_phone_digits: default_min_phone_digits(),
        }
    }
}

/// Messaging gateway endpoints, in fallback order.
///
/// Endpoints with an empty `base_url` are left out of the chain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub primary: ChannelEndpoint,
    #[serde(default)]
    pub secondary: ChannelEndpoint,
    #[serde(default)]
    pub fallback: ChannelEndpoint,
}

/// One gateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_channel_timeout")]
    pub timeout_secs: u64,
}

fn bool_true() -> bool { true }
fn default_channel_timeout() -> u64 { 30 }

impl ChannelEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            enabled: true,
            base_url: base_url.to_string(),
            token: String::new(),
            timeout_secs: default_channel_timeout(),
        }
    }
}

impl Default for ChannelEndpoint {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PosterlyConfig::default();
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.scheduler.timezone, "Asia/Kolkata");
        assert_eq!(config.delivery.default_country_code, "91");
        assert_eq!(config.gateway.primary.timeout_secs, 30);
        assert!(config.canonical_tz().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            timezone = "Europe/London"
            max_concurrent_dispatches = 8

            [delivery]
            media_base_url = "https://cdn.example.com/posters"

            [gateway.secondary]
            enabled = false
            token = "abc"
        "#;

        let config: PosterlyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.timezone, "Europe/London");
        assert_eq!(config.scheduler.max_concurrent_dispatches, 8);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.delivery.media_base_url, "https://cdn.example.com/posters");
        assert!(!config.gateway.secondary.enabled);
        assert_eq!(config.gateway.secondary.token, "abc");
        assert!(config.gateway.primary.enabled);
        assert!(config.gateway.primary.base_url.is_empty());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: PosterlyConfig = toml::from_str("").unwrap();
        assert_eq!(config.storage.db_path, "~/.posterly/posterly.db");
        assert_eq!(config.scheduler.dispatch_budget_secs, 90);
    }

    #[test]
    fn test_bad_timezone_is_config_error() {
        let mut config = PosterlyConfig::default();
        config.scheduler.timezone = "Nowhere/Special".into();
        assert!(matches!(config.canonical_tz(), Err(PosterlyError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = PosterlyConfig::default();
        config.delivery.caption = "Diwali offers inside".into();
        config.save_to(&path).unwrap();

        let loaded = PosterlyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.delivery.caption, "Diwali offers inside");
    }

    #[test]
    fn test_home_dir() {
        let home = PosterlyConfig::home_dir();
        assert!(home.to_string_lossy().contains("posterly"));
    }
}
