use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::KizunaError;
use crate::models::ServiceKind;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub services: ServicesConfig,
    /// Optional in user files; missing knobs take the built-in values.
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub primary: ServiceKind,
    pub anilist: AniListConfig,
    pub kitsu: KitsuConfig,
    pub mal: MalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AniListConfig {
    pub enabled: bool,
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KitsuConfig {
    pub enabled: bool,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalConfig {
    pub enabled: bool,
    pub base_url: String,
    pub client_id: Option<String>,
}

/// Retry and timeout policy for remote requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            rate_limit_cooldown_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ServicesConfig {
    pub fn is_enabled(&self, kind: ServiceKind) -> bool {
        match kind {
            ServiceKind::AniList => self.anilist.enabled,
            ServiceKind::Kitsu => self.kitsu.enabled,
            ServiceKind::MyAnimeList => self.mal.enabled,
        }
    }
}

impl AppConfig {
    /// Load the user config file if it exists, otherwise the built-in defaults.
    pub fn load() -> Result<Self, KizunaError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, KizunaError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using built-in defaults", path.display());
            return Ok(Self::default());
        }
        let user_str =
            std::fs::read_to_string(path).map_err(|e| KizunaError::Config(e.to_string()))?;
        let config = toml::from_str(&user_str).map_err(|e| KizunaError::Config(e.to_string()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save current config to the user config file.
    pub fn save(&self) -> Result<(), KizunaError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), KizunaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| KizunaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path to user config file (XDG on Linux, AppData on Windows).
    pub fn config_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Path to the database file.
    pub fn db_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.data_dir().join("kizuna.db"))
            .unwrap_or_else(|| PathBuf::from("kizuna.db"))
    }

    /// Directory for rolling log files.
    pub fn log_dir() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }

    /// Ensure the data directory exists and return the DB path.
    pub fn ensure_db_path() -> Result<PathBuf, KizunaError> {
        let path = Self::db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "kizuna")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("built-in default config is valid TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = AppConfig::default();
        assert_eq!(config.services.primary, ServiceKind::AniList);
        assert!(config.services.anilist.enabled);
        assert!(config.services.mal.client_id.is_none());
        assert_eq!(config.sync.max_attempts, 4);
        assert_eq!(config.sync.base_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_sync_defaults_match_builtin_file() {
        assert_eq!(AppConfig::default().sync, SyncConfig::default());
    }

    #[test]
    fn test_partial_sync_section() {
        let partial = r#"
            [services]
            primary = "kitsu"

            [services.anilist]
            enabled = true
            base_url = "https://graphql.anilist.co"

            [services.kitsu]
            enabled = true
            base_url = "https://kitsu.app/api/edge"

            [services.mal]
            enabled = false
            base_url = "https://api.myanimelist.net/v2"

            [sync]
            max_attempts = 2
        "#;
        let config: AppConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.services.primary, ServiceKind::Kitsu);
        assert_eq!(config.sync.max_attempts, 2);
        assert_eq!(config.sync.base_backoff_ms, 500);
        assert_eq!(config.sync.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_services_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nmax_attempts = 3\n").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, KizunaError::Config(_)));
    }

    #[test]
    fn test_roundtrip() {
        let config = AppConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.services.primary, config.services.primary);
        assert_eq!(deserialized.sync.max_backoff_ms, config.sync.max_backoff_ms);
    }

    #[test]
    fn test_missing_section_falls_back_to_defaults() {
        let partial = r#"
            [services]
            primary = "mal"

            [services.anilist]
            enabled = false
            base_url = "https://graphql.anilist.co"

            [services.kitsu]
            enabled = true
            base_url = "https://kitsu.app/api/edge"

            [services.mal]
            enabled = true
            base_url = "https://api.myanimelist.net/v2"
            client_id = "abc"
        "#;
        let config: AppConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.services.primary, ServiceKind::MyAnimeList);
        assert!(!config.services.is_enabled(ServiceKind::AniList));
        assert_eq!(config.services.mal.client_id.as_deref(), Some("abc"));
        assert_eq!(config.sync.request_timeout_secs, 30);
    }

    #[test]
    fn test_save_and_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.services.primary = ServiceKind::Kitsu;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.services.primary, ServiceKind::Kitsu);

        let missing = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.services.primary, ServiceKind::AniList);
    }
}
