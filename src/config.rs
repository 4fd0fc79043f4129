//! Configuration file handling.
//!
//! The configuration file is stored at `$FINTRACK_HOME/config.json` and holds the API location,
//! the optional path of the API token and the engine's tunables.

use crate::db::Db;
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "fintrack";
const CONFIG_VERSION: u8 = 1;
const SECRETS: &str = ".secrets";
const ASSET_CACHES: &str = "asset_caches";
const TOKEN_FILE: &str = "api_token";
const CONFIG_JSON: &str = "config.json";
const FINTRACK_SQLITE: &str = "fintrack.sqlite";

/// The `Config` object represents the data directory of the app. It is loaded from
/// `$FINTRACK_HOME/config.json` and provides the paths of everything else kept there.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    secrets: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    db: Db,
    sqlite_path: PathBuf,
}

impl Config {
    /// Creates the data directory with an initial `config.json` pointing at `api_url` and an
    /// empty database.
    pub async fn create(dir: impl Into<PathBuf>, api_url: &str) -> Result<Self> {
        let maybe_relative = dir.into();
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the fintrack home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;

        let config_path = root.join(CONFIG_JSON);
        if config_path.exists() {
            bail!("A config file already exists at '{}'", config_path.display());
        }
        let secrets = root.join(SECRETS);
        utils::make_dir(&secrets).await?;
        utils::make_dir(root.join(ASSET_CACHES)).await?;

        url::Url::parse(api_url).with_context(|| format!("Invalid API URL '{api_url}'"))?;
        let config_file = ConfigFile {
            api_url: api_url.to_string(),
            ..ConfigFile::default()
        };
        config_file.save(&config_path).await?;

        let sqlite_path = root.join(FINTRACK_SQLITE);
        let db = Db::init(&sqlite_path)
            .await
            .context("Unable to create SQLite DB")?;

        Ok(Self {
            root,
            secrets,
            config_path,
            config_file,
            db,
            sqlite_path,
        })
    }

    /// Validates the data directory and loads `config.json` and the database.
    pub async fn load(fintrack_home: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = fintrack_home.into();
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("Fintrack home is missing, run `fintrack init` first")?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            bail!("The config file is missing '{}'", config_path.display())
        }
        let config_file = ConfigFile::load(&config_path).await?;

        let secrets = root.join(SECRETS);
        if !secrets.is_dir() {
            bail!("The secrets directory is missing '{}'", secrets.display())
        }

        let sqlite_path = root.join(FINTRACK_SQLITE);
        let db = Db::load(&sqlite_path)
            .await
            .context("Unable to load SQLite DB")?;

        Ok(Self {
            root,
            secrets,
            config_path,
            config_file,
            db,
            sqlite_path,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn secrets(&self) -> &Path {
        &self.secrets
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub fn api_url(&self) -> &str {
        &self.config_file.api_url
    }

    pub fn sync(&self) -> &SyncSettings {
        &self.config_file.sync
    }

    /// Where cached UI assets live, one directory per cache.
    pub fn asset_caches(&self) -> PathBuf {
        self.root.join(ASSET_CACHES)
    }

    /// Returns the configured `token_path`, resolved against the home directory if relative.
    pub fn token_path(&self) -> PathBuf {
        let p = self.config_file.token_path();
        if p.is_absolute() {
            return p;
        }
        self.root.join(p)
    }

    /// Reads the API token, if one has been stored.
    pub async fn api_token(&self) -> Result<Option<String>> {
        let path = self.token_path();
        if !path.is_file() {
            return Ok(None);
        }
        let token = utils::read(&path).await?.trim().to_string();
        Ok((!token.is_empty()).then_some(token))
    }
}

/// Tunables of the sync engine. Every field has a default, so a `config.json` only needs to
/// name the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Delivery attempts per drain before an operation is marked failed.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound for any single remote call.
    pub request_timeout_ms: u64,
    /// How long a new connectivity state must hold before it is declared.
    pub stable_window_ms: u64,
    pub probe_interval_ms: u64,
    pub cache_entries_per_namespace: usize,
    pub snooze_minutes: u64,
    pub activation_timeout_ms: u64,
    /// Caches whose name contains one of these (ignoring case) hold UI assets and are purged
    /// when an update is accepted.
    pub ui_asset_keywords: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            request_timeout_ms: 10_000,
            stable_window_ms: 2_000,
            probe_interval_ms: 5_000,
            cache_entries_per_namespace: 64,
            snooze_minutes: 24 * 60,
            activation_timeout_ms: 30_000,
            ui_asset_keywords: ["workbox", "precache", "app-shell", "static", "assets"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SyncSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_millis(self.stable_window_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn snooze(&self) -> Duration {
        Duration::from_secs(self.snooze_minutes * 60)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "fintrack",
///   "config_version": 1,
///   "api_url": "https://fintrack.example.com/api/",
///   "token_path": ".secrets/api_token",
///   "sync": { "retry_attempts": 5, "ui_asset_keywords": ["precache", "app-shell"] }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, always "fintrack".
    app_name: String,

    config_version: u8,

    /// Base URL of the remote API.
    api_url: String,

    /// Path to a file holding the API bearer token, relative to the home directory or absolute.
    /// Defaults to `$FINTRACK_HOME/.secrets/api_token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_path: Option<PathBuf>,

    #[serde(default)]
    sync: SyncSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            api_url: String::new(),
            token_path: None,
            sync: SyncSettings::default(),
        }
    }
}

impl ConfigFile {
    async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: ConfigFile = utils::deserialize(path.as_ref()).await?;
        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );
        anyhow::ensure!(
            config.config_version == CONFIG_VERSION,
            "Unsupported config_version {}",
            config.config_version
        );
        Ok(config)
    }

    async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(path, data)
            .await
            .context("Unable to write config file")
    }

    fn token_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(SECRETS).join(TOKEN_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const API: &str = "https://fintrack.example.com/api/";

    #[tokio::test]
    async fn test_config_create_then_load() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("fintrack_home");
        let created = Config::create(&home, API).await.unwrap();
        assert_eq!(created.api_url(), API);
        assert!(created.secrets().is_dir());
        assert!(created.asset_caches().is_dir());
        assert!(created.sqlite_path().is_file());

        let loaded = Config::load(&home).await.unwrap();
        assert_eq!(loaded.root(), created.root());
        assert_eq!(loaded.sync(), &SyncSettings::default());
        assert!(Config::create(&home, API).await.is_err());
    }

    #[tokio::test]
    async fn test_load_missing_home() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(dir.path().join("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_url() {
        let dir = TempDir::new().unwrap();
        assert!(Config::create(dir.path(), "not a url").await.is_err());
    }

    #[tokio::test]
    async fn test_api_token() {
        let dir = TempDir::new().unwrap();
        let config = Config::create(dir.path(), API).await.unwrap();
        assert_eq!(config.api_token().await.unwrap(), None);
        utils::write(config.token_path(), "secret-token\n").await.unwrap();
        assert_eq!(
            config.api_token().await.unwrap().as_deref(),
            Some("secret-token")
        );
    }

    #[tokio::test]
    async fn test_partial_sync_section_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_JSON);
        utils::write(
            &path,
            r#"{"app_name":"fintrack","config_version":1,"api_url":"http://x/","sync":{"retry_attempts":5}}"#,
        )
        .await
        .unwrap();
        let file = ConfigFile::load(&path).await.unwrap();
        assert_eq!(file.sync.retry_attempts, 5);
        assert_eq!(file.sync.retry_base_delay_ms, 500);
        assert_eq!(file.token_path(), PathBuf::from(SECRETS).join(TOKEN_FILE));
    }

    #[tokio::test]
    async fn test_wrong_app_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_JSON);
        let file = ConfigFile {
            app_name: "budget".to_string(),
            ..ConfigFile::default()
        };
        file.save(&path).await.unwrap();
        assert!(ConfigFile::load(&path).await.is_err());
    }
}
