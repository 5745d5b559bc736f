use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BotforgeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub factory: FactoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            github: GithubConfig::default(),
            backup: BackupConfig::default(),
            store: StoreConfig::default(),
            factory: FactoryConfig::default(),
        }
    }
}

impl Config {
    /// Load config: defaults, then optional `config.toml` patch, then env
    /// overrides. Secrets come from the environment only.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("BOTFORGE_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = explicit {
            if let Some(patch) = Self::load_patch(&path)? {
                config.merge_patch(patch);
            }
        } else if let Some(patch) = Self::load_patch(Path::new("config.toml"))? {
            config.merge_patch(patch);
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// `load` plus validation of the required secrets. Service entry points
    /// use this; tests construct `Config` directly.
    pub fn load_checked(explicit_path: Option<&Path>) -> Result<Self> {
        let config = Self::load(explicit_path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("BOT_TOKEN", self.telegram.bot_token.is_empty()),
            ("GITHUB_TOKEN", self.github.token.is_empty()),
            ("GITHUB_REPO_OWNER", self.github.owner.is_empty()),
            ("GITHUB_REPO_NAME", self.github.repo.is_empty()),
        ];
        for (name, missing) in required {
            if missing {
                return Err(BotforgeError::MissingConfig(name.to_string()));
            }
        }
        Ok(())
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|err| BotforgeError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw)
            .map_err(|err| BotforgeError::Config(format!("parse config {}: {err}", path.display())))?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(patch) = patch.telegram {
            self.telegram.merge(patch);
        }
        if let Some(patch) = patch.github {
            self.github.merge(patch);
        }
        if let Some(patch) = patch.backup {
            self.backup.merge(patch);
        }
        if let Some(patch) = patch.store {
            self.store.merge(patch);
        }
        if let Some(patch) = patch.factory {
            self.factory.merge(patch);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("BOT_TOKEN") {
            self.telegram.bot_token = value;
        }
        if let Some(value) = env_string("TELEGRAM_API_URL") {
            self.telegram.api_base = value;
        }
        if let Some(values) = env_list("ADMIN_IDS")? {
            let mut ids = Vec::with_capacity(values.len());
            for value in values {
                let id = value.parse::<i64>().map_err(|err| {
                    BotforgeError::Config(format!("invalid ADMIN_IDS entry {value}: {err}"))
                })?;
                ids.push(id);
            }
            self.telegram.admin_ids = ids;
        }

        if let Some(value) = env_string("GITHUB_TOKEN") {
            self.github.token = value;
        }
        if let Some(value) = env_string("GITHUB_REPO_OWNER") {
            self.github.owner = value;
        }
        if let Some(value) = env_string("GITHUB_REPO_NAME") {
            self.github.repo = value;
        }
        if let Some(value) = env_string("GITHUB_BACKUP_BRANCH") {
            self.github.branch = value;
        }
        if let Some(value) = env_string("GITHUB_BACKUP_PATH") {
            self.github.backup_path = value;
        }
        if let Some(value) = env_string("GITHUB_API_URL") {
            self.github.api_base = value;
        }

        if let Some(value) = env_u32("BACKUP_THRESHOLD")? {
            self.backup.threshold = value;
        }
        if let Some(value) = env_u64("BACKUP_INTERVAL_SECS")? {
            self.backup.interval_secs = value;
        }
        if let Some(value) = env_u64("HTTP_TIMEOUT_SECS")? {
            self.backup.http_timeout_secs = value;
        }

        if let Some(value) = env_string("BOTFORGE_DB_PATH") {
            self.store.db_path = PathBuf::from(value);
        }

        if let Some(value) = env_u32("STAR_PRICE")? {
            self.factory.star_price = value;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token; env-only in practice, never committed to config.toml.
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_telegram_api(),
            admin_ids: Vec::new(),
        }
    }
}

impl TelegramConfig {
    fn merge(&mut self, patch: TelegramPatch) {
        if let Some(value) = patch.api_base {
            self.api_base = value;
        }
        if let Some(values) = patch.admin_ids {
            self.admin_ids = values;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_backup_path")]
    pub backup_path: String,
    #[serde(default = "default_github_api")]
    pub api_base: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
            backup_path: default_backup_path(),
            api_base: default_github_api(),
        }
    }
}

impl GithubConfig {
    fn merge(&mut self, patch: GithubPatch) {
        if let Some(value) = patch.owner {
            self.owner = value;
        }
        if let Some(value) = patch.repo {
            self.repo = value;
        }
        if let Some(value) = patch.branch {
            self.branch = value;
        }
        if let Some(value) = patch.backup_path {
            self.backup_path = value;
        }
        if let Some(value) = patch.api_base {
            self.api_base = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Ordinary writes accumulated before a push is forced.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Periodic sweep interval for unpushed writes.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Fixed per-call socket timeout for remote requests.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            interval_secs: default_interval(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl BackupConfig {
    fn merge(&mut self, patch: BackupPatch) {
        if let Some(value) = patch.threshold {
            self.threshold = value;
        }
        if let Some(value) = patch.interval_secs {
            self.interval_secs = value;
        }
        if let Some(value) = patch.http_timeout_secs {
            self.http_timeout_secs = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StoreConfig {
    fn merge(&mut self, patch: StorePatch) {
        if let Some(value) = patch.db_path {
            self.db_path = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Stars charged for provisioning one bot.
    #[serde(default = "default_star_price")]
    pub star_price: u32,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            star_price: default_star_price(),
        }
    }
}

impl FactoryConfig {
    fn merge(&mut self, patch: FactoryPatch) {
        if let Some(value) = patch.star_price {
            self.star_price = value;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    telegram: Option<TelegramPatch>,
    github: Option<GithubPatch>,
    backup: Option<BackupPatch>,
    store: Option<StorePatch>,
    factory: Option<FactoryPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramPatch {
    api_base: Option<String>,
    admin_ids: Option<Vec<i64>>,
}

#[derive(Debug, Default, Deserialize)]
struct GithubPatch {
    owner: Option<String>,
    repo: Option<String>,
    branch: Option<String>,
    backup_path: Option<String>,
    api_base: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BackupPatch {
    threshold: Option<u32>,
    interval_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FactoryPatch {
    star_price: Option<u32>,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_backup_path() -> String {
    "backups/botforge".to_string()
}

fn default_threshold() -> u32 {
    5
}

fn default_interval() -> u64 {
    600
}

fn default_http_timeout() -> u64 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("botforge.db")
}

fn default_star_price() -> u32 {
    200
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) => value.parse::<u32>().map(Some).map_err(|err| {
            BotforgeError::Config(format!("invalid {key} value {value}: {err}"))
        }),
        Err(_) => Ok(None),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value.parse::<u64>().map(Some).map_err(|err| {
            BotforgeError::Config(format!("invalid {key} value {value}: {err}"))
        }),
        Err(_) => Ok(None),
    }
}

fn env_list(key: &str) -> Result<Option<Vec<String>>> {
    match std::env::var(key) {
        Ok(value) => {
            let list = value
                .split(',')
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(|entry| entry.to_string())
                .collect::<Vec<_>>();
            Ok(Some(list))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.backup.threshold, 5);
        assert_eq!(config.backup.interval_secs, 600);
        assert_eq!(config.github.branch, "main");
        assert_eq!(config.github.backup_path, "backups/botforge");
        assert_eq!(config.factory.star_price, 200);
        assert_eq!(config.store.db_path, PathBuf::from("botforge.db"));
    }

    #[test]
    fn validate_flags_missing_secrets() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        match err {
            BotforgeError::MissingConfig(name) => assert_eq!(name, "BOT_TOKEN"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn patch_merge_overrides_defaults() {
        let mut config = Config::default();
        let patch: ConfigPatch = toml::from_str(
            r#"
            [backup]
            threshold = 3
            interval_secs = 60

            [github]
            owner = "someone"
            repo = "state"
            "#,
        )
        .unwrap();
        config.merge_patch(patch);
        assert_eq!(config.backup.threshold, 3);
        assert_eq!(config.backup.interval_secs, 60);
        assert_eq!(config.github.owner, "someone");
        assert_eq!(config.github.repo, "state");
        // Untouched fields keep defaults.
        assert_eq!(config.github.branch, "main");
    }
}
