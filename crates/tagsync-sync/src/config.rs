use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tagsync_adapters::{DirectoryClientConfig, DirectoryError, FieldMapping, ADMIN_SENTINEL};
use tagsync_storage::TokenBucketConfig;

pub const DEFAULT_CONFIG_FILE: &str = "tagsync.yaml";

/// A value that must never appear in logs or debug output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub api_base_url: String,
    pub auth_url: String,
    pub account_id: i64,
    pub contact_filter: String,
    pub tag_id_field: String,
    pub label_field: String,
    pub admin_role_system_code: String,
    pub http_timeout_secs: u64,
    pub async_poll_attempts: u32,
    pub async_poll_delay_secs: u64,
    pub requests_per_minute: Option<u32>,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        let mapping = FieldMapping::default();
        Self {
            api_base_url: "https://api.wildapricot.org/v2.2".to_string(),
            auth_url: "https://oauth.wildapricot.org/auth/token".to_string(),
            account_id: 0,
            contact_filter: "'Membership status' eq 'Active'".to_string(),
            tag_id_field: mapping.tag_id_field,
            label_field: mapping.label_field,
            admin_role_system_code: mapping.admin_role_system_code,
            http_timeout_secs: 30,
            async_poll_attempts: 10,
            async_poll_delay_secs: 5,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub interval_secs: u64,
    /// Cron expression that replaces the fixed interval when set.
    pub cron: Option<String>,
    pub scheduler_enabled: bool,
    pub pass_timeout_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
            cron: None,
            scheduler_enabled: true,
            pass_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind_addr: String,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    pub directory: DirectorySettings,
    pub sync: ScheduleSettings,
    pub web: WebSettings,
    #[serde(skip)]
    pub directory_api_key: Option<Secret>,
    #[serde(skip)]
    pub webhook_token: Option<Secret>,
    #[serde(skip)]
    pub admin_token: Option<Secret>,
}

/// Serializable view of a [`SyncConfig`] that reports which secrets are set
/// without revealing them.
#[derive(Debug, Serialize)]
pub struct ConfigView<'a> {
    #[serde(flatten)]
    pub settings: &'a SyncConfig,
    pub secrets: SecretsPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecretsPresent {
    pub directory_api_key: bool,
    pub webhook_token: bool,
    pub admin_token: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tagsync.db".to_string(),
            directory: DirectorySettings::default(),
            sync: ScheduleSettings::default(),
            web: WebSettings::default(),
            directory_api_key: None,
            webhook_token: None,
            admin_token: None,
        }
    }
}

impl SyncConfig {
    /// Resolve the config file, parse it, then layer the process environment on top.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var("TAGSYNC_CONFIG")
                .ok()
                .map(PathBuf::from)
                .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists())),
        };

        let mut config = match path {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(id) = get("DIRECTORY_ACCOUNT_ID") {
            self.directory.account_id = parse_env("DIRECTORY_ACCOUNT_ID", &id)?;
        }
        if let Some(filter) = get("DIRECTORY_CONTACT_FILTER") {
            self.directory.contact_filter = filter;
        }
        if let Some(field) = get("DIRECTORY_TAG_FIELD") {
            self.directory.tag_id_field = field;
        }
        if let Some(field) = get("DIRECTORY_LABEL_FIELD") {
            self.directory.label_field = field;
        }
        if let Some(secs) = get("TAGSYNC_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = parse_env("TAGSYNC_SYNC_INTERVAL_SECS", &secs)?;
        }
        if let Some(flag) = get("TAGSYNC_SCHEDULER_ENABLED") {
            self.sync.scheduler_enabled = parse_env("TAGSYNC_SCHEDULER_ENABLED", &flag.to_ascii_lowercase())?;
        }
        if let Some(addr) = get("TAGSYNC_BIND_ADDR") {
            self.web.bind_addr = addr;
        }
        if let Some(key) = get("DIRECTORY_API_KEY") {
            self.directory_api_key = Some(Secret::new(key));
        }
        if let Some(token) = get("WEBHOOK_TOKEN") {
            self.webhook_token = Some(Secret::new(token));
        }
        if let Some(token) = get("ADMIN_TOKEN") {
            self.admin_token = Some(Secret::new(token));
        }
        Ok(())
    }

    pub fn field_mapping(&self) -> FieldMapping {
        FieldMapping {
            tag_id_field: self.directory.tag_id_field.clone(),
            label_field: self.directory.label_field.clone(),
            admin_role_system_code: self.directory.admin_role_system_code.clone(),
            admin_sentinel: ADMIN_SENTINEL.to_string(),
        }
    }

    pub fn directory_client_config(&self) -> Result<DirectoryClientConfig> {
        let api_key = self
            .directory_api_key
            .as_ref()
            .ok_or(DirectoryError::MissingCredential("DIRECTORY_API_KEY"))?;
        if self.directory.account_id <= 0 {
            anyhow::bail!("directory.account_id must be set (or DIRECTORY_ACCOUNT_ID)");
        }
        Ok(DirectoryClientConfig {
            api_base_url: self.directory.api_base_url.clone(),
            auth_url: self.directory.auth_url.clone(),
            account_id: self.directory.account_id,
            api_key: api_key.expose().to_string(),
            http_timeout: Duration::from_secs(self.directory.http_timeout_secs.max(1)),
            async_poll_attempts: self.directory.async_poll_attempts,
            async_poll_delay: Duration::from_secs(self.directory.async_poll_delay_secs),
            rate_limit: self.directory.requests_per_minute.filter(|n| *n > 0).map(|n| TokenBucketConfig {
                capacity: n,
                refill_every: Duration::from_secs(60) / n,
            }),
            user_agent: Some(format!("tagsync/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    pub fn webhook_token(&self) -> Result<&Secret> {
        self.webhook_token
            .as_ref()
            .context("WEBHOOK_TOKEN must be set to accept directory webhooks")
    }

    pub fn view(&self) -> ConfigView<'_> {
        ConfigView {
            settings: self,
            secrets: SecretsPresent {
                directory_api_key: self.directory_api_key.is_some(),
                webhook_token: self.webhook_token.is_some(),
                admin_token: self.admin_token.is_some(),
            },
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs.max(1))
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.pass_timeout_secs.max(1))
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().with_context(|| format!("invalid value for {key}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval(), Duration::from_secs(1800));
        assert_eq!(config.directory.http_timeout_secs, 30);
        assert_eq!(config.directory.async_poll_attempts, 10);
        assert_eq!(config.directory.async_poll_delay_secs, 5);
        assert!(config.sync.scheduler_enabled);
        assert_eq!(config.field_mapping().admin_role_system_code, "AdminRole");
    }

    #[test]
    fn yaml_file_then_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "database_url: sqlite://from-file.db\ndirectory:\n  account_id: 12345\n  tag_id_field: RFID\nsync:\n  interval_secs: 60\n  cron: \"0 */15 * * * *\"\nweb:\n  bind_addr: 127.0.0.1:9000"
        )
        .unwrap();

        let mut config = SyncConfig::from_yaml_file(file.path()).expect("parse yaml");
        assert_eq!(config.database_url, "sqlite://from-file.db");
        assert_eq!(config.directory.tag_id_field, "RFID");
        assert_eq!(config.directory.label_field, "Safety Training");
        assert_eq!(config.sync.cron.as_deref(), Some("0 */15 * * * *"));

        config
            .apply_env_overrides(env(&[
                ("DATABASE_URL", "sqlite://from-env.db"),
                ("TAGSYNC_SYNC_INTERVAL_SECS", "120"),
                ("TAGSYNC_SCHEDULER_ENABLED", "false"),
                ("DIRECTORY_API_KEY", "key-123"),
                ("WEBHOOK_TOKEN", "hook-456"),
                ("ADMIN_TOKEN", "admin-789"),
            ]))
            .unwrap();
        assert_eq!(config.database_url, "sqlite://from-env.db");
        assert_eq!(config.sync.interval_secs, 120);
        assert!(!config.sync.scheduler_enabled);
        assert_eq!(config.webhook_token().unwrap().expose(), "hook-456");
        assert_eq!(config.web.bind_addr, "127.0.0.1:9000");

        let client = config.directory_client_config().unwrap();
        assert_eq!(client.account_id, 12345);
        assert_eq!(client.api_key, "key-123");
        assert!(!format!("{config:?}").contains("hook-456"));
        assert!(!format!("{config:?}").contains("key-123"));
        assert!(!format!("{config:?}").contains("admin-789"));
        assert_eq!(config.admin_token.as_ref().map(Secret::expose), Some("admin-789"));
    }

    #[test]
    fn bad_numeric_env_value_is_an_error() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env_overrides(env(&[("TAGSYNC_SYNC_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("TAGSYNC_SYNC_INTERVAL_SECS"));
    }

    #[test]
    fn scheduler_flag_must_be_a_boolean() {
        let mut config = SyncConfig::default();
        config
            .apply_env_overrides(env(&[("TAGSYNC_SCHEDULER_ENABLED", "False")]))
            .unwrap();
        assert!(!config.sync.scheduler_enabled);

        let err = config
            .apply_env_overrides(env(&[("TAGSYNC_SCHEDULER_ENABLED", "yes")]))
            .unwrap_err();
        assert!(err.to_string().contains("TAGSYNC_SCHEDULER_ENABLED"));
        assert!(!config.sync.scheduler_enabled);
    }

    #[test]
    fn missing_secrets_are_reported() {
        let config = SyncConfig::default();
        assert!(config.webhook_token().is_err());
        let err = config.directory_client_config().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DirectoryError>(),
            Some(DirectoryError::MissingCredential(_))
        ));
    }

    #[test]
    fn rate_limit_becomes_token_bucket() {
        let mut config = SyncConfig::default();
        config.directory.account_id = 1;
        config.directory.requests_per_minute = Some(60);
        config.directory_api_key = Some(Secret::new("k"));
        let bucket = config.directory_client_config().unwrap().rate_limit.expect("bucket");
        assert_eq!(bucket.capacity, 60);
        assert_eq!(bucket.refill_every, Duration::from_secs(1));
    }

    #[test]
    fn config_view_reports_secrets_without_values() {
        let mut config = SyncConfig::default();
        config.webhook_token = Some(Secret::new("hook-456"));
        let view = serde_json::to_value(config.view()).unwrap();

        assert_eq!(view["database_url"], "sqlite://tagsync.db");
        assert_eq!(view["directory"]["tag_id_field"], "Tag ID");
        assert_eq!(view["secrets"]["webhook_token"], true);
        assert_eq!(view["secrets"]["directory_api_key"], false);
        assert!(!view.to_string().contains("hook-456"));
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = SyncConfig::from_yaml_str("  \n").unwrap();
        assert_eq!(config.database_url, "sqlite://tagsync.db");
    }
}
