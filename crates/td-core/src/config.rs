use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::DATA_DIR;

/// Project-local configuration, loaded from `<dir>/.todos/config.json` and
/// layered over the global `~/.config/td/config.json`. Env vars override
/// both (resolved at the accessor, not at load time).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    /// Declared feature-flag defaults; see `features::resolve`.
    #[serde(default)]
    pub features: std::collections::BTreeMap<String, bool>,
}

impl Config {
    /// Load and merge: global config first, then project config on top.
    /// Missing files fall back to defaults.
    pub fn resolve(project_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = match Self::global_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Config::default(),
        };
        let project = project_dir.join(DATA_DIR).join("config.json");
        if project.exists() {
            config.merge_from(&Self::load_from(&project)?);
        }
        Ok(config)
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write to `<dir>/.todos/config.json`.
    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let dir = project_dir.join(DATA_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Io(e.to_string()))?;
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(dir.join("config.json"), json).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// `~/.config/td/config.json`.
    pub fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("td").join("config.json"))
    }

    /// `~/.config/td/associations.json` — directory association map.
    pub fn associations_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("td").join("associations.json"))
    }

    /// Project values win field by field where they differ from defaults.
    fn merge_from(&mut self, project: &Config) {
        let defaults = Config::default();
        if project.sync != defaults.sync {
            self.sync = project.sync.clone();
        }
        if project.server != defaults.server {
            self.server = project.server.clone();
        }
        if project.webhook != defaults.webhook {
            self.webhook = project.webhook.clone();
        }
        if project.review != defaults.review {
            self.review = project.review.clone();
        }
        for (k, v) in &project.features {
            self.features.insert(k.clone(), *v);
        }
    }

    /// Webhook URL with env precedence: `TD_WEBHOOK_URL` > config.
    pub fn webhook_url(&self) -> Option<String> {
        env_nonempty("TD_WEBHOOK_URL").or_else(|| self.webhook.url.clone())
    }

    /// Webhook secret with env precedence: `TD_WEBHOOK_SECRET` > config.
    pub fn webhook_secret(&self) -> Option<String> {
        env_nonempty("TD_WEBHOOK_SECRET").or_else(|| self.webhook.secret.clone())
    }

    /// Sync auth key with env precedence: `TD_AUTH_KEY` > config.
    pub fn auth_key(&self) -> Option<String> {
        env_nonempty("TD_AUTH_KEY").or_else(|| self.sync.auth_key.clone())
    }
}

fn env_nonempty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote server base URL, e.g. `http://127.0.0.1:9090`.
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub pull: bool,
    #[serde(default = "default_true")]
    pub on_start: bool,
    #[serde(default = "default_pull_limit")]
    pub pull_limit: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_key: None,
            auto: false,
            debounce_secs: default_debounce_secs(),
            interval_secs: default_interval_secs(),
            pull: true,
            on_start: true,
            pull_limit: default_pull_limit(),
        }
    }
}

fn default_debounce_secs() -> u64 {
    3
}
fn default_interval_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_pull_limit() -> i64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 = OS-assigned; the bound port is published to the serve-port file.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_sse_poll_secs")]
    pub sse_poll_secs: u64,
    #[serde(default)]
    pub cors_origin: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            sse_poll_secs: default_sse_poll_secs(),
            cors_origin: None,
            auth_token: None,
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_sse_poll_secs() -> u64 {
    2
}
fn default_heartbeat_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Balanced policy allows the creator exception; strict does not.
    #[serde(default = "default_true")]
    pub balanced: bool,
    /// "liberal" | "advisory" | "strict"
    #[serde(default = "default_enforcement")]
    pub enforcement: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self { balanced: true, enforcement: default_enforcement() }
    }
}

fn default_enforcement() -> String {
    "liberal".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.debounce_secs, 3);
        assert_eq!(cfg.sync.interval_secs, 300);
        assert!(cfg.sync.pull);
        assert!(cfg.sync.on_start);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 0);
        assert_eq!(cfg.review.enforcement, "liberal");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"sync":{"auto":true}}"#).unwrap();
        assert!(cfg.sync.auto);
        assert_eq!(cfg.sync.debounce_secs, 3);
        assert!(cfg.webhook.url.is_none());
    }

    #[test]
    fn project_overrides_merge_over_global() {
        let dir = tempfile::tempdir().unwrap();
        let project = Config {
            webhook: WebhookConfig { url: Some("http://hook.local".into()), secret: None },
            ..Default::default()
        };
        project.save(dir.path()).unwrap();

        let resolved = Config::resolve(dir.path()).unwrap();
        assert_eq!(resolved.webhook.url.as_deref(), Some("http://hook.local"));
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.sync.server_url = Some("http://127.0.0.1:9999".into());
        cfg.features.insert("sync".into(), true);
        cfg.save(dir.path()).unwrap();

        let path = dir.path().join(DATA_DIR).join("config.json");
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sync.server_url.as_deref(), Some("http://127.0.0.1:9999"));
        assert_eq!(loaded.features.get("sync"), Some(&true));
    }
}
