use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::HeadlessRuleOverrides;

pub const CONFIG_PATH_ENV: &str = "AGENT_MONITOR_CONFIG";
pub const GRACE_MS_ENV: &str = "AGENT_MONITOR_GRACE_MS";
pub const EVENT_CAPACITY_ENV: &str = "AGENT_MONITOR_EVENT_CAPACITY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {GRACE_MS_ENV}: {0}")]
    InvalidGraceMs(String),
    #[error("invalid {EVENT_CAPACITY_ENV}: {0}")]
    InvalidEventCapacity(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub session: SessionConfig,
    pub events: EventsConfig,
    /// Per-kind launch defaults, keyed by backend kind (`codex`, `claude`, ...).
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub grace_ms: u64,
    pub initialize_timeout_ms: u64,
    /// Per-request response deadline after the handshake. Zero disables it.
    pub request_timeout_ms: u64,
    pub max_consecutive_malformed: usize,
    /// Unset means approvals wait indefinitely.
    pub approval_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_ms: 3_000,
            initialize_timeout_ms: 15_000,
            request_timeout_ms: 60_000,
            max_consecutive_malformed: app_server_client::DEFAULT_MAX_CONSECUTIVE_MALFORMED,
            approval_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub bin: Option<String>,
    /// Shell-style argument string, split with `shell-words`.
    pub args: Option<String>,
    pub home: Option<PathBuf>,
    pub tier: Option<String>,
    /// Headless mode: `interactive` or `stream-json`.
    pub mode: Option<String>,
    /// Extra environment passed to the backend process.
    pub env: HashMap<String, String>,
    /// Host variables passed through on top of the fixed allowlist, e.g.
    /// `SSH_AUTH_SOCK`.
    pub inherit_env: Vec<String>,
    pub headless: HeadlessRuleOverrides,
}

impl MonitorConfig {
    /// `$AGENT_MONITOR_CONFIG`, else `<config dir>/agent-monitor/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = env::var(CONFIG_PATH_ENV)
            && !path.trim().is_empty()
        {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("agent-monitor").join("config.toml"))
    }

    /// Load from the default location (a missing file yields defaults), then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            env::var(GRACE_MS_ENV).ok().as_deref(),
            env::var(EVENT_CAPACITY_ENV).ok().as_deref(),
        )
    }

    fn apply_overrides(
        &mut self,
        grace_ms: Option<&str>,
        event_capacity: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = grace_ms {
            self.session.grace_ms = raw
                .trim()
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidGraceMs(error.to_string()))?;
        }
        if let Some(raw) = event_capacity {
            let capacity = raw
                .trim()
                .parse::<usize>()
                .map_err(|error| ConfigError::InvalidEventCapacity(error.to_string()))?;
            if capacity == 0 {
                return Err(ConfigError::InvalidEventCapacity(
                    "capacity must be positive".to_string(),
                ));
            }
            self.events.capacity = capacity;
        }
        Ok(())
    }

    #[must_use]
    pub fn backend(&self, kind: &str) -> Option<&BackendConfig> {
        self.backends.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() -> anyhow::Result<()> {
        let config: MonitorConfig = toml::from_str("")?;
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.session.grace(), Duration::from_secs(3));
        assert_eq!(config.session.initialize_timeout(), Duration::from_secs(15));
        assert_eq!(config.session.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.events.capacity, 1024);
        Ok(())
    }

    #[test]
    fn backend_sections_parse() -> anyhow::Result<()> {
        let config: MonitorConfig = toml::from_str(
            r#"
            [session]
            grace_ms = 500
            approval_timeout_ms = 60000
            request_timeout_ms = 0

            [backends.claude]
            bin = "/opt/claude/bin/claude"
            args = "--verbose --model 'sonnet'"
            tier = "headless"
            mode = "interactive"
            inherit_env = ["SSH_AUTH_SOCK"]

            [backends.claude.headless]
            turn_completed = "^READY$"
            "#,
        )?;
        assert_eq!(config.session.grace_ms, 500);
        assert_eq!(config.session.initialize_timeout_ms, 15_000);
        assert_eq!(
            config.session.approval_timeout(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.session.request_timeout(), None);
        let claude = config
            .backend("claude")
            .ok_or_else(|| anyhow::anyhow!("missing claude section"))?;
        assert_eq!(claude.tier.as_deref(), Some("headless"));
        assert_eq!(claude.mode.as_deref(), Some("interactive"));
        assert_eq!(claude.inherit_env, vec!["SSH_AUTH_SOCK".to_string()]);
        assert_eq!(claude.headless.turn_completed.as_deref(), Some("^READY$"));
        Ok(())
    }

    #[test]
    fn env_overrides_are_validated() -> anyhow::Result<()> {
        let mut config = MonitorConfig::default();
        config.apply_overrides(Some("250"), Some("16"))?;
        assert_eq!(config.session.grace_ms, 250);
        assert_eq!(config.events.capacity, 16);

        assert!(matches!(
            config.apply_overrides(Some("soon"), None),
            Err(ConfigError::InvalidGraceMs(_))
        ));
        assert!(matches!(
            config.apply_overrides(None, Some("0")),
            Err(ConfigError::InvalidEventCapacity(_))
        ));
        Ok(())
    }

    #[test]
    fn from_file_reports_the_path_on_parse_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session\ngrace_ms = 1")?;
        match MonitorConfig::from_file(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => anyhow::bail!("unexpected result: {other:?}"),
        }
        Ok(())
    }
}
