//! # Configuration Management Module
//!
//! All settings of the bridge live in one TOML file, loaded once at startup and
//! read-only afterwards.
//!
//! ## Configuration Structure
//!
//! - [`SourceConfig`] - MQTT broker carrying the Meshtastic JSON feed
//! - [`TelegramConfig`] - bot token, group chat, allow-list, notification audience
//! - [`GroupingConfig`] - correlation window tuning
//! - [`FormattingConfig`] - optional lines in rendered notifications
//! - [`NodeCacheConfig`] - node cache snapshot file and staleness
//! - [`LoggingConfig`] - log level and file
//! - [`ProxyTargetConfig`] - zero or more downstream brokers (`[[proxy_targets]]`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgram::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides()?;
//!     config.validate()?;
//!     println!("Source broker: {}:{}", config.source.host, config.source.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [source]
//! host = "mqtt.example.org"
//! port = 1883
//! topic = "msh/2/json/#"
//!
//! [telegram]
//! bot_token = "123456:ABC..."
//! group_chat_id = -1001234567890
//! allowed_user_ids = [111, 222]
//!
//! [[proxy_targets]]
//! name = "archive"
//! host = "archive.local"
//! topic_prefix = "fwd/"
//! qos = 1
//! ```
//!
//! ## Environment Integration
//!
//! Secrets and deployment knobs can be overridden through environment variables
//! (`TELEGRAM_BOT_TOKEN`, `TELEGRAM_GROUP_CHAT_ID`, `TELEGRAM_ALLOWED_USER_IDS`,
//! `MQTT_SOURCE_HOST`, `MQTT_SOURCE_PORT`, `MQTT_SOURCE_USERNAME`,
//! `MQTT_SOURCE_PASSWORD`, `MQTT_SOURCE_TOPIC`). Precedence: environment > file > defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::mesh::MessageKind;
use crate::validation::{self, ValidationError};

/// Fatal configuration problems. The process refuses to start on any of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("telegram.bot_token is empty (set it in the config file or TELEGRAM_BOT_TOKEN)")]
    MissingBotToken,

    #[error("{field}: {source}")]
    Invalid {
        field: String,
        #[source]
        source: ValidationError,
    },

    #[error("proxy target name must not be empty")]
    UnnamedProxyTarget,

    #[error("duplicate proxy target name '{0}'")]
    DuplicateProxyTarget(String),

    #[error("grouping: {0}")]
    Grouping(String),

    #[error("grouping.flush_kinds: unknown message kind '{0}'")]
    UnknownFlushKind(String),

    #[error("{field}: reconnect backoff schedule must contain at least one non-zero delay")]
    InvalidBackoff { field: String },

    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

fn invalid(field: impl Into<String>) -> impl FnOnce(ValidationError) -> ConfigError {
    let field = field.into();
    move |source| ConfigError::Invalid { field, source }
}

fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_backoff() -> Vec<u64> {
    vec![1, 2, 5, 10, 30]
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// MQTT client id presented to the source broker; see [`SourceConfig::client_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Subscription filter, e.g. `msh/2/json/#`
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnect delays in seconds; the last entry repeats.
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_seconds: Vec<u64>,
}

fn default_topic() -> String {
    "msh/2/json/#".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            username: None,
            password: None,
            client_id: None,
            topic: default_topic(),
            qos: 0,
            keep_alive_secs: default_keep_alive(),
            reconnect_backoff_seconds: default_backoff(),
        }
    }
}

impl SourceConfig {
    /// Configured client id, or `meshgram-<pid>` so two bridges on one broker
    /// do not take over each other's session.
    pub fn client_id(&self) -> String {
        self.client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("meshgram-{}", std::process::id()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Group chat receiving mesh notifications. Unset disables group delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_chat_id: Option<i64>,
    /// Users allowed to issue commands and receive direct notifications. Empty = everyone.
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,
    /// Explicit direct-notification recipients; empty falls back to `allowed_user_ids`.
    #[serde(default)]
    pub notify_user_ids: Vec<i64>,
    /// Emit node-update summaries (position / nodeinfo / telemetry), not only text.
    #[serde(default = "default_true")]
    pub node_updates: bool,
    /// Deliver mesh notifications to individual users as well as the group.
    #[serde(default = "default_true")]
    pub notify_users: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Long-poll timeout for getUpdates.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    /// Answer /start, /help, /status and /info in private chats.
    #[serde(default = "default_true")]
    pub commands_enabled: bool,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            group_chat_id: None,
            allowed_user_ids: Vec::new(),
            notify_user_ids: Vec::new(),
            node_updates: true,
            notify_users: true,
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            poll_timeout_secs: default_poll_timeout(),
            commands_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Window closes after this long without a new message for the node.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Window force-closes this long after it opened, regardless of activity.
    #[serde(default = "default_max_window_ms")]
    pub max_window_ms: u64,
    /// Kinds that close the node's window right after being merged.
    /// Text messages always bypass windows and need not be listed.
    #[serde(default)]
    pub flush_kinds: Vec<String>,
    /// Upper bound on simultaneously open windows; the oldest is closed on overflow.
    #[serde(default = "default_max_open_windows")]
    pub max_open_windows: usize,
}

fn default_quiet_period_ms() -> u64 {
    3000
}
fn default_max_window_ms() -> u64 {
    15000
}
fn default_max_open_windows() -> usize {
    256
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            max_window_ms: default_max_window_ms(),
            flush_kinds: Vec::new(),
            max_open_windows: default_max_open_windows(),
        }
    }
}

impl GroupingConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn max_window(&self) -> Duration {
        Duration::from_millis(self.max_window_ms)
    }

    pub fn parsed_flush_kinds(&self) -> Result<Vec<MessageKind>, ConfigError> {
        self.flush_kinds
            .iter()
            .map(|k| {
                k.parse::<MessageKind>()
                    .map_err(|_| ConfigError::UnknownFlushKind(k.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingConfig {
    #[serde(default = "default_true")]
    pub show_signal: bool,
    #[serde(default)]
    pub show_time: bool,
    #[serde(default = "default_true")]
    pub show_map_link: bool,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            show_signal: true,
            show_time: false,
            show_map_link: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCacheConfig {
    /// JSON snapshot path; unset keeps the cache purely in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

fn default_save_interval() -> u64 {
    60
}
fn default_stale_after_hours() -> u64 {
    24
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            file: Some("data/node_cache.json".to_string()),
            save_interval_secs: default_save_interval(),
            stale_after_hours: default_stale_after_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshgram.log".to_string()),
        }
    }
}

/// Downstream broker receiving republished source traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTargetConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Defaults to `meshgram-<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Prepended to the source topic; empty republishes under the same topic.
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_seconds: Vec<u64>,
}

impl ProxyTargetConfig {
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("meshgram-{}", self.name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub formatting: FormattingConfig,
    #[serde(default)]
    pub node_cache: NodeCacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub proxy_targets: Vec<ProxyTargetConfig>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        Self::from_toml(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Write the default configuration; refuses to overwrite an existing file.
    pub async fn create_default(path: &str) -> Result<()> {
        if Path::new(path).exists() {
            return Err(anyhow!("Config file {} already exists; not overwriting", path));
        }
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(raw) = get("TELEGRAM_GROUP_CHAT_ID") {
            self.telegram.group_chat_id = Some(raw.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "TELEGRAM_GROUP_CHAT_ID",
                value: raw.clone(),
            })?);
        }
        if let Some(raw) = get("TELEGRAM_ALLOWED_USER_IDS") {
            self.telegram.allowed_user_ids =
                validation::parse_user_id_list(&raw).map_err(|_| ConfigError::InvalidEnv {
                    var: "TELEGRAM_ALLOWED_USER_IDS",
                    value: raw.clone(),
                })?;
        }
        if let Some(host) = get("MQTT_SOURCE_HOST") {
            self.source.host = host;
        }
        if let Some(raw) = get("MQTT_SOURCE_PORT") {
            self.source.port = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MQTT_SOURCE_PORT",
                value: raw.clone(),
            })?;
        }
        if let Some(user) = get("MQTT_SOURCE_USERNAME") {
            self.source.username = Some(user);
        }
        if let Some(pass) = get("MQTT_SOURCE_PASSWORD") {
            self.source.password = Some(pass);
        }
        if let Some(topic) = get("MQTT_SOURCE_TOPIC") {
            self.source.topic = topic;
        }
        Ok(())
    }

    /// Check everything the bridge relies on at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingBotToken);
        }

        validation::validate_endpoint(&self.source.host, self.source.port)
            .map_err(invalid("source"))?;
        validation::validate_topic_filter(&self.source.topic).map_err(invalid("source.topic"))?;
        validation::validate_qos(self.source.qos).map_err(invalid("source.qos"))?;
        check_backoff("source", &self.source.reconnect_backoff_seconds)?;

        let g = &self.grouping;
        if g.quiet_period_ms == 0 {
            return Err(ConfigError::Grouping(
                "quiet_period_ms must be greater than zero".into(),
            ));
        }
        if g.max_window_ms < g.quiet_period_ms {
            return Err(ConfigError::Grouping(format!(
                "max_window_ms ({}) must not be shorter than quiet_period_ms ({})",
                g.max_window_ms, g.quiet_period_ms
            )));
        }
        if g.max_open_windows == 0 {
            return Err(ConfigError::Grouping(
                "max_open_windows must be greater than zero".into(),
            ));
        }
        g.parsed_flush_kinds()?;

        let mut names = HashSet::new();
        for target in &self.proxy_targets {
            let name = target.name.trim();
            if name.is_empty() {
                return Err(ConfigError::UnnamedProxyTarget);
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::DuplicateProxyTarget(name.to_string()));
            }
            let field = format!("proxy_targets[{}]", name);
            validation::validate_endpoint(&target.host, target.port)
                .map_err(invalid(field.clone()))?;
            validation::validate_qos(target.qos).map_err(invalid(format!("{}.qos", field)))?;
            validation::validate_topic_prefix(&target.topic_prefix)
                .map_err(invalid(format!("{}.topic_prefix", field)))?;
            check_backoff(&field, &target.reconnect_backoff_seconds)?;
        }
        Ok(())
    }
}

fn check_backoff(field: &str, schedule: &[u64]) -> Result<(), ConfigError> {
    if schedule.iter().all(|s| *s == 0) {
        return Err(ConfigError::InvalidBackoff {
            field: field.to_string(),
        });
    }
    Ok(())
}
