//! # Configuration de pmolink
//!
//! Static configuration of the node fleet and of the runtime behaviour:
//!
//! - loaded from a YAML file, merged over the embedded default configuration
//! - environment variables prefixed with `PMOLINK__` override single values
//!   (`PMOLINK__OPTIONS__BATCH_DELAY_MS=50`)
//! - every option has a documented default, and [`LinkConfig::validate`]
//!   rejects invalid combinations before anything connects
//!
//! ```no_run
//! use pmolink::config::LinkConfig;
//!
//! let config = LinkConfig::load(Some("pmolink.yaml"))?;
//! assert!(!config.nodes.is_empty());
//! # Ok::<(), pmolink::LinkError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::{env, fs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::errors::{LinkError, Result};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmolink.yaml");

const ENV_CONFIG_FILE: &str = "PMOLINK_CONFIG";
const ENV_PREFIX: &str = "PMOLINK__";

pub const DEFAULT_PORT: u16 = 2333;
pub const DEFAULT_PASSWORD: &str = "youshallnotpass";
pub const DEFAULT_SEARCH_PLATFORM: &str = "ytmsearch";
const DEFAULT_REST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_TRIES: u32 = 3;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RESUME_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;
const DEFAULT_BATCH_DELAY_MS: u64 = 25;
const DEFAULT_HEALTH_CACHE_TTL_SECS: u64 = 30;
const MAX_BATCH_DELAY_MS: u64 = 1_000;

/// Version of the node protocol (REST prefix and socket endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestVersion {
    V3,
    #[default]
    V4,
}

impl RestVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestVersion::V3 => "v3",
            RestVersion::V4 => "v4",
        }
    }

    /// Path of the control socket on the node
    pub fn websocket_path(&self) -> &'static str {
        match self {
            RestVersion::V3 => "/",
            RestVersion::V4 => "/v4/websocket",
        }
    }
}

/// What a session remembers of the tracks it already played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "size", rename_all = "camelCase")]
pub enum HistoryPolicy {
    /// No previous track is kept
    Disabled,
    /// Only the most recent finished track
    LastOnly,
    /// The `n` most recent finished tracks, newest first
    Bounded(usize),
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        HistoryPolicy::LastOnly
    }
}

impl HistoryPolicy {
    pub fn capacity(&self) -> usize {
        match self {
            HistoryPolicy::Disabled => 0,
            HistoryPolicy::LastOnly => 1,
            HistoryPolicy::Bounded(n) => *n,
        }
    }
}

/// One remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique name, defaults to the host
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_password")]
    pub password: String,
    /// Use `https`/`wss`
    #[serde(default)]
    pub secure: bool,
    /// Region tags used by region aware session placement
    #[serde(default)]
    pub regions: Vec<String>,
    /// Session to resume on first connection
    #[serde(default)]
    pub session_id: Option<String>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            password: DEFAULT_PASSWORD.to_string(),
            secure: false,
            regions: Vec::new(),
            session_id: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Name used in logs and events
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self, version: RestVersion) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{}://{}:{}{}",
            scheme,
            self.host,
            self.port,
            version.websocket_path()
        )
    }

    pub fn serves_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_password() -> String {
    DEFAULT_PASSWORD.to_string()
}

/// Runtime behaviour shared by every node and session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOptions {
    pub rest_version: RestVersion,
    /// Sent as `Client-Name`
    pub client_name: String,
    /// Prefix used for non URL queries (`ytmsearch:<query>`)
    pub default_search_platform: String,
    pub rest_timeout_ms: u64,
    /// Reconnect a node whose socket closed
    pub reconnect: bool,
    /// Consecutive failed reconnect attempts before the node is destroyed
    pub reconnect_tries: u32,
    /// First backoff delay, doubled on every failed attempt
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Ask nodes to keep our session alive across socket drops
    pub resume: bool,
    pub resume_timeout_secs: u64,
    /// Keep a node usable when its `/info` endpoint cannot be read
    pub bypass_info_check: bool,
    /// Replay playback state after reconnections
    pub auto_resume: bool,
    pub restart_delay_ms: u64,
    /// Coalescing window for outgoing player updates
    pub batch_delay_ms: u64,
    pub health_cache_ttl_secs: u64,
    pub history: HistoryPolicy,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            rest_version: RestVersion::V4,
            client_name: format!("pmolink/{}", env!("CARGO_PKG_VERSION")),
            default_search_platform: DEFAULT_SEARCH_PLATFORM.to_string(),
            rest_timeout_ms: DEFAULT_REST_TIMEOUT_MS,
            reconnect: true,
            reconnect_tries: DEFAULT_RECONNECT_TRIES,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            resume: true,
            resume_timeout_secs: DEFAULT_RESUME_TIMEOUT_SECS,
            bypass_info_check: false,
            auto_resume: false,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            health_cache_ttl_secs: DEFAULT_HEALTH_CACHE_TTL_SECS,
            history: HistoryPolicy::LastOnly,
        }
    }
}

impl LinkOptions {
    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }

    /// Backoff before reconnect attempt `attempt` (1-based), exponential and capped
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms.max(self.reconnect_delay_ms));
        Duration::from_millis(delay)
    }
}

/// Full configuration: the fleet plus the runtime options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LinkConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub options: LinkOptions,
}

impl LinkConfig {
    pub fn new(nodes: Vec<NodeConfig>, options: LinkOptions) -> Self {
        Self { nodes, options }
    }

    /// Charge la configuration
    ///
    /// Lookup order: the given path, then the file named by `PMOLINK_CONFIG`.
    /// A missing file falls back to the embedded defaults. `PMOLINK__*`
    /// variables are applied last.
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let path = path
            .map(|p| p.as_ref().to_path_buf())
            .or_else(|| env::var(ENV_CONFIG_FILE).ok().map(Into::into));

        let yaml = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading pmolink configuration");
                fs::read_to_string(&path)?
            }
            Some(path) => {
                info!(path = %path.display(), "Configuration file not found, using defaults");
                DEFAULT_CONFIG.to_string()
            }
            None => DEFAULT_CONFIG.to_string(),
        };

        Self::from_yaml_with_overrides(&yaml, env::vars())
    }

    /// Parses YAML without looking at the environment
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_overrides(yaml, std::iter::empty())
    }

    fn from_yaml_with_overrides<I>(yaml: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value: Value = serde_yaml::from_str(yaml)?;
        if value.is_null() {
            value = Value::Mapping(Mapping::new());
        }
        apply_env_overrides(&mut value, vars);

        let mut config: LinkConfig = serde_yaml::from_value(value)?;
        for node in &mut config.nodes {
            if node.name.is_empty() {
                node.name = node.host.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LinkError::config("at least one node must be configured"));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            validate_node(node)?;
            if !names.insert(node.display_name()) {
                return Err(LinkError::config(format!(
                    "duplicate node name '{}'",
                    node.display_name()
                )));
            }
        }

        validate_options(&self.options)
    }
}

pub(crate) fn validate_node(node: &NodeConfig) -> Result<()> {
    if node.host.trim().is_empty() {
        return Err(LinkError::config("node host must not be empty"));
    }
    if node.port == 0 {
        return Err(LinkError::config(format!(
            "node '{}' has an invalid port",
            node.display_name()
        )));
    }
    if node.password.is_empty() {
        return Err(LinkError::config(format!(
            "node '{}' has no password",
            node.display_name()
        )));
    }
    Ok(())
}

pub(crate) fn validate_options(options: &LinkOptions) -> Result<()> {
    if options.reconnect && options.reconnect_tries == 0 {
        return Err(LinkError::config(
            "reconnect_tries must be at least 1 when reconnect is enabled",
        ));
    }
    if options.batch_delay_ms > MAX_BATCH_DELAY_MS {
        return Err(LinkError::config(format!(
            "batch_delay_ms must not exceed {} ms",
            MAX_BATCH_DELAY_MS
        )));
    }
    if options.rest_timeout_ms == 0 {
        return Err(LinkError::config("rest_timeout_ms must be positive"));
    }
    if options.history == HistoryPolicy::Bounded(0) {
        return Err(LinkError::config(
            "bounded history needs a size, use the disabled mode instead",
        ));
    }
    if options.default_search_platform.is_empty() {
        return Err(LinkError::config("default_search_platform must not be empty"));
    }
    Ok(())
}

fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        if let Some(rest) = key.strip_prefix(ENV_PREFIX) {
            let key_path = rest.split("__").collect::<Vec<_>>();
            debug!(key = %key, "Applying configuration override");
            set_value(config, &key_path, convert_env_value(&value));
        }
    }
}

fn convert_env_value(value: &str) -> Value {
    if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
        return parsed;
    }
    Value::String(value.to_string())
}

fn set_value(data: &mut Value, path: &[&str], value: Value) {
    if path.is_empty() {
        *data = value;
        return;
    }
    if let Value::Mapping(map) = data {
        let key = Value::String(path[0].to_lowercase());
        if path.len() == 1 {
            map.insert(key, value);
        } else {
            let entry = map.entry(key).or_insert(Value::Mapping(Mapping::new()));
            set_value(entry, &path[1..], value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_config() {
        let config = LinkConfig::from_yaml(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].port, DEFAULT_PORT);
        assert_eq!(config.options.batch_delay_ms, 25);
        assert_eq!(config.options.history, HistoryPolicy::LastOnly);
        assert_eq!(config.options.rest_version, RestVersion::V4);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = LinkConfig::from_yaml("nodes:\n  - host: node.example\n").unwrap();
        let node = &config.nodes[0];
        assert_eq!(node.name, "node.example");
        assert_eq!(node.password, DEFAULT_PASSWORD);
        assert_eq!(node.rest_url(), "http://node.example:2333");
        assert_eq!(
            node.websocket_url(RestVersion::V4),
            "ws://node.example:2333/v4/websocket"
        );
        assert_eq!(config.options, LinkOptions::default());
    }

    #[test]
    fn test_invalid_version_rejected() {
        let yaml = "nodes:\n  - host: a\noptions:\n  rest_version: v5\n";
        assert!(matches!(LinkConfig::from_yaml(yaml), Err(LinkError::Yaml(_))));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(LinkConfig::from_yaml("nodes: []"), Err(LinkError::Config(_))));

        let duplicate = "nodes:\n  - {name: a, host: h1}\n  - {name: a, host: h2}\n";
        assert!(matches!(LinkConfig::from_yaml(duplicate), Err(LinkError::Config(_))));

        let no_tries = "nodes:\n  - host: h\noptions:\n  reconnect_tries: 0\n";
        assert!(matches!(LinkConfig::from_yaml(no_tries), Err(LinkError::Config(_))));

        let empty_history = "nodes:\n  - host: h\noptions:\n  history: {mode: bounded, size: 0}\n";
        assert!(matches!(LinkConfig::from_yaml(empty_history), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_history_modes() {
        let yaml = "nodes:\n  - host: h\noptions:\n  history: {mode: bounded, size: 5}\n";
        let config = LinkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.options.history, HistoryPolicy::Bounded(5));
        assert_eq!(config.options.history.capacity(), 5);

        let yaml = "nodes:\n  - host: h\noptions:\n  history: {mode: disabled}\n";
        let config = LinkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.options.history.capacity(), 0);
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("PMOLINK__OPTIONS__BATCH_DELAY_MS".to_string(), "50".to_string()),
            ("PMOLINK__OPTIONS__AUTO_RESUME".to_string(), "true".to_string()),
            ("UNRELATED".to_string(), "1".to_string()),
        ];
        let config = LinkConfig::from_yaml_with_overrides(DEFAULT_CONFIG, vars).unwrap();
        assert_eq!(config.options.batch_delay_ms, 50);
        assert!(config.options.auto_resume);
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let options = LinkOptions {
            reconnect_delay_ms: 100,
            reconnect_max_delay_ms: 350,
            ..LinkOptions::default()
        };
        assert_eq!(options.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(options.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(options.reconnect_delay(3), Duration::from_millis(350));
        assert_eq!(options.reconnect_delay(30), Duration::from_millis(350));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = LinkConfig::load(Some("/nonexistent/pmolink.yaml")).unwrap();
        assert_eq!(config.nodes[0].host, "127.0.0.1");
    }
}
