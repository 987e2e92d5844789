use crate::error::{IndispensoError, Result};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "indispenso.yaml";
pub const DEFAULT_HOME: &str = "/etc/indispenso/";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// How long `GET client/{id}/cmds` waits for work before answering empty.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_seconds: u64,
    #[serde(default = "default_templates_file")]
    pub templates_file: String,
}

fn default_server_port() -> u16 {
    897
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_templates_file() -> String {
    "templates.json".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_server_port(),
            poll_timeout_seconds: default_poll_timeout(),
            templates_file: default_templates_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoint_uri: String,
    /// Directory that receives the per-command scripts.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_ping_interval() -> u64 {
    15
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_uri: String::new(),
            tmp_dir: default_tmp_dir(),
            ping_interval_seconds: default_ping_interval(),
            tags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConsensusConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Votes (requester included) needed when a template does not set `min_auth`.
    #[serde(default = "default_min_auth")]
    pub default_min_auth: u32,
    /// Pending requests older than this are pruned.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_min_auth() -> u32 {
    2
}

fn default_max_age_days() -> u64 {
    14
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_min_auth: default_min_auth(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl ConsensusConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_age_days.min(i64::MAX as u64 / 86_400) as i64)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Backoff for node → server requests:
/// `base + rand(0..jitter) + attempt² × quadratic` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    #[serde(default = "default_quadratic_delay")]
    pub quadratic_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay() -> u64 {
    25
}

fn default_jitter() -> u64 {
    50
}

fn default_quadratic_delay() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            jitter_ms: default_jitter(),
            quadratic_delay_ms: default_quadratic_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the failed attempt with zero-based index `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        let square = u64::from(attempt).saturating_mul(u64::from(attempt));
        let ms = self
            .base_delay_ms
            .saturating_add(jitter)
            .saturating_add(square.saturating_mul(self.quadratic_delay_ms));
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pre-shared secure token; configured on every node, never sent over the wire.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            hostname: default_hostname(),
            debug: false,
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            consensus: ConsensusConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

pub fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE)
}

impl Config {
    /// Load `<home>/indispenso.yaml`, falling back to defaults when absent.
    pub fn load(home: &Path) -> Result<Self> {
        let path = config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.auto_repair();
        Ok(cfg)
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let path = config_path(home);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn templates_path(&self, home: &Path) -> PathBuf {
        home.join(&self.server.templates_file)
    }

    /// Turn `host` or `host:port` endpoint values into a full `http://` URI.
    pub fn auto_repair(&mut self) {
        if let Some(repaired) = repair_endpoint(&self.client.endpoint_uri, self.server.port) {
            tracing::info!(endpoint = %repaired, "repaired endpoint URI");
            self.client.endpoint_uri = repaired;
        }
    }

    pub fn require_endpoint(&self) -> Result<&str> {
        if self.client.endpoint_uri.is_empty() {
            return Err(IndispensoError::InvalidConfig(
                "client.endpoint_uri is not set".into(),
            ));
        }
        Ok(&self.client.endpoint_uri)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.token.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no secure token configured: requests are not authenticated".into(),
            });
        } else if self.token.len() < 16 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "secure token is only {} characters long",
                    self.token.len()
                ),
            });
        }

        if !self.server.enabled && self.client.endpoint_uri.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "neither server.enabled nor client.endpoint_uri is set".into(),
            });
        }

        if self.consensus.default_min_auth == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "consensus.default_min_auth is 0: every approval executes immediately"
                    .into(),
            });
        }

        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retry.max_attempts must be at least 1".into(),
            });
        }

        warnings
    }
}

/// Repair an endpoint that lacks a scheme. Returns `None` when the value is
/// already a full URI or cannot be interpreted.
pub fn repair_endpoint(endpoint: &str, default_port: u16) -> Option<String> {
    let full = Regex::new(r"^https?://[^/:]+(:[0-9]+)?").ok()?;
    if endpoint.is_empty() || full.is_match(endpoint) {
        return None;
    }
    let host_port = Regex::new(r"^([^:/]+):?([0-9]*)").ok()?;
    let caps = host_port.captures(endpoint)?;
    let host = caps.get(1).map(|m| m.as_str())?;
    let port = caps
        .get(2)
        .map(|m| m.as_str())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_port.to_string());
    Some(format!("http://{host}:{port}/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
