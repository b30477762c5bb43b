use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7777".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    1000
}
fn default_lock_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_snippet_tokens")]
    pub snippet_tokens: i64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snippet_tokens: default_snippet_tokens(),
            default_limit: default_limit(),
        }
    }
}

fn default_snippet_tokens() -> i64 {
    32
}
fn default_limit() -> i64 {
    50
}

impl Config {
    /// Fixed offset used for timestamps that arrive without one.
    pub fn timezone(&self) -> Result<FixedOffset> {
        parse_offset(&self.workspace.timezone)
    }

    /// Base URL the CLI uses to reach the daemon.
    pub fn endpoint(&self) -> String {
        match &self.client.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.daemon.bind),
        }
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client.timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.client.lock_timeout_ms)
    }
}

/// Parses `"UTC"`, `"Z"`, or a `±HH:MM` offset.
pub fn parse_offset(value: &str) -> Result<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return Ok(Utc.fix());
    }

    let (sign, rest) = match value.as_bytes().first() {
        Some(b'+') => (1, &value[1..]),
        Some(b'-') => (-1, &value[1..]),
        _ => bail!(
            "workspace.timezone must be UTC or an offset like +09:00, got '{}'",
            value
        ),
    };

    let (hours, minutes) = rest
        .split_once(':')
        .with_context(|| format!("workspace.timezone offset must be ±HH:MM, got '{}'", value))?;
    let hours: i32 = hours.parse().context("invalid timezone hours")?;
    let minutes: i32 = minutes.parse().context("invalid timezone minutes")?;
    if hours > 23 || minutes > 59 {
        bail!("workspace.timezone offset out of range: '{}'", value);
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("workspace.timezone offset out of range: '{}'", value))
}

pub const DEFAULT_CONFIG_TEXT: &str = r#"[workspace]
root = "./data"
timezone = "UTC"

[daemon]
bind = "127.0.0.1:7777"

[client]
timeout_ms = 1000
lock_timeout_ms = 2000

[index]
snippet_tokens = 32
default_limit = 50
"#;

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, DEFAULT_CONFIG_TEXT)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Reads and validates a config file. A relative `workspace.root` is taken
/// relative to the directory holding the file, not the current directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    if config.workspace.root.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.workspace.root = base.join(&config.workspace.root);
    }
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.timezone()?;

    let addr: SocketAddr = config
        .daemon
        .bind
        .parse()
        .with_context(|| format!("daemon.bind is not a socket address: '{}'", config.daemon.bind))?;
    // The daemon is a local single-writer; it never listens beyond loopback.
    if !addr.ip().is_loopback() {
        bail!("daemon.bind must be a loopback address, got '{}'", addr);
    }

    if config.client.timeout_ms == 0 {
        bail!("client.timeout_ms must be > 0");
    }
    if config.index.default_limit < 1 {
        bail!("index.default_limit must be >= 1");
    }
    if config.index.snippet_tokens < 1 || config.index.snippet_tokens > 64 {
        bail!("index.snippet_tokens must be in [1, 64]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_default_config_text_is_valid() {
        let config = parse(DEFAULT_CONFIG_TEXT).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("./data"));
        assert_eq!(config.endpoint(), "http://127.0.0.1:7777");
        assert_eq!(config.lock_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[workspace]\nroot = \"/tmp/ws\"\n").unwrap();
        assert_eq!(config.workspace.timezone, "UTC");
        assert_eq!(config.daemon.bind, "127.0.0.1:7777");
        assert_eq!(config.index.default_limit, 50);
        assert_eq!(config.timezone().unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn test_offsets() {
        assert_eq!(parse_offset("+09:00").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(parse_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("Asia/Tokyo").is_err());
        assert!(parse_offset("+25:00").is_err());
    }

    #[test]
    fn test_rejects_non_loopback_bind() {
        let err = parse("[workspace]\nroot = \"x\"\n[daemon]\nbind = \"0.0.0.0:7777\"\n").unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_relative_root_follows_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("conf");
        std::fs::create_dir_all(&dir).unwrap();

        let relative = dir.join("ops.toml");
        std::fs::write(&relative, "[workspace]\nroot = \"./data\"\n").unwrap();
        let config = load_config(&relative).unwrap();
        assert_eq!(config.workspace.root, dir.join("./data"));

        let absolute = dir.join("abs.toml");
        std::fs::write(&absolute, "[workspace]\nroot = \"/srv/ops\"\n").unwrap();
        let config = load_config(&absolute).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("/srv/ops"));
    }

    #[test]
    fn test_explicit_endpoint_trims_slash() {
        let config =
            parse("[workspace]\nroot = \"x\"\n[client]\nendpoint = \"http://127.0.0.1:9000/\"\n")
                .unwrap();
        assert_eq!(config.endpoint(), "http://127.0.0.1:9000");
    }
}
