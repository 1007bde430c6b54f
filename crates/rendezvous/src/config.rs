use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use crate::cli::Cli;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue: default_send_queue(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            audit_log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    ws_relay::DEFAULT_PORT
}

fn default_interval() -> u64 {
    ws_relay::DEFAULT_PING_INTERVAL.as_secs()
}

fn default_send_queue() -> usize {
    ws_relay::DEFAULT_SEND_QUEUE
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Config {
    /// Fold command-line overrides into the file configuration.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.network.port = port;
        }
        if let Some(host) = cli.listen {
            self.network.host = host;
        }
        if let Some(secs) = cli.ping_interval {
            self.liveness.interval_secs = secs;
        }
        if let Some(path) = &cli.audit_log {
            self.logging.audit_log_path = Some(path.clone());
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.host, self.network.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.liveness.interval_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.liveness.interval_secs == 0 {
            bail!("liveness.interval_secs must be greater than zero");
        }
        if self.connection.send_queue == 0 {
            bail!("connection.send_queue must be greater than zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file did not exist. Logging is not up yet when the config is
    /// loaded, so the caller reports this once the subscriber is installed.
    Defaults,
}

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration, so the relay can be
/// started with nothing but a port.
pub fn load(path: &Path) -> anyhow::Result<(Config, ConfigSource)> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults));
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config = load_from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok((config, ConfigSource::File))
}

pub fn load_from_str(yaml: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    Ok(config)
}
