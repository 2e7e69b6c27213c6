//! Configuration system for a `RingChat` node.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/ringchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use ringchat_proto::identity::NodeInfo;

use crate::link::DEFAULT_CONNECT_TIMEOUT;
use crate::node::{DEFAULT_EVENT_BUFFER, DEFAULT_SETTLE_DELAY, NodeConfig};

/// Name given to the king before the handshake reveals its real one.
const UNKNOWN_KING: &str = "king";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// An endpoint is not of the form `address:port`.
    #[error("invalid endpoint {0:?}, expected address:port")]
    InvalidEndpoint(String),

    /// No node name was configured.
    #[error("no node name given (use --name or [node] name)")]
    MissingName,

    /// The node name contains whitespace, which the departure notice
    /// `off <name>` cannot carry.
    #[error("invalid node name {0:?}, names cannot contain spaces")]
    InvalidName(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    node: NodeFileConfig,
    network: NetworkFileConfig,
    ui: UiFileConfig,
}

/// `[node]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NodeFileConfig {
    name: Option<String>,
    bind: Option<String>,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    king: Option<String>,
    connect_timeout_secs: Option<u64>,
    settle_delay_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Node --
    /// Name this node joins the ring with.
    pub name: Option<String>,
    /// Local `address:port` to listen on; port 0 picks a free port.
    pub bind: String,

    // -- Network --
    /// `address:port` of the king to join; `None` starts a new ring.
    pub king: Option<String>,
    /// Upper bound on establishing a link.
    pub connect_timeout: Duration,
    /// Pause after a promotion before the old king's departure is announced.
    pub settle_delay: Duration,
    /// Capacity of the node event channel.
    pub event_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: None,
            bind: "127.0.0.1:0".to_string(),
            king: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            timestamp_format: "%H:%M:%S".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/ringchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Configuration from CLI args and env vars alone, for when the config
    /// file cannot be used.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            name: cli.name.clone().or_else(|| file.node.name.clone()),
            bind: cli
                .bind
                .clone()
                .or_else(|| file.node.bind.clone())
                .unwrap_or(defaults.bind),
            king: cli.king.clone().or_else(|| file.network.king.clone()),
            connect_timeout: cli
                .connect_timeout_secs
                .or(file.network.connect_timeout_secs)
                .map_or(defaults.connect_timeout, Duration::from_secs),
            settle_delay: file
                .network
                .settle_delay_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
            event_buffer: file
                .network
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// This node's identity as configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingName`] without a name,
    /// [`ConfigError::InvalidName`] for a name with whitespace in it, and
    /// [`ConfigError::InvalidEndpoint`] for a malformed bind address.
    pub fn identity(&self) -> Result<NodeInfo, ConfigError> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ConfigError::MissingName)?;
        if name.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidName(name.to_string()));
        }
        let (address, port) = parse_endpoint(&self.bind)?;
        Ok(NodeInfo::new(address, port, name))
    }

    /// The king to join, if one is configured. Its name is a placeholder
    /// until the join handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEndpoint`] for a malformed address.
    pub fn king_endpoint(&self) -> Result<Option<NodeInfo>, ConfigError> {
        self.king
            .as_deref()
            .map(|king| {
                let (address, port) = parse_endpoint(king)?;
                Ok(NodeInfo::new(address, port, UNKNOWN_KING))
            })
            .transpose()
    }

    /// Build the [`NodeConfig`] the engine runs with.
    #[must_use]
    pub const fn to_node_config(&self) -> NodeConfig {
        NodeConfig {
            connect_timeout: self.connect_timeout,
            event_buffer: self.event_buffer,
            settle_delay: self.settle_delay,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Ring overlay group chat")]
pub struct CliArgs {
    /// Name to join the ring with.
    #[arg(long, env = "RINGCHAT_NAME")]
    pub name: Option<String>,

    /// Local address to listen on, as `address:port` (port 0 picks one).
    #[arg(long, env = "RINGCHAT_BIND")]
    pub bind: Option<String>,

    /// Address of the king to join, as `address:port`. Starts a new ring
    /// when absent.
    #[arg(long, env = "RINGCHAT_KING")]
    pub king: Option<String>,

    /// Path to config file (default: `~/.config/ringchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait when connecting to another member.
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RINGCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Splits `address:port`.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(endpoint.to_string());
    let (address, port) = endpoint.trim().rsplit_once(':').ok_or_else(invalid)?;
    if address.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((address.to_string(), port))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("ringchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
