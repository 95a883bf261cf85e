//! Configuration system for a peercoms node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (PEERCOMS_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::{AnnouncePolicy, CoordinatorConfig, ExitPolicy, DEFAULT_GROUP};
use crate::error::{Error, Result};
use crate::transport::TcpConfig;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and group
    pub node: NodeSettings,

    /// Receive loop and worker pool tuning
    pub coordinator: CoordinatorSettings,

    /// TCP mesh settings
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Human-readable node name (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Fixed transport id (a random UUID if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_hint: Option<String>,

    /// Group joined on start and used for shouts
    pub group: String,
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Number of worker tasks
    pub workers: usize,

    /// Capacity of the inbound queue
    pub queue_capacity: usize,

    /// Bounded wait of a worker's queue pop in milliseconds
    pub pop_timeout_ms: u64,

    /// Request/reply timeout in milliseconds
    pub request_timeout_ms: u64,

    /// How listings are sent to entering peers: whisper or shout
    pub announce_policy: AnnouncePolicy,

    /// What happens to a peer's keys on exit: retain or evict
    pub exit_policy: ExitPolicy,

    /// Capacity of the coordinator event channel
    pub event_buffer: usize,
}

/// TCP mesh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// TCP listen port for peer connections (0 = auto-assign)
    pub listen_port: u16,

    /// Seed peers to dial, as host:port
    pub seeds: Vec<String>,

    /// Maximum number of peer connections
    pub max_peers: usize,

    /// Connection and handshake timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// First delay between seed dial attempts in milliseconds
    pub reconnect_interval_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: None,
            id_hint: None,
            group: DEFAULT_GROUP.to_string(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1000,
            pop_timeout_ms: 1000,
            request_timeout_ms: 5000,
            announce_policy: AnnouncePolicy::Whisper,
            exit_policy: ExitPolicy::Retain,
            event_buffer: 256,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_port: 0, // Auto-assign
            seeds: vec![],
            max_peers: 32,
            connect_timeout_ms: 10000,
            reconnect_interval_ms: 2000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Read and parse one configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("peercoms.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("peercoms").join("node.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".peercoms").join("node.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("PEERCOMS_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Ok(val) = std::env::var("PEERCOMS_NODE_ID") {
            self.node.id_hint = Some(val);
        }
        if let Ok(val) = std::env::var("PEERCOMS_GROUP") {
            self.node.group = val;
        }

        // Coordinator settings
        if let Ok(val) = std::env::var("PEERCOMS_WORKERS") {
            if let Ok(n) = val.parse() {
                self.coordinator.workers = n;
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_QUEUE_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.coordinator.queue_capacity = n;
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_POP_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.pop_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.request_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_ANNOUNCE_POLICY") {
            match val.parse() {
                Ok(policy) => self.coordinator.announce_policy = policy,
                Err(e) => warn!(error = %e, "Ignoring PEERCOMS_ANNOUNCE_POLICY"),
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_EXIT_POLICY") {
            match val.parse() {
                Ok(policy) => self.coordinator.exit_policy = policy,
                Err(e) => warn!(error = %e, "Ignoring PEERCOMS_EXIT_POLICY"),
            }
        }

        // Transport settings
        if let Ok(val) = std::env::var("PEERCOMS_LISTEN_PORT") {
            if let Ok(n) = val.parse() {
                self.transport.listen_port = n;
            }
        }
        if let Ok(val) = std::env::var("PEERCOMS_SEEDS") {
            self.transport.seeds = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("PEERCOMS_MAX_PEERS") {
            if let Ok(n) = val.parse() {
                self.transport.max_peers = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("PEERCOMS_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("PEERCOMS_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("PEERCOMS_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.group.trim().is_empty() {
            return Err(Error::config_field_invalid("node.group", "Group name cannot be empty"));
        }
        if self.coordinator.workers == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.workers",
                "At least one worker is required",
            ));
        }
        if self.coordinator.queue_capacity == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.queue_capacity",
                "Queue capacity must be greater than 0",
            ));
        }
        if self.coordinator.event_buffer == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.event_buffer",
                "Event buffer must be greater than 0",
            ));
        }

        for seed in &self.transport.seeds {
            if !is_host_port(seed) {
                return Err(Error::config_field_invalid(
                    "transport.seeds",
                    format!("Invalid seed address '{}'. Expected host:port", seed),
                ));
            }
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Node name, falling back to the hostname
    pub fn node_name(&self) -> String {
        self.node.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "peercoms-node".to_string())
        })
    }

    /// TCP mesh configuration
    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            listen_port: self.transport.listen_port,
            seeds: self.transport.seeds.clone(),
            max_peers: self.transport.max_peers,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            reconnect_interval: Duration::from_millis(self.transport.reconnect_interval_ms),
        }
    }
}

impl From<&NodeConfig> for CoordinatorConfig {
    fn from(config: &NodeConfig) -> Self {
        let c = &config.coordinator;
        CoordinatorConfig {
            group: Some(config.node.group.clone()),
            workers: c.workers,
            queue_capacity: c.queue_capacity,
            pop_timeout: Duration::from_millis(c.pop_timeout_ms),
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            announce_policy: c.announce_policy,
            exit_policy: c.exit_policy,
            event_buffer: c.event_buffer,
        }
    }
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0),
        None => false,
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file; returns the path written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".peercoms")
                .join("node.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# peercoms node configuration

[node]
# Human-readable node name (defaults to the hostname)
# name = "node-a"

# Fixed transport id (random UUID if not set)
# id_hint = "node-a"

# Group joined on start and used for shouts
group = "mktl-test"

[coordinator]
# Number of worker tasks
workers = 2

# Capacity of the inbound queue; messages beyond it are dropped
queue_capacity = 1000

# Bounded wait of a worker's queue pop (milliseconds)
pop_timeout_ms = 1000

# Request/reply timeout (milliseconds)
request_timeout_ms = 5000

# How listings are sent to entering peers: "whisper" or "shout"
announce_policy = "whisper"

# What happens to a peer's keys when it exits: "retain" or "evict"
exit_policy = "retain"

# Capacity of the coordinator event channel
event_buffer = 256

[transport]
# TCP listen port for peer connections (0 = auto-assign)
listen_port = 0

# Seed peers to dial, as host:port
seeds = []

# Maximum number of peer connections
max_peers = 32

# Connection and handshake timeout (milliseconds)
connect_timeout_ms = 10000

# First delay between seed dial attempts (milliseconds)
reconnect_interval_ms = 2000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.peercoms/logs/node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
