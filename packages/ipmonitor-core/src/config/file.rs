//! Configuration file handling.
//!
//! Resolution priority:
//! 1. Path given on the command line
//! 2. `IPMONITOR_CONFIG` environment variable
//! 3. Config file (~/.config/ipmonitor/config.toml)
//! 4. Built-in defaults

use super::{
    build, CONCURRENCY_BOUNDS, DEFAULT_INTERVAL_SECS, INTERVAL_BOUNDS, PROBE_TIMEOUT_BOUNDS,
    RETRY_BOUNDS,
};
use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable name for config path override
const ENV_CONFIG_PATH: &str = "IPMONITOR_CONFIG";

const DEFAULT_SEGMENTS: [(i64, &str); 6] = [
    (70, "VLAN 70 - Cameras"),
    (80, "VLAN 80 - Alarm"),
    (85, "VLAN 85 - Ethernet Automation"),
    (86, "VLAN 86 - WiFi Automation"),
    (200, "VLAN 200 - Fixed IP Telephony"),
    (204, "VLAN 204 - Mobile IP Telephony"),
];

/// Raw configuration document. Missing keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub network: NetworkSection,
    pub segments: SegmentsSection,
    pub scheduler: SchedulerSection,
    pub system: SystemSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// First two octets; segment ids fill the third
    pub base_prefix: String,
    /// Per-host probe timeout in seconds
    pub probe_timeout: i64,
    pub max_concurrent_scans: i64,
    pub retry_attempts: i64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            base_prefix: "172.17".to_string(),
            probe_timeout: 2,
            max_concurrent_scans: 3,
            retry_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentsSection {
    pub active: Vec<i64>,
    /// Seconds between sweeps, keyed by segment id
    pub intervals: BTreeMap<String, i64>,
    pub descriptions: BTreeMap<String, String>,
}

impl Default for SegmentsSection {
    fn default() -> Self {
        Self {
            active: DEFAULT_SEGMENTS.iter().map(|(id, _)| *id).collect(),
            intervals: DEFAULT_SEGMENTS
                .iter()
                .map(|(id, _)| (id.to_string(), DEFAULT_INTERVAL_SECS as i64))
                .collect(),
            descriptions: DEFAULT_SEGMENTS
                .iter()
                .map(|(id, text)| (id.to_string(), text.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Wait between stopping a loop and starting its replacement
    pub restart_grace_secs: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            restart_grace_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    pub last_updated: String,
    pub admin_contact: String,
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Path given explicitly by the caller
    CommandLine,
    /// Path taken from environment variable
    Environment,
    /// Loaded from the per-user config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::CommandLine => write!(f, "command line"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub file: ConfigFile,
    /// File the document was read from, if any
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Get the path to the per-user configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("ipmonitor").join("config.toml"))
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/ipmonitor/config.toml".to_string())
}

/// Read and parse one configuration file.
pub fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path).map_err(|e| MonitorError::ConfigFile {
        path: path.to_path_buf(),
        message: format!("failed to read: {}", e),
    })?;
    let file = toml::from_str(&content).map_err(|e| MonitorError::ConfigFile {
        path: path.to_path_buf(),
        message: format!("failed to parse: {}", e),
    })?;
    tracing::debug!("Loaded config from {:?}", path);
    Ok(file)
}

/// Resolve and read the configuration document.
///
/// An explicitly requested file (argument or environment) must be readable.
/// The per-user file is optional: problems with it are logged and defaults
/// are used instead.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    // Priority 1: command line
    if let Some(path) = explicit {
        return Ok(LoadedConfig {
            file: read_config_file(path)?,
            path: Some(path.to_path_buf()),
            source: ConfigSource::CommandLine,
        });
    }

    // Priority 2: environment variable
    if let Ok(raw) = std::env::var(ENV_CONFIG_PATH) {
        let raw = raw.trim();
        if !raw.is_empty() {
            let path = PathBuf::from(raw);
            tracing::info!("Using config file from environment variable: {:?}", path);
            return Ok(LoadedConfig {
                file: read_config_file(&path)?,
                path: Some(path),
                source: ConfigSource::Environment,
            });
        }
    }

    // Priority 3: per-user config file
    if let Some(path) = get_config_file_path() {
        if path.exists() {
            match read_config_file(&path) {
                Ok(file) => {
                    return Ok(LoadedConfig {
                        file,
                        path: Some(path),
                        source: ConfigSource::ConfigFile,
                    });
                }
                Err(e) => tracing::warn!("{}. Using default configuration.", e),
            }
        }
    }

    // Priority 4: defaults
    tracing::debug!("Using default configuration");
    Ok(LoadedConfig {
        file: ConfigFile::default(),
        path: None,
        source: ConfigSource::Default,
    })
}

/// Write the document back to disk, stamping `system.last_updated`.
pub fn save_config_file(path: &Path, file: &mut ConfigFile) -> Result<()> {
    file.system.last_updated = chrono::Utc::now().to_rfc3339();

    let content = toml::to_string_pretty(file).map_err(|e| MonitorError::ConfigFile {
        path: path.to_path_buf(),
        message: format!("failed to serialize: {}", e),
    })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content)?;

    tracing::info!("Saved configuration to {:?}", path);
    Ok(())
}

/// Outcome of a configuration dry run
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub intervals_tested: usize,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl ConfigReport {
    pub fn message(&self) -> String {
        let mut message = format!("Check complete. {} intervals tested.", self.intervals_tested);
        if !self.valid {
            message.push_str(" Some values are outside the accepted bounds.");
        }
        message
    }
}

/// Validate a document without failing, collecting every issue.
pub fn check(file: &ConfigFile) -> ConfigReport {
    let mut issues = Vec::new();
    let _ = build(file, &mut issues);
    ConfigReport {
        intervals_tested: file.segments.intervals.len(),
        valid: issues.is_empty(),
        issues: issues.into_iter().map(|e| e.to_string()).collect(),
    }
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    format!(
        r#"# IP Monitor Configuration
# Place this file at: ~/.config/ipmonitor/config.toml

[network]
# Segment N is probed over <base_prefix>.N.0/24
base_prefix = "172.17"
# Per-host probe timeout in seconds [{}, {}]
probe_timeout = 2
# Segments swept in parallel [{}, {}]
max_concurrent_scans = 3
# Extra attempts for hosts that do not answer [{}, {}]
retry_attempts = 2

[segments]
active = [70, 80, 85, 86, 200, 204]

[segments.intervals]
# Seconds between sweeps [{}, {}]. The scheduler sleeps for the smallest
# interval among active segments.
70 = 60
80 = 60

[segments.descriptions]
70 = "VLAN 70 - Cameras"
80 = "VLAN 80 - Alarm"

[scheduler]
# Wait between stopping the running loop and starting its replacement
restart_grace_secs = 2
"#,
        PROBE_TIMEOUT_BOUNDS.0,
        PROBE_TIMEOUT_BOUNDS.1,
        CONCURRENCY_BOUNDS.0,
        CONCURRENCY_BOUNDS.1,
        RETRY_BOUNDS.0,
        RETRY_BOUNDS.1,
        INTERVAL_BOUNDS.0,
        INTERVAL_BOUNDS.1,
    )
}
