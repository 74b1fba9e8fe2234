//! Configuration for gatechain paths, tools and notifications.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GATECHAIN_HOME, GATECHAIN_PIPELINE, GATECHAIN_APPROVERS)
//! 2. Config file (.gatechain/config.yaml)
//! 3. Defaults (~/.gatechain)
//!
//! Config file discovery:
//! - Searches current directory and parents for .gatechain/config.yaml
//! - `paths.home` is relative to the .gatechain/ directory
//! - Other paths are relative to the project root (the parent of .gatechain/)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::pipeline::StageKind;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub notifications: Option<NotificationsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Ledger and key directory (relative to .gatechain/)
    pub home: Option<String>,
    /// Pipeline definition YAML
    pub pipeline: Option<String>,
    /// Approver roster YAML
    pub approvers: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Hours a Change may wait for approvals; 0 disables the timeout
    pub timeout_hours: Option<u64>,
}

/// A subprocess tool adapter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolConfig {
    pub command: String,
    pub category: StageKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to gatechain home (ledgers, keys)
    pub home: PathBuf,
    /// Pipeline definition file
    pub pipeline: PathBuf,
    /// Approver roster file
    pub approvers: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Approval window; `None` waits indefinitely
    pub approval_timeout_hours: Option<u64>,
    /// Tool name → subprocess adapter
    pub tools: BTreeMap<String, ToolConfig>,
    pub webhook_url: Option<String>,
}

impl ResolvedConfig {
    /// Directory holding one ledger directory per Change
    pub fn changes_dir(&self) -> PathBuf {
        self.home.join("changes")
    }

    /// Directory holding signing and trusted public keys
    pub fn keys_dir(&self) -> PathBuf {
        self.home.join("keys")
    }

    /// The orchestrator's own signing key
    pub fn signing_key_path(&self) -> PathBuf {
        self.keys_dir().join("orchestrator.key")
    }

    pub fn approval_timeout(&self) -> Option<chrono::Duration> {
        self.approval_timeout_hours
            .map(|hours| chrono::Duration::hours(hours as i64))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".gatechain").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

/// Approvals wait indefinitely unless a non-zero timeout is configured
fn timeout_hours(configured: Option<u64>) -> Option<u64> {
    configured.filter(|hours| *hours > 0)
}

/// Resolve a parsed config file found at `config_path`
fn resolve(config: ConfigFile, config_path: &Path, default_home: PathBuf) -> ResolvedConfig {
    let gatechain_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = gatechain_dir.parent().unwrap_or(Path::new("."));

    let home = env_path("GATECHAIN_HOME")
        .or_else(|| config.paths.home.as_deref().map(|h| resolve_path(gatechain_dir, h)))
        .unwrap_or(default_home);

    let pipeline = env_path("GATECHAIN_PIPELINE")
        .or_else(|| config.paths.pipeline.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or_else(|| home.join("pipeline.yaml"));

    let approvers = env_path("GATECHAIN_APPROVERS")
        .or_else(|| config.paths.approvers.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or_else(|| home.join("approvers.yaml"));

    ResolvedConfig {
        home,
        pipeline,
        approvers,
        config_file: Some(config_path.to_path_buf()),
        approval_timeout_hours: timeout_hours(config.approval.and_then(|a| a.timeout_hours)),
        tools: config.tools,
        webhook_url: config.notifications.and_then(|n| n.webhook_url),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".gatechain");

    if let Some(config_path) = find_config_file() {
        let config = load_config_file(&config_path)?;
        return Ok(resolve(config, &config_path, default_home));
    }

    // No config file - use env vars or defaults
    let home = env_path("GATECHAIN_HOME").unwrap_or(default_home);
    let pipeline = env_path("GATECHAIN_PIPELINE").unwrap_or_else(|| home.join("pipeline.yaml"));
    let approvers = env_path("GATECHAIN_APPROVERS").unwrap_or_else(|| home.join("approvers.yaml"));

    Ok(ResolvedConfig {
        home,
        pipeline,
        approvers,
        config_file: None,
        approval_timeout_hours: None,
        tools: BTreeMap::new(),
        webhook_url: None,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the gatechain home directory
pub fn gatechain_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the changes directory ($GATECHAIN_HOME/changes)
pub fn changes_dir() -> Result<PathBuf> {
    Ok(config()?.changes_dir())
}

/// Get the keys directory ($GATECHAIN_HOME/keys)
pub fn keys_dir() -> Result<PathBuf> {
    Ok(config()?.keys_dir())
}
