//! Configuration for keystone.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (KEYSTONE_HOME, KEYSTONE_RECEIPTS_DIR,
//!    KEYSTONE_SIMULATION, KEYSTONE_CODE_VERSION, GIT_COMMIT...)
//! 2. Config file (.keystone/config.yaml)
//! 3. Defaults (~/.keystone)
//!
//! Config file discovery:
//! - Searches current directory and parents for .keystone/config.yaml
//! - `paths.home` is relative to the .keystone/ directory, `paths.receipts`
//!   to the project root (the directory containing .keystone/)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{BreakerConfig, BreakerRegistry, CacheConfig, GatesConfig};
use crate::domain::ExecutionMode;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Environment variables consulted for the code version, in order
const CODE_VERSION_VARS: [&str; 4] = ["KEYSTONE_CODE_VERSION", "GIT_COMMIT", "GIT_SHA", "COMMIT_SHA"];

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub breaker: Option<BreakerSection>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub gates: Option<GatesConfig>,
    #[serde(default)]
    pub execution: Option<ExecutionSection>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .keystone/)
    pub home: Option<String>,
    /// Receipt log directory (relative to the project root)
    pub receipts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(flatten)]
    pub defaults: BreakerConfig,
    /// Per-target overrides; unset fields inherit the defaults
    #[serde(default)]
    pub targets: BTreeMap<String, BreakerOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerOverride {
    pub enabled: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
}

impl BreakerOverride {
    fn apply(&self, defaults: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout_ms: self.reset_timeout_ms.unwrap_or(defaults.reset_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionSection {
    pub mode: Option<ExecutionMode>,
}

/// A task backed by an external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_task_timeout")]
    pub timeout_seconds: u64,
}

fn default_task_timeout() -> u64 {
    60
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Keystone home (engine state)
    pub home: PathBuf,
    /// Directory holding receipts-YYYY-MM-DD.jsonl
    pub receipts_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub breaker: BreakerConfig,
    pub breaker_targets: BTreeMap<String, BreakerConfig>,
    pub cache: CacheConfig,
    pub gates: GatesConfig,
    pub mode: ExecutionMode,
    /// Baked into cache keys so a deploy invalidates stale results
    pub code_version: String,
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl ResolvedConfig {
    /// Breaker registry with the configured defaults and overrides
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.breaker_targets.iter().fold(
            BreakerRegistry::new(self.breaker.clone()),
            |registry, (target, config)| registry.with_override(target.clone(), config.clone()),
        )
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".keystone").join("config.yaml");
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
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
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

/// Interpret KEYSTONE_SIMULATION. Unrecognized values are ignored.
fn parse_simulation_flag(value: &str) -> Option<ExecutionMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(ExecutionMode::Simulated),
        "0" | "false" | "no" => Some(ExecutionMode::Strict),
        other => {
            warn!(value = %other, "Ignoring unrecognized KEYSTONE_SIMULATION value");
            None
        }
    }
}

/// Merge an optional config file with environment overrides.
///
/// `env` looks up a variable by name; empty values count as unset.
pub fn resolve<E>(
    file: Option<(&Path, ConfigFile)>,
    env: E,
    default_home: PathBuf,
) -> ResolvedConfig
where
    E: Fn(&str) -> Option<String>,
{
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), config),
        None => (None, ConfigFile::default()),
    };

    // .keystone/ and the project root containing it
    let keystone_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = keystone_dir.parent().unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env("KEYSTONE_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        resolve_path(keystone_dir, home_path)
    } else {
        default_home
    };

    let receipts_dir = if let Some(env_receipts) = env("KEYSTONE_RECEIPTS_DIR") {
        PathBuf::from(env_receipts)
    } else if let Some(ref receipts_path) = config.paths.receipts {
        resolve_path(base_dir, receipts_path)
    } else {
        home.join("receipts")
    };

    let (breaker, breaker_targets) = match config.breaker {
        Some(section) => {
            let targets = section
                .targets
                .iter()
                .map(|(target, o)| (target.clone(), o.apply(&section.defaults)))
                .collect();
            (section.defaults, targets)
        }
        None => (BreakerConfig::default(), BTreeMap::new()),
    };

    let mode = env("KEYSTONE_SIMULATION")
        .and_then(|v| parse_simulation_flag(&v))
        .or(config.execution.and_then(|e| e.mode))
        .unwrap_or_default();

    let code_version = CODE_VERSION_VARS
        .iter()
        .find_map(|key| env(*key))
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    ResolvedConfig {
        home,
        receipts_dir,
        config_file,
        breaker,
        breaker_targets,
        cache: config.cache.unwrap_or_default(),
        gates: config.gates.unwrap_or_default(),
        mode,
        code_version,
        tasks: config.tasks,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".keystone");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let file = match find_config_file(&cwd) {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(
        file.as_ref().map(|(path, config)| (path.as_path(), config.clone())),
        |key| std::env::var(key).ok(),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
