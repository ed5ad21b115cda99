//! Gate configuration: `.phasegate/config.toml` plus environment overrides.

use crate::core::error::GateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".phasegate";
pub const CONFIG_FILE: &str = "config.toml";

pub const ENV_SCHEMA_PATH: &str = "PHASEGATE_SCHEMA_PATH";
pub const ENV_AUDIT_ENABLED: &str = "PHASEGATE_AUDIT_LOGGING_ENABLED";
pub const ENV_AUDIT_LOG_DIR: &str = "PHASEGATE_AUDIT_LOG_DIR";

/// Roots that never get a project-local audit directory.
const SYSTEM_ROOTS: &[&str] = &["/", "/usr", "/bin", "/etc", "/var", "/tmp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub schema_path: Option<PathBuf>,
    pub audit_logging_enabled: bool,
    pub audit_log_dir: Option<PathBuf>,
    pub clock_skew_tolerance_secs: u64,
    pub git_timeout_secs: u64,
    pub commit_trailer: String,
    pub scope_allowed_patterns: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            schema_path: None,
            audit_logging_enabled: true,
            audit_log_dir: None,
            clock_skew_tolerance_secs: 60,
            git_timeout_secs: 5,
            commit_trailer: "Step-ID".to_string(),
            scope_allowed_patterns: vec!["**/*".to_string()],
        }
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Read the config file under `root`. No file means defaults.
pub fn load_config_file(root: &Path) -> Result<GateConfig, GateError> {
    let path = config_path(root);
    if !path.exists() {
        return Ok(GateConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(GateError::IoError)?;
    let mut config: GateConfig = toml::from_str(&content)
        .map_err(|e| GateError::ConfigError(format!("{}: {}", path.display(), e)))?;
    config.schema_path = config.schema_path.map(|p| anchor(root, p));
    config.audit_log_dir = config.audit_log_dir.map(|p| anchor(root, p));
    Ok(config)
}

fn anchor(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() { path } else { root.join(path) }
}

impl GateConfig {
    /// File config for `root` with process environment overrides applied.
    pub fn load(root: &Path) -> Result<Self, GateError> {
        Ok(load_config_file(root)?.with_env(|key| std::env::var(key).ok()))
    }

    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(ENV_SCHEMA_PATH).filter(|v| !v.is_empty()) {
            self.schema_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup(ENV_AUDIT_ENABLED) {
            self.audit_logging_enabled = is_truthy(&flag);
        }
        if let Some(dir) = lookup(ENV_AUDIT_LOG_DIR).filter(|v| !v.is_empty()) {
            self.audit_log_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Where audit files go for a project rooted at `root`.
    ///
    /// Explicit directory, then the configured one (env already folded
    /// in), then `<root>/.phasegate/logs`, then `<home>/.phasegate/logs`
    /// when `root` is the home directory or a system directory.
    pub fn audit_dir(&self, explicit: Option<&Path>, root: &Path) -> PathBuf {
        if let Some(dir) = explicit {
            return dir.to_path_buf();
        }
        if let Some(dir) = &self.audit_log_dir {
            return dir.clone();
        }
        let home = dirs::home_dir();
        let is_home = home.as_deref() == Some(root);
        let is_system = SYSTEM_ROOTS.iter().any(|s| Path::new(s) == root);
        match home {
            Some(home) if is_home || is_system => home.join(CONFIG_DIR).join("logs"),
            _ => root.join(CONFIG_DIR).join("logs"),
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
