use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionErrorPolicy;

/// Main configuration structure for repomirror
///
/// Loaded from YAML, then overridden from the environment. Access tokens are
/// never part of the file; they are read from the environment when used.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory holding one local mirror per repository
    #[serde(default = "default_working_directory")]
    pub working_directory: String,

    /// JSON file recording the last synced commit per branch
    #[serde(default = "default_history_file")]
    pub history_file: String,

    /// Source platform (Bitbucket) settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Destination platform (Azure DevOps) settings
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bitbucket configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Workspace whose repositories are mirrored
    pub workspace: Option<String>,

    /// Username paired with the BITBUCKET_PAT app password
    pub username: Option<String>,

    /// REST API base URL
    #[serde(default = "default_bitbucket_api_url")]
    pub api_url: String,

    /// Repository exclusion patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Azure DevOps configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DestinationConfig {
    pub organization: Option<String>,

    /// Project id, used by the repositories REST API
    pub project_id: Option<String>,

    /// Project name, used in git URLs
    pub project_name: Option<String>,

    /// REST and git base URL
    #[serde(default = "default_azure_api_url")]
    pub api_url: String,

    /// Name of the destination remote inside each local mirror
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum repositories synced at once (default: half the CPUs, at least one)
    pub max_parallel: Option<usize>,

    /// Upper bound in seconds for one repository's whole sync
    pub timeout: Option<u64>,

    /// What to do when a branch's current commit cannot be determined
    #[serde(default)]
    pub on_detection_error: DetectionErrorPolicy,

    /// Pause between passes in watch mode
    #[serde(default = "default_watch_interval")]
    pub watch_interval: String, // "30m"
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "json"
}

// Default value functions
fn default_working_directory() -> String {
    "./repos".to_string()
}
fn default_history_file() -> String {
    "sync_history.json".to_string()
}
fn default_bitbucket_api_url() -> String {
    crate::bitbucket::DEFAULT_API_URL.to_string()
}
fn default_azure_api_url() -> String {
    crate::azure::DEFAULT_API_URL.to_string()
}
fn default_remote_name() -> String {
    "mirror".to_string()
}
fn default_watch_interval() -> String {
    "30m".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            username: None,
            api_url: default_bitbucket_api_url(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            organization: None,
            project_id: None,
            project_name: None,
            api_url: default_azure_api_url(),
            remote_name: default_remote_name(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            timeout: None,
            on_detection_error: DetectionErrorPolicy::default(),
            watch_interval: default_watch_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            history_file: default_history_file(),
            source: SourceConfig::default(),
            destination: DestinationConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Environment variables that override configuration values
pub mod env_vars {
    pub const WORKING_DIR: &str = "WORKING_DIR";
    pub const SYNC_HISTORY_FILE: &str = "SYNC_HISTORY_FILE";
    pub const BITBUCKET_WORKSPACE_ID: &str = "BITBUCKET_WORKSPACE_ID";
    pub const BITBUCKET_USERNAME: &str = "BITBUCKET_USERNAME";
    pub const AZURE_ORG: &str = "AZURE_ORG";
    pub const AZURE_PROJECT: &str = "AZURE_PROJECT";
    pub const AZURE_PROJECT_NAME: &str = "AZURE_PROJECT_NAME";

    /// Secrets, read at call time only
    pub const BITBUCKET_PAT: &str = "BITBUCKET_PAT";
    pub const AZURE_PAT: &str = "AZURE_PAT";
}

impl Config {
    /// Load from `path` if given, else the default location if it exists,
    /// else defaults; then apply environment overrides and expand paths
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default()?,
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.expand_paths()?;
        Ok(config)
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!(
                "No configuration at {:?}, using defaults and environment",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repomirror").join("config.yml"))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(env_vars::WORKING_DIR) {
            self.working_directory = value;
        }
        if let Some(value) = get(env_vars::SYNC_HISTORY_FILE) {
            self.history_file = value;
        }
        if let Some(value) = get(env_vars::BITBUCKET_WORKSPACE_ID) {
            self.source.workspace = Some(value);
        }
        if let Some(value) = get(env_vars::BITBUCKET_USERNAME) {
            self.source.username = Some(value);
        }
        if let Some(value) = get(env_vars::AZURE_ORG) {
            self.destination.organization = Some(value);
        }
        if let Some(value) = get(env_vars::AZURE_PROJECT) {
            self.destination.project_id = Some(value);
        }
        if let Some(value) = get(env_vars::AZURE_PROJECT_NAME) {
            self.destination.project_name = Some(value);
        }
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.working_directory = shellexpand::full(&self.working_directory)
            .context("Failed to expand working_directory path")?
            .into_owned();

        self.history_file = shellexpand::full(&self.history_file)
            .context("Failed to expand history_file path")?
            .into_owned();

        Ok(())
    }

    /// Check that everything needed to talk to both platforms is present
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("source.workspace", env_vars::BITBUCKET_WORKSPACE_ID, &self.source.workspace),
            ("source.username", env_vars::BITBUCKET_USERNAME, &self.source.username),
            (
                "destination.organization",
                env_vars::AZURE_ORG,
                &self.destination.organization,
            ),
            (
                "destination.project_id",
                env_vars::AZURE_PROJECT,
                &self.destination.project_id,
            ),
            (
                "destination.project_name",
                env_vars::AZURE_PROJECT_NAME,
                &self.destination.project_name,
            ),
        ];

        let missing: Vec<String> = required
            .iter()
            .filter(|(_, _, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(key, var, _)| format!("{} (or {})", key, var))
            .collect();

        if !missing.is_empty() {
            return Err(anyhow!(
                "Missing required configuration: {}",
                missing.join(", ")
            ));
        }

        if self.sync.max_parallel == Some(0) {
            return Err(anyhow!("sync.max_parallel must be at least 1"));
        }

        Ok(())
    }

    pub fn working_dir(&self) -> PathBuf {
        PathBuf::from(&self.working_directory)
    }

    pub fn history_path(&self) -> PathBuf {
        PathBuf::from(&self.history_file)
    }

    /// Number of repositories synced concurrently
    pub fn worker_count(&self) -> usize {
        self.sync
            .max_parallel
            .unwrap_or_else(crate::sync::default_worker_count)
            .max(1)
    }

    pub fn repository_timeout(&self) -> Option<Duration> {
        self.sync
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn watch_interval(&self) -> Result<Duration> {
        parse_duration(&self.sync.watch_interval).map(Duration::from_secs)
    }
}

/// Parse duration strings like "30m", "1h", "45s", "2d" into seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")
    } else {
        // Try to parse as raw seconds
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::env;
    use tempfile::TempDir;

    fn complete_config() -> Config {
        let mut config = Config::default();
        config.source.workspace = Some("acme".to_string());
        config.source.username = Some("mirror-bot".to_string());
        config.destination.organization = Some("acme-devops".to_string());
        config.destination.project_id = Some("5d2c".to_string());
        config.destination.project_name = Some("Platform".to_string());
        config
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.working_directory, "./repos");
        assert_eq!(config.history_file, "sync_history.json");
        assert_eq!(config.source.api_url, "https://api.bitbucket.org/2.0");
        assert_eq!(config.destination.api_url, "https://dev.azure.com");
        assert_eq!(config.destination.remote_name, "mirror");
        assert_eq!(config.sync.max_parallel, None);
        assert_eq!(config.sync.timeout, None);
        assert_eq!(
            config.sync.on_detection_error,
            DetectionErrorPolicy::AssumeChanged
        );
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("WORKING_DIR", "/srv/mirrors"),
            ("SYNC_HISTORY_FILE", "/srv/state/history.json"),
            ("BITBUCKET_WORKSPACE_ID", "acme"),
            ("BITBUCKET_USERNAME", "mirror-bot"),
            ("AZURE_ORG", "acme-devops"),
            ("AZURE_PROJECT", "5d2c"),
            ("AZURE_PROJECT_NAME", "Platform"),
            // Blank values are ignored
            ("AZURE_PAT", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.working_directory, "/srv/mirrors");
        assert_eq!(config.history_file, "/srv/state/history.json");
        assert_eq!(config.source.workspace.as_deref(), Some("acme"));
        assert_eq!(config.source.username.as_deref(), Some("mirror-bot"));
        assert_eq!(config.destination.organization.as_deref(), Some("acme-devops"));
        assert_eq!(config.destination.project_id.as_deref(), Some("5d2c"));
        assert_eq!(config.destination.project_name.as_deref(), Some("Platform"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_override_keeps_file_value() {
        let mut config = complete_config();
        config.apply_overrides(|key| (key == "AZURE_ORG").then(|| "  ".to_string()));
        assert_eq!(config.destination.organization.as_deref(), Some("acme-devops"));
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let err = Config::default().validate().unwrap_err().to_string();
        assert!(err.contains("source.workspace"));
        assert!(err.contains("BITBUCKET_WORKSPACE_ID"));
        assert!(err.contains("destination.project_name"));

        let mut config = complete_config();
        config.sync.max_parallel = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_count_and_timeout() {
        let mut config = complete_config();
        assert!(config.worker_count() >= 1);

        config.sync.max_parallel = Some(3);
        assert_eq!(config.worker_count(), 3);

        assert_eq!(config.repository_timeout(), None);
        config.sync.timeout = Some(0);
        assert_eq!(config.repository_timeout(), None);
        config.sync.timeout = Some(600);
        assert_eq!(config.repository_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), 45);
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("2d").unwrap(), 172800);
        assert_eq!(parse_duration(" 90 ").unwrap(), 90);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOMIRROR_HOME", "/test/home");

        let mut config = Config::default();
        config.working_directory = "${TEST_REPOMIRROR_HOME}/mirrors".to_string();
        config.history_file = "${TEST_REPOMIRROR_HOME}/history.json".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.working_directory, "/test/home/mirrors");
        assert_eq!(config.history_file, "/test/home/history.json");

        env::remove_var("TEST_REPOMIRROR_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("repomirror"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
working_directory: "/srv/mirrors"
history_file: "/srv/state/sync_history.json"
source:
  workspace: "acme"
  username: "mirror-bot"
  exclude_patterns:
    - "archived-*"
destination:
  organization: "acme-devops"
  project_id: "5d2c"
  project_name: "Platform"
  remote_name: "azure"
sync:
  max_parallel: 6
  timeout: 900
  on_detection_error: assume-unchanged
  watch_interval: "1h"
logging:
  level: "debug"
  format: "json"
"#;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, yaml_content).unwrap();

        let config = Config::load(&path).expect("Failed to parse YAML");

        assert_eq!(config.working_directory, "/srv/mirrors");
        assert_eq!(config.source.workspace.as_deref(), Some("acme"));
        assert_eq!(config.source.exclude_patterns, vec!["archived-*".to_string()]);
        assert_eq!(config.source.api_url, "https://api.bitbucket.org/2.0");
        assert_eq!(config.destination.remote_name, "azure");
        assert_eq!(config.sync.max_parallel, Some(6));
        assert_eq!(config.sync.timeout, Some(900));
        assert_eq!(
            config.sync.on_detection_error,
            DetectionErrorPolicy::AssumeUnchanged
        );
        assert_eq!(config.watch_interval().unwrap(), Duration::from_secs(3600));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").expect("Failed to parse YAML");
        assert_eq!(config.working_directory, "./repos");
        assert_eq!(config.destination.remote_name, "mirror");
    }
}
