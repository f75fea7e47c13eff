//! Agent configuration.

use crate::error::ConfigError;
use crate::retry::{RetryPolicies, RetrySettings};
use gantry_core::ids::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity the agent registers and reports with.
    #[serde(default)]
    pub agent_uuid: AgentId,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Base URL of the server; artifact URLs are resolved against it.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Directory jobs are built in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Console lines buffered before an upload is attempted.
    #[serde(default = "default_console_batch_size")]
    pub console_batch_size: usize,
    /// Ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Retry settings for material types without an explicit entry.
    #[serde(default)]
    pub material_retry_default: RetrySettings,
    /// Retry settings per material type (`git`, `hg`, ...).
    #[serde(default)]
    pub material_retry: HashMap<String, RetrySettings>,
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_server_url() -> String {
    "https://localhost:8154/gantry/".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/var/lib/gantry/work")
}

fn default_console_batch_size() -> usize {
    100
}

fn default_ping_interval() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_uuid: AgentId::new(),
            hostname: default_hostname(),
            server_url: default_server_url(),
            working_dir: default_working_dir(),
            console_batch_size: default_console_batch_size(),
            ping_interval_secs: default_ping_interval(),
            material_retry_default: RetrySettings::default(),
            material_retry: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Server URL with a trailing slash, so relative paths join beneath it.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.server_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
            url: self.server_url.clone(),
            message: e.to_string(),
        })
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        self.material_retry.iter().fold(
            RetryPolicies::new(self.material_retry_default.into()),
            |policies, (material_type, settings)| policies.with(material_type.clone(), (*settings).into()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_apply_to_sparse_yaml() {
        let config = AgentConfig::from_yaml("hostname: builder-1\n").unwrap();
        assert_eq!(config.hostname, "builder-1");
        assert_eq!(config.console_batch_size, 100);
        assert_eq!(config.ping_interval_secs, 10);

        let policy = config.retry_policies().policy_for("git");
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_per_material_retry_settings() {
        let yaml = r#"
server_url: https://ci.example.com/gantry
material_retry:
  git:
    attempts: 5
    delay_ms: 100
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        let policies = config.retry_policies();
        assert_eq!(policies.policy_for("git").attempts, 5);
        assert_eq!(policies.policy_for("git").delay, Duration::from_millis(100));
        assert_eq!(policies.policy_for("svn").attempts, 3);

        let base = config.base_url().unwrap();
        assert_eq!(
            base.join("files/p/1/s/1/j/a.txt").unwrap().as_str(),
            "https://ci.example.com/gantry/files/p/1/s/1/j/a.txt"
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "working_dir: /tmp/gantry-work").unwrap();
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/tmp/gantry-work"));
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let err = AgentConfig::from_yaml("console_batch_size: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
