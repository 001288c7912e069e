use crate::constants::DEFAULT_COMMAND_TIMEOUT_SECS;
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Loosely-typed backend configuration as it arrives from presets and callers
pub type BackendConfig = serde_json::Map<String, serde_json::Value>;

/// Result of one command inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output followed by standard error
    pub output: String,
    #[serde(rename = "returncode")]
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-call overrides for `Environment::execute`
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn resolve_cwd<'a>(&'a self, configured: &'a str) -> &'a str {
        match self.cwd.as_deref() {
            Some(cwd) if !cwd.is_empty() => cwd,
            _ => configured,
        }
    }

    pub fn resolve_timeout(&self, configured_secs: u64) -> Duration {
        self.timeout
            .unwrap_or_else(|| Duration::from_secs(configured_secs))
    }
}

/// One execution substrate. Every variant maps these three calls onto its own
/// tool: a subprocess, a container CLI, a scheduler or a hosted API.
///
/// `destroy` must accept an environment whose `create` failed halfway and
/// clean up whatever was acquired.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Backend tag, e.g. "docker"
    fn kind(&self) -> &'static str;

    /// Substrate handle once created (container name, job id, ...)
    fn handle(&self) -> Option<String> {
        None
    }

    async fn create(&mut self) -> Result<()>;

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput>;

    async fn destroy(&mut self) -> Result<()>;
}

pub(crate) fn default_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

pub(crate) fn default_root_cwd() -> String {
    "/".to_string()
}

/// Decode a variant's typed config, reporting bad fields as provisioning errors
pub(crate) fn parse_config<T: DeserializeOwned>(backend: &str, config: BackendConfig) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(config))
        .map_err(|e| RolloutError::provision(backend, format!("invalid config: {}", e)))
}

/// Host variables named in `forward_env` (when set) followed by explicit overrides
pub(crate) fn resolve_env(
    forward_env: &[String],
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = forward_env
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
        .collect();
    vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Short unique name for containers and scratch dirs owned by this service
pub(crate) fn instance_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", crate::constants::INSTANCE_NAME_PREFIX, &id[..8])
}

pub mod bubblewrap;
pub mod docker;
pub mod enroot;
pub mod factory;
pub mod local;
pub mod process;
pub mod remote;
pub mod singularity;
pub mod slurm;

pub use factory::EnvironmentFactory;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_options_fallbacks() {
        let opts = ExecOptions::default();
        assert_eq!(opts.resolve_cwd("/work"), "/work");
        assert_eq!(opts.resolve_timeout(12), Duration::from_secs(12));

        let opts = ExecOptions {
            cwd: Some("/tmp".into()),
            timeout: Some(Duration::from_secs(2)),
        };
        assert_eq!(opts.resolve_cwd("/work"), "/tmp");
        assert_eq!(opts.resolve_timeout(12), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_cwd_uses_configured() {
        let opts = ExecOptions {
            cwd: Some(String::new()),
            timeout: None,
        };
        assert_eq!(opts.resolve_cwd("/work"), "/work");
    }

    #[test]
    fn test_resolve_env_overrides_after_forwarded() {
        std::env::set_var("ROLLOUT_TEST_FORWARDED", "from-host");
        let mut overrides = BTreeMap::new();
        overrides.insert("A".to_string(), "1".to_string());

        let vars = resolve_env(
            &["ROLLOUT_TEST_FORWARDED".to_string(), "ROLLOUT_TEST_UNSET_VAR".to_string()],
            &overrides,
        );
        assert_eq!(
            vars,
            vec![
                ("ROLLOUT_TEST_FORWARDED".to_string(), "from-host".to_string()),
                ("A".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_instance_name_shape() {
        let name = instance_name();
        assert!(name.starts_with("rollout-"));
        assert_eq!(name.len(), "rollout-".len() + 8);
    }
}
