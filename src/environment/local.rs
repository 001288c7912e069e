use crate::environment::process::{self, ProcessError};
use crate::environment::{
    default_timeout, instance_name, parse_config, resolve_env, BackendConfig, Environment,
    ExecOptions, ExecOutput,
};
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

const KIND: &str = "local";

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Working directory; a scratch dir is created when unset
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Runs commands as host subprocesses. No isolation beyond a dedicated
/// process group per command and an optional scratch working directory.
pub struct LocalEnvironment {
    config: LocalConfig,
    workdir: Option<PathBuf>,
    scratch: bool,
}

impl LocalEnvironment {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            workdir: None,
            scratch: false,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    pub fn workdir(&self) -> Option<&PathBuf> {
        self.workdir.as_ref()
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.workdir.as_ref().map(|p| p.display().to_string())
    }

    async fn create(&mut self) -> Result<()> {
        match &self.config.cwd {
            Some(cwd) if !cwd.is_empty() => {
                let path = PathBuf::from(cwd);
                if !path.is_dir() {
                    return Err(RolloutError::provision(
                        KIND,
                        format!("working directory {} does not exist", path.display()),
                    ));
                }
                self.workdir = Some(path);
            }
            _ => {
                let path = std::env::temp_dir().join(instance_name());
                // record before creating so destroy can clean a half-made dir
                self.workdir = Some(path.clone());
                self.scratch = true;
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| RolloutError::provision(KIND, e))?;
                info!(workdir = %path.display(), "Created scratch working directory");
            }
        }
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let workdir = self
            .workdir
            .as_ref()
            .ok_or_else(|| RolloutError::execution(KIND, "environment is not running"))?;
        let cwd = match opts.cwd.as_deref() {
            Some(cwd) if !cwd.is_empty() => PathBuf::from(cwd),
            _ => workdir.clone(),
        };
        let timeout = opts.resolve_timeout(self.config.timeout);

        debug!(cwd = %cwd.display(), command, "Executing local command");
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(resolve_env(&[], &self.config.env));

        match process::run_command(cmd, &self.config.shell, None, timeout).await {
            Ok(out) => Ok(ExecOutput {
                output: out.combined(),
                exit_code: out.exit_code,
            }),
            Err(ProcessError::Timeout(timeout)) => Err(RolloutError::ExecutionTimeout { timeout }),
            Err(e) => Err(RolloutError::execution(KIND, e)),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(path) = self.workdir.take() else {
            return Ok(());
        };
        if self.scratch && path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| RolloutError::execution(KIND, format!("removing {}: {}", path.display(), e)))?;
            info!(workdir = %path.display(), "Removed scratch working directory");
        }
        Ok(())
    }
}
