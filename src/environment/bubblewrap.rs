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
use tracing::{debug, info};

const KIND: &str = "bubblewrap";

#[derive(Debug, Clone, Deserialize)]
pub struct BubblewrapConfig {
    /// Working directory inside the sandbox; defaults to the scratch dir
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments placed before the per-command binds
    #[serde(default = "default_wrapper_args")]
    pub wrapper_args: Vec<String>,
}

fn default_executable() -> String {
    std::env::var("ROLLOUT_BUBBLEWRAP_PATH").unwrap_or_else(|_| "bwrap".to_string())
}

fn default_wrapper_args() -> Vec<String> {
    [
        "--unshare-user-try",
        "--ro-bind", "/usr", "/usr",
        "--ro-bind", "/bin", "/bin",
        "--ro-bind", "/lib", "/lib",
        "--ro-bind", "/lib64", "/lib64",
        "--ro-bind", "/etc", "/etc",
        "--tmpfs", "/tmp",
        "--proc", "/proc",
        "--dev", "/dev",
        "--new-session",
        "--setenv", "PATH", "/usr/local/bin:/usr/sbin:/usr/bin:/bin",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Read-only view of the host plus one writable scratch dir, via `bwrap`.
pub struct BubblewrapEnvironment {
    config: BubblewrapConfig,
    workdir: Option<PathBuf>,
}

impl BubblewrapEnvironment {
    pub fn new(config: BubblewrapConfig) -> Self {
        Self {
            config,
            workdir: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    pub fn wrap_args(&self, command: &str, cwd: &str) -> Vec<String> {
        let mut args = self.config.wrapper_args.clone();
        args.extend([
            "--bind".to_string(),
            cwd.to_string(),
            cwd.to_string(),
            "--chdir".to_string(),
            cwd.to_string(),
        ]);
        for (key, value) in resolve_env(&self.config.forward_env, &self.config.env) {
            args.extend(["--setenv".to_string(), key, value]);
        }
        args.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

#[async_trait]
impl Environment for BubblewrapEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.workdir.as_ref().map(|p| p.display().to_string())
    }

    async fn create(&mut self) -> Result<()> {
        let dir = std::env::temp_dir().join(instance_name());
        self.workdir = Some(dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RolloutError::provision(KIND, e))?;
        info!(workdir = %dir.display(), "Created bubblewrap working directory");
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let workdir = self
            .workdir
            .as_ref()
            .ok_or_else(|| RolloutError::execution(KIND, "environment is not running"))?
            .display()
            .to_string();
        let configured = if self.config.cwd.is_empty() {
            workdir.as_str()
        } else {
            self.config.cwd.as_str()
        };
        let cwd = opts.resolve_cwd(configured);
        let args = self.wrap_args(command, cwd);
        debug!(cwd, command, "Executing in bubblewrap");

        match process::run(
            &self.config.executable,
            &args,
            None,
            opts.resolve_timeout(self.config.timeout),
        )
        .await
        {
            Ok(out) => Ok(ExecOutput {
                output: out.combined(),
                exit_code: out.exit_code,
            }),
            Err(ProcessError::Timeout(timeout)) => Err(RolloutError::ExecutionTimeout { timeout }),
            Err(e) => Err(RolloutError::execution(KIND, e)),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(dir) = self.workdir.take() else {
            return Ok(());
        };
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| RolloutError::execution(KIND, format!("removing {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_args_binds_cwd() {
        let map = match serde_json::json!({ "wrapper_args": ["--die-with-parent"], "env": { "X": "y" } }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let env = BubblewrapEnvironment::new(parse_config(KIND, map).unwrap());
        assert_eq!(
            env.wrap_args("make test", "/tmp/w"),
            vec![
                "--die-with-parent", "--bind", "/tmp/w", "/tmp/w", "--chdir", "/tmp/w",
                "--setenv", "X", "y", "bash", "-c", "make test"
            ]
        );
    }

    #[tokio::test]
    async fn test_workdir_lifecycle() {
        let mut env = BubblewrapEnvironment::new(parse_config(KIND, BackendConfig::new()).unwrap());
        env.create().await.unwrap();
        let dir = PathBuf::from(env.handle().unwrap());
        assert!(dir.is_dir());
        env.destroy().await.unwrap();
        assert!(!dir.exists());
    }
}
