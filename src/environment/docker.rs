use crate::constants::TEARDOWN_TIMEOUT_SECS;
use crate::environment::process::{self, command_line, ProcessError};
use crate::environment::{
    default_root_cwd, default_timeout, instance_name, parse_config, resolve_env, BackendConfig,
    Environment, ExecOptions, ExecOutput,
};
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const KIND: &str = "docker";

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    #[serde(default = "default_root_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// `docker`, `podman`, or a full path to either
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Extra arguments for `docker run`
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// Argument to `sleep` keeping the container alive
    #[serde(default = "default_container_timeout")]
    pub container_timeout: String,
    /// Seconds allowed for `docker run`, image pull included
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
}

fn default_executable() -> String {
    "docker".to_string()
}

fn default_run_args() -> Vec<String> {
    vec!["--rm".to_string()]
}

fn default_container_timeout() -> String {
    "2h".to_string()
}

fn default_pull_timeout() -> u64 {
    120
}

/// A long-lived container started with `sleep`; commands go through `docker exec`.
pub struct DockerEnvironment {
    config: DockerConfig,
    container: Option<String>,
}

impl DockerEnvironment {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            container: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    /// `podman` shares the docker CLI surface; only the default binary differs
    pub fn podman_from_config(mut config: BackendConfig) -> Result<Box<dyn Environment>> {
        config
            .entry("executable")
            .or_insert_with(|| serde_json::Value::String("podman".to_string()));
        Self::from_config(config)
    }

    pub fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            self.config.cwd.clone(),
        ];
        args.extend(self.config.run_args.iter().cloned());
        args.push(self.config.image.clone());
        args.push("sleep".to_string());
        args.push(self.config.container_timeout.clone());
        args
    }

    pub fn exec_args(&self, name: &str, command: &str, cwd: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-w".to_string(), cwd.to_string()];
        for (key, value) in resolve_env(&self.config.forward_env, &self.config.env) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        args.extend(["bash".to_string(), "-lc".to_string(), command.to_string()]);
        args
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.container.clone()
    }

    async fn create(&mut self) -> Result<()> {
        let name = instance_name();
        let args = self.run_args(&name);
        // a timed-out `docker run` may still leave a container behind
        self.container = Some(name.clone());

        info!(command = %command_line(&self.config.executable, &args), "Starting container");
        let out = process::run(
            &self.config.executable,
            &args,
            None,
            Duration::from_secs(self.config.pull_timeout),
        )
        .await
        .map_err(|e| RolloutError::provision(KIND, e))?;

        if !out.success() {
            return Err(RolloutError::provision(
                KIND,
                format!("docker run failed with {}", out.failure_reason()),
            ));
        }
        info!(container = %name, id = %out.stdout.trim(), "Started container");
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let name = self
            .container
            .as_deref()
            .ok_or_else(|| RolloutError::execution(KIND, "container not created"))?;
        let args = self.exec_args(name, command, opts.resolve_cwd(&self.config.cwd));
        debug!(container = name, command, "Executing in container");

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
        let Some(name) = self.container.take() else {
            return Ok(());
        };
        let args = vec!["rm".to_string(), "-f".to_string(), name.clone()];
        info!(container = %name, "Removing container");

        let out = process::run(
            &self.config.executable,
            &args,
            None,
            Duration::from_secs(TEARDOWN_TIMEOUT_SECS),
        )
        .await
        .map_err(|e| RolloutError::execution(KIND, e))?;
        if !out.success() {
            return Err(RolloutError::execution(
                KIND,
                format!("docker rm failed with {}", out.failure_reason()),
            ));
        }
        Ok(())
    }
}
