use crate::constants::IMAGE_IMPORT_TIMEOUT_SECS;
use crate::environment::process::{self, command_line, ProcessError};
use crate::environment::{
    default_root_cwd, default_timeout, instance_name, parse_config, resolve_env, BackendConfig,
    Environment, ExecOptions, ExecOutput,
};
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const KIND: &str = "singularity";

#[derive(Debug, Clone, Deserialize)]
pub struct SingularityConfig {
    /// Anything `singularity build` accepts, e.g. `docker://python:3.11`
    pub image: String,
    #[serde(default = "default_root_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Extra arguments for `singularity exec`
    #[serde(default)]
    pub exec_args: Vec<String>,
}

fn default_executable() -> String {
    "singularity".to_string()
}

/// Writable sandbox directory built from an image; commands run with
/// `singularity exec --contain --cleanenv --writable`.
pub struct SingularityEnvironment {
    config: SingularityConfig,
    sandbox_dir: Option<PathBuf>,
}

impl SingularityEnvironment {
    pub fn new(config: SingularityConfig) -> Self {
        Self {
            config,
            sandbox_dir: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    pub fn apptainer_from_config(mut config: BackendConfig) -> Result<Box<dyn Environment>> {
        config
            .entry("executable")
            .or_insert_with(|| serde_json::Value::String("apptainer".to_string()));
        Self::from_config(config)
    }

    pub fn exec_args(&self, sandbox_dir: &str, command: &str, cwd: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if !cwd.is_empty() && cwd != "/" {
            args.push("--pwd".to_string());
            args.push(cwd.to_string());
        }
        for (key, value) in resolve_env(&self.config.forward_env, &self.config.env) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(self.config.exec_args.iter().cloned());
        args.extend([
            "--contain".to_string(),
            "--cleanenv".to_string(),
            "--writable".to_string(),
            sandbox_dir.to_string(),
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Environment for SingularityEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.sandbox_dir.as_ref().map(|p| p.display().to_string())
    }

    async fn create(&mut self) -> Result<()> {
        let dir = std::env::temp_dir().join(instance_name());
        self.sandbox_dir = Some(dir.clone());

        let args = vec![
            "build".to_string(),
            "--sandbox".to_string(),
            dir.display().to_string(),
            self.config.image.clone(),
        ];
        info!(command = %command_line(&self.config.executable, &args), "Building sandbox");
        let out = process::run(
            &self.config.executable,
            &args,
            None,
            Duration::from_secs(IMAGE_IMPORT_TIMEOUT_SECS),
        )
        .await
        .map_err(|e| RolloutError::provision(KIND, e))?;

        if !out.success() {
            return Err(RolloutError::provision(
                KIND,
                format!("singularity build failed with {}", out.failure_reason()),
            ));
        }
        info!(sandbox = %dir.display(), "Built sandbox");
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let dir = self
            .sandbox_dir
            .as_ref()
            .ok_or_else(|| RolloutError::execution(KIND, "sandbox not built"))?;
        let args = self.exec_args(
            &dir.display().to_string(),
            command,
            opts.resolve_cwd(&self.config.cwd),
        );
        debug!(sandbox = %dir.display(), command, "Executing in singularity sandbox");

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
        let Some(dir) = self.sandbox_dir.take() else {
            return Ok(());
        };
        if dir.exists() {
            info!(sandbox = %dir.display(), "Removing sandbox");
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| RolloutError::execution(KIND, format!("removing {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }
}
