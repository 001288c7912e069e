use crate::constants::{CONTAINER_CREATE_TIMEOUT_SECS, TEARDOWN_TIMEOUT_SECS};
use crate::environment::process::{self, command_line, ProcessError};
use crate::environment::{
    default_timeout, parse_config, BackendConfig, Environment, ExecOptions, ExecOutput,
};
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const KIND: &str = "slurm";

/// Batch script holding the allocation open until `scancel`
pub const HOLD_SCRIPT: &str = "#!/bin/bash\nsleep infinity\n";

#[derive(Debug, Clone, Deserialize)]
pub struct SlurmConfig {
    /// Extra arguments for `sbatch`, e.g. `["--partition=gpu", "--gres=gpu:1"]`
    #[serde(default)]
    pub sbatch_args: Vec<String>,
    /// Extra arguments for `srun`
    #[serde(default)]
    pub srun_args: Vec<String>,
    /// Passed as `srun --chdir`
    #[serde(default)]
    pub cwd: Option<String>,
    /// Exported on top of the submitting environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_srun")]
    pub srun: String,
    #[serde(default = "default_scancel")]
    pub scancel: String,
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_srun() -> String {
    "srun".to_string()
}

fn default_scancel() -> String {
    "scancel".to_string()
}

/// A held scheduler allocation; commands are job steps run with `srun --overlap`.
pub struct SlurmEnvironment {
    config: SlurmConfig,
    job_id: Option<String>,
}

impl SlurmEnvironment {
    pub fn new(config: SlurmConfig) -> Self {
        Self {
            config,
            job_id: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    pub fn sbatch_args(&self) -> Vec<String> {
        let mut args = vec!["--parsable".to_string()];
        args.extend(self.config.sbatch_args.iter().cloned());
        args
    }

    pub fn srun_args(&self, job_id: &str, command: &str, cwd: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--jobid".to_string(),
            job_id.to_string(),
            "--overlap".to_string(),
        ];
        if let Some(cwd) = cwd.filter(|c| !c.is_empty()) {
            args.push(format!("--chdir={}", cwd));
        }
        if !self.config.env.is_empty() {
            let exports: Vec<String> = self
                .config
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            args.push(format!("--export=ALL,{}", exports.join(",")));
        }
        args.extend(self.config.srun_args.iter().cloned());
        args.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

/// `sbatch --parsable` prints `jobid` or `jobid;cluster`
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[async_trait]
impl Environment for SlurmEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.job_id.clone()
    }

    async fn create(&mut self) -> Result<()> {
        let args = self.sbatch_args();
        info!(command = %command_line(&self.config.sbatch, &args), "Submitting allocation");

        let out = process::run(
            &self.config.sbatch,
            &args,
            Some(HOLD_SCRIPT),
            Duration::from_secs(CONTAINER_CREATE_TIMEOUT_SECS),
        )
        .await
        .map_err(|e| RolloutError::provision(KIND, e))?;

        if !out.success() {
            return Err(RolloutError::provision(
                KIND,
                format!("sbatch failed with {}", out.failure_reason()),
            ));
        }
        let job_id = parse_job_id(&out.stdout).ok_or_else(|| {
            RolloutError::provision(KIND, format!("sbatch returned no job id: {:?}", out.stdout))
        })?;
        info!(job_id = %job_id, "Submitted allocation");
        self.job_id = Some(job_id);
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let job_id = self
            .job_id
            .as_deref()
            .ok_or_else(|| RolloutError::execution(KIND, "no allocation"))?;
        let cwd = opts.cwd.as_deref().or(self.config.cwd.as_deref());
        let args = self.srun_args(job_id, command, cwd);
        debug!(job_id, command, "Running job step");

        match process::run(
            &self.config.srun,
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
        let Some(job_id) = self.job_id.take() else {
            return Ok(());
        };
        info!(job_id = %job_id, "Cancelling allocation");
        let out = process::run(
            &self.config.scancel,
            &[job_id.clone()],
            None,
            Duration::from_secs(TEARDOWN_TIMEOUT_SECS),
        )
        .await
        .map_err(|e| RolloutError::execution(KIND, e))?;
        if !out.success() {
            return Err(RolloutError::execution(
                KIND,
                format!("scancel {} failed with {}", job_id, out.failure_reason()),
            ));
        }
        Ok(())
    }
}
