use crate::constants::{CONTAINER_CREATE_TIMEOUT_SECS, IMAGE_IMPORT_TIMEOUT_SECS, TEARDOWN_TIMEOUT_SECS};
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
use tracing::{debug, error, info};

const KIND: &str = "enroot";

/// Directory holding imported `.sqsh` images when `cache_dir` is not set
pub const ENROOT_CACHE_ENV: &str = "ENROOT_CACHE_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct EnrootConfig {
    /// Image reference understood by `enroot import`, e.g. `docker://ubuntu:22.04`
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
    /// Extra arguments for `enroot start`
    #[serde(default)]
    pub start_args: Vec<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
}

fn default_executable() -> String {
    "enroot".to_string()
}

/// Container filesystem created from a cached squashfs image. Every command
/// is its own `enroot start --rw` against that filesystem.
pub struct EnrootEnvironment {
    config: EnrootConfig,
    container: Option<String>,
}

impl EnrootEnvironment {
    pub fn new(config: EnrootConfig) -> Self {
        Self {
            config,
            container: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    /// `<cache>/<image>.sqsh` with path separators in the image flattened
    pub fn image_path(&self) -> Result<PathBuf> {
        let cache_dir = match &self.config.cache_dir {
            Some(dir) => dir.clone(),
            None => std::env::var(ENROOT_CACHE_ENV).map_err(|_| {
                RolloutError::provision(
                    KIND,
                    format!("no cache_dir configured and {} is not set", ENROOT_CACHE_ENV),
                )
            })?,
        };
        let file_name = format!("{}.sqsh", self.config.image).replace('/', "_");
        Ok(PathBuf::from(cache_dir).join(file_name))
    }

    pub fn start_args(&self, name: &str, command: &str) -> Vec<String> {
        let mut args = vec!["start".to_string(), "--rw".to_string()];
        args.extend(self.config.start_args.iter().cloned());
        for (key, value) in resolve_env(&self.config.forward_env, &self.config.env) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        args.extend(["bash".to_string(), "-lc".to_string(), command.to_string()]);
        args
    }

    async fn provision_step(&self, args: Vec<String>, timeout_secs: u64, what: &str) -> Result<()> {
        info!(command = %command_line(&self.config.executable, &args), "Running enroot {}", what);
        let out = process::run(
            &self.config.executable,
            &args,
            None,
            Duration::from_secs(timeout_secs),
        )
        .await
        .map_err(|e| RolloutError::provision(KIND, format!("enroot {}: {}", what, e)))?;

        if !out.success() {
            error!(stderr = %out.stderr, stdout = %out.stdout, "Enroot {} failed", what);
            return Err(RolloutError::provision(
                KIND,
                format!("enroot {} failed with {}", what, out.failure_reason()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Environment for EnrootEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.container.clone()
    }

    async fn create(&mut self) -> Result<()> {
        let image_path = self.image_path()?;
        let image_arg = image_path.display().to_string();

        if image_path.exists() {
            info!(image = %self.config.image, "Image already present");
        } else {
            let args = vec![
                "import".to_string(),
                "-o".to_string(),
                image_arg.clone(),
                self.config.image.clone(),
            ];
            self.provision_step(args, IMAGE_IMPORT_TIMEOUT_SECS, "import").await?;
            info!(image = %self.config.image, "Imported image");
        }

        let name = instance_name();
        self.container = Some(name.clone());
        let args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.clone(),
            image_arg,
        ];
        self.provision_step(args, CONTAINER_CREATE_TIMEOUT_SECS, "create").await?;
        info!(container = %name, "Created container");
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let name = self
            .container
            .as_deref()
            .ok_or_else(|| RolloutError::execution(KIND, "container not created"))?;

        // enroot start has no workdir flag; cd inside the shell instead
        let cwd = opts.resolve_cwd(&self.config.cwd);
        let script = format!("cd {} && {}", shell_quote(cwd), command);
        let args = self.start_args(name, &script);
        debug!(container = name, command, "Executing in enroot container");

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
        info!(container = %name, "Removing container");
        let args = vec!["remove".to_string(), "--force".to_string(), name];
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
                format!("enroot remove failed with {}", out.failure_reason()),
            ));
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
