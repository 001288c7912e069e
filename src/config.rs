use crate::constants::BACKEND_TAG_KEY;
use crate::environment::BackendConfig;
use crate::error::{Result, RolloutError};
use crate::resources::ResourceVector;
use crate::runner::ClosePolicy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment flavour of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunnerMode {
    /// Backends must be named in every config
    Local,
    /// Configs without a `container_type` get a Slurm allocation
    Slurm,
}

impl RunnerMode {
    pub fn default_backend(self) -> Option<String> {
        match self {
            Self::Local => None,
            Self::Slurm => Some("slurm".to_string()),
        }
    }

    pub fn close_policy(self) -> ClosePolicy {
        match self {
            Self::Local => ClosePolicy::Strict,
            // scheduler jobs can vanish underneath us
            Self::Slurm => ClosePolicy::Lenient,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
        }
    }
}

/// Parse `--max-resources`, e.g. `{"instances": 10, "gpus": 4}`
pub fn parse_max_resources(raw: &str) -> Result<ResourceVector> {
    serde_json::from_str(raw)
        .map_err(|e| RolloutError::InvalidConfig(format!("invalid --max-resources {:?}: {}", raw, e)))
}

/// Named backend configurations loaded at startup
#[derive(Debug, Clone, Default)]
pub struct Presets {
    entries: BTreeMap<String, BackendConfig>,
}

impl Presets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RolloutError::InvalidConfig(format!("reading {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            RolloutError::InvalidConfig(format!("parsing {}: {}", path.display(), e))
        })?;
        Self::from_value(value)
    }

    /// Accepts `{name: {..config..} | "image"}`; a bare string is a docker image
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(RolloutError::InvalidConfig(
                "environments file must be a JSON object".to_string(),
            ));
        };

        let mut entries = BTreeMap::new();
        for (name, entry) in map {
            let config = match entry {
                Value::Object(config) => config,
                Value::String(image) => docker_image(image),
                other => {
                    return Err(RolloutError::InvalidConfig(format!(
                        "environment {:?} must be an object or an image name, got {}",
                        name, other
                    )))
                }
            };
            entries.insert(name, config);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Config for a start request: the named preset with `overrides` merged on
    /// top, or `overrides` alone when no preset has that name. Empty results
    /// are rejected.
    pub fn resolve(&self, name: &str, overrides: BackendConfig) -> Result<BackendConfig> {
        let config = match self.entries.get(name) {
            Some(preset) => merge_config(preset.clone(), overrides),
            None => overrides,
        };
        if config.is_empty() {
            return Err(RolloutError::InvalidConfig(format!(
                "no environment configuration for {:?}",
                name
            )));
        }
        Ok(config)
    }
}

fn docker_image(image: String) -> BackendConfig {
    let mut config = BackendConfig::new();
    config.insert(BACKEND_TAG_KEY.to_string(), Value::String("docker".to_string()));
    config.insert("image".to_string(), Value::String(image));
    config
}

/// Shallow merge: top-level keys of `overrides` replace those of `base`
pub fn merge_config(mut base: BackendConfig, overrides: BackendConfig) -> BackendConfig {
    for (key, value) in overrides {
        base.insert(key, value);
    }
    base
}
