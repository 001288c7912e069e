use crate::constants::BACKEND_TAG_KEY;
use crate::environment::{
    bubblewrap::BubblewrapEnvironment, docker::DockerEnvironment, enroot::EnrootEnvironment,
    local::LocalEnvironment, remote::RemoteEnvironment, singularity::SingularityEnvironment,
    slurm::SlurmEnvironment, BackendConfig, Environment,
};
use crate::error::{Result, RolloutError};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Constructor = Arc<dyn Fn(BackendConfig) -> Result<Box<dyn Environment>> + Send + Sync>;

/// Maps a backend tag to the constructor of its `Environment` variant.
///
/// New substrates are added with `register`; the runner never names a variant.
#[derive(Clone, Default)]
pub struct EnvironmentFactory {
    constructors: BTreeMap<String, Constructor>,
    default_tag: Option<String>,
}

impl EnvironmentFactory {
    /// A factory with no variants registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Every variant shipped with the crate
    pub fn with_builtin_backends() -> Self {
        let mut factory = Self::new();
        factory
            .register("local", LocalEnvironment::from_config)
            .register("docker", DockerEnvironment::from_config)
            .register("podman", DockerEnvironment::podman_from_config)
            .register("enroot", EnrootEnvironment::from_config)
            .register("singularity", SingularityEnvironment::from_config)
            .register("apptainer", SingularityEnvironment::apptainer_from_config)
            .register("bubblewrap", BubblewrapEnvironment::from_config)
            .register("slurm", SlurmEnvironment::from_config)
            .register("remote", RemoteEnvironment::from_config);
        factory
    }

    pub fn register<F>(&mut self, tag: &str, constructor: F) -> &mut Self
    where
        F: Fn(BackendConfig) -> Result<Box<dyn Environment>> + Send + Sync + 'static,
    {
        self.constructors.insert(tag.to_string(), Arc::new(constructor));
        self
    }

    /// Tag used when a config carries no `container_type`
    pub fn with_default_tag(mut self, tag: Option<String>) -> Self {
        self.default_tag = tag;
        self
    }

    pub fn tags(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// The tag `config` would resolve to, without constructing anything
    pub fn tag_for(&self, config: &BackendConfig) -> Result<String> {
        match config.get(BACKEND_TAG_KEY) {
            Some(serde_json::Value::String(tag)) => Ok(tag.clone()),
            Some(other) => Err(self.unknown(other.to_string())),
            None => self
                .default_tag
                .clone()
                .ok_or_else(|| self.unknown(String::new())),
        }
    }

    /// Strip the tag from `config` and build the matching variant. The
    /// environment is constructed but not yet created.
    pub fn resolve(&self, mut config: BackendConfig) -> Result<Box<dyn Environment>> {
        let tag = self.tag_for(&config)?;
        config.remove(BACKEND_TAG_KEY);

        let constructor = self
            .constructors
            .get(&tag)
            .ok_or_else(|| self.unknown(tag.clone()))?;
        constructor(config)
    }

    fn unknown(&self, tag: String) -> RolloutError {
        RolloutError::UnknownBackend {
            tag,
            available: self.tags().join(", "),
        }
    }
}
