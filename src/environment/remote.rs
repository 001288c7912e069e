//! Sandbox hosted by a remote container service.
//!
//! The service owns isolation; this variant only speaks its HTTP API:
//!
//! ```text
//! POST   {base_url}/sandboxes            {image, cwd, env}            -> {id}
//! POST   {base_url}/sandboxes/{id}/exec  {command, cwd, timeout_secs} -> {output, exit_code}
//! DELETE {base_url}/sandboxes/{id}
//! ```

use crate::constants::{CONTAINER_CREATE_TIMEOUT_SECS, TEARDOWN_TIMEOUT_SECS};
use crate::environment::{
    default_root_cwd, default_timeout, parse_config, resolve_env, BackendConfig, Environment,
    ExecOptions, ExecOutput,
};
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const KIND: &str = "remote";

/// Slack on top of the command timeout before the HTTP call itself gives up
const REQUEST_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub image: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_root_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Service-specific options passed through on creation
    #[serde(default)]
    pub create_options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub image: String,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub output: String,
    pub exit_code: i32,
}

pub struct RemoteEnvironment {
    config: RemoteConfig,
    client: Client,
    sandbox_id: Option<String>,
}

impl RemoteEnvironment {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config: RemoteConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            client: Client::new(),
            sandbox_id: None,
        }
    }

    pub fn from_config(config: BackendConfig) -> Result<Box<dyn Environment>> {
        Ok(Box::new(Self::new(parse_config(KIND, config)?)))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn sandbox_url(&self, id: &str) -> String {
        format!("{}/sandboxes/{}", self.config.base_url, id)
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    format!("{} - {}", status, text.trim())
}

#[async_trait]
impl Environment for RemoteEnvironment {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn handle(&self) -> Option<String> {
        self.sandbox_id.clone()
    }

    async fn create(&mut self) -> Result<()> {
        let url = format!("{}/sandboxes", self.config.base_url);
        let body = CreateSandboxRequest {
            image: self.config.image.clone(),
            cwd: self.config.cwd.clone(),
            env: resolve_env(&self.config.forward_env, &self.config.env)
                .into_iter()
                .collect(),
            options: self.config.create_options.clone(),
        };
        info!(url = %url, image = %body.image, "Creating remote sandbox");

        let response = self
            .authorized(self.client.post(&url))
            .timeout(Duration::from_secs(CONTAINER_CREATE_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await
            .map_err(|e| RolloutError::provision(KIND, e))?;

        if !response.status().is_success() {
            return Err(RolloutError::provision(KIND, error_body(response).await));
        }
        let created: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| RolloutError::provision(KIND, format!("bad create response: {}", e)))?;
        info!(sandbox = %created.id, "Created remote sandbox");
        self.sandbox_id = Some(created.id);
        Ok(())
    }

    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let id = self
            .sandbox_id
            .as_deref()
            .ok_or_else(|| RolloutError::execution(KIND, "sandbox not created"))?;
        let timeout = opts.resolve_timeout(self.config.timeout);
        let body = ExecRequest {
            command: command.to_string(),
            cwd: opts.resolve_cwd(&self.config.cwd).to_string(),
            timeout_secs: timeout.as_secs().max(1),
        };
        debug!(sandbox = id, command, "Executing in remote sandbox");

        let response = self
            .authorized(self.client.post(format!("{}/exec", self.sandbox_url(id))))
            .timeout(timeout.saturating_add(Duration::from_secs(REQUEST_GRACE_SECS)))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RolloutError::ExecutionTimeout { timeout }
                } else {
                    RolloutError::execution(KIND, e)
                }
            })?;

        match response.status() {
            status if status.is_success() => {
                let result: ExecResponse = response
                    .json()
                    .await
                    .map_err(|e| RolloutError::execution(KIND, format!("bad exec response: {}", e)))?;
                Ok(ExecOutput {
                    output: result.output,
                    exit_code: result.exit_code,
                })
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(RolloutError::ExecutionTimeout { timeout })
            }
            _ => Err(RolloutError::execution(KIND, error_body(response).await)),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(id) = self.sandbox_id.take() else {
            return Ok(());
        };
        info!(sandbox = %id, "Deleting remote sandbox");
        let response = self
            .authorized(self.client.delete(self.sandbox_url(&id)))
            .timeout(Duration::from_secs(TEARDOWN_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| RolloutError::execution(KIND, e))?;

        // already gone counts as destroyed
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(RolloutError::execution(KIND, error_body(response).await))
        }
    }
}
