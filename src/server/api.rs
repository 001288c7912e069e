//! Request and response bodies of the HTTP API

use crate::environment::{BackendConfig, ExecOutput};
use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstanceRequest {
    /// Preset name, also the instance's label in stats
    pub container_name: String,
    pub run_id: String,
    #[serde(default)]
    pub environment_config: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstanceResponse {
    pub status: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    pub run_id: String,
    pub cmd: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandResponse {
    pub status: String,
    pub result: ExecOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseInstanceRequest {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
