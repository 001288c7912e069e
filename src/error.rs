//! Rollout error types and handling utilities

use crate::resources::ResourceVector;
use std::time::Duration;
use thiserror::Error;

/// Main error type for runner and environment operations
#[derive(Debug, Error)]
pub enum RolloutError {
    /// A live instance already owns this run id
    #[error("Instance {run_id} is already running")]
    DuplicateInstance { run_id: String },

    /// Admission control rejected the request
    #[error("Not enough resources: requested {requested}, available {available}")]
    InsufficientResources {
        requested: ResourceVector,
        available: ResourceVector,
    },

    /// The backend tag has no registered constructor
    #[error("Unknown environment type: {tag:?} (available: {available})")]
    UnknownBackend { tag: String, available: String },

    /// The substrate refused or failed to create the sandbox
    #[error("Failed to provision {backend} environment: {reason}")]
    BackendProvision { backend: String, reason: String },

    /// A command outlived its timeout; the sandbox stays up
    #[error("Command timed out after {}s", .timeout.as_secs_f64())]
    ExecutionTimeout { timeout: Duration },

    /// The substrate failed while running a command
    #[error("Execution failed in {backend} environment: {reason}")]
    Execution { backend: String, reason: String },

    /// No live instance is registered under this run id
    #[error("Run ID {run_id} not found")]
    InstanceNotFound { run_id: String },

    /// Malformed presets, CLI arguments or request payloads
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RolloutError>;

impl RolloutError {
    pub fn provision(backend: &str, reason: impl std::fmt::Display) -> Self {
        Self::BackendProvision {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn execution(backend: &str, reason: impl std::fmt::Display) -> Self {
        Self::Execution {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(run_id: &str) -> Self {
        Self::InstanceNotFound {
            run_id: run_id.to_string(),
        }
    }

    /// HTTP status the API layer answers with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InstanceNotFound { .. } => 404,
            Self::DuplicateInstance { .. } => 409,
            Self::InsufficientResources { .. } => 503,
            Self::UnknownBackend { .. } | Self::InvalidConfig(_) => 400,
            Self::ExecutionTimeout { .. } => 504,
            Self::BackendProvision { .. } | Self::Execution { .. } => 500,
        }
    }

    /// Precondition failures the caller can fix without touching the fleet
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = RolloutError::not_found("run-7");
        assert_eq!(err.to_string(), "Run ID run-7 not found");
        assert_eq!(err.status_code(), 404);
        assert!(err.is_client_error());
    }

    #[test]
    fn test_insufficient_resources_display() {
        let err = RolloutError::InsufficientResources {
            requested: ResourceVector::single("instances", 1),
            available: ResourceVector::single("instances", 0),
        };
        let msg = err.to_string();
        assert!(msg.contains("Not enough resources"));
        assert!(msg.contains("instances=0"));
        assert_eq!(err.status_code(), 503);
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RolloutError::DuplicateInstance { run_id: "a".into() }.status_code(),
            409
        );
        assert_eq!(
            RolloutError::ExecutionTimeout {
                timeout: Duration::from_secs(3),
            }
            .status_code(),
            504
        );
        assert_eq!(RolloutError::provision("docker", "no image").status_code(), 500);
        assert_eq!(RolloutError::InvalidConfig("x".into()).status_code(), 400);
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: anyhow::Error = RolloutError::execution("slurm", "job vanished").into();
        assert!(err.to_string().contains("job vanished"));
    }
}
