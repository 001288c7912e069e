/// Error taxonomy and its HTTP mapping
#[cfg(test)]
mod tests {
    use rollout::error::RolloutError;
    use rollout::ResourceVector;
    use std::time::Duration;

    #[test]
    fn test_admission_errors_carry_vectors() {
        let err = RolloutError::InsufficientResources {
            requested: [("instances", 1), ("gpus", 2)].into_iter().collect(),
            available: [("instances", 3), ("gpus", 0)].into_iter().collect(),
        };

        let msg = err.to_string();
        assert!(msg.contains("requested {gpus=2, instances=1}"));
        assert!(msg.contains("available {gpus=0, instances=3}"));
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_client_errors() {
        let client = [
            RolloutError::not_found("a"),
            RolloutError::DuplicateInstance { run_id: "a".into() },
            RolloutError::UnknownBackend {
                tag: "vm".into(),
                available: "docker, local".into(),
            },
            RolloutError::InvalidConfig("bad json".into()),
        ];
        for err in &client {
            assert!(err.is_client_error(), "{} should be a client error", err);
        }

        let server = [
            RolloutError::provision("enroot", "import failed"),
            RolloutError::execution("docker", "daemon gone"),
            RolloutError::ExecutionTimeout {
                timeout: Duration::from_secs(30),
            },
            RolloutError::InsufficientResources {
                requested: ResourceVector::one_instance(),
                available: ResourceVector::new(),
            },
        ];
        for err in &server {
            assert!(!err.is_client_error(), "{} should not be a client error", err);
        }
    }

    #[test]
    fn test_messages_name_the_backend() {
        let err = RolloutError::provision("singularity", "build failed");
        assert_eq!(
            err.to_string(),
            "Failed to provision singularity environment: build failed"
        );

        let err = RolloutError::UnknownBackend {
            tag: "vm".into(),
            available: "docker, local".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown environment type: \"vm\" (available: docker, local)"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = RolloutError::ExecutionTimeout {
            timeout: Duration::from_secs(45),
        };
        assert_eq!(err.to_string(), "Command timed out after 45s");
        assert_eq!(err.status_code(), 504);
    }

    #[test]
    fn test_sub_second_timeout_message() {
        let err = RolloutError::ExecutionTimeout {
            timeout: Duration::from_millis(300),
        };
        assert_eq!(err.to_string(), "Command timed out after 0.3s");

        let err = RolloutError::ExecutionTimeout {
            timeout: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "Command timed out after 2.5s");
    }
}
