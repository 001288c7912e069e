// Centralized constants for the rollout service to avoid magic numbers

/// Resource dimension charged when a start request names no resources
pub const PRIMARY_RESOURCE: &str = "instances";

/// Config key holding the backend tag
pub const BACKEND_TAG_KEY: &str = "container_type";

/// Config key holding the per-instance resource request
pub const RESOURCES_KEY: &str = "resources";

/// Default capacity when none is configured
pub const DEFAULT_MAX_RESOURCES: &str = r#"{"instances": 10}"#;

/// Default per-command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Timeout for pulling/importing an image during provisioning (5 minutes)
pub const IMAGE_IMPORT_TIMEOUT_SECS: u64 = 300;

/// Timeout for creating a container or sandbox from a local image
pub const CONTAINER_CREATE_TIMEOUT_SECS: u64 = 120;

/// Timeout for a single teardown call
pub const TEARDOWN_TIMEOUT_SECS: u64 = 60;

/// How long shutdown waits for starts that are still provisioning
pub const SHUTDOWN_START_GRACE_SECS: u64 = IMAGE_IMPORT_TIMEOUT_SECS;

/// Interval between shutdown checks for pending starts
pub const SHUTDOWN_POLL_INTERVAL_MS: u64 = 50;

/// Prefix for names of containers and scratch dirs owned by this service
pub const INSTANCE_NAME_PREFIX: &str = "rollout";

/// Default HTTP port for `rollout serve`
pub const DEFAULT_PORT: u16 = 8000;

/// Default stats URL polled by `rollout poll`
pub const DEFAULT_POLL_URL: &str = "http://127.0.0.1:8000";

/// Timeout for a single stats request from the poller
pub const POLL_REQUEST_TIMEOUT_SECS: u64 = 5;
