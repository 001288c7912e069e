//! Structured logging and observability utilities for the rollout service

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rollout=info,tower_http=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for log aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Lifecycle counters for one runner, readable while requests are in flight
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    starts: AtomicU64,
    rejected_starts: AtomicU64,
    provision_failures: AtomicU64,
    commands: AtomicU64,
    command_failures: AtomicU64,
    closes: AtomicU64,
    teardown_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub starts: u64,
    pub rejected_starts: u64,
    pub provision_failures: u64,
    pub commands: u64,
    pub command_failures: u64,
    pub closes: u64,
    pub teardown_failures: u64,
}

impl RunnerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_start(&self) {
        self.rejected_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, ok: bool) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.command_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_close(&self, teardown_ok: bool) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        if !teardown_ok {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            starts: self.starts.load(Ordering::Relaxed),
            rejected_starts: self.rejected_starts.load(Ordering::Relaxed),
            provision_failures: self.provision_failures.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn command_failure_rate(&self) -> f64 {
        if self.commands == 0 {
            0.0
        } else {
            (self.command_failures as f64) / (self.commands as f64)
        }
    }
}

#[macro_export]
macro_rules! log_instance_started {
    ($run_id:expr, $backend:expr, $handle:expr, $resources:expr) => {
        tracing::info!(
            run_id = %$run_id,
            backend = $backend,
            handle = ?$handle,
            resources = %$resources,
            "Instance started"
        );
    };
}

#[macro_export]
macro_rules! log_instance_closed {
    ($run_id:expr, $backend:expr, $num_cmd:expr) => {
        tracing::info!(
            run_id = %$run_id,
            backend = $backend,
            num_cmd = $num_cmd,
            "Instance closed"
        );
    };
}

#[macro_export]
macro_rules! log_teardown_failure {
    ($run_id:expr, $backend:expr, $err:expr) => {
        tracing::warn!(
            run_id = %$run_id,
            backend = $backend,
            error = %$err,
            "Teardown failed; releasing resources anyway"
        );
    };
}

#[macro_export]
macro_rules! log_command_executed {
    ($run_id:expr, $exit_code:expr, $duration_ms:expr) => {
        tracing::debug!(
            run_id = %$run_id,
            exit_code = $exit_code,
            duration_ms = $duration_ms,
            "Command executed"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counting() {
        let metrics = RunnerMetrics::new();
        metrics.record_start();
        metrics.record_start();
        metrics.record_rejected_start();
        metrics.record_command(true);
        metrics.record_command(false);
        metrics.record_close(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.starts, 2);
        assert_eq!(snap.rejected_starts, 1);
        assert_eq!(snap.commands, 2);
        assert_eq!(snap.command_failures, 1);
        assert_eq!(snap.closes, 1);
        assert_eq!(snap.teardown_failures, 1);
        assert!((snap.command_failure_rate() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_zero_metrics() {
        let snap = RunnerMetrics::new().snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(snap.command_failure_rate(), 0.0);
    }
}
