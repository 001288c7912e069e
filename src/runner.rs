//! Orchestration over the resource ledger, the instance registry and the
//! environment factory.
//!
//! Every operation is a short transaction: `start` claims the run id, charges
//! the ledger, then provisions; any failure undoes the earlier steps, and an
//! environment whose creation began is always destroyed. `close`
//! removes the record, tears the environment down and releases its
//! reservation whether or not teardown succeeded.

use crate::constants::{RESOURCES_KEY, SHUTDOWN_POLL_INTERVAL_MS, SHUTDOWN_START_GRACE_SECS};
use crate::environment::{BackendConfig, Environment, EnvironmentFactory, ExecOptions, ExecOutput};
use crate::error::{Result, RolloutError};
use crate::logging::RunnerMetrics;
use crate::registry::{unix_seconds, InstanceRecord, InstanceRegistry};
use crate::resources::{ResourceLedger, ResourceVector};
use crate::stats::{RunnerStats, StatsFilter};
use chrono::Utc;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What `close` does with a run id it does not know
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Fail with `InstanceNotFound`
    #[default]
    Strict,
    /// Succeed without doing anything
    Lenient,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_resources: ResourceVector,
    pub close_policy: ClosePolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_resources: ResourceVector::single(crate::constants::PRIMARY_RESOURCE, 10),
            close_policy: ClosePolicy::Strict,
        }
    }
}

pub struct Runner {
    ledger: ResourceLedger,
    registry: InstanceRegistry,
    factory: EnvironmentFactory,
    close_policy: ClosePolicy,
    metrics: RunnerMetrics,
    started_at: Instant,
    /// Teardowns of environments whose `start` was dropped midway
    detached: Mutex<Vec<JoinHandle<()>>>,
}

/// Undoes a `start` that has not committed: destroys the environment if one
/// was resolved, releases the reservation if one was charged and drops the
/// run id claim. Also runs if the start future is dropped midway.
struct PendingStart<'a> {
    runner: &'a Runner,
    run_id: &'a str,
    reserved: Option<ResourceVector>,
    environment: Option<Box<dyn Environment>>,
}

impl PendingStart<'_> {
    /// Hand the created environment and its reservation to the registry
    fn commit(mut self, descriptor: &str) {
        if let (Some(reserved), Some(environment)) =
            (self.reserved.take(), self.environment.take())
        {
            crate::log_instance_started!(
                self.run_id,
                environment.kind(),
                environment.handle(),
                reserved
            );
            self.runner.registry.commit(self.run_id, descriptor, reserved, environment);
        }
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if let Some(environment) = self.environment.take() {
            self.runner.destroy_detached(self.run_id, environment);
        }
        if let Some(reserved) = self.reserved.take() {
            self.runner.ledger.release(&reserved);
        }
        self.runner.registry.abandon(self.run_id);
    }
}

/// Pull the resource request out of a backend config
pub fn requested_resources(config: &mut BackendConfig) -> Result<ResourceVector> {
    match config.remove(RESOURCES_KEY) {
        None | Some(serde_json::Value::Null) => Ok(ResourceVector::one_instance()),
        Some(value) => serde_json::from_value(value).map_err(|e| {
            RolloutError::InvalidConfig(format!(
                "{} must map names to non-negative integers: {}",
                RESOURCES_KEY, e
            ))
        }),
    }
}

impl Runner {
    pub fn new(factory: EnvironmentFactory, options: RunnerOptions) -> Self {
        Self {
            ledger: ResourceLedger::new(options.max_resources),
            registry: InstanceRegistry::new(),
            factory,
            close_policy: options.close_policy,
            metrics: RunnerMetrics::new(),
            started_at: Instant::now(),
            detached: Mutex::new(Vec::new()),
        }
    }

    pub fn close_policy(&self) -> ClosePolicy {
        self.close_policy
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Provision a new instance under `run_id`.
    ///
    /// `descriptor` labels the instance in stats (usually the preset name).
    /// `config` carries the backend tag, an optional `resources` request and
    /// the variant's own options.
    pub async fn start(
        &self,
        run_id: &str,
        descriptor: &str,
        mut config: BackendConfig,
    ) -> Result<String> {
        let requested = requested_resources(&mut config)?;

        if let Err(e) = self.registry.claim(run_id) {
            self.metrics.record_rejected_start();
            return Err(e);
        }
        let mut pending = PendingStart {
            runner: self,
            run_id,
            reserved: None,
            environment: None,
        };

        if !self.ledger.try_allocate(&requested) {
            self.metrics.record_rejected_start();
            let available = self.ledger.available();
            info!(run_id, requested = %requested, available = %available, "Start rejected");
            return Err(RolloutError::InsufficientResources {
                requested,
                available,
            });
        }
        pending.reserved = Some(requested);

        let environment = match self.factory.resolve(config) {
            Ok(env) => pending.environment.insert(env),
            Err(e) => {
                self.metrics.record_provision_failure();
                return Err(e);
            }
        };

        if let Err(e) = environment.create().await {
            self.metrics.record_provision_failure();
            warn!(run_id, backend = environment.kind(), error = %e, "Provisioning failed");
            if let Err(cleanup) = environment.destroy().await {
                crate::log_teardown_failure!(run_id, environment.kind(), cleanup);
            }
            pending.environment = None;
            return Err(e);
        }

        pending.commit(descriptor);
        self.metrics.record_start();
        Ok(run_id.to_string())
    }

    /// Run `command` in a live instance. A non-zero exit code is a successful
    /// call; only substrate failures and timeouts are errors.
    pub async fn execute(
        &self,
        run_id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput> {
        let environment = self.registry.environment(run_id)?;
        let started = Instant::now();

        let result = {
            let env = environment.lock().await;
            // closed or replaced while this command waited its turn
            if !self.registry.is_current(run_id, &environment) {
                return Err(RolloutError::not_found(run_id));
            }
            env.execute(command, opts).await
        };

        self.registry.record_command(run_id, &environment);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(out) => {
                self.metrics.record_command(out.is_success());
                crate::log_command_executed!(run_id, out.exit_code, elapsed_ms);
            }
            Err(e) => {
                self.metrics.record_command(false);
                warn!(run_id, error = %e, duration_ms = elapsed_ms, "Command failed");
            }
        }
        result
    }

    /// Tear down `run_id` and return its resources. Teardown errors are logged,
    /// never returned.
    pub async fn close(&self, run_id: &str) -> Result<()> {
        let Some(record) = self.registry.take(run_id) else {
            return match self.close_policy {
                ClosePolicy::Strict => Err(RolloutError::not_found(run_id)),
                ClosePolicy::Lenient => {
                    debug!(run_id, "Close of unknown instance ignored");
                    Ok(())
                }
            };
        };
        self.teardown(record).await;
        Ok(())
    }

    async fn teardown(&self, record: InstanceRecord) {
        let environment = record.environment();
        // waits for an in-flight command on this instance
        let result = environment.lock().await.destroy().await;

        if let Err(e) = &result {
            crate::log_teardown_failure!(record.run_id, record.backend, e);
        }
        self.ledger.release(&record.reserved);
        self.metrics.record_close(result.is_ok());
        crate::log_instance_closed!(record.run_id, record.backend, record.command_count);
    }

    /// Destroy an environment whose `start` future is gone. Runs on its own
    /// task; `shutdown` waits for it.
    fn destroy_detached(&self, run_id: &str, mut environment: Box<dyn Environment>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                run_id,
                backend = environment.kind(),
                "No runtime left to destroy abandoned environment"
            );
            return;
        };
        debug!(run_id, backend = environment.kind(), "Destroying environment of abandoned start");
        let run_id = run_id.to_string();
        let task = runtime.spawn(async move {
            if let Err(e) = environment.destroy().await {
                crate::log_teardown_failure!(run_id, environment.kind(), e);
            }
        });

        let mut detached = self.detached.lock();
        detached.retain(|t| !t.is_finished());
        detached.push(task);
    }

    /// Close every live instance; used on process shutdown.
    ///
    /// Starts still provisioning get a grace period to finish; whatever they
    /// commit is closed too.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_START_GRACE_SECS);
        loop {
            let records = self.registry.drain();
            if !records.is_empty() {
                info!(count = records.len(), "Closing live instances");
                futures::future::join_all(records.into_iter().map(|r| self.teardown(r))).await;
            }

            let starting = self.registry.starting();
            if starting == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(starting, "Starts still provisioning at shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS)).await;
        }

        let detached = std::mem::take(&mut *self.detached.lock());
        for result in futures::future::join_all(detached).await {
            if let Err(e) = result {
                warn!(error = %e, "Abandoned environment teardown aborted");
            }
        }
    }

    pub fn available(&self) -> ResourceVector {
        self.ledger.available()
    }

    pub fn capacity(&self) -> ResourceVector {
        self.ledger.capacity()
    }

    pub fn stats(&self, filter: &StatsFilter) -> RunnerStats {
        let instances = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|i| filter.matches(i))
            .collect();

        RunnerStats {
            server_time: unix_seconds(Utc::now()),
            uptime_s: self.started_at.elapsed().as_secs_f64(),
            active_instances: self.registry.len(),
            total_instances: self.registry.total_started(),
            max_resources: self.ledger.capacity(),
            allocated_resources: self.ledger.allocated(),
            available_resources: self.ledger.available(),
            container_counts: self.registry.container_counts(),
            metrics: self.metrics.snapshot(),
            instances,
        }
    }
}
