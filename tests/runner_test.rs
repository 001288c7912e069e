/// Lifecycle tests for the runner against scripted environments
#[cfg(test)]
mod runner_tests {
    use async_trait::async_trait;
    use rollout::environment::{BackendConfig, Environment, EnvironmentFactory, ExecOptions, ExecOutput};
    use rollout::runner::{ClosePolicy, Runner, RunnerOptions};
    use rollout::stats::StatsFilter;
    use rollout::{ResourceVector, Result, RolloutError};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Counts calls across every environment built by one factory
    #[derive(Default)]
    struct CallCounts {
        creates: AtomicUsize,
        destroys: AtomicUsize,
        commands: AtomicUsize,
    }

    /// Behaviour is read from the backend config:
    /// `fail_create`, `fail_destroy` and `exit_code`
    struct ScriptedEnvironment {
        calls: Arc<CallCounts>,
        fail_create: bool,
        fail_destroy: bool,
        exit_code: i32,
        live: bool,
    }

    #[async_trait]
    impl Environment for ScriptedEnvironment {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn handle(&self) -> Option<String> {
            self.live.then(|| "scripted-0".to_string())
        }

        async fn create(&mut self) -> Result<()> {
            self.calls.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(RolloutError::provision("scripted", "image not found"));
            }
            self.live = true;
            Ok(())
        }

        async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
            self.calls.commands.fetch_add(1, Ordering::SeqCst);
            match command {
                "hang" => Err(RolloutError::ExecutionTimeout {
                    timeout: opts.resolve_timeout(30),
                }),
                "crash" => Err(RolloutError::execution("scripted", "sandbox vanished")),
                _ => Ok(ExecOutput {
                    output: format!("{} @ {}", command, opts.resolve_cwd("/")),
                    exit_code: self.exit_code,
                }),
            }
        }

        async fn destroy(&mut self) -> Result<()> {
            self.calls.destroys.fetch_add(1, Ordering::SeqCst);
            self.live = false;
            if self.fail_destroy {
                return Err(RolloutError::execution("scripted", "rm failed"));
            }
            Ok(())
        }
    }

    fn factory(calls: Arc<CallCounts>) -> EnvironmentFactory {
        let mut factory = EnvironmentFactory::new();
        factory.register("scripted", move |config: BackendConfig| {
            let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);
            Ok(Box::new(ScriptedEnvironment {
                calls: calls.clone(),
                fail_create: flag("fail_create"),
                fail_destroy: flag("fail_destroy"),
                exit_code: config
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as i32,
                live: false,
            }) as Box<dyn Environment>)
        });
        factory
    }

    fn runner_with(capacity: ResourceVector, policy: ClosePolicy) -> (Runner, Arc<CallCounts>) {
        let calls = Arc::new(CallCounts::default());
        let runner = Runner::new(
            factory(calls.clone()),
            RunnerOptions {
                max_resources: capacity,
                close_policy: policy,
            },
        );
        (runner, calls)
    }

    fn runner(instances: u64) -> (Runner, Arc<CallCounts>) {
        runner_with(ResourceVector::single("instances", instances), ClosePolicy::Strict)
    }

    fn scripted(extra: Value) -> BackendConfig {
        let mut config = BackendConfig::new();
        config.insert("container_type".into(), json!("scripted"));
        if let Value::Object(map) = extra {
            config.extend(map);
        }
        config
    }

    fn instances(runner: &Runner) -> u64 {
        runner.available().get("instances")
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let (runner, _) = runner(2);

        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();
        assert_eq!(instances(&runner), 1);
        runner.start("b", "ubuntu", scripted(json!({}))).await.unwrap();
        assert_eq!(instances(&runner), 0);

        let err = runner.start("c", "ubuntu", scripted(json!({}))).await.unwrap_err();
        assert!(matches!(err, RolloutError::InsufficientResources { .. }));
        assert_eq!(instances(&runner), 0);

        runner.close("a").await.unwrap();
        assert_eq!(instances(&runner), 1);
        runner.start("c", "ubuntu", scripted(json!({}))).await.unwrap();
        assert_eq!(instances(&runner), 0);
    }

    #[tokio::test]
    async fn test_rejected_start_reports_availability() {
        let (runner, calls) = runner(1);
        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();

        match runner.start("b", "ubuntu", scripted(json!({}))).await {
            Err(RolloutError::InsufficientResources { requested, available }) => {
                assert_eq!(requested.get("instances"), 1);
                assert_eq!(available.get("instances"), 0);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
        assert_eq!(runner.metrics().snapshot().rejected_starts, 1);
    }

    #[tokio::test]
    async fn test_start_close_cycles_restore_availability() {
        let (runner, calls) = runner(3);
        for i in 0..10 {
            let before = runner.available();
            let run_id = format!("run-{}", i);
            runner.start(&run_id, "ubuntu", scripted(json!({}))).await.unwrap();
            runner.close(&run_id).await.unwrap();
            assert_eq!(runner.available(), before);
        }
        assert_eq!(calls.creates.load(Ordering::SeqCst), 10);
        assert_eq!(calls.destroys.load(Ordering::SeqCst), 10);
        assert!(runner.registry().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_leaves_ledger_alone() {
        let (runner, calls) = runner(4);
        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();
        let before = runner.available();

        let err = runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap_err();
        assert!(matches!(err, RolloutError::DuplicateInstance { .. }));
        assert_eq!(runner.available(), before);
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_id_is_not_found() {
        let (runner, calls) = runner(2);
        let before = runner.available();

        let err = runner
            .execute("ghost", "ls", &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::InstanceNotFound { .. }));

        let err = runner.close("ghost").await.unwrap_err();
        assert!(matches!(err, RolloutError::InstanceNotFound { .. }));

        assert_eq!(runner.available(), before);
        assert_eq!(calls.commands.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lenient_close_ignores_unknown() {
        let (runner, _) = runner_with(ResourceVector::single("instances", 1), ClosePolicy::Lenient);
        runner.close("ghost").await.unwrap();

        runner.start("a", "slurm", scripted(json!({}))).await.unwrap();
        runner.close("a").await.unwrap();
        runner.close("a").await.unwrap();
        assert_eq!(instances(&runner), 1);
    }

    #[tokio::test]
    async fn test_close_releases_even_when_destroy_fails() {
        let (runner, calls) = runner(1);
        runner
            .start("a", "ubuntu", scripted(json!({ "fail_destroy": true })))
            .await
            .unwrap();
        assert_eq!(instances(&runner), 0);

        runner.close("a").await.unwrap();
        assert_eq!(instances(&runner), 1);
        assert_eq!(calls.destroys.load(Ordering::SeqCst), 1);

        let metrics = runner.metrics().snapshot();
        assert_eq!(metrics.closes, 1);
        assert_eq!(metrics.teardown_failures, 1);
    }

    #[tokio::test]
    async fn test_provision_failure_compensates() {
        let (runner, calls) = runner(1);
        let before = runner.available();

        let err = runner
            .start("a", "ubuntu", scripted(json!({ "fail_create": true })))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::BackendProvision { .. }));
        assert_eq!(runner.available(), before);
        assert!(runner.registry().is_empty());
        // the half-built environment is still torn down
        assert_eq!(calls.destroys.load(Ordering::SeqCst), 1);

        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_backend_compensates() {
        let (runner, calls) = runner(1);
        let mut config = BackendConfig::new();
        config.insert("container_type".into(), json!("firecracker"));

        let err = runner.start("a", "vm", config).await.unwrap_err();
        assert!(matches!(err, RolloutError::UnknownBackend { .. }));
        assert_eq!(instances(&runner), 1);
        assert_eq!(calls.creates.load(Ordering::SeqCst), 0);
        assert_eq!(runner.metrics().snapshot().provision_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_counts_commands() {
        let (runner, _) = runner(1);
        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();

        let mut last = 0.0;
        for _ in 0..3 {
            let out = runner
                .execute("a", "echo hi", &ExecOptions::default())
                .await
                .unwrap();
            assert_eq!(out.output, "echo hi @ /");
            let updated = runner.registry().get("a").unwrap().updated_at.unwrap();
            assert!(updated >= last);
            last = updated;
        }
        assert_eq!(runner.registry().get("a").unwrap().num_cmd, 3);
        assert_eq!(instances(&runner), 0);
    }

    #[tokio::test]
    async fn test_execute_passes_results_through() {
        let (runner, _) = runner(1);
        runner
            .start("a", "ubuntu", scripted(json!({ "exit_code": 2 })))
            .await
            .unwrap();

        let opts = ExecOptions {
            cwd: Some("/work".into()),
            timeout: None,
        };
        let out = runner.execute("a", "false", &opts).await.unwrap();
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.output, "false @ /work");

        let err = runner.execute("a", "hang", &opts).await.unwrap_err();
        match err {
            RolloutError::ExecutionTimeout { timeout } => assert_eq!(timeout, Duration::from_secs(30)),
            other => panic!("unexpected error: {}", other),
        }
        let err = runner.execute("a", "crash", &opts).await.unwrap_err();
        assert!(matches!(err, RolloutError::Execution { .. }));

        // failures still count as commands and leave the instance live
        assert_eq!(runner.registry().get("a").unwrap().num_cmd, 3);
        let metrics = runner.metrics().snapshot();
        assert_eq!(metrics.commands, 3);
        assert_eq!(metrics.command_failures, 3);
        runner.execute("a", "true", &opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_dimension_requests() {
        let capacity: ResourceVector = [("instances", 4), ("gpus", 1)].into_iter().collect();
        let (runner, _) = runner_with(capacity, ClosePolicy::Strict);

        let gpu = json!({ "resources": { "instances": 1, "gpus": 1 } });
        runner.start("a", "cuda", scripted(gpu.clone())).await.unwrap();
        let err = runner.start("b", "cuda", scripted(gpu.clone())).await.unwrap_err();
        assert!(matches!(err, RolloutError::InsufficientResources { .. }));
        assert_eq!(runner.available().get("instances"), 3);

        // dimensions the service does not track are free
        runner
            .start("c", "cpu", scripted(json!({ "resources": { "instances": 1, "tpus": 8 } })))
            .await
            .unwrap();
        assert_eq!(runner.available().get("instances"), 2);
        assert!(!runner.available().contains("tpus"));

        runner.close("a").await.unwrap();
        runner.start("b", "cuda", scripted(gpu)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_resources_rejected_before_claim() {
        let (runner, calls) = runner(1);
        let err = runner
            .start("a", "ubuntu", scripted(json!({ "resources": "lots" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::InvalidConfig(_)));
        assert_eq!(calls.creates.load(Ordering::SeqCst), 0);
        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_race_for_last_slot() {
        let (runner, calls) = runner(1);
        let runner = Arc::new(runner);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner
                        .start(&format!("r{}", i), "ubuntu", scripted(json!({})))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(RolloutError::InsufficientResources { .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
        assert_eq!(instances(&runner), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_starts() {
        let (runner, _) = runner(8);
        let runner = Arc::new(runner);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.start("same", "ubuntu", scripted(json!({}))).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RolloutError::DuplicateInstance { .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(instances(&runner), 7);
    }

    #[tokio::test]
    async fn test_stats_document() {
        let (runner, _) = runner(4);
        runner.start("eval-1", "ubuntu", scripted(json!({}))).await.unwrap();
        runner.start("eval-2", "python", scripted(json!({}))).await.unwrap();
        runner.start("train-1", "ubuntu", scripted(json!({}))).await.unwrap();
        runner.close("eval-2").await.unwrap();
        runner
            .execute("train-1", "ls", &ExecOptions::default())
            .await
            .unwrap();

        let stats = runner.stats(&StatsFilter::default());
        assert_eq!(stats.active_instances, 2);
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.max_resources.get("instances"), 4);
        assert_eq!(stats.allocated_resources.get("instances"), 2);
        assert_eq!(stats.available_resources.get("instances"), 2);
        assert_eq!(stats.container_counts.get("ubuntu"), Some(&2));
        assert!(!stats.container_counts.contains_key("python"));
        assert_eq!(stats.metrics.starts, 3);
        assert_eq!(stats.metrics.closes, 1);

        let ids: Vec<&str> = stats.instances.iter().map(|i| i.run_id.as_str()).collect();
        assert_eq!(ids, vec!["eval-1", "train-1"]);
        assert_eq!(stats.instances[1].num_cmd, 1);
        assert_eq!(stats.instances[1].backend, "scripted");
        assert_eq!(stats.instances[1].handle.as_deref(), Some("scripted-0"));

        let filtered = runner.stats(&StatsFilter {
            run_id: Some("train".into()),
            container: None,
        });
        assert_eq!(filtered.instances.len(), 1);
        assert_eq!(filtered.container_counts.get("ubuntu"), Some(&2));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (runner, calls) = runner(3);
        runner.start("a", "ubuntu", scripted(json!({}))).await.unwrap();
        runner
            .start("b", "ubuntu", scripted(json!({ "fail_destroy": true })))
            .await
            .unwrap();
        runner.start("c", "ubuntu", scripted(json!({}))).await.unwrap();

        runner.shutdown().await;
        assert!(runner.registry().is_empty());
        assert_eq!(calls.destroys.load(Ordering::SeqCst), 3);
        assert_eq!(instances(&runner), 3);

        runner.shutdown().await;
        assert_eq!(calls.destroys.load(Ordering::SeqCst), 3);
    }
}
