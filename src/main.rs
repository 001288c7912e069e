use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use rollout::config::{parse_max_resources, Presets, RunnerMode};
use rollout::constants::{DEFAULT_MAX_RESOURCES, DEFAULT_POLL_URL, DEFAULT_PORT};
use rollout::environment::EnvironmentFactory;
use rollout::logging::init_logging;
use rollout::poll::{self, PollOptions};
use rollout::runner::{Runner, RunnerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollout", author, version, about = "Sandbox rollout service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Runner flavour
        #[arg(long, value_enum, env = "ROLLOUT_RUNNER")]
        runner: RunnerMode,
        #[arg(long, default_value = "0.0.0.0", env = "ROLLOUT_HOST")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT, env = "ROLLOUT_PORT")]
        port: u16,
        /// Capacity as JSON, e.g. '{"instances": 10, "gpus": 4}'
        #[arg(long, default_value = DEFAULT_MAX_RESOURCES, env = "ROLLOUT_MAX_RESOURCES")]
        max_resources: String,
        /// JSON file of named environment presets
        #[arg(long, env = "ROLLOUT_ENVIRONMENTS")]
        environments: Option<PathBuf>,
        /// Emit logs as JSON lines
        #[arg(long, env = "ROLLOUT_JSON_LOGS")]
        json_logs: bool,
    },
    /// Watch a running service's stats
    Poll {
        #[arg(long, default_value = DEFAULT_POLL_URL)]
        url: String,
        /// List active instances
        #[arg(long)]
        list: bool,
        /// Print the raw JSON response
        #[arg(long)]
        raw: bool,
        /// Seconds between refreshes
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
    },
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            runner,
            host,
            port,
            max_resources,
            environments,
            json_logs,
        } => {
            init_logging(json_logs).map_err(|e| anyhow::anyhow!("failed to init logging: {}", e))?;
            serve(runner, host, port, &max_resources, environments).await
        }
        Commands::Poll {
            url,
            list,
            raw,
            interval,
        } => {
            if !interval.is_finite() || interval <= 0.0 {
                anyhow::bail!("--interval must be a positive number of seconds");
            }
            poll::run(PollOptions {
                url,
                list,
                raw,
                interval: Duration::from_secs_f64(interval),
            })
            .await
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "rollout", &mut std::io::stdout());
            Ok(())
        }
    }
}

#[cfg(feature = "server")]
async fn serve(
    mode: RunnerMode,
    host: String,
    port: u16,
    max_resources: &str,
    environments: Option<PathBuf>,
) -> Result<()> {
    use rollout::server::{self, AppState};

    let max_resources = parse_max_resources(max_resources)?;
    let presets = match environments {
        Some(path) => Presets::load(&path)
            .with_context(|| format!("loading environments from {}", path.display()))?,
        None => Presets::new(),
    };

    let factory = EnvironmentFactory::with_builtin_backends().with_default_tag(mode.default_backend());
    let runner = Arc::new(Runner::new(
        factory,
        RunnerOptions {
            max_resources: max_resources.clone(),
            close_policy: mode.close_policy(),
        },
    ));
    tracing::info!(
        runner = mode.as_str(),
        max_resources = %max_resources,
        presets = ?presets.names(),
        "Starting rollout service"
    );

    let state = Arc::new(AppState {
        runner: runner.clone(),
        presets,
    });
    let result = server::start_server(&host, port, state, shutdown_signal()).await;

    runner.shutdown().await;
    tracing::info!("Rollout service stopped");
    result
}

#[cfg(not(feature = "server"))]
async fn serve(
    _mode: RunnerMode,
    _host: String,
    _port: u16,
    _max_resources: &str,
    _environments: Option<PathBuf>,
) -> Result<()> {
    anyhow::bail!("Server feature not enabled. Rebuild with --features server");
}

#[cfg(feature = "server")]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
