//! Terminal view of a running service's `/stats`

use crate::constants::{POLL_REQUEST_TIMEOUT_SECS, PRIMARY_RESOURCE};
use crate::registry::InstanceSnapshot;
use crate::stats::RunnerStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub url: String,
    pub list: bool,
    pub raw: bool,
    pub interval: Duration,
}

pub fn format_timestamp(ts: Option<f64>) -> String {
    ts.and_then(|secs| DateTime::<Utc>::from_timestamp_millis((secs * 1000.0) as i64))
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

pub fn render_summary(stats: &RunnerStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", "Server time:".bold(), format_timestamp(Some(stats.server_time)));
    let _ = writeln!(out, "{} {:.1}s", "Uptime:".bold(), stats.uptime_s);
    let _ = writeln!(
        out,
        "{} {}/{}",
        "Active instances:".bold(),
        stats.active_instances.to_string().green(),
        stats.total_instances
    );
    let _ = writeln!(
        out,
        "{} {}/{} allocated, {} available",
        "Resources (inst):".bold(),
        stats.allocated_resources.get(PRIMARY_RESOURCE),
        stats.max_resources.get(PRIMARY_RESOURCE),
        stats.available_resources.get(PRIMARY_RESOURCE)
    );

    let other: Vec<String> = stats
        .max_resources
        .iter()
        .filter(|(k, _)| *k != PRIMARY_RESOURCE)
        .map(|(k, cap)| format!("{}={}/{}", k, stats.allocated_resources.get(k), cap))
        .collect();
    if !other.is_empty() {
        let _ = writeln!(out, "{} {}", "Other resources:".bold(), other.join(", "));
    }

    let m = &stats.metrics;
    let failures = if m.command_failures > 0 {
        m.command_failures.to_string().red()
    } else {
        m.command_failures.to_string().normal()
    };
    let _ = writeln!(
        out,
        "{} {} started, {} rejected, {} commands ({} failed), {} teardown failures",
        "Lifecycle:".bold(),
        m.starts,
        m.rejected_starts,
        m.commands,
        failures,
        m.teardown_failures
    );

    if !stats.container_counts.is_empty() {
        let _ = writeln!(out, "{}", "Containers:".bold());
        for (container, count) in &stats.container_counts {
            let _ = writeln!(out, "  {}: {}", container.cyan(), count);
        }
    }
    out
}

pub fn render_instances(instances: &[InstanceSnapshot]) -> String {
    if instances.is_empty() {
        return "No active instances.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", "Active instances:".bold());
    let _ = writeln!(
        out,
        "  {:36}  {:18}  {:10}  {:>5}  {}",
        "run_id", "container", "backend", "cmds", "created_at"
    );
    for item in instances {
        let _ = writeln!(
            out,
            "  {:36}  {:18}  {:10}  {:>5}  {}",
            item.run_id,
            item.container_name,
            item.backend,
            item.num_cmd,
            format_timestamp(Some(item.created_at))
        );
    }
    out
}

/// Fetch `/stats` once and render it
pub async fn poll_once(client: &reqwest::Client, opts: &PollOptions) -> Result<String> {
    let url = format!("{}/stats", opts.url.trim_end_matches('/'));
    let body: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("stats response is not JSON")?;

    if opts.raw {
        return Ok(serde_json::to_string_pretty(&body)?);
    }

    let stats: RunnerStats =
        serde_json::from_value(body).context("unexpected stats document")?;
    let mut out = render_summary(&stats);
    if opts.list {
        out.push_str(&render_instances(&stats.instances));
    }
    Ok(out)
}

/// Redraw the stats every `interval` until Ctrl+C
pub async fn run(opts: PollOptions) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(POLL_REQUEST_TIMEOUT_SECS))
        .build()?;
    let mut ticker = tokio::time::interval(opts.interval.max(MIN_INTERVAL));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            _ = ticker.tick() => {
                let text = match poll_once(&client, &opts).await {
                    Ok(text) => text,
                    Err(e) => format!("{} {:#}", "Error fetching stats:".red(), e),
                };
                let mut stdout = std::io::stdout().lock();
                write!(stdout, "\x1b[H\x1b[J{}", text)?;
                if !text.ends_with('\n') {
                    writeln!(stdout)?;
                }
                stdout.flush()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MetricsSnapshot;
    use crate::resources::ResourceVector;
    use std::collections::BTreeMap;

    fn stats() -> RunnerStats {
        let mut container_counts = BTreeMap::new();
        container_counts.insert("ubuntu".to_string(), 2);
        RunnerStats {
            server_time: 1_700_000_000.0,
            uptime_s: 12.34,
            active_instances: 2,
            total_instances: 5,
            max_resources: [("instances", 4), ("gpus", 2)].into_iter().collect(),
            allocated_resources: [("instances", 2), ("gpus", 1)].into_iter().collect(),
            available_resources: [("instances", 2), ("gpus", 1)].into_iter().collect(),
            container_counts,
            metrics: MetricsSnapshot::default(),
            instances: vec![InstanceSnapshot {
                run_id: "eval-1".into(),
                container_name: "ubuntu".into(),
                backend: "docker".into(),
                handle: None,
                created_at: 1_700_000_000.5,
                updated_at: None,
                num_cmd: 3,
            }],
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(None), "never");
        assert_eq!(format_timestamp(Some(0.0)), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_render_summary() {
        colored::control::set_override(false);
        let text = render_summary(&stats());
        assert!(text.contains("Uptime: 12.3s"));
        assert!(text.contains("Active instances: 2/5"));
        assert!(text.contains("Resources (inst): 2/4 allocated, 2 available"));
        assert!(text.contains("gpus=1/2"));
        assert!(text.contains("  ubuntu: 2"));
    }

    #[test]
    fn test_render_instances() {
        colored::control::set_override(false);
        assert_eq!(render_instances(&[]), "No active instances.\n");
        let text = render_instances(&stats().instances);
        assert!(text.contains("eval-1"));
        assert!(text.contains("2023-11-14T22:13:20.500+00:00"));
    }

    #[test]
    fn test_summary_without_extra_dimensions() {
        colored::control::set_override(false);
        let mut s = stats();
        s.max_resources = ResourceVector::single("instances", 4);
        s.container_counts.clear();
        let text = render_summary(&s);
        assert!(!text.contains("Other resources"));
        assert!(!text.contains("Containers:"));
    }
}
