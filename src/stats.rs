use crate::logging::MetricsSnapshot;
use crate::registry::InstanceSnapshot;
use crate::resources::ResourceVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Substring filters for the instance list in `/stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFilter {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
}

impl StatsFilter {
    pub fn matches(&self, instance: &InstanceSnapshot) -> bool {
        fn hit(filter: &Option<String>, value: &str) -> bool {
            match filter.as_deref() {
                Some(needle) if !needle.is_empty() => value.contains(needle),
                _ => true,
            }
        }
        hit(&self.run_id, &instance.run_id) && hit(&self.container, &instance.container_name)
    }
}

/// Point-in-time view of a runner, served by `/stats` and read by `poll`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStats {
    pub server_time: f64,
    pub uptime_s: f64,
    pub active_instances: usize,
    pub total_instances: u64,
    pub max_resources: ResourceVector,
    pub allocated_resources: ResourceVector,
    pub available_resources: ResourceVector,
    /// Live instances per descriptor, unfiltered
    pub container_counts: BTreeMap<String, usize>,
    pub metrics: MetricsSnapshot,
    pub instances: Vec<InstanceSnapshot>,
}

impl RunnerStats {
    /// Fraction of the primary dimension in use
    pub fn utilization(&self, dimension: &str) -> f64 {
        let capacity = self.max_resources.get(dimension);
        if capacity == 0 {
            0.0
        } else {
            self.allocated_resources.get(dimension) as f64 / capacity as f64
        }
    }
}
