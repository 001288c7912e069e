use crate::environment::Environment;
use crate::error::{Result, RolloutError};
use crate::resources::ResourceVector;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An environment shared between in-flight commands and teardown. Holding the
/// async lock serializes work against one instance.
pub type SharedEnvironment = Arc<tokio::sync::Mutex<Box<dyn Environment>>>;

/// Bookkeeping for one live instance
pub struct InstanceRecord {
    pub run_id: String,
    /// Preset or caller label the instance was started from
    pub descriptor: String,
    pub backend: &'static str,
    pub handle: Option<String>,
    pub reserved: ResourceVector,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub command_count: u64,
    seq: u64,
    environment: SharedEnvironment,
}

impl InstanceRecord {
    pub fn environment(&self) -> SharedEnvironment {
        self.environment.clone()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.command_count += 1;
        self.updated_at = Some(match self.updated_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            run_id: self.run_id.clone(),
            container_name: self.descriptor.clone(),
            backend: self.backend.to_string(),
            handle: self.handle.clone(),
            created_at: unix_seconds(self.created_at),
            updated_at: self.updated_at.map(unix_seconds),
            num_cmd: self.command_count,
        }
    }
}

/// Serializable view of one record for `/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub run_id: String,
    pub container_name: String,
    pub backend: String,
    #[serde(default)]
    pub handle: Option<String>,
    pub created_at: f64,
    pub updated_at: Option<f64>,
    pub num_cmd: u64,
}

pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

enum Slot {
    /// Claimed by a `start` that has not finished provisioning
    Starting,
    Live(InstanceRecord),
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    next_seq: u64,
    total_started: u64,
}

/// run_id -> instance map. A run id is claimed before any resources are
/// charged, so a second `start` for it fails fast, and it only becomes
/// visible to `execute`/`close` once committed.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: Mutex<Inner>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `run_id` for a starting instance
    pub fn claim(&self, run_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.slots.contains_key(run_id) {
            return Err(RolloutError::DuplicateInstance {
                run_id: run_id.to_string(),
            });
        }
        inner.slots.insert(run_id.to_string(), Slot::Starting);
        Ok(())
    }

    /// Drop a claim whose start failed
    pub fn abandon(&self, run_id: &str) {
        let mut inner = self.inner.lock();
        if matches!(inner.slots.get(run_id), Some(Slot::Starting)) {
            inner.slots.remove(run_id);
        }
    }

    /// Turn a claim into a live record owning `environment`
    pub fn commit(
        &self,
        run_id: &str,
        descriptor: &str,
        reserved: ResourceVector,
        environment: Box<dyn Environment>,
    ) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_started += 1;

        let record = InstanceRecord {
            run_id: run_id.to_string(),
            descriptor: descriptor.to_string(),
            backend: environment.kind(),
            handle: environment.handle(),
            reserved,
            created_at: Utc::now(),
            updated_at: None,
            command_count: 0,
            seq,
            environment: Arc::new(tokio::sync::Mutex::new(environment)),
        };
        inner.slots.insert(run_id.to_string(), Slot::Live(record));
    }

    pub fn environment(&self, run_id: &str) -> Result<SharedEnvironment> {
        match self.inner.lock().slots.get(run_id) {
            Some(Slot::Live(record)) => Ok(record.environment()),
            _ => Err(RolloutError::not_found(run_id)),
        }
    }

    /// Whether `run_id` is still live and backed by `environment`
    pub fn is_current(&self, run_id: &str, environment: &SharedEnvironment) -> bool {
        match self.inner.lock().slots.get(run_id) {
            Some(Slot::Live(record)) => Arc::ptr_eq(&record.environment, environment),
            _ => false,
        }
    }

    /// Count one command against the record that ran it. A record closed or
    /// replaced under the same run id meanwhile is skipped.
    pub fn record_command(&self, run_id: &str, environment: &SharedEnvironment) {
        if let Some(Slot::Live(record)) = self.inner.lock().slots.get_mut(run_id) {
            if Arc::ptr_eq(&record.environment, environment) {
                record.touch(Utc::now());
            }
        }
    }

    /// Remove a live record, handing ownership to the caller
    pub fn take(&self, run_id: &str) -> Option<InstanceRecord> {
        let mut inner = self.inner.lock();
        match inner.slots.get(run_id) {
            Some(Slot::Live(_)) => match inner.slots.remove(run_id) {
                Some(Slot::Live(record)) => Some(record),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove every live record, oldest first
    pub fn drain(&self) -> Vec<InstanceRecord> {
        let mut inner = self.inner.lock();
        let live: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let mut records: Vec<InstanceRecord> = live
            .iter()
            .filter_map(|id| match inner.slots.remove(id) {
                Some(Slot::Live(record)) => Some(record),
                _ => None,
            })
            .collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn get(&self, run_id: &str) -> Option<InstanceSnapshot> {
        match self.inner.lock().slots.get(run_id) {
            Some(Slot::Live(record)) => Some(record.snapshot()),
            _ => None,
        }
    }

    /// Live records in start order
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let inner = self.inner.lock();
        let mut records: Vec<&InstanceRecord> = inner
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(record) => Some(record),
                Slot::Starting => None,
            })
            .collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(InstanceRecord::snapshot).collect()
    }

    /// Live instances per descriptor
    pub fn container_counts(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = BTreeMap::new();
        for slot in inner.slots.values() {
            if let Slot::Live(record) = slot {
                *counts.entry(record.descriptor.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn contains(&self, run_id: &str) -> bool {
        matches!(self.inner.lock().slots.get(run_id), Some(Slot::Live(_)))
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims still provisioning
    pub fn starting(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Starting))
            .count()
    }

    /// Instances committed since the registry was created
    pub fn total_started(&self) -> u64 {
        self.inner.lock().total_started
    }
}
