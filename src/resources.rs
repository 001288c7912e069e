use crate::constants::PRIMARY_RESOURCE;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Quantities per named resource dimension ("instances", "gpus", ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, u64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(dimension: &str, amount: u64) -> Self {
        let mut v = Self::new();
        v.set(dimension, amount);
        v
    }

    /// One unit of the primary dimension, charged when a request names nothing
    pub fn one_instance() -> Self {
        Self::single(PRIMARY_RESOURCE, 1)
    }

    pub fn get(&self, dimension: &str) -> u64 {
        self.0.get(dimension).copied().unwrap_or(0)
    }

    pub fn set(&mut self, dimension: &str, amount: u64) {
        self.0.insert(dimension.to_string(), amount);
    }

    pub fn contains(&self, dimension: &str) -> bool {
        self.0.contains_key(dimension)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for ResourceVector {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Admission control over a fixed capacity vector.
///
/// `allocated` only moves under the ledger's lock, so two callers racing for
/// the last unit can never both be admitted.
pub struct ResourceLedger {
    capacity: ResourceVector,
    allocated: Mutex<ResourceVector>,
}

impl ResourceLedger {
    pub fn new(capacity: ResourceVector) -> Self {
        let allocated = capacity.iter().map(|(k, _)| (k, 0)).collect();
        Self {
            capacity,
            allocated: Mutex::new(allocated),
        }
    }

    pub fn capacity(&self) -> ResourceVector {
        self.capacity.clone()
    }

    pub fn allocated(&self) -> ResourceVector {
        self.allocated.lock().clone()
    }

    pub fn available(&self) -> ResourceVector {
        let allocated = self.allocated.lock();
        Self::available_locked(&self.capacity, &allocated)
    }

    fn available_locked(capacity: &ResourceVector, allocated: &ResourceVector) -> ResourceVector {
        capacity
            .iter()
            .map(|(k, cap)| (k, cap.saturating_sub(allocated.get(k))))
            .collect()
    }

    /// Charge `request` if every capacity-tracked dimension fits; otherwise leave
    /// the ledger untouched. Dimensions unknown to the capacity are free.
    pub fn try_allocate(&self, request: &ResourceVector) -> bool {
        let mut allocated = self.allocated.lock();
        let available = Self::available_locked(&self.capacity, &allocated);

        let fits = request
            .iter()
            .filter(|(k, _)| self.capacity.contains(k))
            .all(|(k, amount)| available.get(k) >= amount);
        if !fits {
            return false;
        }

        for (k, amount) in request.iter() {
            if self.capacity.contains(k) {
                let current = allocated.get(k);
                allocated.set(k, current + amount);
            }
        }
        true
    }

    /// Return `request` to the pool, flooring each dimension at zero
    pub fn release(&self, request: &ResourceVector) {
        let mut allocated = self.allocated.lock();
        for (k, amount) in request.iter() {
            if self.capacity.contains(k) {
                let current = allocated.get(k);
                allocated.set(k, current.saturating_sub(amount));
            }
        }
    }
}
