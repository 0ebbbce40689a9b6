// src/core/instance.rs

//! DAQ instance identity and the process-wide free-instance pool.

use crate::core::CoordinatorError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One data-acquisition process on one host, named `host/index`. The same
/// host may expose multiple indices (one per NVMe buffer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instance {
    host: String,
    number: u8,
}

impl Instance {
    pub fn new(host: impl Into<String>, number: u8) -> Self {
        Self {
            host: host.into(),
            number,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The instance index on its host. Chooses the `/buf<n>` volume and the
    /// `<array>-<n>` gateway group.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Splits the host name into its alphabetic prefix and trailing number,
    /// so that `blpn9` sorts before `blpn10`.
    fn host_sort_key(&self) -> (&str, u64) {
        let digits_at = self
            .host
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        let prefix = &self.host[..digits_at];
        let num = self.host[digits_at..].parse::<u64>().unwrap_or(0);
        (prefix, num)
    }
}

impl Ord for Instance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host_sort_key()
            .cmp(&other.host_sort_key())
            .then_with(|| self.number.cmp(&other.number))
    }
}

impl PartialOrd for Instance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.number)
    }
}

impl FromStr for Instance {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, number) = s
            .split_once('/')
            .ok_or_else(|| CoordinatorError::BadInstance(s.to_string()))?;
        if host.is_empty() {
            return Err(CoordinatorError::BadInstance(s.to_string()));
        }
        let number = number
            .parse::<u8>()
            .map_err(|_| CoordinatorError::BadInstance(s.to_string()))?;
        Ok(Self::new(host, number))
    }
}

impl TryFrom<String> for Instance {
    type Error = CoordinatorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Instance> for String {
    fn from(i: Instance) -> Self {
        i.to_string()
    }
}

/// An ordered set of instances. Ordering matters for deterministic group
/// allocation: the first instance claims the first block of streams.
pub type InstanceSet = BTreeSet<Instance>;

/// The process-wide set of instances not subscribed to any subarray. Shared
/// across all subarray state machines; mutated only inside Free/Subscribed
/// entry actions, and never while awaiting.
#[derive(Debug, Default)]
pub struct InstancePool {
    inner: Mutex<InstanceSet>,
}

impl InstancePool {
    pub fn new(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            inner: Mutex::new(instances.into_iter().collect()),
        }
    }

    /// Claims up to `n` instances in natural order. May return fewer than
    /// requested when the pool is short.
    pub fn take(&self, n: usize) -> InstanceSet {
        let mut pool = self.inner.lock();
        let claimed: InstanceSet = pool.iter().take(n).cloned().collect();
        for instance in &claimed {
            pool.remove(instance);
        }
        claimed
    }

    /// Returns instances to the pool after a subarray releases them.
    pub fn release(&self, instances: impl IntoIterator<Item = Instance>) {
        let mut pool = self.inner.lock();
        pool.extend(instances);
    }

    /// Replaces the whole pool, used when restoring persisted state.
    pub fn replace(&self, instances: InstanceSet) {
        *self.inner.lock() = instances;
    }

    pub fn snapshot(&self) -> InstanceSet {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
