//! Per-zone mutual exclusion for multi-call remote sequences.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One lock per configured zone.
///
/// Built once at startup from every account's zones and shared read-only
/// between workers; the set of zones never changes afterwards.
#[derive(Debug, Default)]
pub struct ZoneLockTable {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ZoneLockTable {
    pub fn new<I, S>(zone_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locks = zone_ids
            .into_iter()
            .map(|id| (id.into(), Arc::new(Mutex::new(()))))
            .collect();
        Self { locks }
    }

    /// Wait for the zone's lock. The guard releases it when dropped.
    ///
    /// Zones outside the table (e.g. unmanaged zones visible to the
    /// credential) have no lock and yield `None`.
    pub async fn lock(&self, zone_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.get(zone_id)?.clone();
        Some(lock.lock_owned().await)
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.locks.contains_key(zone_id)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
