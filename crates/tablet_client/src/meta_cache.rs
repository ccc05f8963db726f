//! Cache of tablet row-range to leader mappings.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::rpc::TabletId;

/// Where one tablet lives, as last reported by the master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletLocation {
    pub tablet_id: TabletId,
    pub table_name: String,
    /// Inclusive start of the encoded key range; empty means unbounded.
    pub start_key: Bytes,
    /// Exclusive end of the encoded key range; empty means unbounded.
    pub end_key: Bytes,
    pub leader: SocketAddr,
    /// Bumped by the master whenever the leader changes.
    pub epoch: u64,
}

impl TabletLocation {
    pub fn contains(&self, key: &[u8]) -> bool {
        let in_start = self.start_key.is_empty() || key >= self.start_key.as_ref();
        let in_end = self.end_key.is_empty() || key < self.end_key.as_ref();
        in_start && in_end
    }
}

struct TableEntry {
    tablets: BTreeMap<Bytes, TabletLocation>,
    refreshed_at: Instant,
}

pub struct TabletLocationCache {
    ttl: Duration,
    tables: RwLock<HashMap<String, TableEntry>>,
}

impl TabletLocationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Tablet covering `key`, unless missing or the table entry expired.
    pub fn lookup(&self, table: &str, key: &[u8]) -> Option<TabletLocation> {
        let guard = self.tables.read().ok()?;
        let entry = guard.get(table)?;
        if entry.refreshed_at.elapsed() > self.ttl {
            return None;
        }
        let (_, location) = entry
            .tablets
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        location.contains(key).then(|| location.clone())
    }

    /// Every cached tablet of `table` in key order, if fresh.
    pub fn tablets(&self, table: &str) -> Option<Vec<TabletLocation>> {
        let guard = self.tables.read().ok()?;
        let entry = guard.get(table)?;
        if entry.refreshed_at.elapsed() > self.ttl || entry.tablets.is_empty() {
            return None;
        }
        Some(entry.tablets.values().cloned().collect())
    }

    /// Replace the entry for `table` with a fresh master response.
    ///
    /// A tablet already cached at a newer epoch keeps its cached leader.
    pub fn update(&self, table: &str, locations: Vec<TabletLocation>) {
        let Ok(mut guard) = self.tables.write() else {
            return;
        };
        let previous = guard.remove(table);
        let mut tablets = BTreeMap::new();
        for mut location in locations {
            if let Some(cached) = previous.as_ref().and_then(|entry| {
                entry
                    .tablets
                    .values()
                    .find(|cached| cached.tablet_id == location.tablet_id)
            }) {
                if cached.epoch > location.epoch {
                    tracing::debug!(
                        table,
                        tablet_id = %location.tablet_id,
                        cached_epoch = cached.epoch,
                        reported_epoch = location.epoch,
                        "ignoring stale tablet location"
                    );
                    location = cached.clone();
                }
            }
            tablets.insert(location.start_key.clone(), location);
        }
        guard.insert(
            table.to_string(),
            TableEntry {
                tablets,
                refreshed_at: Instant::now(),
            },
        );
    }

    /// Drop one tablet after a staleness signal from its believed leader.
    pub fn invalidate(&self, location: &TabletLocation) {
        let Ok(mut guard) = self.tables.write() else {
            return;
        };
        let Some(entry) = guard.get_mut(&location.table_name) else {
            return;
        };
        let matches = entry
            .tablets
            .get(&location.start_key)
            .is_some_and(|cached| cached.tablet_id == location.tablet_id);
        if matches {
            entry.tablets.remove(&location.start_key);
            tracing::debug!(
                table = %location.table_name,
                tablet_id = %location.tablet_id,
                leader = %location.leader,
                "invalidated cached tablet location"
            );
        }
    }

    pub fn invalidate_table(&self, table: &str) {
        if let Ok(mut guard) = self.tables.write() {
            guard.remove(table);
        }
    }
}
