//! Table handles and key-to-tablet routing.
//!
//! [`TableLocator`] fronts the [`TabletLocationCache`]: lookups are served
//! from the cache when fresh and fall back to the leader master otherwise.
//! Callers that talk to a tablet leader report staleness back through
//! [`TableLocator::call_with_refresh`], which refreshes the location and
//! retries the call exactly once.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::master_resolver::MasterLeaderResolver;
use crate::meta_cache::{TabletLocation, TabletLocationCache};
use crate::operation::{MutationOp, OpType};
use crate::rpc::ProxyFactory;
use crate::schema::Schema;

/// An opened table: its name plus the schema the client writes and scans with.
#[derive(Debug)]
pub struct Table {
    name: String,
    schema: Arc<Schema>,
}

impl Table {
    pub(crate) fn new(name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn new_insert(self: &Arc<Self>) -> MutationOp {
        MutationOp::new(OpType::Insert, Arc::clone(self))
    }

    pub fn new_update(self: &Arc<Self>) -> MutationOp {
        MutationOp::new(OpType::Update, Arc::clone(self))
    }

    pub fn new_delete(self: &Arc<Self>) -> MutationOp {
        MutationOp::new(OpType::Delete, Arc::clone(self))
    }
}

/// Outcome of one tablet RPC as seen by [`TableLocator::call_with_refresh`].
pub enum TabletCall<T> {
    /// The tablet leader answered; nothing to refresh.
    Complete(T),
    /// The addressed replica is no longer the leader or no longer hosts the
    /// tablet.
    Stale(ClientError),
}

pub struct TableLocator {
    resolver: MasterLeaderResolver,
    cache: TabletLocationCache,
    config: ClientConfig,
}

impl TableLocator {
    pub fn new(config: ClientConfig, factory: Arc<dyn ProxyFactory>) -> Result<Self> {
        Ok(Self {
            resolver: MasterLeaderResolver::new(config.clone(), factory)?,
            cache: TabletLocationCache::new(config.location_cache_ttl),
            config,
        })
    }

    pub fn resolver(&self) -> &MasterLeaderResolver {
        &self.resolver
    }

    /// Open `name`, waiting until the master reports at least one tablet.
    pub async fn open_table(
        &self,
        name: &str,
        schema: Schema,
        deadline: Instant,
    ) -> Result<Arc<Table>> {
        self.refresh(name, deadline).await?;
        tracing::debug!(table = name, "opened table");
        Ok(Arc::new(Table::new(name, Arc::new(schema))))
    }

    /// Fetch locations from the master into the cache.
    ///
    /// An empty location list means the tablets have not been reported yet;
    /// poll at the heartbeat cadence until they appear or `deadline` passes.
    /// Once the master has answered with an empty list, running out of time
    /// is `NotFound`, not `TimedOut`.
    async fn refresh(&self, table: &str, deadline: Instant) -> Result<Vec<TabletLocation>> {
        let started = Instant::now();
        let mut saw_empty = false;
        loop {
            let locations = match self.resolver.get_table_locations(table, deadline).await {
                Ok(locations) => locations,
                Err(err) if saw_empty && err.is_timed_out() => {
                    return Err(no_locations(table, started));
                }
                Err(err) => return Err(err),
            };
            if !locations.is_empty() {
                tracing::debug!(
                    table,
                    tablets = locations.len(),
                    "refreshed tablet locations"
                );
                self.cache.update(table, locations.clone());
                return Ok(locations);
            }
            saw_empty = true;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(no_locations(table, started));
            }
            tracing::debug!(table, "master reported no tablets yet; polling");
            tokio::time::sleep(self.config.heartbeat_interval.min(remaining)).await;
            if Instant::now() >= deadline {
                return Err(no_locations(table, started));
            }
        }
    }

    /// Tablet whose range contains `key`.
    pub async fn locate(
        &self,
        table: &str,
        key: &[u8],
        deadline: Instant,
    ) -> Result<TabletLocation> {
        if let Some(location) = self.cache.lookup(table, key) {
            return Ok(location);
        }
        let locations = self.refresh(table, deadline).await?;
        locations
            .into_iter()
            .find(|location| location.contains(key))
            .ok_or_else(|| {
                ClientError::not_found(format!("no tablet of table {table} covers the given key"))
            })
    }

    /// Every tablet of `table`, in key order.
    pub async fn tablets(&self, table: &str, deadline: Instant) -> Result<Vec<TabletLocation>> {
        if let Some(tablets) = self.cache.tablets(table) {
            return Ok(tablets);
        }
        let mut locations = self.refresh(table, deadline).await?;
        locations.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        Ok(locations)
    }

    pub fn invalidate(&self, location: &TabletLocation) {
        self.cache.invalidate(location);
    }

    pub fn invalidate_table(&self, table: &str) {
        self.cache.invalidate_table(table);
    }

    /// Run `call` against the leader of the tablet containing `key`.
    ///
    /// A stale answer or a network error invalidates the cached location,
    /// re-locates the tablet and retries once. The second answer is final.
    pub async fn call_with_refresh<T, F, Fut>(
        &self,
        table: &str,
        key: &[u8],
        deadline: Instant,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(TabletLocation) -> Fut,
        Fut: Future<Output = Result<TabletCall<T>>>,
    {
        let location = self.locate(table, key, deadline).await?;
        let stale = match call(location.clone()).await {
            Ok(TabletCall::Complete(value)) => return Ok(value),
            Ok(TabletCall::Stale(err)) => err,
            Err(err) if err.is_network_error() => err,
            Err(err) => return Err(err),
        };

        tracing::warn!(
            table,
            tablet_id = %location.tablet_id,
            leader = %location.leader,
            error = %stale,
            "tablet location is stale; refreshing and retrying once"
        );
        self.invalidate(&location);
        let location = self.locate(table, key, deadline).await?;
        match call(location).await? {
            TabletCall::Complete(value) => Ok(value),
            TabletCall::Stale(err) => Err(err),
        }
    }
}

fn no_locations(table: &str, started: Instant) -> ClientError {
    ClientError::not_found(format!(
        "table {table} has no tablet locations after {} ms",
        started.elapsed().as_millis()
    ))
}
