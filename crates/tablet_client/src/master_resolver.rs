//! Master leader discovery and the location-request retry loop.
//!
//! The caller's deadline is the only termination criterion. Inside it, every
//! failed attempt (unreachable master, "not the leader", catalog still
//! initializing) invalidates the believed leader and backs off exponentially
//! before the next attempt.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::meta_cache::TabletLocation;
use crate::rpc::{
    call_with_timeout, GetTableLocationsRequest, MasterErrorCode, MasterProxy, MasterRole,
    ProxyFactory,
};

/// Doubling delay with jitter in [75%, 100%] of the current step.
#[derive(Clone, Debug)]
pub struct RetryBackoff {
    next: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            next: initial.min(max.max(initial)),
            max: max.max(initial),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self.next;
        self.next = step.saturating_mul(2).min(self.max);
        let step_us = step.as_micros().min(u128::from(u64::MAX)) as u64;
        let jitter_us = rand::thread_rng().gen_range(0..=step_us / 4);
        Duration::from_micros(step_us - jitter_us)
    }

    /// Sleep for the next delay, never past `deadline`.
    pub async fn wait(&mut self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(self.next_delay().min(remaining)).await;
    }
}

pub struct MasterLeaderResolver {
    masters: Vec<SocketAddr>,
    factory: Arc<dyn ProxyFactory>,
    leader: RwLock<Option<SocketAddr>>,
    config: ClientConfig,
}

impl MasterLeaderResolver {
    pub fn new(config: ClientConfig, factory: Arc<dyn ProxyFactory>) -> Result<Self> {
        if config.master_addrs.is_empty() {
            return Err(ClientError::invalid_argument(
                "at least one master address is required",
            ));
        }
        Ok(Self {
            masters: config.master_addrs.clone(),
            factory,
            leader: RwLock::new(None),
            config,
        })
    }

    pub fn cached_leader(&self) -> Option<SocketAddr> {
        self.leader.read().ok().and_then(|guard| *guard)
    }

    /// Forget `stale` if it is still the believed leader.
    pub fn invalidate(&self, stale: SocketAddr) {
        if let Ok(mut guard) = self.leader.write() {
            if *guard == Some(stale) {
                *guard = None;
            }
        }
    }

    fn set_leader(&self, leader: SocketAddr) {
        if let Ok(mut guard) = self.leader.write() {
            *guard = Some(leader);
        }
    }

    /// Find the current leader master, polling all replicas until one
    /// reports itself as leader or `deadline` passes.
    pub async fn resolve_leader(&self, deadline: Instant) -> Result<SocketAddr> {
        let started = Instant::now();
        let mut backoff = RetryBackoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut last_error: Option<ClientError> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                let elapsed_ms = now.duration_since(started).as_millis();
                let cause = last_error
                    .map(|err| format!(" (last error: {err})"))
                    .unwrap_or_default();
                return Err(ClientError::timed_out(format!(
                    "Timed out resolving the leader master after {elapsed_ms} ms{cause}"
                )));
            }
            let rpc_timeout = self
                .config
                .default_admin_operation_timeout
                .min(deadline.saturating_duration_since(now));

            let mut probes = self
                .masters
                .iter()
                .map(|addr| {
                    let addr = *addr;
                    let proxy = self.factory.master(addr);
                    async move {
                        let role = call_with_timeout(
                            rpc_timeout,
                            "get_master_role",
                            addr,
                            proxy.get_master_role(),
                        )
                        .await;
                        (addr, role)
                    }
                })
                .collect::<FuturesUnordered<_>>();

            while let Some((addr, role)) = probes.next().await {
                match role {
                    Ok(MasterRole::Leader) => {
                        tracing::debug!(leader = %addr, "resolved leader master");
                        self.set_leader(addr);
                        return Ok(addr);
                    }
                    Ok(MasterRole::Follower) => {}
                    Err(err) => last_error = Some(err),
                }
            }

            tracing::debug!(
                masters = self.masters.len(),
                "no master reported itself as leader; backing off"
            );
            backoff.wait(deadline).await;
        }
    }

    async fn leader_proxy(&self, deadline: Instant) -> Result<(SocketAddr, Arc<dyn MasterProxy>)> {
        let leader = match self.cached_leader() {
            Some(leader) => leader,
            None => self.resolve_leader(deadline).await?,
        };
        Ok((leader, self.factory.master(leader)))
    }

    /// Fetch the tablet locations of `table` from the leader master.
    ///
    /// An empty list is returned as-is; it means the table exists but has no
    /// reported tablets yet.
    pub async fn get_table_locations(
        &self,
        table: &str,
        deadline: Instant,
    ) -> Result<Vec<TabletLocation>> {
        let started = Instant::now();
        let mut backoff = RetryBackoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut last_error: Option<ClientError> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                let elapsed_ms = now.duration_since(started).as_millis();
                let cause = last_error
                    .map(|err| format!(" (last error: {err})"))
                    .unwrap_or_default();
                tracing::error!(
                    table,
                    elapsed_ms = elapsed_ms as u64,
                    "timed out waiting for table locations from a leader master"
                );
                return Err(ClientError::timed_out(format!(
                    "Timed out waiting for GetTableLocations reply from a leader master after {elapsed_ms} ms{cause}"
                )));
            }

            let (leader, proxy) = match self.leader_proxy(deadline).await {
                Ok(found) => found,
                Err(err) if err.is_timed_out() => {
                    let cause = last_error
                        .map(|last| format!(" (last error: {last})"))
                        .unwrap_or_default();
                    return Err(ClientError::timed_out(format!("{}{cause}", err.message())));
                }
                Err(err) => return Err(err),
            };
            let rpc_timeout = self
                .config
                .default_admin_operation_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let request = GetTableLocationsRequest {
                table_name: table.to_string(),
            };
            let response = call_with_timeout(
                rpc_timeout,
                "get_table_locations",
                leader,
                proxy.get_table_locations(request),
            )
            .await;

            match response {
                Ok(response) => match response.error {
                    None => return Ok(response.tablet_locations),
                    Some(err) => match err.code {
                        MasterErrorCode::TableNotFound => return Err(err.status),
                        MasterErrorCode::NotTheLeader
                        | MasterErrorCode::CatalogManagerNotInitialized => {
                            tracing::warn!(
                                master = %leader,
                                error = %err.status,
                                "master is not an initialized leader; determining the leader master again"
                            );
                            self.invalidate(leader);
                            last_error = Some(err.status);
                        }
                        MasterErrorCode::Unknown => {
                            tracing::warn!(
                                master = %leader,
                                error = %err.status,
                                "error getting table locations; retrying"
                            );
                            last_error = Some(err.status);
                        }
                    },
                },
                Err(err) => {
                    tracing::warn!(
                        master = %leader,
                        error = %err,
                        "rpc to the leader master failed; determining the leader master again"
                    );
                    self.invalidate(leader);
                    last_error = Some(err);
                }
            }
            backoff.wait(deadline).await;
        }
    }
}
