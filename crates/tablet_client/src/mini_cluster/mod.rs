//! In-process cluster for tests and the workload driver.
//!
//! Masters share one catalog and agree on a single leader; tablet servers
//! store rows in memory and report the tablets they lead on every heartbeat.
//! Nodes can be shut down and restarted, leadership can be moved, and the
//! catalog can be flagged as still initializing, which is enough to drive
//! every client retry path without a network.

mod master;
mod tablet_server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::client::TabletClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::rpc::{
    GetTableLocationsRequest, GetTableLocationsResponse, MasterProxy, MasterRole,
    NewScanRequest, ProxyFactory, ScanResponse, ScannerId, TabletId, TabletServerProxy,
    WriteRequest, WriteResponse,
};
use crate::schema::{encode_key, Schema, Value};

use master::MasterGroup;
pub use master::MiniMaster;
use tablet_server::TabletData;
pub use tablet_server::{MiniTabletServer, ServerScan};

const MASTER_BASE_PORT: u16 = 17000;
const TABLET_SERVER_BASE_PORT: u16 = 17100;

#[derive(Clone, Debug)]
pub struct MiniClusterOptions {
    pub num_masters: usize,
    pub num_tablet_servers: usize,
    /// How often tablet servers report their leader tablets.
    pub heartbeat_interval: Duration,
    /// Idle time after which a server-side scanner is reclaimed.
    pub scanner_ttl: Duration,
    pub scanner_sweep_interval: Duration,
}

impl Default for MiniClusterOptions {
    fn default() -> Self {
        Self {
            num_masters: 1,
            num_tablet_servers: 1,
            heartbeat_interval: Duration::from_millis(50),
            scanner_ttl: Duration::from_secs(60),
            scanner_sweep_interval: Duration::from_secs(1),
        }
    }
}

pub struct MiniCluster {
    options: MiniClusterOptions,
    group: Arc<MasterGroup>,
    masters: Vec<Arc<MiniMaster>>,
    tablet_servers: Vec<Arc<MiniTabletServer>>,
    proxies: Arc<MiniClusterProxies>,
    heartbeats: Vec<JoinHandle<()>>,
}

impl MiniCluster {
    /// Start masters and tablet servers. Must run within a tokio runtime.
    pub async fn start(options: MiniClusterOptions) -> anyhow::Result<Self> {
        if options.num_masters == 0 {
            bail!("a mini cluster needs at least one master");
        }
        if options.num_tablet_servers == 0 {
            bail!("a mini cluster needs at least one tablet server");
        }

        let group = Arc::new(MasterGroup::new(options.num_masters));
        let masters = (0..options.num_masters)
            .map(|idx| {
                let addr = node_addr(MASTER_BASE_PORT, idx)?;
                Ok(Arc::new(MiniMaster::new(idx, addr, Arc::clone(&group))))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let tablet_servers = (0..options.num_tablet_servers)
            .map(|idx| {
                let addr = node_addr(TABLET_SERVER_BASE_PORT, idx)?;
                Ok(Arc::new(MiniTabletServer::new(
                    addr,
                    options.scanner_ttl,
                    options.scanner_sweep_interval,
                )))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let proxies = Arc::new(MiniClusterProxies {
            masters: masters
                .iter()
                .map(|master| (master.addr(), Arc::clone(master)))
                .collect(),
            tablet_servers: tablet_servers
                .iter()
                .map(|server| (server.addr(), Arc::clone(server)))
                .collect(),
        });
        let heartbeats = tablet_servers
            .iter()
            .map(|server| {
                spawn_heartbeat(
                    Arc::downgrade(server),
                    Arc::clone(&group),
                    options.heartbeat_interval,
                )
            })
            .collect();

        tracing::info!(
            masters = options.num_masters,
            tablet_servers = options.num_tablet_servers,
            "mini cluster started"
        );
        Ok(Self {
            options,
            group,
            masters,
            tablet_servers,
            proxies,
            heartbeats,
        })
    }

    pub fn options(&self) -> &MiniClusterOptions {
        &self.options
    }

    pub fn master_addrs(&self) -> Vec<SocketAddr> {
        self.masters.iter().map(|master| master.addr()).collect()
    }

    pub fn proxy_factory(&self) -> Arc<dyn ProxyFactory> {
        Arc::clone(&self.proxies) as Arc<dyn ProxyFactory>
    }

    /// Client settings sized for an in-process cluster.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            heartbeat_interval: self.options.heartbeat_interval,
            default_admin_operation_timeout: Duration::from_secs(5),
            default_select_master_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(200),
            ..ClientConfig::with_masters(self.master_addrs())
        }
    }

    pub fn client(&self, config: ClientConfig) -> anyhow::Result<TabletClient> {
        TabletClient::new(config, self.proxy_factory()).context("create tablet client")
    }

    pub fn master(&self, idx: usize) -> anyhow::Result<&Arc<MiniMaster>> {
        self.masters
            .get(idx)
            .with_context(|| format!("no master with index {idx}"))
    }

    pub fn tablet_server(&self, idx: usize) -> anyhow::Result<&Arc<MiniTabletServer>> {
        self.tablet_servers
            .get(idx)
            .with_context(|| format!("no tablet server with index {idx}"))
    }

    /// Sum of open scanners over every tablet server.
    pub fn count_active_scanners(&self) -> usize {
        self.tablet_servers
            .iter()
            .map(|server| server.count_active_scanners())
            .sum()
    }

    /// Create `name` with one tablet per range between `split_rows`.
    ///
    /// Each split row holds the key column values of a tablet boundary.
    /// Tablets are spread round-robin over the tablet servers and become
    /// visible to clients after the next heartbeat.
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        split_rows: &[Vec<Value>],
    ) -> anyhow::Result<Vec<TabletId>> {
        let schema = Arc::new(schema);
        let mut boundaries = vec![Bytes::new()];
        for split in split_rows {
            let key = encode_key(&schema, split)
                .with_context(|| format!("encode split row for table {name}"))?;
            if boundaries.last().is_some_and(|last| *last >= key) {
                bail!("split rows of table {name} must be strictly increasing");
            }
            boundaries.push(key);
        }
        boundaries.push(Bytes::new());

        let mut tablets = Vec::with_capacity(boundaries.len() - 1);
        let mut replicas = Vec::with_capacity(boundaries.len() - 1);
        for (idx, range) in boundaries.windows(2).enumerate() {
            let tablet_id = format!("{name}-{idx:04}");
            let data = Arc::new(TabletData::new(
                name,
                Arc::clone(&schema),
                range[0].clone(),
                range[1].clone(),
            ));
            replicas.push((tablet_id.clone(), data));
            tablets.push((tablet_id, range[0].clone(), range[1].clone()));
        }
        self.group.catalog.add_table(name, tablets)?;

        let mut tablet_ids = Vec::with_capacity(replicas.len());
        for (idx, (tablet_id, data)) in replicas.into_iter().enumerate() {
            let server = &self.tablet_servers[idx % self.tablet_servers.len()];
            server.host_replica(tablet_id.clone(), data, true);
            tablet_ids.push(tablet_id);
        }
        tracing::info!(table = name, tablets = boundaries.len() - 1, "created table");
        Ok(tablet_ids)
    }

    pub fn tablet_ids(&self, table: &str) -> Vec<TabletId> {
        self.group.catalog.tablet_ids(table)
    }

    /// Load full rows (schema order) straight into tablet storage, bypassing
    /// the client.
    pub fn insert_rows_locally(&self, table: &str, rows: Vec<Vec<Value>>) -> anyhow::Result<()> {
        let tablets = self
            .tablet_ids(table)
            .into_iter()
            .filter_map(|tablet_id| self.find_tablet_data(&tablet_id))
            .collect::<Vec<_>>();
        if tablets.is_empty() {
            bail!("table {table} does not exist");
        }
        for row in rows {
            let key = tablets[0]
                .row_key(&row)
                .with_context(|| format!("encode key of row for table {table}"))?;
            let tablet = tablets
                .iter()
                .find(|tablet| tablet.contains(&key))
                .with_context(|| format!("no tablet of table {table} covers row"))?;
            tablet
                .insert_row(row)
                .with_context(|| format!("insert row into table {table}"))?;
        }
        Ok(())
    }

    /// Number of rows stored for `table` across its tablets.
    pub fn count_rows(&self, table: &str) -> usize {
        self.tablet_ids(table)
            .iter()
            .filter_map(|tablet_id| self.find_tablet_data(tablet_id))
            .map(|data| data.len())
            .sum()
    }

    fn find_tablet_data(&self, tablet_id: &str) -> Option<Arc<TabletData>> {
        self.tablet_servers
            .iter()
            .find_map(|server| server.replica_data(tablet_id))
    }

    pub fn shutdown_master(&self, idx: usize) -> anyhow::Result<()> {
        self.master(idx)?;
        self.group.set_running(idx, false);
        tracing::info!(master = idx, "master shut down");
        Ok(())
    }

    pub fn restart_master(&self, idx: usize) -> anyhow::Result<()> {
        self.master(idx)?;
        self.group.set_running(idx, true);
        tracing::info!(master = idx, "master restarted");
        Ok(())
    }

    pub fn shutdown_tablet_server(&self, idx: usize) -> anyhow::Result<()> {
        self.tablet_server(idx)?.set_running(false);
        tracing::info!(tablet_server = idx, "tablet server shut down");
        Ok(())
    }

    pub fn restart_tablet_server(&self, idx: usize) -> anyhow::Result<()> {
        self.tablet_server(idx)?.set_running(true);
        tracing::info!(tablet_server = idx, "tablet server restarted");
        Ok(())
    }

    /// Make master `new_leader` the leader; the others become followers.
    pub fn step_down_master(&self, new_leader: usize) -> anyhow::Result<()> {
        self.master(new_leader)?;
        self.group.set_leader(new_leader);
        tracing::info!(leader = new_leader, "master leadership moved");
        Ok(())
    }

    pub fn set_catalog_initialized(&self, initialized: bool) {
        self.group.set_catalog_initialized(initialized);
    }

    /// Move leadership of `tablet_id` to tablet server `to` and wait until a
    /// heartbeat made the master aware of it.
    pub async fn move_tablet_leader(&self, tablet_id: &str, to: usize) -> anyhow::Result<()> {
        let target = Arc::clone(self.tablet_server(to)?);
        let data = self
            .find_tablet_data(tablet_id)
            .with_context(|| format!("unknown tablet {tablet_id}"))?;
        for server in &self.tablet_servers {
            if server.is_leader_of(tablet_id) {
                server.set_leader(tablet_id, false);
            }
        }
        target.host_replica(tablet_id.to_string(), data, true);

        let deadline = Instant::now() + self.options.heartbeat_interval * 50;
        while self.group.catalog.reported_leader(tablet_id) != Some(target.addr()) {
            if Instant::now() >= deadline {
                bail!("master never learned the new leader of tablet {tablet_id}");
            }
            tokio::time::sleep(self.options.heartbeat_interval / 2).await;
        }
        tracing::info!(tablet_id, leader = %target.addr(), "tablet leadership moved");
        Ok(())
    }
}

impl Drop for MiniCluster {
    fn drop(&mut self) {
        for heartbeat in self.heartbeats.drain(..) {
            heartbeat.abort();
        }
    }
}

fn node_addr(base_port: u16, idx: usize) -> anyhow::Result<SocketAddr> {
    let offset = u16::try_from(idx).context("node index out of range")?;
    let port = base_port
        .checked_add(offset)
        .context("node port out of range")?;
    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
}

fn spawn_heartbeat(
    server: Weak<MiniTabletServer>,
    group: Arc<MasterGroup>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(server) = server.upgrade() else {
                break;
            };
            if !server.is_running() || !group.any_running() {
                continue;
            }
            for tablet_id in server.leader_tablets() {
                group.catalog.report(&tablet_id, server.addr());
            }
        }
    })
}

/// Routes proxies to in-process nodes; unknown addresses are unreachable.
struct MiniClusterProxies {
    masters: HashMap<SocketAddr, Arc<MiniMaster>>,
    tablet_servers: HashMap<SocketAddr, Arc<MiniTabletServer>>,
}

impl ProxyFactory for MiniClusterProxies {
    fn master(&self, addr: SocketAddr) -> Arc<dyn MasterProxy> {
        match self.masters.get(&addr) {
            Some(master) => Arc::clone(master) as Arc<dyn MasterProxy>,
            None => Arc::new(UnreachableNode),
        }
    }

    fn tablet_server(&self, addr: SocketAddr) -> Arc<dyn TabletServerProxy> {
        match self.tablet_servers.get(&addr) {
            Some(server) => Arc::clone(server) as Arc<dyn TabletServerProxy>,
            None => Arc::new(UnreachableNode),
        }
    }
}

struct UnreachableNode;

fn refused<T>() -> Result<T> {
    Err(ClientError::network("Connection refused"))
}

#[async_trait]
impl MasterProxy for UnreachableNode {
    async fn get_master_role(&self) -> Result<MasterRole> {
        refused()
    }

    async fn get_table_locations(
        &self,
        _req: GetTableLocationsRequest,
    ) -> Result<GetTableLocationsResponse> {
        refused()
    }
}

#[async_trait]
impl TabletServerProxy for UnreachableNode {
    async fn write(&self, _req: WriteRequest) -> Result<WriteResponse> {
        refused()
    }

    async fn open_scanner(&self, _req: NewScanRequest) -> Result<ScanResponse> {
        refused()
    }

    async fn continue_scan(&self, _scanner_id: ScannerId, _batch: usize) -> Result<ScanResponse> {
        refused()
    }

    async fn close_scanner(&self, _scanner_id: ScannerId) -> Result<()> {
        refused()
    }
}
