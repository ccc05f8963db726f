//! In-process masters sharing one catalog.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ClientError, Result};
use crate::meta_cache::TabletLocation;
use crate::rpc::{
    GetTableLocationsRequest, GetTableLocationsResponse, MasterError, MasterErrorCode,
    MasterProxy, MasterRole, TabletId,
};

/// Last leader a tablet server reported for a tablet.
#[derive(Clone, Copy, Debug)]
struct ReportedLeader {
    leader: SocketAddr,
    epoch: u64,
}

struct CatalogTablet {
    tablet_id: TabletId,
    start_key: Bytes,
    end_key: Bytes,
    reported: Option<ReportedLeader>,
}

/// Table name to ordered tablet list. Tablets only become visible to
/// location requests after a tablet server reported hosting their leader.
#[derive(Default)]
pub(crate) struct Catalog {
    tables: RwLock<HashMap<String, Vec<CatalogTablet>>>,
}

impl Catalog {
    pub(crate) fn add_table(
        &self,
        name: &str,
        tablets: Vec<(TabletId, Bytes, Bytes)>,
    ) -> anyhow::Result<()> {
        let Ok(mut tables) = self.tables.write() else {
            bail!("catalog lock poisoned");
        };
        if tables.contains_key(name) {
            bail!("table {name} already exists");
        }
        let tablets = tablets
            .into_iter()
            .map(|(tablet_id, start_key, end_key)| CatalogTablet {
                tablet_id,
                start_key,
                end_key,
                reported: None,
            })
            .collect();
        tables.insert(name.to_string(), tablets);
        Ok(())
    }

    /// Record `leader` for `tablet_id`, bumping the epoch on change.
    pub(crate) fn report(&self, tablet_id: &str, leader: SocketAddr) {
        let Ok(mut tables) = self.tables.write() else {
            return;
        };
        let Some(tablet) = tables
            .values_mut()
            .flat_map(|tablets| tablets.iter_mut())
            .find(|tablet| tablet.tablet_id == tablet_id)
        else {
            return;
        };
        let previous = tablet.reported;
        match previous {
            Some(current) if current.leader == leader => {}
            Some(current) => {
                tracing::debug!(
                    tablet_id,
                    %leader,
                    epoch = current.epoch + 1,
                    "tablet leader changed"
                );
                tablet.reported = Some(ReportedLeader {
                    leader,
                    epoch: current.epoch + 1,
                });
            }
            None => {
                tablet.reported = Some(ReportedLeader { leader, epoch: 1 });
            }
        }
    }

    pub(crate) fn reported_leader(&self, tablet_id: &str) -> Option<SocketAddr> {
        let tables = self.tables.read().ok()?;
        tables
            .values()
            .flat_map(|tablets| tablets.iter())
            .find(|tablet| tablet.tablet_id == tablet_id)?
            .reported
            .map(|reported| reported.leader)
    }

    pub(crate) fn tablet_ids(&self, table: &str) -> Vec<TabletId> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| {
                tables
                    .get(table)
                    .map(|tablets| tablets.iter().map(|t| t.tablet_id.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// `None` if the table is unknown; empty until every tablet was reported.
    fn locations(&self, table: &str) -> Option<Vec<TabletLocation>> {
        let tables = self.tables.read().ok()?;
        let tablets = tables.get(table)?;
        let mut locations = Vec::with_capacity(tablets.len());
        for tablet in tablets {
            let Some(reported) = tablet.reported else {
                return Some(Vec::new());
            };
            locations.push(TabletLocation {
                tablet_id: tablet.tablet_id.clone(),
                table_name: table.to_string(),
                start_key: tablet.start_key.clone(),
                end_key: tablet.end_key.clone(),
                leader: reported.leader,
                epoch: reported.epoch,
            });
        }
        Some(locations)
    }
}

/// Role and liveness of every master, plus the catalog they serve.
pub(crate) struct MasterGroup {
    pub(crate) catalog: Catalog,
    leader: AtomicUsize,
    catalog_initialized: AtomicBool,
    running: Vec<AtomicBool>,
}

impl MasterGroup {
    pub(crate) fn new(num_masters: usize) -> Self {
        Self {
            catalog: Catalog::default(),
            leader: AtomicUsize::new(0),
            catalog_initialized: AtomicBool::new(true),
            running: (0..num_masters).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    pub(crate) fn set_leader(&self, index: usize) {
        self.leader.store(index, Ordering::SeqCst);
    }

    pub(crate) fn set_catalog_initialized(&self, initialized: bool) {
        self.catalog_initialized.store(initialized, Ordering::SeqCst);
    }

    pub(crate) fn set_running(&self, index: usize, running: bool) {
        if let Some(flag) = self.running.get(index) {
            flag.store(running, Ordering::SeqCst);
        }
    }

    fn is_running(&self, index: usize) -> bool {
        self.running
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Heartbeats only land while some master is up.
    pub(crate) fn any_running(&self) -> bool {
        self.running.iter().any(|flag| flag.load(Ordering::SeqCst))
    }
}

pub struct MiniMaster {
    index: usize,
    addr: SocketAddr,
    group: Arc<MasterGroup>,
}

impl MiniMaster {
    pub(crate) fn new(index: usize, addr: SocketAddr, group: Arc<MasterGroup>) -> Self {
        Self { index, addr, group }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.group.is_running(self.index)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ClientError::network("Connection refused"))
        }
    }

    fn is_leader(&self) -> bool {
        self.group.leader.load(Ordering::SeqCst) == self.index
    }
}

#[async_trait]
impl MasterProxy for MiniMaster {
    async fn get_master_role(&self) -> Result<MasterRole> {
        self.ensure_running()?;
        Ok(if self.is_leader() {
            MasterRole::Leader
        } else {
            MasterRole::Follower
        })
    }

    async fn get_table_locations(
        &self,
        req: GetTableLocationsRequest,
    ) -> Result<GetTableLocationsResponse> {
        self.ensure_running()?;
        let error = |code, status| GetTableLocationsResponse {
            tablet_locations: Vec::new(),
            error: Some(MasterError { code, status }),
        };

        if !self.is_leader() {
            return Ok(error(
                MasterErrorCode::NotTheLeader,
                ClientError::illegal_state(format!("master {} is not the leader", self.addr)),
            ));
        }
        if !self.group.catalog_initialized.load(Ordering::SeqCst) {
            return Ok(error(
                MasterErrorCode::CatalogManagerNotInitialized,
                ClientError::remote("catalog manager is not yet initialized"),
            ));
        }
        match self.group.catalog.locations(&req.table_name) {
            Some(tablet_locations) => Ok(GetTableLocationsResponse {
                tablet_locations,
                error: None,
            }),
            None => Ok(error(
                MasterErrorCode::TableNotFound,
                ClientError::not_found(format!("The table does not exist: {}", req.table_name)),
            )),
        }
    }
}
