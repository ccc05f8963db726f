//! Wire messages and the narrow proxy interfaces the client consumes.
//!
//! The transport itself is external: anything that can carry these messages
//! to a master or tablet server implements [`MasterProxy`] /
//! [`TabletServerProxy`] and is handed out by a [`ProxyFactory`]. The
//! in-process [`crate::mini_cluster`] is one such implementation.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ClientError, Result};
use crate::meta_cache::TabletLocation;
use crate::operation::OpType;
use crate::predicate::ColumnRangePredicate;
use crate::schema::{ColumnSchema, Value};

pub type TabletId = String;

/// Server-assigned handle for an open scan, used as the continuation cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScannerId(pub u64);

impl fmt::Display for ScannerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterRole {
    Leader,
    Follower,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterErrorCode {
    NotTheLeader,
    CatalogManagerNotInitialized,
    TableNotFound,
    Unknown,
}

/// Application-level error carried inside an otherwise successful master response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterError {
    pub code: MasterErrorCode,
    pub status: ClientError,
}

#[derive(Clone, Debug)]
pub struct GetTableLocationsRequest {
    pub table_name: String,
}

/// An empty `tablet_locations` list with no error means "not yet partitioned".
#[derive(Clone, Debug, Default)]
pub struct GetTableLocationsResponse {
    pub tablet_locations: Vec<TabletLocation>,
    pub error: Option<MasterError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TabletServerErrorCode {
    NotTheLeader,
    TabletNotFound,
    ScannerNotFound,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletServerError {
    pub code: TabletServerErrorCode,
    pub status: ClientError,
}

impl TabletServerError {
    /// The cached location for this tablet should be dropped and re-fetched.
    pub fn is_stale_location(&self) -> bool {
        matches!(
            self.code,
            TabletServerErrorCode::NotTheLeader | TabletServerErrorCode::TabletNotFound
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnValue {
    pub name: String,
    pub value: Value,
}

/// One mutation on the wire. `key` is the client's encoding and is only
/// used to check the op belongs to the addressed tablet.
#[derive(Clone, Debug)]
pub struct RowOperation {
    pub op_type: OpType,
    pub key: Bytes,
    pub cells: Vec<ColumnValue>,
}

#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub tablet_id: TabletId,
    pub ops: Vec<RowOperation>,
}

/// `per_op` holds one outcome per request op, in request order.
#[derive(Clone, Debug, Default)]
pub struct WriteResponse {
    pub error: Option<TabletServerError>,
    pub per_op: Vec<Result<()>>,
}

#[derive(Clone, Debug)]
pub struct NewScanRequest {
    pub tablet_id: TabletId,
    pub projection: Vec<ColumnSchema>,
    pub predicates: Vec<ColumnRangePredicate>,
    pub batch_size_bytes: usize,
}

/// `scanner_id` is only set while the server keeps state for the scan.
#[derive(Clone, Debug, Default)]
pub struct ScanResponse {
    pub scanner_id: Option<ScannerId>,
    pub rows: Vec<Vec<Value>>,
    pub has_more: bool,
    pub error: Option<TabletServerError>,
}

#[async_trait]
pub trait MasterProxy: Send + Sync {
    async fn get_master_role(&self) -> Result<MasterRole>;

    async fn get_table_locations(
        &self,
        req: GetTableLocationsRequest,
    ) -> Result<GetTableLocationsResponse>;
}

#[async_trait]
pub trait TabletServerProxy: Send + Sync {
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse>;

    async fn open_scanner(&self, req: NewScanRequest) -> Result<ScanResponse>;

    async fn continue_scan(
        &self,
        scanner_id: ScannerId,
        batch_size_bytes: usize,
    ) -> Result<ScanResponse>;

    /// Fire-and-forget; an `Ok` only means the request was accepted.
    async fn close_scanner(&self, scanner_id: ScannerId) -> Result<()>;
}

/// Hands out proxies by address. Implementations may cache connections.
pub trait ProxyFactory: Send + Sync {
    fn master(&self, addr: SocketAddr) -> Arc<dyn MasterProxy>;
    fn tablet_server(&self, addr: SocketAddr) -> Arc<dyn TabletServerProxy>;
}

/// Bound one RPC by `timeout`, mapping expiry to `TimedOut`.
pub(crate) async fn call_with_timeout<T, F>(
    timeout: Duration,
    rpc_name: &str,
    target: SocketAddr,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|err| err.with_context(format!("{rpc_name} to {target}"))),
        Err(_) => Err(ClientError::timed_out(format!(
            "{rpc_name} rpc timed out for {target} after {} ms",
            timeout.as_millis()
        ))),
    }
}
