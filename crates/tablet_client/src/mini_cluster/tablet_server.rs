//! In-process tablet servers: row storage per tablet, batched writes and
//! paginated scans backed by a [`ScannerRegistry`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ClientError, Result};
use crate::operation::OpType;
use crate::predicate::ColumnRangePredicate;
use crate::rpc::{
    NewScanRequest, RowOperation, ScanResponse, ScannerId, TabletId, TabletServerError,
    TabletServerErrorCode, TabletServerProxy, WriteRequest, WriteResponse,
};
use crate::scanner_registry::ScannerRegistry;
use crate::schema::{encode_key, Schema, Value};

/// Rows of one tablet, keyed by encoded primary key. Shared by every replica
/// of the tablet, so moving leadership keeps the data.
pub(crate) struct TabletData {
    pub(crate) table_name: String,
    pub(crate) schema: Arc<Schema>,
    pub(crate) start_key: Bytes,
    pub(crate) end_key: Bytes,
    rows: Mutex<BTreeMap<Bytes, Vec<Value>>>,
}

impl TabletData {
    pub(crate) fn new(
        table_name: impl Into<String>,
        schema: Arc<Schema>,
        start_key: Bytes,
        end_key: Bytes,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            schema,
            start_key,
            end_key,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        let in_start = self.start_key.is_empty() || key >= self.start_key.as_ref();
        let in_end = self.end_key.is_empty() || key < self.end_key.as_ref();
        in_start && in_end
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<Bytes, Vec<Value>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a full row (schema order), rejecting duplicates.
    pub(crate) fn insert_row(&self, row: Vec<Value>) -> Result<()> {
        let key = self.row_key(&row)?;
        let mut rows = self.rows();
        if rows.contains_key(&key) {
            return Err(ClientError::already_present("key already present"));
        }
        rows.insert(key, row);
        Ok(())
    }

    pub(crate) fn row_key(&self, row: &[Value]) -> Result<Bytes> {
        let num_keys = self.schema.num_key_columns();
        if row.len() < num_keys {
            return Err(ClientError::invalid_argument("row is missing key columns"));
        }
        encode_key(&self.schema, &row[..num_keys])
    }

    pub(crate) fn len(&self) -> usize {
        self.rows().len()
    }

    fn apply(&self, op: &RowOperation) -> Result<()> {
        let schema = &self.schema;
        let missing = op
            .cells
            .iter()
            .filter(|cell| schema.find_column(&cell.name).is_none())
            .map(|cell| cell.name.as_str())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ClientError::invalid_argument(format!(
                "Some columns are not present in the current schema: {}",
                missing.join(", ")
            )));
        }
        if !self.contains(&op.key) {
            return Err(ClientError::invalid_argument(format!(
                "row key does not belong to the range of a tablet of table {}",
                self.table_name
            )));
        }

        let mut cells: Vec<Option<Value>> = vec![None; schema.num_columns()];
        for cell in &op.cells {
            if let Some(idx) = schema.find_column(&cell.name) {
                if let Some(column) = schema.column(idx) {
                    column.check_value(&cell.value)?;
                }
                cells[idx] = Some(cell.value.clone());
            }
        }
        let mut key_values = Vec::with_capacity(schema.num_key_columns());
        for (column, cell) in schema.key_columns().iter().zip(&cells) {
            let value = cell.clone().ok_or_else(|| {
                ClientError::invalid_argument(format!("missing key column {}", column.name))
            })?;
            key_values.push(value);
        }
        let key = encode_key(schema, &key_values)?;

        let mut rows = self.rows();
        match op.op_type {
            OpType::Insert => {
                if rows.contains_key(&key) {
                    return Err(ClientError::already_present("key already present"));
                }
                let mut row = Vec::with_capacity(cells.len());
                for (column, cell) in schema.columns().iter().zip(cells) {
                    match cell {
                        Some(value) => row.push(value),
                        None if column.nullable => row.push(Value::Null),
                        None => {
                            return Err(ClientError::invalid_argument(format!(
                                "No value provided for required column: {}",
                                column.name
                            )))
                        }
                    }
                }
                rows.insert(key, row);
            }
            OpType::Update => {
                let row = rows
                    .get_mut(&key)
                    .ok_or_else(|| ClientError::not_found("key not found"))?;
                for (idx, cell) in cells.into_iter().enumerate() {
                    if let Some(value) = cell {
                        row[idx] = value;
                    }
                }
            }
            OpType::Delete => {
                if rows.remove(&key).is_none() {
                    return Err(ClientError::not_found("key not found"));
                }
            }
        }
        Ok(())
    }
}

/// Server-side cursor: the projected, filtered rows not yet returned.
pub struct ServerScan {
    rows: VecDeque<Vec<Value>>,
}

impl ServerScan {
    /// Pop rows until `budget` bytes are used. Always returns at least one
    /// row while any remain.
    fn next_batch(&mut self, budget: usize) -> Vec<Vec<Value>> {
        let mut batch = Vec::new();
        let mut used = 0usize;
        while let Some(row) = self.rows.pop_front() {
            used += row.iter().map(Value::size_bytes).sum::<usize>();
            batch.push(row);
            if used >= budget {
                break;
            }
        }
        batch
    }

    fn is_drained(&self) -> bool {
        self.rows.is_empty()
    }
}

struct TabletReplica {
    data: Arc<TabletData>,
    is_leader: bool,
}

pub struct MiniTabletServer {
    addr: SocketAddr,
    running: AtomicBool,
    replicas: RwLock<HashMap<TabletId, TabletReplica>>,
    scanners: ScannerRegistry<ServerScan>,
}

impl MiniTabletServer {
    /// Must be called within a tokio runtime (the scanner registry spawns
    /// its background tasks).
    pub(crate) fn new(addr: SocketAddr, scanner_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            addr,
            running: AtomicBool::new(true),
            replicas: RwLock::new(HashMap::new()),
            scanners: ScannerRegistry::new(scanner_ttl, sweep_interval),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if !running {
            self.scanners.clear();
        }
    }

    pub fn scanner_registry(&self) -> &ScannerRegistry<ServerScan> {
        &self.scanners
    }

    pub fn count_active_scanners(&self) -> usize {
        self.scanners.count_active_scanners()
    }

    pub(crate) fn host_replica(&self, tablet_id: TabletId, data: Arc<TabletData>, is_leader: bool) {
        if let Ok(mut replicas) = self.replicas.write() {
            replicas.insert(tablet_id, TabletReplica { data, is_leader });
        }
    }

    pub(crate) fn set_leader(&self, tablet_id: &str, is_leader: bool) {
        if let Ok(mut replicas) = self.replicas.write() {
            if let Some(replica) = replicas.get_mut(tablet_id) {
                replica.is_leader = is_leader;
            }
        }
    }

    pub(crate) fn replica_data(&self, tablet_id: &str) -> Option<Arc<TabletData>> {
        let replicas = self.replicas.read().ok()?;
        replicas.get(tablet_id).map(|replica| Arc::clone(&replica.data))
    }

    pub(crate) fn is_leader_of(&self, tablet_id: &str) -> bool {
        self.replicas
            .read()
            .ok()
            .and_then(|replicas| replicas.get(tablet_id).map(|replica| replica.is_leader))
            .unwrap_or(false)
    }

    /// Tablet ids this server currently leads, for heartbeats.
    pub(crate) fn leader_tablets(&self) -> Vec<TabletId> {
        self.replicas
            .read()
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|(_, replica)| replica.is_leader)
                    .map(|(tablet_id, _)| tablet_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ClientError::network("Connection refused"))
        }
    }

    /// The tablet's data if this server is its leader, else the error the
    /// client should act on.
    fn leader_tablet(
        &self,
        tablet_id: &str,
    ) -> std::result::Result<Arc<TabletData>, TabletServerError> {
        let replicas = self.replicas.read().map_err(|_| TabletServerError {
            code: TabletServerErrorCode::Unknown,
            status: ClientError::remote("replica table lock poisoned"),
        })?;
        match replicas.get(tablet_id) {
            None => Err(TabletServerError {
                code: TabletServerErrorCode::TabletNotFound,
                status: ClientError::not_found(format!(
                    "tablet {tablet_id} not found on {}",
                    self.addr
                )),
            }),
            Some(replica) if !replica.is_leader => Err(TabletServerError {
                code: TabletServerErrorCode::NotTheLeader,
                status: ClientError::illegal_state(format!(
                    "{} is not the leader of tablet {tablet_id}",
                    self.addr
                )),
            }),
            Some(replica) => Ok(Arc::clone(&replica.data)),
        }
    }

    fn snapshot(
        data: &TabletData,
        projection: &[usize],
        predicates: &[(usize, ColumnRangePredicate)],
    ) -> VecDeque<Vec<Value>> {
        data.rows()
            .values()
            .filter(|row| {
                predicates
                    .iter()
                    .all(|(idx, predicate)| predicate.matches(&row[*idx]))
            })
            .map(|row| projection.iter().map(|idx| row[*idx].clone()).collect())
            .collect()
    }
}

fn invalid_scan(status: ClientError) -> ScanResponse {
    ScanResponse {
        error: Some(TabletServerError {
            code: TabletServerErrorCode::Unknown,
            status,
        }),
        ..ScanResponse::default()
    }
}

#[async_trait]
impl TabletServerProxy for MiniTabletServer {
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        self.ensure_running()?;
        let data = match self.leader_tablet(&req.tablet_id) {
            Ok(data) => data,
            Err(error) => {
                return Ok(WriteResponse {
                    error: Some(error),
                    per_op: Vec::new(),
                })
            }
        };
        let per_op = req.ops.iter().map(|op| data.apply(op)).collect();
        Ok(WriteResponse {
            error: None,
            per_op,
        })
    }

    async fn open_scanner(&self, req: NewScanRequest) -> Result<ScanResponse> {
        self.ensure_running()?;
        let data = match self.leader_tablet(&req.tablet_id) {
            Ok(data) => data,
            Err(error) => {
                return Ok(ScanResponse {
                    error: Some(error),
                    ..ScanResponse::default()
                })
            }
        };

        let schema = &data.schema;
        let mut projection = Vec::with_capacity(req.projection.len());
        for column in &req.projection {
            match schema.find_column(&column.name) {
                Some(idx) => projection.push(idx),
                None => {
                    return Ok(invalid_scan(ClientError::invalid_argument(format!(
                        "Some columns are not present in the current schema: {}",
                        column.name
                    ))))
                }
            }
        }
        let mut predicates = Vec::with_capacity(req.predicates.len());
        for predicate in req.predicates {
            match schema.find_column(&predicate.column().name) {
                Some(idx) => predicates.push((idx, predicate)),
                None => {
                    return Ok(invalid_scan(ClientError::invalid_argument(format!(
                        "predicate column {} is not present in the current schema",
                        predicate.column().name
                    ))))
                }
            }
        }

        let mut scan = ServerScan {
            rows: Self::snapshot(&data, &projection, &predicates),
        };
        if req.batch_size_bytes == 0 {
            let scanner_id = self.scanners.register(req.tablet_id, scan);
            return Ok(ScanResponse {
                scanner_id: Some(scanner_id),
                rows: Vec::new(),
                has_more: true,
                error: None,
            });
        }

        let rows = scan.next_batch(req.batch_size_bytes);
        if scan.is_drained() {
            return Ok(ScanResponse {
                scanner_id: None,
                rows,
                has_more: false,
                error: None,
            });
        }
        let scanner_id = self.scanners.register(req.tablet_id, scan);
        Ok(ScanResponse {
            scanner_id: Some(scanner_id),
            rows,
            has_more: true,
            error: None,
        })
    }

    async fn continue_scan(
        &self,
        scanner_id: ScannerId,
        batch_size_bytes: usize,
    ) -> Result<ScanResponse> {
        self.ensure_running()?;
        let batch = self.scanners.with_scanner(scanner_id, |scan| {
            let rows = scan.next_batch(batch_size_bytes);
            (rows, scan.is_drained())
        });
        let Some((rows, drained)) = batch else {
            return Ok(ScanResponse {
                error: Some(TabletServerError {
                    code: TabletServerErrorCode::ScannerNotFound,
                    status: ClientError::not_found(format!("scanner {scanner_id} not found")),
                }),
                ..ScanResponse::default()
            });
        };
        if drained {
            self.scanners.unregister(scanner_id);
        }
        Ok(ScanResponse {
            scanner_id: (!drained).then_some(scanner_id),
            rows,
            has_more: !drained,
            error: None,
        })
    }

    async fn close_scanner(&self, scanner_id: ScannerId) -> Result<()> {
        self.ensure_running()?;
        self.scanners.request_close(scanner_id);
        Ok(())
    }
}
