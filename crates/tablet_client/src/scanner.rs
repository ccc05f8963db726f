//! Paginated scans with projection and predicate pushdown.
//!
//! Tablets are scanned one at a time in key order. Each tablet scan is a
//! server-side cursor: the open RPC returns the first batch and, when rows
//! remain, a scanner id that later continuations pass back. Whatever is
//! still registered on the server when the scanner is closed or dropped is
//! released by a fire-and-forget close.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::client::ClientContext;
use crate::error::{ClientError, Result};
use crate::meta_cache::TabletLocation;
use crate::predicate::ColumnRangePredicate;
use crate::rpc::{call_with_timeout, NewScanRequest, ScanResponse, ScannerId};
use crate::schema::{Schema, Value};
use crate::table_locator::{Table, TabletCall};

/// One scanned row; values follow the projection's column order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRow {
    values: Vec<Value>,
}

impl ScanRow {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Zero for rows scanned with an empty projection.
    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl fmt::Display for ScanRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, value) in self.values.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

/// Rows returned by one `next_batch` call. Immutable once returned.
#[derive(Clone, Debug)]
pub struct RowBatch {
    projection: Arc<Schema>,
    rows: Vec<ScanRow>,
}

impl RowBatch {
    fn new(projection: Arc<Schema>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            projection,
            rows: rows.into_iter().map(|values| ScanRow { values }).collect(),
        }
    }

    pub fn projection(&self) -> &Schema {
        &self.projection
    }

    pub fn rows(&self) -> &[ScanRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of the projected column `name` in row `row`.
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.projection.find_column(name)?;
        self.rows.get(row)?.value(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScanRow> {
        self.rows.iter()
    }
}

impl IntoIterator for RowBatch {
    type Item = ScanRow;
    type IntoIter = std::vec::IntoIter<ScanRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScannerState {
    Unopened,
    Open,
    Exhausted,
    Closed,
}

/// The tablet currently being scanned.
struct TabletScan {
    location: TabletLocation,
    /// Set while the server holds cursor state for this tablet.
    scanner_id: Option<ScannerId>,
    has_more: bool,
}

pub struct Scanner {
    ctx: Arc<ClientContext>,
    table: Arc<Table>,
    projection: Arc<Schema>,
    predicates: Vec<ColumnRangePredicate>,
    batch_size_bytes: usize,
    state: ScannerState,
    remaining: VecDeque<TabletLocation>,
    current: Option<TabletScan>,
    /// Non-empty first batch of the open RPC, handed out by the next `next_batch`.
    pending: Option<Vec<Vec<Value>>>,
}

impl Scanner {
    pub(crate) fn new(ctx: Arc<ClientContext>, table: Arc<Table>) -> Self {
        let projection = Arc::clone(table.schema());
        let batch_size_bytes = ctx.config.scanner_batch_size_bytes;
        Self {
            ctx,
            table,
            projection,
            predicates: Vec::new(),
            batch_size_bytes,
            state: ScannerState::Unopened,
            remaining: VecDeque::new(),
            current: None,
            pending: None,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn projection(&self) -> &Schema {
        &self.projection
    }

    fn ensure_unopened(&self, what: &str) -> Result<()> {
        if self.state != ScannerState::Unopened {
            return Err(ClientError::illegal_state(format!(
                "{what} must be called before the scanner is opened"
            )));
        }
        Ok(())
    }

    /// Restrict returned columns. Every column must exist in the table
    /// schema with the same type; an empty projection is allowed and yields
    /// zero-width rows.
    pub fn set_projection(&mut self, projection: Schema) -> Result<()> {
        self.ensure_unopened("set_projection")?;
        let schema = self.table.schema();
        for column in projection.columns() {
            let known = schema
                .find_column(&column.name)
                .and_then(|idx| schema.column(idx))
                .is_some_and(|existing| existing.data_type == column.data_type);
            if !known {
                return Err(ClientError::invalid_argument(format!(
                    "projection column {} ({}) is not in the schema of table {}",
                    column.name,
                    column.data_type,
                    self.table.name()
                )));
            }
        }
        self.projection = Arc::new(projection);
        Ok(())
    }

    /// Project the named columns of the table schema.
    pub fn set_projected_columns(&mut self, names: &[&str]) -> Result<()> {
        let projection = self.table.schema().project(names)?;
        self.set_projection(projection)
    }

    /// AND another range predicate into the scan.
    pub fn add_conjunct_predicate(&mut self, predicate: ColumnRangePredicate) -> Result<()> {
        self.ensure_unopened("add_conjunct_predicate")?;
        let schema = self.table.schema();
        let column = predicate.column();
        let known = schema
            .find_column(&column.name)
            .and_then(|idx| schema.column(idx))
            .is_some_and(|existing| existing.data_type == column.data_type);
        if !known {
            return Err(ClientError::invalid_argument(format!(
                "predicate column {} is not in the schema of table {}",
                column.name,
                self.table.name()
            )));
        }
        self.predicates.push(predicate);
        Ok(())
    }

    /// Byte budget per batch. Zero makes `open` register the server scanner
    /// without fetching rows.
    pub fn set_batch_size_bytes(&mut self, batch_size_bytes: usize) -> Result<()> {
        self.ensure_unopened("set_batch_size_bytes")?;
        self.batch_size_bytes = batch_size_bytes;
        Ok(())
    }

    /// Locate the table's tablets and open the first one that has rows.
    pub async fn open(&mut self) -> Result<()> {
        self.ensure_unopened("open")?;
        let tablets = self
            .ctx
            .locator
            .tablets(self.table.name(), self.ctx.lookup_deadline())
            .await?;
        self.remaining = tablets.into();
        self.state = ScannerState::Open;

        while let Some(location) = self.remaining.pop_front() {
            if let Err(err) = self.open_tablet(location).await {
                self.remaining.clear();
                self.current = None;
                self.pending = None;
                self.state = ScannerState::Unopened;
                return Err(err);
            }
            if self.current_has_rows() {
                break;
            }
        }
        self.settle_state();
        tracing::debug!(
            table = self.table.name(),
            has_more = self.has_more_rows(),
            "opened scanner"
        );
        Ok(())
    }

    pub fn has_more_rows(&self) -> bool {
        match self.state {
            ScannerState::Open => {
                self.pending.is_some()
                    || self.current.as_ref().is_some_and(|scan| scan.has_more)
                    || !self.remaining.is_empty()
            }
            _ => false,
        }
    }

    /// Fetch the next batch, issuing at most one RPC.
    ///
    /// May return an empty batch while `has_more_rows` is still true, e.g.
    /// when crossing into a tablet with no matching rows.
    pub async fn next_batch(&mut self) -> Result<RowBatch> {
        match self.state {
            ScannerState::Unopened => {
                return Err(ClientError::illegal_state("scanner is not open"));
            }
            ScannerState::Closed => {
                return Err(ClientError::illegal_state("scanner is closed"));
            }
            ScannerState::Exhausted => {
                return Ok(RowBatch::new(Arc::clone(&self.projection), Vec::new()));
            }
            ScannerState::Open => {}
        }

        let rows = if let Some(rows) = self.pending.take() {
            rows
        } else if let Some(scanner_id) = self.continuation() {
            self.continue_tablet(scanner_id).await?
        } else if let Some(location) = self.remaining.front().cloned() {
            // A failed open leaves the tablet queued so a retry rescans it.
            self.open_tablet(location).await?;
            self.remaining.pop_front();
            self.pending.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        self.settle_state();
        Ok(RowBatch::new(Arc::clone(&self.projection), rows))
    }

    /// Release server-side state without waiting. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == ScannerState::Closed {
            return;
        }
        self.state = ScannerState::Closed;
        self.pending = None;
        self.remaining.clear();
        let Some(scan) = self.current.take() else {
            return;
        };
        let Some(scanner_id) = scan.scanner_id else {
            return;
        };

        let proxy = self.ctx.factory.tablet_server(scan.location.leader);
        let timeout = self.ctx.config.default_admin_operation_timeout;
        let leader = scan.location.leader;
        self.ctx.runtime.spawn(async move {
            let result = call_with_timeout(
                timeout,
                "close_scanner",
                leader,
                proxy.close_scanner(scanner_id),
            )
            .await;
            match result {
                Ok(()) => {
                    tracing::debug!(scanner_id = %scanner_id, %leader, "requested scanner close")
                }
                Err(err) => tracing::warn!(
                    scanner_id = %scanner_id,
                    %leader,
                    error = %err,
                    "failed to close scanner"
                ),
            }
        });
    }

    fn current_has_rows(&self) -> bool {
        self.pending.is_some() || self.current.as_ref().is_some_and(|scan| scan.has_more)
    }

    fn continuation(&self) -> Option<ScannerId> {
        let scan = self.current.as_ref()?;
        if scan.has_more {
            scan.scanner_id
        } else {
            None
        }
    }

    fn settle_state(&mut self) {
        if self.state == ScannerState::Open && !self.has_more_rows() {
            self.state = ScannerState::Exhausted;
        }
    }

    /// Open the scan on one tablet, buffering its first batch in `pending`.
    async fn open_tablet(&mut self, location: TabletLocation) -> Result<()> {
        let request = NewScanRequest {
            tablet_id: location.tablet_id.clone(),
            projection: self.projection.columns().to_vec(),
            predicates: self.predicates.clone(),
            batch_size_bytes: self.batch_size_bytes,
        };
        let ctx = Arc::clone(&self.ctx);
        let (location, response) = ctx
            .locator
            .call_with_refresh(
                self.table.name(),
                &location.start_key,
                ctx.lookup_deadline(),
                |location| {
                    let ctx = Arc::clone(&ctx);
                    let request = NewScanRequest {
                        tablet_id: location.tablet_id.clone(),
                        ..request.clone()
                    };
                    async move {
                        let proxy = ctx.factory.tablet_server(location.leader);
                        let response = call_with_timeout(
                            ctx.config.default_admin_operation_timeout,
                            "open_scanner",
                            location.leader,
                            proxy.open_scanner(request),
                        )
                        .await?;
                        match response.error {
                            Some(err) if err.is_stale_location() => {
                                Ok(TabletCall::Stale(err.status))
                            }
                            Some(err) => Err(err.status),
                            None => Ok(TabletCall::Complete((location, response))),
                        }
                    }
                },
            )
            .await?;

        let ScanResponse {
            scanner_id,
            rows,
            has_more,
            ..
        } = response;
        tracing::debug!(
            tablet_id = %location.tablet_id,
            rows = rows.len(),
            has_more,
            "opened tablet scan"
        );
        self.current = Some(TabletScan {
            location,
            scanner_id: scanner_id.filter(|_| has_more),
            has_more,
        });
        self.pending = (!rows.is_empty()).then_some(rows);
        Ok(())
    }

    async fn continue_tablet(&mut self, scanner_id: ScannerId) -> Result<Vec<Vec<Value>>> {
        let Some(scan) = self.current.as_mut() else {
            return Ok(Vec::new());
        };
        let proxy = self.ctx.factory.tablet_server(scan.location.leader);
        let response = call_with_timeout(
            self.ctx.config.default_admin_operation_timeout,
            "continue_scan",
            scan.location.leader,
            proxy.continue_scan(scanner_id, self.batch_size_bytes),
        )
        .await?;
        if let Some(err) = response.error {
            return Err(err.status);
        }
        scan.has_more = response.has_more;
        if !response.has_more {
            scan.scanner_id = None;
        }
        Ok(response.rows)
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_lookup_by_projected_name() {
        let schema = Schema::new(
            vec![
                crate::schema::ColumnSchema::new("key", crate::schema::DataType::UInt32),
                crate::schema::ColumnSchema::new("name", crate::schema::DataType::String),
            ],
            1,
        )
        .unwrap();
        let batch = RowBatch::new(
            Arc::new(schema),
            vec![vec![Value::UInt32(7), "seven".into()]],
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(0, "name"), Some(&Value::from("seven")));
        assert_eq!(batch.get(0, "missing"), None);
        assert_eq!(batch.rows()[0].to_string(), "(7, seven)");
    }

    #[test]
    fn empty_projection_rows_have_zero_width() {
        let batch = RowBatch::new(Arc::new(Schema::empty()), vec![Vec::new(), Vec::new()]);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|row| row.width() == 0));
    }
}
