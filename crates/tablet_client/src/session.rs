//! Buffered write sessions.
//!
//! A session accumulates [`MutationOp`]s and ships them on flush, grouped by
//! destination tablet with one batched write per tablet. Per-op failures land
//! in a bounded error queue the caller drains; the flush itself only reports
//! whether anything failed.
//!
//! An in-flight flush owns its own state through an `Arc<FlushBatch>` held by
//! every tablet write task. Dropping the session does not cancel it: the
//! callback fires from `FlushBatch::drop` once the last task lets go.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::client::ClientContext;
use crate::error::{ApplyError, ClientError, OpError, Result};
use crate::meta_cache::TabletLocation;
use crate::operation::MutationOp;
use crate::rpc::{call_with_timeout, RowOperation, TabletId, WriteRequest};

/// Completion callback for [`WriteSession::flush_async`].
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Ops stay buffered until `flush` or `flush_async`.
    ManualFlush,
    /// Ops are flushed periodically and whenever the buffer reaches the
    /// configured size.
    AutoFlushBackground,
}

/// Drained contents of a session's error queue.
#[derive(Debug, Default)]
pub struct PendingErrors {
    pub errors: Vec<OpError>,
    /// Some failures were dropped because the queue was full.
    pub overflowed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ErrorQueue {
    errors: VecDeque<OpError>,
    overflowed: bool,
}

/// Bounded queue of per-op failures, shared with in-flight flushes.
pub(crate) struct ErrorCollector {
    capacity: usize,
    queue: Mutex<ErrorQueue>,
}

impl ErrorCollector {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(ErrorQueue::default()),
        }
    }

    pub(crate) fn push(&self, error: OpError) {
        let mut queue = lock(&self.queue);
        if queue.errors.len() >= self.capacity {
            if !queue.overflowed {
                tracing::warn!(
                    capacity = self.capacity,
                    "session error queue is full; dropping further errors"
                );
            }
            queue.overflowed = true;
            return;
        }
        queue.errors.push_back(error);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.queue).errors.len()
    }

    pub(crate) fn drain(&self) -> PendingErrors {
        let mut queue = lock(&self.queue);
        PendingErrors {
            errors: queue.errors.drain(..).collect(),
            overflowed: mem::take(&mut queue.overflowed),
        }
    }
}

/// State of one flush, shared by every tablet write it dispatched.
struct FlushBatch {
    errors: Arc<ErrorCollector>,
    total: usize,
    finished: AtomicUsize,
    failed: AtomicUsize,
    callback: Mutex<Option<FlushCallback>>,
}

impl FlushBatch {
    fn new(total: usize, errors: Arc<ErrorCollector>, callback: FlushCallback) -> Self {
        Self {
            errors,
            total,
            finished: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn record_success(&self, count: usize) {
        self.finished.fetch_add(count, Ordering::AcqRel);
    }

    fn record_failure(&self, status: ClientError, op: MutationOp) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.finished.fetch_add(1, Ordering::AcqRel);
        self.errors.push(OpError::new(status, op));
    }

    fn fail_all(&self, status: &ClientError, ops: Vec<MutationOp>) {
        for op in ops {
            self.record_failure(status.clone(), op);
        }
    }
}

impl Drop for FlushBatch {
    fn drop(&mut self) {
        let finished = *self.finished.get_mut();
        let failed = *self.failed.get_mut();
        let status = if failed > 0 {
            Err(ClientError::io_error("Some errors occurred"))
        } else if finished < self.total {
            Err(ClientError::io_error(format!(
                "flush aborted with {} of {} operations unresolved",
                self.total - finished,
                self.total
            )))
        } else {
            Ok(())
        };
        tracing::debug!(
            ops = self.total,
            failed,
            ok = status.is_ok(),
            "flush completed"
        );
        let callback = self
            .callback
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(status);
        }
    }
}

/// Session state reachable from the background flusher through a `Weak`.
struct SessionShared {
    ctx: Arc<ClientContext>,
    buffer: Mutex<Vec<MutationOp>>,
    mode: Mutex<FlushMode>,
    errors: Arc<ErrorCollector>,
}

impl SessionShared {
    fn mode(&self) -> FlushMode {
        *lock(&self.mode)
    }

    fn count_buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    fn flush_async(&self, callback: FlushCallback) {
        let ops = mem::take(&mut *lock(&self.buffer));
        if ops.is_empty() {
            callback(Ok(()));
            return;
        }
        let batch = Arc::new(FlushBatch::new(
            ops.len(),
            Arc::clone(&self.errors),
            callback,
        ));
        let ctx = Arc::clone(&self.ctx);
        self.ctx.runtime.spawn(dispatch(ctx, batch, ops));
    }

    fn background_flush(&self) {
        self.flush_async(Box::new(|status| {
            if let Err(err) = status {
                tracing::warn!(error = %err, "background flush finished with errors");
            }
        }));
    }
}

/// Buffers mutations and ships them to tablet leaders.
///
/// Methods take `&self`, so one session may be shared between tasks behind
/// an `Arc`.
pub struct WriteSession {
    shared: Arc<SessionShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl WriteSession {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> Self {
        let errors = Arc::new(ErrorCollector::new(ctx.config.max_pending_errors));
        Self {
            shared: Arc::new(SessionShared {
                ctx,
                buffer: Mutex::new(Vec::new()),
                mode: Mutex::new(FlushMode::ManualFlush),
                errors,
            }),
            flusher: Mutex::new(None),
        }
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.shared.mode()
    }

    /// Switch flush mode. Only allowed while nothing is buffered.
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<()> {
        {
            let buffer = lock(&self.shared.buffer);
            if !buffer.is_empty() {
                return Err(ClientError::illegal_state(format!(
                    "Cannot change flush mode with {} buffered operations",
                    buffer.len()
                )));
            }
            *lock(&self.shared.mode) = mode;
        }

        let mut flusher = lock(&self.flusher);
        if let Some(handle) = flusher.take() {
            handle.abort();
        }
        if mode == FlushMode::AutoFlushBackground {
            *flusher = Some(spawn_flusher(&self.shared));
        }
        Ok(())
    }

    /// Buffer `op` for the next flush.
    ///
    /// Rejects ops whose key columns are not all set, handing the op back
    /// untouched. No I/O happens here except an early background flush in
    /// `AutoFlushBackground` mode.
    pub fn apply(&self, op: MutationOp) -> Result<(), ApplyError> {
        if !op.row().is_key_set() {
            let status = ClientError::illegal_state(format!("Key not specified: {op}"));
            return Err(ApplyError::new(status, op));
        }

        let buffered = {
            let mut buffer = lock(&self.shared.buffer);
            buffer.push(op);
            buffer.len()
        };
        if self.shared.mode() == FlushMode::AutoFlushBackground
            && buffered >= self.shared.ctx.config.auto_flush_max_buffered_ops
        {
            self.shared.background_flush();
        }
        Ok(())
    }

    /// Flush everything buffered and wait for every tablet write.
    ///
    /// `Ok` iff no op of this flush failed. Otherwise
    /// `IO error: Some errors occurred`, with details in the error queue.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.flush_async(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        rx.await
            .unwrap_or_else(|_| Err(ClientError::io_error("flush was abandoned")))
    }

    /// Start flushing and return immediately.
    ///
    /// The buffer is empty once this returns. `callback` runs exactly once,
    /// after every tablet write of this flush finished, whether or not the
    /// session still exists.
    pub fn flush_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.shared.flush_async(Box::new(callback));
    }

    pub fn count_buffered_operations(&self) -> usize {
        self.shared.count_buffered()
    }

    pub fn has_pending_operations(&self) -> bool {
        self.count_buffered_operations() > 0
    }

    pub fn count_pending_errors(&self) -> usize {
        self.shared.errors.len()
    }

    /// Drain the error queue.
    pub fn get_pending_errors(&self) -> PendingErrors {
        self.shared.errors.drain()
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.flusher).take() {
            handle.abort();
        }
        let discarded = self.shared.count_buffered();
        if discarded > 0 {
            tracing::warn!(
                discarded,
                "write session dropped with unflushed operations; discarding them"
            );
        }
    }
}

fn spawn_flusher(shared: &Arc<SessionShared>) -> JoinHandle<()> {
    let weak: Weak<SessionShared> = Arc::downgrade(shared);
    let period = shared.ctx.config.auto_flush_interval;
    shared.ctx.runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if shared.mode() != FlushMode::AutoFlushBackground {
                break;
            }
            if shared.count_buffered() > 0 {
                shared.background_flush();
            }
        }
    })
}

type TabletGroups = HashMap<TabletId, (TabletLocation, Vec<MutationOp>)>;

/// Resolve each op's tablet and bucket ops by tablet.
///
/// Tables are looked up concurrently, so an unreachable master costs one
/// deadline per flush rather than one per table.
async fn group_by_tablet(
    ctx: &ClientContext,
    batch: &FlushBatch,
    ops: Vec<MutationOp>,
    deadline: Instant,
) -> TabletGroups {
    let mut by_table: HashMap<String, Vec<(Bytes, MutationOp)>> = HashMap::new();
    for op in ops {
        match op.row().encoded_key() {
            Ok(key) => by_table
                .entry(op.table().name().to_string())
                .or_default()
                .push((key, op)),
            Err(status) => batch.record_failure(status, op),
        }
    }

    let lookups = by_table
        .into_iter()
        .map(|(table, ops)| locate_table_ops(ctx, batch, table, ops, deadline));
    let mut groups = TabletGroups::new();
    for located in join_all(lookups).await {
        for (location, op) in located {
            groups
                .entry(location.tablet_id.clone())
                .or_insert_with(|| (location, Vec::new()))
                .1
                .push(op);
        }
    }
    groups
}

/// Locate every op of one table. After the first lookup failure the rest of
/// the table's ops fail with the same status and no further master calls.
async fn locate_table_ops(
    ctx: &ClientContext,
    batch: &FlushBatch,
    table: String,
    ops: Vec<(Bytes, MutationOp)>,
    deadline: Instant,
) -> Vec<(TabletLocation, MutationOp)> {
    let mut located = Vec::with_capacity(ops.len());
    let mut ops = ops.into_iter();
    while let Some((key, op)) = ops.next() {
        match ctx.locator.locate(&table, &key, deadline).await {
            Ok(location) => located.push((location, op)),
            Err(status) => {
                tracing::warn!(
                    table = %table,
                    error = %status,
                    "failed to locate tablet for write"
                );
                batch.record_failure(status.clone(), op);
                for (_, op) in ops.by_ref() {
                    batch.record_failure(status.clone(), op);
                }
                break;
            }
        }
    }
    located
}

enum WriteOutcome {
    Done,
    Stale {
        status: ClientError,
        ops: Vec<MutationOp>,
    },
}

/// Send one batched write. Per-op outcomes are recorded on `batch`; a stale
/// leader or a transport failure hands the ops back when `retry` is set.
async fn send_write(
    ctx: &ClientContext,
    batch: &FlushBatch,
    location: &TabletLocation,
    ops: Vec<MutationOp>,
    retry: bool,
) -> WriteOutcome {
    let mut wire: Vec<RowOperation> = Vec::with_capacity(ops.len());
    let mut sendable = Vec::with_capacity(ops.len());
    for op in ops {
        match op.to_wire() {
            Ok(row) => {
                wire.push(row);
                sendable.push(op);
            }
            Err(status) => batch.record_failure(status, op),
        }
    }
    if sendable.is_empty() {
        return WriteOutcome::Done;
    }

    let proxy = ctx.factory.tablet_server(location.leader);
    let request = WriteRequest {
        tablet_id: location.tablet_id.clone(),
        ops: wire,
    };
    let response = call_with_timeout(
        ctx.config.default_admin_operation_timeout,
        "write",
        location.leader,
        proxy.write(request),
    )
    .await;

    let response = match response {
        Ok(response) => response,
        Err(status) if retry && status.is_network_error() => {
            return WriteOutcome::Stale {
                status,
                ops: sendable,
            };
        }
        Err(status) => {
            tracing::warn!(
                tablet_id = %location.tablet_id,
                leader = %location.leader,
                error = %status,
                ops = sendable.len(),
                "tablet write failed"
            );
            batch.fail_all(&status, sendable);
            return WriteOutcome::Done;
        }
    };

    if let Some(error) = response.error {
        if retry && error.is_stale_location() {
            return WriteOutcome::Stale {
                status: error.status,
                ops: sendable,
            };
        }
        batch.fail_all(&error.status, sendable);
        return WriteOutcome::Done;
    }

    let expected = sendable.len();
    let mut outcomes = response.per_op.into_iter();
    let mut succeeded = 0;
    for op in sendable {
        match outcomes.next() {
            Some(Ok(())) => succeeded += 1,
            Some(Err(status)) => batch.record_failure(status, op),
            None => batch.record_failure(
                ClientError::remote(format!(
                    "write response for tablet {} is missing outcomes for some of {expected} operations",
                    location.tablet_id
                )),
                op,
            ),
        }
    }
    batch.record_success(succeeded);
    WriteOutcome::Done
}

async fn write_to_tablet(
    ctx: Arc<ClientContext>,
    batch: Arc<FlushBatch>,
    location: TabletLocation,
    ops: Vec<MutationOp>,
) {
    let WriteOutcome::Stale { status, ops } = send_write(&ctx, &batch, &location, ops, true).await
    else {
        return;
    };

    tracing::warn!(
        tablet_id = %location.tablet_id,
        leader = %location.leader,
        error = %status,
        "tablet leader is stale; refreshing location and retrying once"
    );
    ctx.locator.invalidate(&location);
    let regrouped = group_by_tablet(&ctx, &batch, ops, ctx.lookup_deadline()).await;
    let retries = regrouped.into_values().map(|(location, ops)| {
        let ctx = &ctx;
        let batch = &batch;
        async move { send_write(ctx, batch, &location, ops, false).await }
    });
    // With `retry == false` every outcome is recorded inside `send_write`.
    join_all(retries).await;
}

async fn dispatch(ctx: Arc<ClientContext>, batch: Arc<FlushBatch>, ops: Vec<MutationOp>) {
    let groups = group_by_tablet(&ctx, &batch, ops, ctx.lookup_deadline()).await;
    tracing::debug!(tablets = groups.len(), "dispatching flush");
    for (location, ops) in groups.into_values() {
        ctx.runtime.spawn(write_to_tablet(
            Arc::clone(&ctx),
            Arc::clone(&batch),
            location,
            ops,
        ));
    }
}
