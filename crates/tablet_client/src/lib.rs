//! Client data-access layer for a tablet-partitioned table store.
//!
//! - [`TabletClient`] resolves the leader master, caches tablet locations
//!   and hands out sessions and scanners.
//! - [`WriteSession`] buffers mutations, ships them per tablet and reports
//!   per-row failures through a bounded error queue.
//! - [`Scanner`] runs paginated scans with projection and predicate pushdown.
//! - [`ScannerRegistry`] is the server-side bookkeeping of open scans.
//!
//! The transport is abstracted behind the traits in [`rpc`]; the
//! [`mini_cluster`] module provides an in-process implementation.

pub mod client;
pub mod config;
pub mod error;
pub mod master_resolver;
pub mod meta_cache;
pub mod mini_cluster;
pub mod operation;
pub mod predicate;
pub mod rpc;
pub mod scanner;
pub mod scanner_registry;
pub mod schema;
pub mod session;
pub mod table_locator;

pub use client::TabletClient;
pub use config::ClientConfig;
pub use error::{ApplyError, ClientError, ErrorKind, OpError, Result};
pub use master_resolver::{MasterLeaderResolver, RetryBackoff};
pub use meta_cache::{TabletLocation, TabletLocationCache};
pub use operation::{MutationOp, OpType};
pub use predicate::ColumnRangePredicate;
pub use scanner::{RowBatch, ScanRow, Scanner, ScannerState};
pub use scanner_registry::ScannerRegistry;
pub use schema::{ColumnSchema, DataType, PartialRow, Schema, Value};
pub use session::{FlushMode, PendingErrors, WriteSession};
pub use table_locator::{Table, TableLocator, TabletCall};
