//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tablet_client::mini_cluster::{MiniCluster, MiniClusterOptions};
use tablet_client::{
    ColumnSchema, DataType, Schema, Table, TabletClient, Value, WriteSession,
};

/// Upper bound for anything that converges asynchronously.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

pub const TABLE_NAME: &str = "client-testtb";
pub const TABLE2_NAME: &str = "client-testtb2";

/// `key uint32` primary key, `int_val uint32`, nullable `string_val string`.
pub fn test_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("key", DataType::UInt32),
            ColumnSchema::new("int_val", DataType::UInt32),
            ColumnSchema::new("string_val", DataType::String).nullable(),
        ],
        1,
    )
    .expect("valid test schema")
}

pub fn hello(idx: u32) -> String {
    format!("hello {idx}")
}

/// A started cluster with one empty table and a connected client.
pub struct TestEnv {
    pub cluster: MiniCluster,
    pub client: TabletClient,
    pub table: Arc<Table>,
}

pub async fn start_env(options: MiniClusterOptions) -> Result<TestEnv> {
    let cluster = MiniCluster::start(options).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    let client = cluster.client(cluster.client_config())?;
    let table = client
        .open_table(TABLE_NAME, test_schema())
        .await
        .context("open test table")?;
    Ok(TestEnv {
        cluster,
        client,
        table,
    })
}

pub async fn start_default_env() -> Result<TestEnv> {
    start_env(MiniClusterOptions::default()).await
}

/// Load `num_rows` rows `(i, 2*i, "hello i")` directly into storage.
pub fn insert_rows_locally(cluster: &MiniCluster, table: &str, num_rows: u32) -> Result<()> {
    let rows = (0..num_rows)
        .map(|idx| {
            vec![
                Value::UInt32(idx),
                Value::UInt32(idx * 2),
                Value::String(hello(idx)),
            ]
        })
        .collect();
    cluster.insert_rows_locally(table, rows)
}

/// Apply one insert of `(key, int_val, string_val)` to `session`.
pub fn apply_insert(
    session: &WriteSession,
    table: &Arc<Table>,
    key: u32,
    int_val: u32,
    string_val: &str,
) -> Result<()> {
    let mut op = table.new_insert();
    op.row_mut().set_u32("key", key)?;
    op.row_mut().set_u32("int_val", int_val)?;
    op.row_mut().set_string("string_val", string_val)?;
    session.apply(op)?;
    Ok(())
}

/// Scan every row of `table` and return the `key` column values.
pub async fn scan_keys(client: &TabletClient, table: &Arc<Table>) -> Result<Vec<u32>> {
    let mut scanner = client.new_scanner(table);
    scanner.set_projected_columns(&["key"])?;
    scanner.open().await?;
    let mut keys = Vec::new();
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        for row in batch.iter() {
            keys.push(
                row.value(0)
                    .and_then(Value::as_u32)
                    .context("key column is not a uint32")?,
            );
        }
    }
    scanner.close();
    Ok(keys)
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
