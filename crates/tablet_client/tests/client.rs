//! End-to-end client behavior against an in-process cluster: scans,
//! scanner lifecycle, write sessions and their error reporting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{
    apply_insert, hello, insert_rows_locally, scan_keys, start_default_env, start_env,
    test_schema, wait_until, CONVERGE_TIMEOUT, TABLE2_NAME, TABLE_NAME,
};
use tablet_client::mini_cluster::{MiniCluster, MiniClusterOptions};
use tablet_client::{
    ColumnRangePredicate, ColumnSchema, DataType, ErrorKind, FlushMode, Schema, ScannerState,
    Value,
};
use tokio::sync::oneshot;

const NUM_ROWS: u32 = 1000;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_only_scan_sums_to_closed_form() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, NUM_ROWS)?;

    let keys = scan_keys(&env.client, &env.table).await?;
    assert_eq!(keys.len(), NUM_ROWS as usize);
    let sum: u64 = keys.iter().map(|k| u64::from(*k)).sum();
    let n = u64::from(NUM_ROWS);
    assert_eq!(sum, n * (n - 1) / 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_batches_paginate_through_every_row() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, NUM_ROWS)?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.set_projected_columns(&["key"])?;
    scanner.set_batch_size_bytes(64)?;
    scanner.open().await?;
    assert_eq!(env.cluster.count_active_scanners(), 1);

    let mut batches = 0;
    let mut sum = 0u64;
    let mut count = 0usize;
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        assert!(batch.len() <= 16);
        batches += 1;
        count += batch.len();
        sum += batch
            .iter()
            .filter_map(|row| row.value(0).and_then(Value::as_u32))
            .map(u64::from)
            .sum::<u64>();
    }
    assert!(batches > 1);
    assert_eq!(count, NUM_ROWS as usize);
    let n = u64::from(NUM_ROWS);
    assert_eq!(sum, n * (n - 1) / 2);
    assert_eq!(scanner.state(), ScannerState::Exhausted);

    // A drained scan releases its server-side state without an explicit close.
    assert_eq!(env.cluster.count_active_scanners(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn string_range_predicate_is_inclusive_and_prefix_aware() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, NUM_ROWS)?;

    let string_col = env
        .table
        .schema()
        .columns()
        .iter()
        .find(|column| column.name == "string_val")
        .cloned()
        .context("string_val column")?;
    let predicate = ColumnRangePredicate::new(
        string_col,
        Some(Value::from("hello 2")),
        Some(Value::from("hello 3")),
    )?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.add_conjunct_predicate(predicate)?;
    scanner.open().await?;

    let mut count = 0;
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        for idx in 0..batch.len() {
            let value = batch
                .get(idx, "string_val")
                .and_then(Value::as_str)
                .context("string_val missing")?;
            assert!(
                ("hello 2"..="hello 3").contains(&value),
                "{value} is outside the predicate range"
            );
            count += 1;
        }
    }
    // "hello 2", "hello 20".."hello 29", "hello 200".."hello 299", "hello 3".
    assert_eq!(count, 112);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_table_has_no_rows() -> Result<()> {
    let env = start_default_env().await?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.open().await?;
    assert!(!scanner.has_more_rows());
    assert!(scanner.next_batch().await?.is_empty());
    assert_eq!(env.cluster.count_active_scanners(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_projection_preserves_row_count() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, NUM_ROWS)?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.set_projection(Schema::empty())?;
    scanner.open().await?;

    let mut count = 0;
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        assert!(batch.iter().all(|row| row.width() == 0));
        count += batch.len();
    }
    assert_eq!(count, NUM_ROWS as usize);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scanner_close_releases_server_state() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, 10)?;

    // Every row fits the first batch, so the server never registers a scanner.
    {
        let mut scanner = env.client.new_scanner(&env.table);
        scanner.open().await?;
        assert_eq!(env.cluster.count_active_scanners(), 0);
        scanner.close();
        scanner.close();
    }

    // A zero budget registers the scanner without returning rows.
    let mut scanner = env.client.new_scanner(&env.table);
    scanner.set_batch_size_bytes(0)?;
    scanner.open().await?;
    assert!(scanner.has_more_rows());
    assert_eq!(env.cluster.count_active_scanners(), 1);
    scanner.close();
    assert_eq!(scanner.state(), ScannerState::Closed);
    assert!(scanner.next_batch().await.is_err());
    assert!(
        wait_until(CONVERGE_TIMEOUT, || env.cluster.count_active_scanners() == 0).await,
        "explicitly closed scanner was never released"
    );

    // Dropping an open scanner takes the same path.
    {
        let mut scanner = env.client.new_scanner(&env.table);
        scanner.set_batch_size_bytes(0)?;
        scanner.open().await?;
        assert_eq!(env.cluster.count_active_scanners(), 1);
    }
    assert!(
        wait_until(CONVERGE_TIMEOUT, || env.cluster.count_active_scanners() == 0).await,
        "dropped scanner was never released"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_budget_scan_fetches_rows_on_first_next_batch() -> Result<()> {
    let env = start_default_env().await?;
    insert_rows_locally(&env.cluster, TABLE_NAME, 5)?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.set_batch_size_bytes(0)?;
    scanner.open().await?;
    let mut count = 0;
    while scanner.has_more_rows() {
        count += scanner.next_batch().await?.len();
    }
    assert_eq!(count, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scanner_rejects_configuration_after_open() -> Result<()> {
    let env = start_default_env().await?;
    let mut scanner = env.client.new_scanner(&env.table);
    assert_eq!(
        scanner
            .set_projected_columns(&["nope"])
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
    scanner.open().await?;
    assert!(scanner.set_batch_size_bytes(10).unwrap_err().is_illegal_state());
    assert!(scanner
        .set_projection(Schema::empty())
        .unwrap_err()
        .is_illegal_state());
    assert!(scanner.open().await.unwrap_err().is_illegal_state());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_without_key_is_rejected_and_op_stays_usable() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();

    let mut op = env.table.new_insert();
    op.row_mut().set_u32("int_val", 54321)?;
    op.row_mut().set_string("string_val", "hello world")?;
    let err = session.apply(op).unwrap_err();
    assert_eq!(
        err.status().to_string(),
        "Illegal state: Key not specified: INSERT uint32 int_val=54321, string string_val=hello world"
    );
    assert_eq!(session.count_buffered_operations(), 0);

    let mut op = err.into_op();
    op.row_mut().set_u32("key", 12345)?;
    session.apply(op)?;
    assert_eq!(session.count_buffered_operations(), 1);
    assert!(session.has_pending_operations());
    session.flush().await?;
    assert_eq!(scan_keys(&env.client, &env.table).await?, vec![12345]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_row_manual_flush() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();
    apply_insert(&session, &env.table, 1, 1, "original row")?;
    assert_eq!(session.count_buffered_operations(), 1);

    session.flush().await?;
    assert!(!session.has_pending_operations());
    assert_eq!(session.count_pending_errors(), 0);
    assert_eq!(scan_keys(&env.client, &env.table).await?, vec![1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn updates_and_deletes_round_trip() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();
    for key in 0..4 {
        apply_insert(&session, &env.table, key, key, &hello(key))?;
    }
    session.flush().await?;

    let mut update = env.table.new_update();
    update.row_mut().set_u32("key", 1)?;
    update.row_mut().set_u32("int_val", 100)?;
    session.apply(update)?;
    let mut delete = env.table.new_delete();
    delete.row_mut().set_u32("key", 2)?;
    session.apply(delete)?;
    session.flush().await?;

    let mut scanner = env.client.new_scanner(&env.table);
    scanner.set_projected_columns(&["key", "int_val"])?;
    scanner.open().await?;
    let mut rows = Vec::new();
    while scanner.has_more_rows() {
        for row in scanner.next_batch().await? {
            rows.push(row.into_values());
        }
    }
    assert_eq!(
        rows,
        vec![
            vec![Value::UInt32(0), Value::UInt32(0)],
            vec![Value::UInt32(1), Value::UInt32(100)],
            vec![Value::UInt32(3), Value::UInt32(3)],
        ]
    );

    let mut missing = env.table.new_delete();
    missing.row_mut().set_u32("key", 77)?;
    session.apply(missing)?;
    assert!(session.flush().await.unwrap_err().is_io_error());
    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 1);
    assert!(pending.errors[0].status().is_not_found());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_flush_callback_outlives_session() -> Result<()> {
    let env = start_default_env().await?;

    let (tx, rx) = oneshot::channel();
    {
        let session = env.client.new_session();
        apply_insert(&session, &env.table, 1, 1, "row")?;
        session.flush_async(move |status| {
            let _ = tx.send(status);
        });
        assert_eq!(session.count_buffered_operations(), 0);
    }
    let status = tokio::time::timeout(CONVERGE_TIMEOUT, rx).await??;
    assert!(status.is_ok(), "unexpected flush status {status:?}");

    // Same again, but the write collides with the row above.
    let (tx, rx) = oneshot::channel();
    {
        let session = env.client.new_session();
        apply_insert(&session, &env.table, 1, 2, "dup")?;
        session.flush_async(move |status| {
            let _ = tx.send(status);
        });
        assert_eq!(session.count_buffered_operations(), 0);
    }
    let status = tokio::time::timeout(CONVERGE_TIMEOUT, rx).await??;
    let err = status.unwrap_err();
    assert!(err.is_io_error());
    assert!(err.to_string().contains("Some errors occurred"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_session_writes_to_two_tables() -> Result<()> {
    let env = start_default_env().await?;
    env.cluster.create_table(TABLE2_NAME, test_schema(), &[])?;
    let table2 = env.client.open_table(TABLE2_NAME, test_schema()).await?;

    let session = env.client.new_session();
    for key in 0..10 {
        apply_insert(&session, &env.table, key, key, &hello(key))?;
        apply_insert(&session, &table2, key + 100, key, &hello(key))?;
    }
    assert_eq!(session.count_buffered_operations(), 20);
    session.flush().await?;

    assert_eq!(scan_keys(&env.client, &env.table).await?, (0..10).collect::<Vec<_>>());
    assert_eq!(scan_keys(&env.client, &table2).await?, (100..110).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_insert_is_the_only_error() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();
    apply_insert(&session, &env.table, 1, 1, "original row")?;
    session.flush().await?;

    apply_insert(&session, &env.table, 1, 1, "Attempted dup")?;
    apply_insert(&session, &env.table, 2, 1, "Should succeed")?;
    let err = session.flush().await.unwrap_err();
    assert!(err.to_string().contains("Some errors occurred"));

    let pending = session.get_pending_errors();
    assert!(!pending.overflowed);
    assert_eq!(pending.errors.len(), 1);
    let error = &pending.errors[0];
    assert!(error.status().is_already_present());
    assert_eq!(
        error.failed_op().to_string(),
        "INSERT uint32 key=1, uint32 int_val=1, string string_val=Attempted dup"
    );
    assert_eq!(session.count_pending_errors(), 0);

    assert_eq!(scan_keys(&env.client, &env.table).await?, vec![1, 2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flushing_nothing_is_ok() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();
    session.flush().await?;
    assert_eq!(session.count_pending_errors(), 0);

    let (tx, rx) = oneshot::channel();
    session.flush_async(move |status| {
        let _ = tx.send(status);
    });
    assert!(rx.await?.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_with_dead_master_times_out() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions::default()).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    let mut config = cluster.client_config();
    config.default_select_master_timeout = Duration::from_secs(1);
    config.default_admin_operation_timeout = Duration::from_millis(500);
    // Force every write to look its tablet up at the master.
    config.location_cache_ttl = Duration::ZERO;
    let client = cluster.client(config)?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;

    cluster.shutdown_master(0)?;
    let session = client.new_session();
    apply_insert(&session, &table, 1, 1, "row")?;
    let err = session.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoError);

    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 1);
    assert!(
        pending.errors[0].status().is_timed_out(),
        "unexpected status {}",
        pending.errors[0].status()
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_with_dead_tablet_server_reports_network_error() -> Result<()> {
    let env = start_default_env().await?;
    env.cluster.shutdown_tablet_server(0)?;

    let session = env.client.new_session();
    apply_insert(&session, &env.table, 1, 1, "row")?;
    let err = session.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoError);

    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 1);
    let status = pending.errors[0].status();
    assert!(status.is_network_error(), "unexpected status {status}");
    assert!(status.to_string().contains("Connection refused"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_session_discards_unflushed_ops() -> Result<()> {
    let env = start_default_env().await?;
    {
        let session = env.client.new_session();
        for key in 0..5 {
            apply_insert(&session, &env.table, key, key, &hello(key))?;
        }
        assert_eq!(session.count_buffered_operations(), 5);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.cluster.count_rows(TABLE_NAME), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_with_column_missing_from_server_schema() -> Result<()> {
    let env = start_default_env().await?;
    let bad_schema = Schema::new(
        vec![
            ColumnSchema::new("key", DataType::UInt32),
            ColumnSchema::new("int_val", DataType::UInt32),
            ColumnSchema::new("string_val", DataType::String).nullable(),
            ColumnSchema::new("bad_col", DataType::UInt32).nullable(),
        ],
        1,
    )?;
    let bad_table = env.client.open_table(TABLE_NAME, bad_schema).await?;

    let session = env.client.new_session();
    let mut op = bad_table.new_insert();
    op.row_mut().set_u32("key", 12345)?;
    op.row_mut().set_u32("int_val", 1)?;
    op.row_mut().set_u32("bad_col", 12345)?;
    session.apply(op)?;
    assert!(session.flush().await.is_err());

    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 1);
    assert_eq!(
        pending.errors[0].status().to_string(),
        "Invalid argument: Some columns are not present in the current schema: bad_col"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_queue_overflow_is_reported() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions::default()).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    insert_rows_locally(&cluster, TABLE_NAME, 5)?;
    let mut config = cluster.client_config();
    config.max_pending_errors = 2;
    let client = cluster.client(config)?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;

    let session = client.new_session();
    for key in 0..5 {
        apply_insert(&session, &table, key, key, "dup")?;
    }
    assert!(session.flush().await.is_err());
    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 2);
    assert!(pending.overflowed);
    assert!(pending
        .errors
        .iter()
        .all(|error| error.status().is_already_present()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_flush_ships_buffered_ops() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions::default()).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    let mut config = cluster.client_config();
    config.auto_flush_interval = Duration::from_millis(50);
    config.auto_flush_max_buffered_ops = 1_000_000;
    let client = cluster.client(config)?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;

    let session = client.new_session();
    session.set_flush_mode(FlushMode::AutoFlushBackground)?;
    for key in 0..20 {
        apply_insert(&session, &table, key, key, &hello(key))?;
    }
    assert!(
        wait_until(CONVERGE_TIMEOUT, || cluster.count_rows(TABLE_NAME) == 20).await,
        "background flusher never shipped the buffered ops"
    );
    assert_eq!(session.count_buffered_operations(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_threshold_triggers_flush() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions::default()).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    let mut config = cluster.client_config();
    config.auto_flush_interval = Duration::from_secs(3600);
    config.auto_flush_max_buffered_ops = 5;
    let client = cluster.client(config)?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;

    let session = client.new_session();
    session.set_flush_mode(FlushMode::AutoFlushBackground)?;
    for key in 0..5 {
        apply_insert(&session, &table, key, key, &hello(key))?;
    }
    assert_eq!(session.count_buffered_operations(), 0);
    assert!(wait_until(CONVERGE_TIMEOUT, || cluster.count_rows(TABLE_NAME) == 5).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_mode_cannot_change_with_buffered_ops() -> Result<()> {
    let env = start_default_env().await?;
    let session = env.client.new_session();
    apply_insert(&session, &env.table, 1, 1, "row")?;
    let err = session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(session.flush_mode(), FlushMode::ManualFlush);
    session.flush().await?;
    session.set_flush_mode(FlushMode::AutoFlushBackground)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_tablet_table_routes_and_scans_in_key_order() -> Result<()> {
    let env = start_env(MiniClusterOptions {
        num_tablet_servers: 3,
        ..MiniClusterOptions::default()
    })
    .await?;
    let splits = [250u32, 500, 750]
        .into_iter()
        .map(|key| vec![Value::UInt32(key)])
        .collect::<Vec<_>>();
    env.cluster.create_table(TABLE2_NAME, test_schema(), &splits)?;
    assert_eq!(env.cluster.tablet_ids(TABLE2_NAME).len(), 4);
    let table = env.client.open_table(TABLE2_NAME, test_schema()).await?;

    let session = Arc::new(env.client.new_session());
    let writers = (0..4u32)
        .map(|worker| {
            let session = Arc::clone(&session);
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                for key in (worker..NUM_ROWS).step_by(4) {
                    apply_insert(&session, &table, key, key, &hello(key))?;
                }
                anyhow::Ok(())
            })
        })
        .collect::<Vec<_>>();
    for writer in writers {
        writer.await??;
    }
    session.flush().await?;

    let keys = scan_keys(&env.client, &table).await?;
    assert_eq!(keys, (0..NUM_ROWS).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_tablet_open_is_retried_by_next_batch() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions {
        num_tablet_servers: 2,
        ..MiniClusterOptions::default()
    })
    .await?;
    // Tablet 0 lands on server 0, tablet 1 on server 1.
    cluster.create_table(TABLE_NAME, test_schema(), &[vec![Value::UInt32(5)]])?;
    insert_rows_locally(&cluster, TABLE_NAME, 10)?;
    let client = cluster.client(cluster.client_config())?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;

    let mut scanner = client.new_scanner(&table);
    scanner.set_projected_columns(&["key"])?;
    scanner.open().await?;
    let mut keys = scanner
        .next_batch()
        .await?
        .iter()
        .filter_map(|row| row.value(0).and_then(Value::as_u32))
        .collect::<Vec<_>>();
    assert_eq!(keys, (0..5).collect::<Vec<_>>());

    cluster.shutdown_tablet_server(1)?;
    let err = scanner.next_batch().await.unwrap_err();
    assert!(err.is_network_error(), "unexpected error {err}");
    assert!(scanner.has_more_rows());

    cluster.restart_tablet_server(1)?;
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        keys.extend(
            batch
                .iter()
                .filter_map(|row| row.value(0).and_then(Value::as_u32)),
        );
    }
    assert_eq!(keys, (0..10).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_master_costs_one_lookup_deadline_across_tables() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions::default()).await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    cluster.create_table(TABLE2_NAME, test_schema(), &[])?;
    let mut config = cluster.client_config();
    config.default_select_master_timeout = Duration::from_secs(1);
    config.default_admin_operation_timeout = Duration::from_millis(500);
    let client = cluster.client(config)?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;
    let table2 = client.open_table(TABLE2_NAME, test_schema()).await?;

    cluster.shutdown_master(0)?;
    client.invalidate_table_locations(TABLE_NAME);
    client.invalidate_table_locations(TABLE2_NAME);
    let session = client.new_session();
    for key in 0..3 {
        apply_insert(&session, &table, key, key, "first")?;
        apply_insert(&session, &table2, key, key, "second")?;
    }

    let started = std::time::Instant::now();
    let err = session.flush().await.unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.kind(), ErrorKind::IoError);
    assert!(
        elapsed < Duration::from_millis(1800),
        "tables were looked up one after another: {elapsed:?}"
    );

    let pending = session.get_pending_errors();
    assert_eq!(pending.errors.len(), 6);
    assert!(pending.errors.iter().all(|err| err.status().is_timed_out()));
    Ok(())
}
