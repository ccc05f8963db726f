//! Leader resolution and location refresh under master and tablet failover.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use common::{apply_insert, hello, scan_keys, test_schema, TABLE_NAME};
use tablet_client::mini_cluster::{MiniCluster, MiniClusterOptions};
use tablet_client::{ErrorKind, MasterLeaderResolver};

async fn three_master_cluster() -> Result<MiniCluster> {
    let cluster = MiniCluster::start(MiniClusterOptions {
        num_masters: 3,
        num_tablet_servers: 2,
        ..MiniClusterOptions::default()
    })
    .await?;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;
    Ok(cluster)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolver_finds_the_leader_among_followers() -> Result<()> {
    let cluster = three_master_cluster().await?;
    cluster.step_down_master(2)?;

    let resolver = MasterLeaderResolver::new(cluster.client_config(), cluster.proxy_factory())?;
    let leader = resolver
        .resolve_leader(Instant::now() + Duration::from_secs(5))
        .await?;
    assert_eq!(leader, cluster.master(2)?.addr());
    assert_eq!(resolver.cached_leader(), Some(leader));

    resolver.invalidate(cluster.master(0)?.addr());
    assert_eq!(resolver.cached_leader(), Some(leader));
    resolver.invalidate(leader);
    assert_eq!(resolver.cached_leader(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_follow_master_leadership_changes() -> Result<()> {
    let cluster = three_master_cluster().await?;
    let client = cluster.client(cluster.client_config())?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;
    assert_eq!(client.cached_master_leader(), Some(cluster.master(0)?.addr()));

    // The old leader goes away and another master takes over.
    cluster.shutdown_master(0)?;
    cluster.step_down_master(1)?;
    client.invalidate_table_locations(TABLE_NAME);

    let session = client.new_session();
    apply_insert(&session, &table, 1, 1, "after failover")?;
    session.flush().await?;
    assert_eq!(client.cached_master_leader(), Some(cluster.master(1)?.addr()));

    // A live follower answering "not the leader" also redirects.
    cluster.restart_master(0)?;
    cluster.step_down_master(2)?;
    client.invalidate_table_locations(TABLE_NAME);
    apply_insert(&session, &table, 2, 2, "after step down")?;
    session.flush().await?;
    assert_eq!(client.cached_master_leader(), Some(cluster.master(2)?.addr()));

    assert_eq!(scan_keys(&client, &table).await?, vec![1, 2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_waits_for_catalog_initialization() -> Result<()> {
    let cluster = three_master_cluster().await?;
    cluster.set_catalog_initialized(false);
    let client = cluster.client(cluster.client_config())?;

    let started = Instant::now();
    let (opened, ()) = tokio::join!(client.open_table(TABLE_NAME, test_schema()), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cluster.set_catalog_initialized(true);
    });
    let table = opened?;
    assert_eq!(table.name(), TABLE_NAME);
    assert!(started.elapsed() >= Duration::from_millis(300));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_tablet_leader_is_refreshed_once() -> Result<()> {
    let cluster = three_master_cluster().await?;
    let client = cluster.client(cluster.client_config())?;
    let table = client.open_table(TABLE_NAME, test_schema()).await?;
    let tablet_id = cluster
        .tablet_ids(TABLE_NAME)
        .into_iter()
        .next()
        .expect("table has a tablet");

    let session = client.new_session();
    apply_insert(&session, &table, 1, 1, &hello(1))?;
    session.flush().await?;

    // The cached location still points at server 0.
    cluster.move_tablet_leader(&tablet_id, 1).await?;
    apply_insert(&session, &table, 2, 2, &hello(2))?;
    session.flush().await?;
    assert_eq!(session.count_pending_errors(), 0);

    // Scans take the same refresh path.
    cluster.move_tablet_leader(&tablet_id, 0).await?;
    assert_eq!(scan_keys(&client, &table).await?, vec![1, 2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_table_is_not_found() -> Result<()> {
    let cluster = three_master_cluster().await?;
    let client = cluster.client(cluster.client_config())?;
    let err = client
        .open_table("no-such-table", test_schema())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("no-such-table"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_times_out_when_every_master_is_down() -> Result<()> {
    let cluster = three_master_cluster().await?;
    for idx in 0..3 {
        cluster.shutdown_master(idx)?;
    }
    let mut config = cluster.client_config();
    config.default_select_master_timeout = Duration::from_millis(500);
    config.default_admin_operation_timeout = Duration::from_millis(500);
    let client = cluster.client(config)?;

    let started = Instant::now();
    let err = client
        .open_table(TABLE_NAME, test_schema())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(err.message().contains(" ms"), "no elapsed time in: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tablets_appear_after_heartbeat() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions {
        heartbeat_interval: Duration::from_secs(1),
        ..MiniClusterOptions::default()
    })
    .await?;
    // The first heartbeat fires at startup, before the table exists.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;

    let resolver = MasterLeaderResolver::new(cluster.client_config(), cluster.proxy_factory())?;
    let locations = resolver
        .get_table_locations(TABLE_NAME, Instant::now() + Duration::from_secs(5))
        .await?;
    assert!(locations.is_empty());

    let client = cluster.client(cluster.client_config())?;
    client.open_table(TABLE_NAME, test_schema()).await?;
    let locations = resolver
        .get_table_locations(TABLE_NAME, Instant::now() + Duration::from_secs(5))
        .await?;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].leader, cluster.tablet_server(0)?.addr());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unpartitioned_table_is_not_found_after_polling() -> Result<()> {
    let cluster = MiniCluster::start(MiniClusterOptions {
        heartbeat_interval: Duration::from_secs(60),
        ..MiniClusterOptions::default()
    })
    .await?;
    // Created after the first heartbeat, so no tablet is reported in time.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.create_table(TABLE_NAME, test_schema(), &[])?;

    let mut config = cluster.client_config();
    config.default_select_master_timeout = Duration::from_millis(500);
    config.default_admin_operation_timeout = Duration::from_millis(500);
    let client = cluster.client(config)?;

    let started = Instant::now();
    let err = client
        .open_table(TABLE_NAME, test_schema())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.kind(), ErrorKind::NotFound, "unexpected error {err}");
    assert!(err.message().contains("has no tablet locations"), "{err}");
    assert!(!err.message().contains("after 0 ms"), "{err}");
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_is_bounded_by_the_select_master_timeout() -> Result<()> {
    let cluster = three_master_cluster().await?;
    cluster.set_catalog_initialized(false);
    let mut config = cluster.client_config();
    config.default_admin_operation_timeout = Duration::from_millis(200);
    config.default_select_master_timeout = Duration::from_secs(5);
    let client = cluster.client(config)?;

    // Initialization takes longer than one admin timeout but fits the
    // select-master timeout.
    let (opened, ()) = tokio::join!(client.open_table(TABLE_NAME, test_schema()), async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        cluster.set_catalog_initialized(true);
    });
    assert_eq!(opened?.name(), TABLE_NAME);
    Ok(())
}
