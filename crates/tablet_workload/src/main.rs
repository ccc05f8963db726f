//! Workload driver for the tablet client.
//!
//! Starts an in-process mini cluster, creates a pre-split table, writes rows
//! from several concurrent sessions and scans them back to verify that every
//! acknowledged write is visible exactly once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tablet_client::mini_cluster::{MiniCluster, MiniClusterOptions};
use tablet_client::{
    ClientConfig, ColumnRangePredicate, ColumnSchema, DataType, FlushMode, Schema, Table,
    TabletClient, Value, WriteSession,
};
use tracing_subscriber::EnvFilter;

const TABLE_NAME: &str = "workload";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "tablet-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// How writer sessions push their buffered rows.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
enum Mode {
    /// Explicit flush every `--flush-every` rows.
    Manual,
    /// Background flusher plus a final explicit flush.
    Background,
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of masters in the mini cluster.
    #[arg(long, default_value_t = 3)]
    masters: usize,

    /// Number of tablet servers in the mini cluster.
    #[arg(long, default_value_t = 3)]
    tablet_servers: usize,

    /// Number of tablets the table is pre-split into.
    #[arg(long, default_value_t = 8)]
    tablets: u32,

    /// Number of concurrent writer sessions.
    #[arg(long, default_value_t = 4)]
    writers: u32,

    /// Rows written by each writer.
    #[arg(long, default_value_t = 1000)]
    rows_per_writer: u32,

    /// Flush strategy used by writer sessions.
    #[arg(long, value_enum, default_value_t = Mode::Manual)]
    mode: Mode,

    /// Rows applied between explicit flushes in manual mode.
    #[arg(long, default_value_t = 100)]
    flush_every: u32,

    /// Scanner batch size in bytes.
    #[arg(long, default_value_t = 4096)]
    batch_size_bytes: usize,

    /// Master heartbeat interval of the mini cluster.
    #[arg(long, default_value = "50ms")]
    heartbeat: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optional path for a JSON run summary.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Run summary written with `--out`.
#[derive(serde::Serialize, Debug)]
struct Summary {
    masters: usize,
    tablet_servers: usize,
    tablets: u32,
    writers: u32,
    rows_per_writer: u32,
    mode: Mode,
    seed: u64,
    rows_written: u64,
    write_errors: usize,
    write_ms: u64,
    rows_scanned: u64,
    batches: u64,
    scan_ms: u64,
    predicate_rows: u64,
    client_config: ClientConfig,
}

/// Per-writer result.
#[derive(Debug, Default)]
struct WriterStats {
    rows: u64,
    errors: usize,
}

/// Result of a full-table verification scan.
#[derive(Debug, Default)]
struct ScanStats {
    rows: u64,
    batches: u64,
    key_sum: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tablet_client=info,tablet_workload=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn workload_schema() -> anyhow::Result<Schema> {
    Ok(Schema::new(
        vec![
            ColumnSchema::new("key", DataType::UInt32),
            ColumnSchema::new("writer", DataType::UInt32),
            ColumnSchema::new("payload", DataType::String).nullable(),
        ],
        1,
    )?)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.masters > 0, "--masters must be > 0");
    anyhow::ensure!(args.tablet_servers > 0, "--tablet-servers must be > 0");
    anyhow::ensure!(args.tablets > 0, "--tablets must be > 0");
    anyhow::ensure!(args.writers > 0, "--writers must be > 0");
    anyhow::ensure!(args.flush_every > 0, "--flush-every must be > 0");
    let total_rows = u64::from(args.writers) * u64::from(args.rows_per_writer);
    anyhow::ensure!(
        total_rows <= u64::from(u32::MAX),
        "--writers * --rows-per-writer must fit in a uint32 key"
    );

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = MiniCluster::start(MiniClusterOptions {
        num_masters: args.masters,
        num_tablet_servers: args.tablet_servers,
        heartbeat_interval: args.heartbeat.into(),
        ..MiniClusterOptions::default()
    })
    .await?;

    // Evenly spaced split points over the key range.
    let key_space = total_rows.max(1) as u32;
    let step = (key_space / args.tablets).max(1);
    let splits = (1..args.tablets)
        .map(|idx| idx * step)
        .take_while(|split| *split < key_space)
        .map(|split| vec![Value::UInt32(split)])
        .collect::<Vec<_>>();
    cluster
        .create_table(TABLE_NAME, workload_schema()?, &splits)
        .context("create workload table")?;

    // `TABLET_CLIENT_*` variables tune the client; the masters are always
    // the mini cluster's.
    let mut config = cluster
        .client_config()
        .with_env_overrides()
        .context("read TABLET_CLIENT_* overrides")?;
    config.master_addrs = cluster.master_addrs();
    config.scanner_batch_size_bytes = args.batch_size_bytes;
    let client = cluster.client(config.clone())?;
    let table = client.open_table(TABLE_NAME, workload_schema()?).await?;
    tracing::info!(
        table = TABLE_NAME,
        tablets = splits.len() + 1,
        writers = args.writers,
        rows = total_rows,
        seed,
        "starting workload"
    );

    let write_started = Instant::now();
    let mut tasks = Vec::with_capacity(args.writers as usize);
    for writer in 0..args.writers {
        let client = client.clone();
        let table = Arc::clone(&table);
        let args = args.clone();
        // Mix the base seed with the writer id for deterministic per-writer RNG.
        let seed = seed ^ u64::from(writer).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_writer(client, table, writer, &args, seed).await
        }));
    }

    let mut rows_written = 0u64;
    let mut write_errors = 0usize;
    for task in tasks {
        let stats = task.await.context("writer task panicked")??;
        rows_written += stats.rows;
        write_errors += stats.errors;
    }
    let write_elapsed = write_started.elapsed();
    tracing::info!(
        rows = rows_written,
        errors = write_errors,
        elapsed_ms = write_elapsed.as_millis() as u64,
        "writers finished"
    );

    let scan_started = Instant::now();
    let scan = scan_keys(&client, &table).await?;
    let scan_elapsed = scan_started.elapsed();
    tracing::info!(
        rows = scan.rows,
        batches = scan.batches,
        elapsed_ms = scan_elapsed.as_millis() as u64,
        "verification scan finished"
    );

    anyhow::ensure!(write_errors == 0, "{write_errors} row writes failed");
    anyhow::ensure!(
        scan.rows == total_rows,
        "scanned {} rows, expected {total_rows}",
        scan.rows
    );
    let expected_sum = total_rows * total_rows.saturating_sub(1) / 2;
    anyhow::ensure!(
        scan.key_sum == expected_sum,
        "key sum {} does not match expected {expected_sum}",
        scan.key_sum
    );

    let predicate_rows = count_writer_rows(&client, &table, 0).await?;
    anyhow::ensure!(
        predicate_rows == u64::from(args.rows_per_writer),
        "writer 0 has {predicate_rows} rows, expected {}",
        args.rows_per_writer
    );

    if let Some(out) = &args.out {
        let summary = Summary {
            masters: args.masters,
            tablet_servers: args.tablet_servers,
            tablets: args.tablets,
            writers: args.writers,
            rows_per_writer: args.rows_per_writer,
            mode: args.mode,
            seed,
            rows_written,
            write_errors,
            write_ms: write_elapsed.as_millis() as u64,
            rows_scanned: scan.rows,
            batches: scan.batches,
            scan_ms: scan_elapsed.as_millis() as u64,
            predicate_rows,
            client_config: config,
        };
        write_summary(out, &summary).context("write summary")?;
        eprintln!("wrote summary: {}", out.display());
    }
    Ok(())
}

/// Insert this writer's share of the key space in random order.
async fn run_writer(
    client: TabletClient,
    table: Arc<Table>,
    writer: u32,
    args: &RunArgs,
    seed: u64,
) -> anyhow::Result<WriterStats> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut keys = (0..args.rows_per_writer)
        .map(|idx| idx * args.writers + writer)
        .collect::<Vec<_>>();
    keys.shuffle(&mut rng);

    let session = client.new_session();
    if args.mode == Mode::Background {
        session.set_flush_mode(FlushMode::AutoFlushBackground)?;
    }

    let mut stats = WriterStats::default();
    for (idx, key) in keys.into_iter().enumerate() {
        let mut op = table.new_insert();
        op.row_mut().set_u32("key", key)?;
        op.row_mut().set_u32("writer", writer)?;
        if rng.gen_bool(0.9) {
            op.row_mut().set_string("payload", format!("w{writer}:{key}"))?;
        }
        session.apply(op)?;
        stats.rows += 1;

        if args.mode == Mode::Manual && (idx as u32 + 1) % args.flush_every == 0 {
            flush_session(&session, writer, &mut stats).await;
        }
    }
    flush_session(&session, writer, &mut stats).await;
    Ok(stats)
}

async fn flush_session(session: &WriteSession, writer: u32, stats: &mut WriterStats) {
    if let Err(err) = session.flush().await {
        tracing::warn!(writer, error = %err, "flush reported errors");
    }
    let pending = session.get_pending_errors();
    if pending.overflowed {
        tracing::warn!(writer, "error queue overflowed; some row errors were dropped");
    }
    for err in &pending.errors {
        tracing::warn!(writer, error = %err, "row write failed");
    }
    stats.errors += pending.errors.len();
}

/// Scan the whole table with a key-only projection.
async fn scan_keys(client: &TabletClient, table: &Arc<Table>) -> anyhow::Result<ScanStats> {
    let mut scanner = client.new_scanner(table);
    scanner.set_projected_columns(&["key"])?;
    scanner.open().await?;

    let mut stats = ScanStats::default();
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        stats.batches += 1;
        for row in batch.iter() {
            let key = row
                .value(0)
                .and_then(Value::as_u32)
                .context("key column is not a uint32")?;
            stats.rows += 1;
            stats.key_sum += u64::from(key);
        }
    }
    scanner.close();
    Ok(stats)
}

/// Count the rows written by `writer` with a pushed-down predicate.
async fn count_writer_rows(
    client: &TabletClient,
    table: &Arc<Table>,
    writer: u32,
) -> anyhow::Result<u64> {
    let column = table
        .schema()
        .find_column("writer")
        .and_then(|idx| table.schema().column(idx))
        .cloned()
        .context("workload table has no writer column")?;

    let mut scanner = client.new_scanner(table);
    scanner.set_projected_columns(&["writer"])?;
    scanner.add_conjunct_predicate(ColumnRangePredicate::new(
        column,
        Some(Value::UInt32(writer)),
        Some(Value::UInt32(writer)),
    )?)?;
    scanner.open().await?;

    let mut rows = 0u64;
    while scanner.has_more_rows() {
        rows += scanner.next_batch().await?.len() as u64;
    }
    scanner.close();
    Ok(rows)
}

/// Serialize and write the run summary JSON.
fn write_summary(path: &PathBuf, summary: &Summary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
