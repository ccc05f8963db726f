//! Client configuration.
//!
//! Everything that tunes resolution, retries and buffering is passed in at
//! construction; nothing here is process-global.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Every master replica; the leader is discovered at runtime.
    pub master_addrs: Vec<SocketAddr>,
    /// Per-RPC timeout for master and tablet-server calls.
    pub default_admin_operation_timeout: Duration,
    /// Overall deadline for leader resolution and location lookups.
    pub default_select_master_timeout: Duration,
    /// Cluster heartbeat period. Tablets become visible to the master at this
    /// cadence, so polling for a non-empty location list is spaced by it.
    pub heartbeat_interval: Duration,
    /// Cached tablet locations older than this are re-fetched.
    pub location_cache_ttl: Duration,
    /// First delay between failed master attempts.
    pub backoff_initial: Duration,
    /// Upper bound for the exponential master retry delay.
    pub backoff_max: Duration,
    /// Capacity of each session's error queue.
    pub max_pending_errors: usize,
    /// Default scan batch budget, in bytes.
    pub scanner_batch_size_bytes: usize,
    /// Background flush period for `AutoFlushBackground` sessions.
    pub auto_flush_interval: Duration,
    /// Buffered op count that triggers an early background flush.
    pub auto_flush_max_buffered_ops: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_addrs: Vec::new(),
            default_admin_operation_timeout: Duration::from_secs(10),
            default_select_master_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(1),
            location_cache_ttl: Duration::from_secs(300),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            max_pending_errors: 1024,
            scanner_batch_size_bytes: 1024 * 1024,
            auto_flush_interval: Duration::from_secs(1),
            auto_flush_max_buffered_ops: 1000,
        }
    }
}

impl ClientConfig {
    pub fn with_masters(master_addrs: Vec<SocketAddr>) -> Self {
        Self {
            master_addrs,
            ..Self::default()
        }
    }

    /// Build a config from `TABLET_CLIENT_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Replace every field that has a `TABLET_CLIENT_*` variable set, keeping
    /// the current value otherwise.
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let master_addrs = match lookup("TABLET_CLIENT_MASTER_ADDRS") {
            Some(raw) => parse_addr_list(&raw)?,
            None => self.master_addrs,
        };

        Ok(Self {
            master_addrs,
            default_admin_operation_timeout: parse_millis(
                lookup("TABLET_CLIENT_ADMIN_TIMEOUT_MS"),
                self.default_admin_operation_timeout,
            )?,
            default_select_master_timeout: parse_millis(
                lookup("TABLET_CLIENT_SELECT_MASTER_TIMEOUT_MS"),
                self.default_select_master_timeout,
            )?,
            heartbeat_interval: parse_millis(
                lookup("TABLET_CLIENT_HEARTBEAT_INTERVAL_MS"),
                self.heartbeat_interval,
            )?,
            location_cache_ttl: parse_millis(
                lookup("TABLET_CLIENT_LOCATION_CACHE_TTL_MS"),
                self.location_cache_ttl,
            )?,
            backoff_initial: parse_millis(
                lookup("TABLET_CLIENT_BACKOFF_INITIAL_MS"),
                self.backoff_initial,
            )?,
            backoff_max: parse_millis(lookup("TABLET_CLIENT_BACKOFF_MAX_MS"), self.backoff_max)?,
            max_pending_errors: parse_usize(
                lookup("TABLET_CLIENT_MAX_PENDING_ERRORS"),
                self.max_pending_errors,
            )?,
            scanner_batch_size_bytes: parse_usize(
                lookup("TABLET_CLIENT_SCANNER_BATCH_SIZE_BYTES"),
                self.scanner_batch_size_bytes,
            )?,
            auto_flush_interval: parse_millis(
                lookup("TABLET_CLIENT_AUTO_FLUSH_INTERVAL_MS"),
                self.auto_flush_interval,
            )?,
            auto_flush_max_buffered_ops: parse_usize(
                lookup("TABLET_CLIENT_AUTO_FLUSH_MAX_BUFFERED_OPS"),
                self.auto_flush_max_buffered_ops,
            )?
            .max(1),
        })
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> anyhow::Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_millis(value: Option<String>, default_value: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("invalid millisecond value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parse a comma-separated `host:port` list, skipping empty entries.
pub fn parse_addr_list(raw: &str) -> anyhow::Result<Vec<SocketAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<SocketAddr>()
                .with_context(|| format!("invalid socket address: {part}"))
        })
        .collect()
}
