//! Client handle: owns the routing state and hands out sessions and scanners.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::rpc::ProxyFactory;
use crate::scanner::Scanner;
use crate::schema::Schema;
use crate::session::WriteSession;
use crate::table_locator::{Table, TableLocator};

/// State shared by the client, its sessions, scanners and in-flight RPC tasks.
pub(crate) struct ClientContext {
    pub(crate) config: ClientConfig,
    pub(crate) locator: TableLocator,
    pub(crate) factory: Arc<dyn ProxyFactory>,
    /// Runtime that RPC completions and fire-and-forget closes run on.
    pub(crate) runtime: Handle,
}

impl ClientContext {
    /// Deadline for one round of location lookups started now.
    pub(crate) fn lookup_deadline(&self) -> Instant {
        Instant::now() + self.config.default_select_master_timeout
    }
}

/// Cheap to clone; every clone shares the same location cache.
#[derive(Clone)]
pub struct TabletClient {
    ctx: Arc<ClientContext>,
}

impl TabletClient {
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig, factory: Arc<dyn ProxyFactory>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            ClientError::illegal_state(format!("client requires a tokio runtime: {err}"))
        })?;
        let locator = TableLocator::new(config.clone(), Arc::clone(&factory))?;
        Ok(Self {
            ctx: Arc::new(ClientContext {
                config,
                locator,
                factory,
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    /// Open `name` with the schema the caller writes and scans with.
    ///
    /// Waits until the master reports the table's tablets. Fails `NotFound`
    /// when the table does not exist or stays unpartitioned past the
    /// select-master timeout; each master RPC is still bounded by the
    /// admin-operation timeout.
    pub async fn open_table(&self, name: &str, schema: Schema) -> Result<Arc<Table>> {
        let deadline = self.ctx.lookup_deadline();
        self.ctx.locator.open_table(name, schema, deadline).await
    }

    pub fn new_session(&self) -> WriteSession {
        WriteSession::new(Arc::clone(&self.ctx))
    }

    pub fn new_scanner(&self, table: &Arc<Table>) -> Scanner {
        Scanner::new(Arc::clone(&self.ctx), Arc::clone(table))
    }

    /// Drop every cached location of `table`.
    pub fn invalidate_table_locations(&self, table: &str) {
        self.ctx.locator.invalidate_table(table);
    }

    pub fn cached_master_leader(&self) -> Option<std::net::SocketAddr> {
        self.ctx.locator.resolver().cached_leader()
    }
}
