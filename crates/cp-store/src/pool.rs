use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use duckdb::Connection;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use cp_types::errors::{StoreError, StoreResult};

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

/// Bounded pool of reusable DuckDB connections.
///
/// `acquire` waits for a free member; the returned guard hands the
/// connection back on drop, on every exit path.
pub struct ConnectionPool {
    connections: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ConnectionPool {
    /// Open a pool against a database file, cloning the base connection up
    /// to the configured size.
    pub fn open<P: AsRef<Path>>(path: P, config: PoolConfig) -> StoreResult<Self> {
        let base = Connection::open(path.as_ref()).map_err(|e| StoreError::Connection {
            message: e.to_string(),
        })?;
        Self::from_base(base, config)
    }

    /// Open an in-memory pool (tests and ephemeral deployments).
    pub fn open_in_memory(config: PoolConfig) -> StoreResult<Self> {
        let base = Connection::open_in_memory().map_err(|e| StoreError::Connection {
            message: e.to_string(),
        })?;
        Self::from_base(base, config)
    }

    fn from_base(base: Connection, config: PoolConfig) -> StoreResult<Self> {
        let size = config.size.max(1);
        let mut connections = Vec::with_capacity(size);
        for _ in 1..size {
            let clone = base.try_clone().map_err(|e| StoreError::Connection {
                message: e.to_string(),
            })?;
            connections.push(clone);
        }
        connections.push(base);

        info!(pool_size = size, "storage connection pool established");

        Ok(Self {
            connections: Mutex::new(connections),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Check a connection out of the pool, waiting if all are in use.
    pub async fn acquire(&self) -> StoreResult<PooledConnection<'_>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;

        let conn = self
            .connections
            .lock()
            .pop()
            .ok_or(StoreError::PoolClosed)?;

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Stop handing out connections. Members already checked out are dropped
    /// when their guards release.
    pub fn close(&self) {
        self.permits.close();
        let dropped = {
            let mut connections = self.connections.lock();
            std::mem::take(&mut *connections).len()
        };
        info!(dropped, "storage connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

/// RAII guard for a checked-out connection.
#[derive(Debug)]
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.pool.is_closed() {
                self.pool.connections.lock().push(conn);
            }
        }
    }
}
