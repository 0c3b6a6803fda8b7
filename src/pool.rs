//! Bounded pool of metadata connections.
//!
//! Workers borrow a connection for catalog lookups and return it by
//! dropping the guard; the pool never closes a connection that is checked
//! out. The dedicated replication connection is opened separately and is
//! not pool-managed.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::PgConnection;
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleError, RecycleResult};

/// Creates and recycles [`PgConnection`]s for the pool.
#[derive(Debug)]
pub struct PgManager {
    conninfo: String,
}

impl PgManager {
    pub fn new(conninfo: String) -> Self {
        Self { conninfo }
    }
}

impl Manager for PgManager {
    type Type = PgConnection;
    type Error = ReplicationError;

    async fn create(&self) -> Result<PgConnection, ReplicationError> {
        let conninfo = self.conninfo.clone();
        // libpq connects synchronously; keep it off the async executor.
        tokio::task::spawn_blocking(move || PgConnection::connect(&conninfo)).await?
    }

    async fn recycle(
        &self,
        conn: &mut PgConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<ReplicationError> {
        if conn.is_alive() {
            Ok(())
        } else {
            Err(RecycleError::Message("connection no longer alive".into()))
        }
    }
}

pub type ConnectionPool = Pool<PgManager>;
pub type PooledConnection = Object<PgManager>;

/// Build a pool of at most `max_size` connections. Connections are opened
/// lazily on first acquire.
pub fn build_pool(conninfo: String, max_size: usize) -> ReplicationResult<ConnectionPool> {
    Pool::builder(PgManager::new(conninfo))
        .max_size(max_size)
        .build()
        .map_err(|e| ReplicationError::pool(e.to_string()))
}

/// Borrow a connection, waiting for one to free up if the pool is at its
/// bound. Fails once the pool has been closed.
pub async fn acquire(pool: &ConnectionPool) -> ReplicationResult<PooledConnection> {
    pool.get()
        .await
        .map_err(|e| ReplicationError::pool(e.to_string()))
}
