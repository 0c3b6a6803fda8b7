//! Event sink seam.
//!
//! A sink receives each change as `(table_name, payload)`: the
//! schema-qualified table for pgoutput changes, or the literal
//! `"wal2json"` for pass-through JSON payloads. Implementations may forward the raw
//! bytes (e.g. to a broker keyed by table name) or decode further with
//! [`crate::protocol::decode_change`] against a pooled connection.
//!
//! `on_change` must tolerate concurrent invocation: the producer fans
//! events out to a bounded worker pool, so calls overlap unless the worker
//! pool size is 1.

pub mod stdout;

use crate::core::errors::ReplicationResult;
use async_trait::async_trait;

pub use stdout::StdoutSink;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Called once per change event. An error is caught at the dispatcher
    /// boundary and counts as a failed completion for the feedback policy.
    async fn on_change(&self, table_name: &str, payload: &[u8]) -> ReplicationResult<()>;

    /// Called exactly once during graceful shutdown, after in-flight
    /// workers have drained and the pool is closed.
    async fn on_shutdown(&self) -> ReplicationResult<()> {
        Ok(())
    }
}
