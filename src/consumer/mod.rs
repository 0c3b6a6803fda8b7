//! The symmetric consumer path.
//!
//! A broker adapter (or any other transport) hands this side the same
//! `(table_name, payload)` pairs the producer's sink emitted. The consumer
//! re-runs the decoding pipeline (catalog lookup against its own pool,
//! then the change decoder) and invokes a user-supplied handler with the
//! typed event. Errors propagate to the caller so the transport can decide
//! between acknowledging and requeueing the delivery.

use crate::catalog;
use crate::core::config::DatabaseConfig;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::pool::{self, ConnectionPool, build_pool};
use crate::protocol::decoder::{ChangeEvent, Operation, decode_change, relation_id_of};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives each successfully decoded change.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_parsed(&self, operation: Operation, event: &ChangeEvent) -> ReplicationResult<()>;
}

pub struct Consumer {
    pool: ConnectionPool,
    handler: Arc<dyn EventHandler>,
}

impl Consumer {
    pub fn new(db: &DatabaseConfig, handler: Arc<dyn EventHandler>) -> ReplicationResult<Self> {
        let pool = build_pool(db.conninfo(), db.connection_pool_size)?;

        info!(
            dbname = %db.name,
            host = %db.host,
            port = %db.port,
            "consumer initialized"
        );

        Ok(Self { pool, handler })
    }

    /// Decode one delivered payload and hand it to the handler.
    ///
    /// Payloads whose first byte is not an Insert/Update/Delete tag are
    /// logged and dropped without an error, mirroring the producer's
    /// ignore set.
    pub async fn process_incoming_message(
        &self,
        table_name: &str,
        payload: &[u8],
    ) -> ReplicationResult<()> {
        let first = *payload
            .first()
            .ok_or_else(|| ReplicationError::decode("empty delivery payload"))?;

        let Some(operation) = Operation::from_byte(first) else {
            warn!(
                table = table_name,
                message_type = %(first as char),
                "ignoring non-change delivery"
            );
            return Ok(());
        };

        info!(
            operation = operation.verb(),
            table = table_name,
            "processing delivery"
        );

        let relation_id = relation_id_of(payload)?;
        let columns = self.resolve_columns(relation_id).await?;
        let event = decode_change(payload, &columns)?;

        self.handler.on_parsed(operation, &event).await
    }

    async fn resolve_columns(
        &self,
        relation_id: i32,
    ) -> ReplicationResult<Vec<catalog::Column>> {
        let conn = pool::acquire(&self.pool).await?;
        let (conn, columns) = tokio::task::spawn_blocking(move || {
            let c = catalog::table_columns(&conn, relation_id);
            (conn, c)
        })
        .await?;
        drop(conn);
        columns
    }

    /// Drain the pool. Call once when the transport shuts down.
    pub fn shutdown(&self) {
        info!("terminating consumer");
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        parsed: Mutex<Vec<(Operation, ChangeEvent)>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn on_parsed(
            &self,
            operation: Operation,
            event: &ChangeEvent,
        ) -> ReplicationResult<()> {
            self.parsed.lock().unwrap().push((operation, event.clone()));
            Ok(())
        }
    }

    fn test_db_config() -> DatabaseConfig {
        crate::core::config::Config::from_yaml_str(
            r#"
database:
  name: dummy
  user: postgres
  password: postgres
  host: localhost
  port: 5432
  connection_pool_size: 2
  replication_plugin: pgoutput
  replication_slot: pgtest
"#,
        )
        .unwrap()
        .database
    }

    #[tokio::test]
    async fn empty_delivery_is_a_decode_error() {
        let handler = Arc::new(RecordingHandler::default());
        let consumer = Consumer::new(&test_db_config(), handler.clone()).unwrap();

        let err = consumer
            .process_incoming_message("public.users", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Decode { .. }));
        assert!(handler.parsed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_change_deliveries_are_dropped_without_error() {
        let handler = Arc::new(RecordingHandler::default());
        let consumer = Consumer::new(&test_db_config(), handler.clone()).unwrap();

        consumer
            .process_incoming_message("public.users", b"B\x00\x00\x00\x00")
            .await
            .unwrap();
        assert!(handler.parsed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_the_pool() {
        let handler = Arc::new(RecordingHandler::default());
        let consumer = Consumer::new(&test_db_config(), handler.clone()).unwrap();
        consumer.shutdown();

        // A change delivery now fails at connection acquisition, which the
        // transport sees and can requeue.
        let err = consumer
            .process_incoming_message("public.users", b"I\x00\x00\x40\x39N\x00\x00")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Pool { .. }));
    }
}
