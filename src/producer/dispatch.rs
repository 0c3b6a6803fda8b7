//! Per-event dispatch: plugin branch, table resolution, sink invocation.
//!
//! This is the error boundary of the pipeline. Whatever goes wrong here
//! (an unknown relation, a malformed payload, a sink rejection) is
//! reported to the session as a failed completion and never reaches the
//! cursor thread as anything but a log line and a feedback-policy
//! decision.

use crate::catalog;
use crate::core::config::OutputPlugin;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::EventSink;
use crate::pool::{self, ConnectionPool};
use crate::protocol::decoder::{Operation, relation_id_of};
use tracing::{debug, info};

/// What happened to one WAL payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The sink received the change, keyed by this table name.
    Delivered(String),
    /// A pgoutput message outside {I, U, D} (Begin, Commit, Relation,
    /// Type, Truncate, ...); not a sink-visible event.
    Ignored,
}

/// Route one WAL payload to the sink.
///
/// wal2json payloads are already JSON text and pass through under the
/// fixed table name `"wal2json"`. pgoutput change messages are resolved to
/// a schema-qualified table name via a pooled catalog connection first.
pub async fn dispatch_change(
    plugin: OutputPlugin,
    pool: &ConnectionPool,
    sink: &dyn EventSink,
    payload: &[u8],
) -> ReplicationResult<DispatchOutcome> {
    match plugin {
        OutputPlugin::Wal2json => {
            sink.on_change("wal2json", payload).await?;
            Ok(DispatchOutcome::Delivered("wal2json".to_string()))
        }
        OutputPlugin::Pgoutput => {
            let first = *payload
                .first()
                .ok_or_else(|| ReplicationError::decode("empty WAL payload"))?;

            let Some(operation) = Operation::from_byte(first) else {
                debug!(
                    message_type = %(first as char),
                    "ignoring non-change pgoutput message"
                );
                return Ok(DispatchOutcome::Ignored);
            };

            let relation_id = relation_id_of(payload)?;
            let table_name = resolve_table_name(pool, relation_id).await?;

            info!(
                operation = operation.verb(),
                table = %table_name,
                "change occurred"
            );
            sink.on_change(&table_name, payload).await?;

            Ok(DispatchOutcome::Delivered(table_name))
        }
    }
}

async fn resolve_table_name(pool: &ConnectionPool, relation_id: i32) -> ReplicationResult<String> {
    let conn = pool::acquire(pool).await?;
    // Catalog queries over libpq block; keep them off the async executor.
    let (conn, name) = tokio::task::spawn_blocking(move || {
        let name = catalog::qualified_table_name(&conn, relation_id);
        (conn, name)
    })
    .await?;
    drop(conn);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::build_pool;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn on_change(&self, table_name: &str, payload: &[u8]) -> ReplicationResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((table_name.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn on_change(&self, _table_name: &str, _payload: &[u8]) -> ReplicationResult<()> {
            Err(ReplicationError::sink("broker unavailable"))
        }
    }

    fn unused_pool() -> ConnectionPool {
        // Connections open lazily; these tests never draw one.
        build_pool("host=localhost port=5432".to_string(), 1).unwrap()
    }

    #[tokio::test]
    async fn wal2json_payloads_pass_through() {
        let sink = RecordingSink::default();
        let payload = br#"{"change":[{"kind":"insert"}]}"#;

        let outcome = dispatch_change(OutputPlugin::Wal2json, &unused_pool(), &sink, payload)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Delivered("wal2json".to_string()));
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "wal2json");
        assert_eq!(calls[0].1, payload);
    }

    #[tokio::test]
    async fn transaction_control_messages_are_ignored() {
        let sink = RecordingSink::default();

        // Begin, Commit, Relation headers never reach the sink.
        for payload in [
            &b"B\x00\x00\x00\x00"[..],
            &b"C\x00\x01\x02"[..],
            &b"R\x00\x00\x40\x39"[..],
        ] {
            let outcome = dispatch_change(OutputPlugin::Pgoutput, &unused_pool(), &sink, payload)
                .await
                .unwrap();
            assert_eq!(outcome, DispatchOutcome::Ignored);
        }

        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_payload_is_a_decode_error() {
        let sink = RecordingSink::default();
        let err = dispatch_change(OutputPlugin::Pgoutput, &unused_pool(), &sink, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Decode { .. }));
    }

    #[tokio::test]
    async fn short_change_header_is_a_decode_error() {
        let sink = RecordingSink::default();
        let err = dispatch_change(OutputPlugin::Pgoutput, &unused_pool(), &sink, b"I\x00\x00")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Decode { .. }));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pool_failure_surfaces_before_the_sink_runs() {
        let sink = RecordingSink::default();
        let pool = unused_pool();
        pool.close();

        let payload = b"I\x00\x00\x40\x39N\x00\x00";
        let err = dispatch_change(OutputPlugin::Pgoutput, &pool, &sink, payload)
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicationError::Pool { .. }));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_errors_propagate_for_wal2json() {
        let err = dispatch_change(OutputPlugin::Wal2json, &unused_pool(), &FailingSink, b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Sink { .. }));
    }
}
