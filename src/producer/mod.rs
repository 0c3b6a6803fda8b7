//! The replication producer: slot bootstrap, stream consumption, worker
//! fan-out, and LSN feedback.
//!
//! One dedicated connection owns the replication cursor and is driven from
//! a blocking task (the connection is not thread-safe and feedback
//! ordering must be preserved). Each WAL change is handed to a bounded
//! pool of async workers; completions flow back to the cursor task, which
//! is the only place standby status updates are written.

pub mod dispatch;
pub mod state;

use crate::core::config::{Config, DatabaseConfig, ErrorPolicy, OutputPlugin};
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::EventSink;
use crate::pool::{self, ConnectionPool, build_pool};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::messages::{KeepaliveMessage, StandbyStatusUpdate, XLogDataMessage};
use crate::utils::{PgConnection, XLogRecPtr, format_timestamp_from_pg};
use crate::utils::timestamp::system_time_to_postgres_timestamp;
use libpq_sys::ExecStatusType;
use self::state::{SessionPhase, SessionState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// SQLSTATE for `duplicate_object`: the slot already exists, which is fine.
const DUPLICATE_OBJECT: &str = "42710";

/// Result of one worker, reported back to the cursor task.
#[derive(Debug, Clone, Copy)]
struct Completion {
    lsn: XLogRecPtr,
    succeeded: bool,
}

/// Whether a completion may advance the flush LSN under the configured
/// error policy.
fn should_advance(policy: ErrorPolicy, succeeded: bool) -> bool {
    succeeded || policy == ErrorPolicy::Advance
}

/// Owns the connection pool and the sink; `start_replication` runs the
/// session until the shutdown signal fires or the stream fails.
pub struct Producer {
    db: DatabaseConfig,
    pool: ConnectionPool,
    sink: Arc<dyn EventSink>,
    shutdown: Arc<AtomicBool>,
    feedback_interval: Duration,
}

impl Producer {
    pub fn new(
        config: Config,
        sink: Arc<dyn EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> ReplicationResult<Self> {
        let db = config.database;
        let pool = build_pool(db.conninfo(), db.connection_pool_size)?;

        info!(
            dbname = %db.name,
            host = %db.host,
            port = %db.port,
            slot = %db.replication_slot,
            plugin = %db.replication_plugin,
            "producer initialized"
        );

        Ok(Self {
            db,
            pool,
            sink,
            shutdown,
            feedback_interval: Duration::from_secs(1),
        })
    }

    /// Metadata pool, shared with sinks that decode payloads themselves.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Bootstrap the slot and consume the replication stream until
    /// shutdown. `publication_names` and `proto_version` only apply to the
    /// pgoutput plugin.
    pub async fn start_replication(
        &self,
        publication_names: &[String],
        proto_version: u32,
    ) -> ReplicationResult<()> {
        if self.db.replication_plugin == OutputPlugin::Pgoutput && publication_names.is_empty() {
            return Err(ReplicationError::config(
                "at least one publication name is required for pgoutput",
            ));
        }

        let mut session_state = SessionState::new();

        self.check_wal_level().await?;
        self.ensure_replication_slot().await?;
        session_state.advance_phase(SessionPhase::SlotReady);

        let session = ReplicationSession {
            db: self.db.clone(),
            pool: self.pool.clone(),
            sink: Arc::clone(&self.sink),
            shutdown: Arc::clone(&self.shutdown),
            publications: publication_names.to_vec(),
            proto_version,
            feedback_interval: self.feedback_interval,
            runtime: tokio::runtime::Handle::current(),
        };

        tokio::task::spawn_blocking(move || session.run(session_state)).await?
    }

    /// Logical replication needs `wal_level = logical`; checking up front
    /// turns a cryptic stream failure into a precise startup error.
    async fn check_wal_level(&self) -> ReplicationResult<()> {
        let conn = pool::acquire(&self.pool).await?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let r = conn.exec("SHOW wal_level;");
            (conn, r)
        })
        .await?;
        drop(conn);

        let result = result?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(format!(
                "failed to check wal_level: {:?}",
                result.status()
            )));
        }

        match result.getvalue(0, 0) {
            Some(level) if level == "logical" => Ok(()),
            Some(level) => Err(ReplicationError::protocol(format!(
                "wal_level is '{level}', but logical replication requires 'logical'"
            ))),
            None => Err(ReplicationError::protocol(
                "could not retrieve wal_level value",
            )),
        }
    }

    /// Create the replication slot if it does not exist yet; an existing
    /// slot is benign so restarts are idempotent.
    async fn ensure_replication_slot(&self) -> ReplicationResult<()> {
        let conn = pool::acquire(&self.pool).await?;
        let slot = self.db.replication_slot.clone();
        let plugin = self.db.replication_plugin.to_string();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let r = create_replication_slot(&conn, &slot, &plugin);
            (conn, r)
        })
        .await?;
        drop(conn);
        result
    }
}

fn create_replication_slot(
    conn: &PgConnection,
    slot_name: &str,
    plugin: &str,
) -> ReplicationResult<()> {
    let result = conn.exec_params(
        "SELECT pg_create_logical_replication_slot($1, $2);",
        &[slot_name, plugin],
    )?;

    if result.is_ok() {
        debug!(slot = slot_name, "replication slot created");
        return Ok(());
    }

    if result.sqlstate().as_deref() == Some(DUPLICATE_OBJECT) {
        debug!(slot = slot_name, "replication slot already exists");
        return Ok(());
    }

    Err(ReplicationError::protocol(format!(
        "failed to create replication slot '{}': {}",
        slot_name,
        result
            .error_message()
            .unwrap_or_else(|| format!("{:?}", result.status()))
    )))
}

/// Everything the cursor-owning blocking task needs, moved off the async
/// producer.
struct ReplicationSession {
    db: DatabaseConfig,
    pool: ConnectionPool,
    sink: Arc<dyn EventSink>,
    shutdown: Arc<AtomicBool>,
    publications: Vec<String>,
    proto_version: u32,
    feedback_interval: Duration,
    runtime: tokio::runtime::Handle,
}

impl ReplicationSession {
    fn run(self, mut state: SessionState) -> ReplicationResult<()> {
        let conn = PgConnection::connect(&self.db.replication_conninfo())?;
        info!("connected to database server for replication");

        self.start_stream(&conn)?;
        state.advance_phase(SessionPhase::Streaming);

        self.stream_loop(&conn, &mut state)?;

        // DRAINING: the cursor stops reading; the final feedback below
        // reports everything completed workers have flushed.
        if let Err(e) = self.send_feedback(&conn, &mut state) {
            warn!("failed to send final feedback during shutdown: {e}");
        }
        if let Err(e) = conn.flush() {
            warn!("failed to flush replication connection during shutdown: {e}");
        }
        drop(conn);

        self.pool.close();
        if let Err(e) = self.runtime.block_on(self.sink.on_shutdown()) {
            warn!("sink shutdown hook failed: {e}");
        }

        state.advance_phase(SessionPhase::Terminated);
        info!("replication session terminated");
        Ok(())
    }

    fn start_stream(&self, conn: &PgConnection) -> ReplicationResult<()> {
        let options = match self.db.replication_plugin {
            OutputPlugin::Pgoutput => format!(
                " (proto_version '{}', publication_names '{}')",
                self.proto_version,
                self.publications.join(",")
            ),
            OutputPlugin::Wal2json => String::new(),
        };

        let start_replication_sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL 0/0{};",
            self.db.replication_slot, options
        );
        info!(sql = %start_replication_sql, "starting replication");

        let result = conn.exec(&start_replication_sql)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            return Err(ReplicationError::protocol(format!(
                "failed to start replication: {}",
                result
                    .error_message()
                    .unwrap_or_else(|| format!("{:?}", result.status()))
            )));
        }

        info!("started receiving data from database server");
        Ok(())
    }

    fn stream_loop(&self, conn: &PgConnection, state: &mut SessionState) -> ReplicationResult<()> {
        let workers = Arc::new(Semaphore::new(self.db.effective_worker_pool_size()));
        let (completion_tx, completion_rx) = mpsc::channel::<Completion>();
        let mut in_flight: usize = 0;

        loop {
            while let Ok(completion) = completion_rx.try_recv() {
                in_flight -= 1;
                self.note_completion(conn, state, completion)?;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown signal received, draining in-flight workers");
                state.advance_phase(SessionPhase::Draining);
                break;
            }

            if state.feedback_due(self.feedback_interval) {
                self.send_feedback(conn, state)?;
            }

            // Blocks until the server sends something; its periodic
            // keepalives bound the wait even on an idle database.
            match conn.get_copy_data()? {
                None => {
                    info!("replication stream ended by server");
                    state.advance_phase(SessionPhase::Draining);
                    break;
                }
                Some(data) if data.is_empty() => continue,
                Some(data) => match data[0] {
                    b'k' => self.handle_keepalive(conn, &data, state)?,
                    b'w' => {
                        let message = XLogDataMessage::try_from(BufferReader::new(&data))?;
                        state.update_received_lsn(message.data_start);
                        self.submit(message, &workers, &completion_tx, &mut in_flight)?;
                    }
                    other => {
                        warn!("received unknown copy message type '{}'", other as char);
                    }
                },
            }
        }

        // Let in-flight workers finish; no new work is submitted.
        while in_flight > 0 {
            match completion_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(completion) => {
                    in_flight -= 1;
                    self.note_completion(conn, state, completion)?;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(())
    }

    /// Hand one WAL message to a worker. Acquiring the semaphore here
    /// blocks the cursor when all workers are busy, which is the
    /// backpressure bound on submission.
    fn submit(
        &self,
        message: XLogDataMessage,
        workers: &Arc<Semaphore>,
        completion_tx: &mpsc::Sender<Completion>,
        in_flight: &mut usize,
    ) -> ReplicationResult<()> {
        let permit = self
            .runtime
            .block_on(Arc::clone(workers).acquire_owned())
            .map_err(|_| ReplicationError::protocol("worker pool closed"))?;

        let pool = self.pool.clone();
        let sink = Arc::clone(&self.sink);
        let plugin = self.db.replication_plugin;
        let completion_tx = completion_tx.clone();
        let correlation_id = Uuid::new_v4();
        let lsn = message.data_start;

        *in_flight += 1;
        self.runtime.spawn(async move {
            let _permit = permit;

            let succeeded =
                match dispatch::dispatch_change(plugin, &pool, sink.as_ref(), &message.payload)
                    .await
                {
                    Ok(outcome) => {
                        debug!(%correlation_id, lsn, ?outcome, "change processed");
                        true
                    }
                    Err(e) => {
                        error!(%correlation_id, lsn, "failed to process change: {e}");
                        false
                    }
                };

            // The cursor task may have exited on an error; nothing to do then.
            let _ = completion_tx.send(Completion { lsn, succeeded });
        });

        Ok(())
    }

    fn note_completion(
        &self,
        conn: &PgConnection,
        state: &mut SessionState,
        completion: Completion,
    ) -> ReplicationResult<()> {
        if should_advance(self.db.error_policy, completion.succeeded) {
            state.update_flushed_lsn(completion.lsn);
        }
        self.send_feedback(conn, state)
    }

    fn handle_keepalive(
        &self,
        conn: &PgConnection,
        data: &[u8],
        state: &mut SessionState,
    ) -> ReplicationResult<()> {
        let keepalive = KeepaliveMessage::try_from(BufferReader::new(data))?;
        debug!(
            wal_end = keepalive.wal_end,
            server_clock = %format_timestamp_from_pg(keepalive.send_time),
            "keepalive received"
        );

        if keepalive.reply_requested {
            debug!("server requested feedback in keepalive");
            self.send_feedback(conn, state)?;
        }
        Ok(())
    }

    fn send_feedback(&self, conn: &PgConnection, state: &mut SessionState) -> ReplicationResult<()> {
        let update = StandbyStatusUpdate {
            write_lsn: state.received_lsn,
            flush_lsn: state.flushed_lsn,
            apply_lsn: state.flushed_lsn,
            send_time: system_time_to_postgres_timestamp(SystemTime::now()),
            reply_requested: false,
        };

        let mut reply_buf = [0u8; StandbyStatusUpdate::WIRE_LEN];
        let mut writer = BufferWriter::new(&mut reply_buf);
        update.write(&mut writer)?;

        conn.put_copy_data(&reply_buf)?;
        conn.flush()?;
        state.mark_feedback_sent();

        debug!(
            received_lsn = %format!("{:x}", state.received_lsn),
            flushed_lsn = %format!("{:x}", state.flushed_lsn),
            "feedback sent"
        );
        Ok(())
    }
}
