//! PostgreSQL timestamp conversion.
//!
//! The replication protocol exchanges timestamps as microseconds since
//! midnight on 2000-01-01 (the PostgreSQL epoch), not the Unix epoch.

use chrono::DateTime;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch (1970-01-01) and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Timestamp with timezone, microseconds since the PostgreSQL epoch.
pub type TimestampTz = i64;

/// Convert a `SystemTime` to the PostgreSQL timestamp format used in
/// standby status updates.
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let duration_since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let unix_secs = duration_since_unix.as_secs() as i64;
    let unix_micros = unix_secs * 1_000_000 + duration_since_unix.subsec_micros() as i64;

    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Render a server-side PostgreSQL timestamp as a readable UTC string,
/// e.g. for keepalive logging.
pub fn format_timestamp_from_pg(ts: TimestampTz) -> String {
    let secs = ts / 1_000_000 + PG_EPOCH_OFFSET_SECS;
    let nsecs = (ts % 1_000_000) * 1_000;

    match DateTime::from_timestamp(secs, nsecs as u32) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("<invalid timestamp {ts}>"),
    }
}
