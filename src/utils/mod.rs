//! Shared low-level helpers: byte-order primitives, the libpq connection
//! wrapper, and PostgreSQL epoch timestamp conversion.

pub mod binary;
pub mod connection;
pub mod timestamp;

pub use connection::{PgConnection, PgQueryResult};
pub use timestamp::{TimestampTz, format_timestamp_from_pg, system_time_to_postgres_timestamp};

/// WAL location pointer (LSN).
pub type XLogRecPtr = u64;
