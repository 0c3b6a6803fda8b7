//! PostgreSQL logical replication streaming.
//!
//! The producer side opens a logical replication slot, consumes the WAL
//! stream, resolves each change to its schema-qualified table, and hands
//! `(table_name, payload)` to a user-supplied [`events::EventSink`]. The
//! consumer side accepts the same pairs back from any transport, decodes
//! the pgoutput payload into a typed [`protocol::ChangeEvent`] (including
//! an old/new column diff for updates), and invokes a user handler.
//!
//! Supported output plugins: `pgoutput` (binary, decoded here) and
//! `wal2json` (JSON text, passed through to the sink unparsed).

pub mod catalog;
pub mod consumer;
pub mod core;
pub mod events;
pub mod pool;
pub mod producer;
pub mod protocol;
pub mod utils;

pub use crate::core::config::{Config, DatabaseConfig, ErrorPolicy, OutputPlugin};
pub use crate::core::errors::{ReplicationError, ReplicationResult};
pub use consumer::{Consumer, EventHandler};
pub use events::{EventSink, StdoutSink};
pub use producer::Producer;
pub use protocol::{ChangeEvent, FieldChange, Operation, TupleMap, TupleValue};
