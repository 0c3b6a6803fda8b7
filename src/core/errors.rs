//! Error types for the replication pipeline.
//!
//! Startup errors (configuration, connection) are fatal and propagate to
//! the caller. Decode and sink errors are caught at the dispatcher
//! boundary, logged, and reported as failed completions so the session can
//! apply its feedback policy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Missing or invalid configuration; fatal at startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Database unreachable or authentication failed; fatal at startup.
    #[error("database connection error: {message}")]
    Connection { message: String },

    /// Replication protocol violation (unexpected command status, bad
    /// framing, failed COPY operation).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Malformed change payload: short read, bad kind byte, column-count
    /// mismatch, invalid UTF-8.
    #[error("decode error: {message}")]
    Decode { message: String },

    /// The relation id of a change is not visible in the catalog.
    #[error("unknown relation: {relation_id}")]
    UnknownRelation { relation_id: i32 },

    /// A sink rejected a change event.
    #[error("sink error: {message}")]
    Sink { message: String },

    /// Connection pool failure (exhausted after close, create failed).
    #[error("connection pool error: {message}")]
    Pool { message: String },

    /// Fixed-size buffer overflow while building an outgoing message.
    #[error("buffer operation error: {message}")]
    Buffer { message: String },

    #[error("network IO error")]
    NetworkIo(#[from] std::io::Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::Sink {
            message: message.into(),
        }
    }

    pub fn pool<S: Into<String>>(message: S) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    pub fn buffer<S: Into<String>>(message: S) -> Self {
        Self::Buffer {
            message: message.into(),
        }
    }
}
