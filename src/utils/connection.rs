//! Safe wrapper around libpq connections.
//!
//! All database traffic in this crate goes through [`PgConnection`]: the
//! catalog lookups issued by workers (via the pool) and the dedicated
//! replication connection that owns the COPY-BOTH stream. The wrapper
//! exposes plain queries, parameterized queries, and the COPY data
//! primitives the replication protocol rides on.

use crate::core::errors::{ReplicationError, ReplicationResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

/// libpq error field code for the SQLSTATE of a failed command ('C').
const PG_DIAG_SQLSTATE: c_int = b'C' as c_int;

/// A PostgreSQL connection handle.
///
/// The handle may be moved between threads (the pool and the worker tasks
/// rely on this) but must never be used from two threads at once; libpq
/// connections are not thread-safe.
pub struct PgConnection {
    conn: *mut PGconn,
}

unsafe impl Send for PgConnection {}

impl PgConnection {
    /// Connect using a libpq connection string, e.g.
    /// `host=localhost port=5432 dbname=app user=postgres`.
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::connection(
                "failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::connection(format!(
                "connection failed: {error_msg}"
            )));
        }

        Ok(Self { conn })
    }

    /// Whether the underlying connection is still usable. The pool checks
    /// this before handing a recycled connection to a worker.
    pub fn is_alive(&self) -> bool {
        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_OK }
    }

    /// Execute a simple query.
    pub fn exec(&self, query: &str) -> ReplicationResult<PgQueryResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::protocol(format!(
                "query execution failed: {error_msg}"
            )));
        }

        Ok(PgQueryResult { result })
    }

    /// Execute a query with `$1`-style text parameters.
    ///
    /// Catalog lookups always go through here; relation ids and slot names
    /// are never interpolated into SQL text.
    pub fn exec_params(&self, query: &str, params: &[&str]) -> ReplicationResult<PgQueryResult> {
        let c_query = CString::new(query)?;
        let c_params: Vec<CString> = params
            .iter()
            .map(|p| CString::new(*p))
            .collect::<Result<_, _>>()?;
        let param_ptrs: Vec<*const c_char> = c_params.iter().map(|p| p.as_ptr()).collect();

        let result = unsafe {
            PQexecParams(
                self.conn,
                c_query.as_ptr(),
                param_ptrs.len() as c_int,
                ptr::null(),
                param_ptrs.as_ptr(),
                ptr::null(),
                ptr::null(),
                0,
            )
        };

        if result.is_null() {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::protocol(format!(
                "parameterized query failed: {error_msg}"
            )));
        }

        Ok(PgQueryResult { result })
    }

    /// Read one message from a COPY-BOTH stream (blocking).
    ///
    /// Returns `Ok(Some(bytes))` for a data row, `Ok(None)` when the COPY
    /// has finished cleanly.
    pub fn get_copy_data(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let mut buffer: *mut c_char = ptr::null_mut();

        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match copy_data_len {
            -2 => {
                let error_msg =
                    get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(ReplicationError::protocol(error_msg))
            }
            -1 => {
                // COPY is done; collect the final command status.
                let result = PgQueryResult {
                    result: unsafe { PQgetResult(self.conn) },
                };

                if !result.is_ok() {
                    let error_msg =
                        get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                    return Err(ReplicationError::protocol(error_msg));
                }

                Ok(None)
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::buffer("received null COPY buffer"));
                }

                let data =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };

                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    /// Send one message into a COPY-BOTH stream (standby status updates).
    pub fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(self.conn, data.as_ptr() as *const c_char, data.len() as i32)
        };

        if result != 1 {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::protocol(format!(
                "failed to send copy data: {error_msg}"
            )));
        }

        Ok(())
    }

    /// Flush buffered output to the server.
    pub fn flush(&self) -> ReplicationResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(ReplicationError::protocol("failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned())
        }
    }
}

/// A query result handle.
///
/// Results are plain heap memory with no thread affinity; they may move
/// across threads freely.
pub struct PgQueryResult {
    result: *mut PGresult,
}

unsafe impl Send for PgQueryResult {}

impl PgQueryResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// True for `PGRES_TUPLES_OK` and `PGRES_COMMAND_OK`.
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    /// The five-character SQLSTATE of a failed command, if any.
    ///
    /// Used to tell a benign `duplicate_object` (42710) from a fatal error
    /// when creating the replication slot.
    pub fn sqlstate(&self) -> Option<String> {
        let field_ptr = unsafe { PQresultErrorField(self.result, PG_DIAG_SQLSTATE) };
        if field_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(field_ptr).to_string_lossy().into_owned()) }
        }
    }

    /// Server error message of a failed command, if any.
    pub fn error_message(&self) -> Option<String> {
        let msg_ptr = unsafe { PQresultErrorMessage(self.result) };
        if msg_ptr.is_null() {
            return None;
        }
        let msg = unsafe { CStr::from_ptr(msg_ptr).to_string_lossy().into_owned() };
        let msg = msg.trim().to_string();
        if msg.is_empty() { None } else { Some(msg) }
    }

    /// Value at (row, col) as a string, or `None` when NULL or out of range.
    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        if row >= self.ntuples() {
            return None;
        }
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgQueryResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
