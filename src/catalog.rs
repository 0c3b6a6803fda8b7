//! Relation metadata lookups.
//!
//! Change payloads identify their table only by relation id; the catalog
//! supplies the schema-qualified name and the ordered column list the
//! tuple decoder pairs values against. Lookups run per event on a pooled
//! connection, so a schema change between events is picked up on the next
//! change for that relation.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::PgConnection;

const TABLE_NAME_QUERY: &str =
    "SELECT schemaname, relname FROM pg_stat_user_tables WHERE relid = $1";

const COLUMNS_QUERY: &str = "SELECT attname, format_type(atttypid, atttypmod) \
     FROM pg_attribute \
     WHERE attrelid = $1 AND attnum > 0 AND NOT attisdropped \
     ORDER BY attnum";

/// One attribute of a relation, snapshotted from the catalog at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

/// `schema.table` for a relation id, or `UnknownRelation` when the id is
/// not a user table visible to this connection.
pub fn qualified_table_name(conn: &PgConnection, relation_id: i32) -> ReplicationResult<String> {
    let relation_id_text = relation_id.to_string();
    let result = conn.exec_params(TABLE_NAME_QUERY, &[relation_id_text.as_str()])?;

    if !result.is_ok() {
        return Err(ReplicationError::protocol(format!(
            "table name lookup failed with status {:?}",
            result.status()
        )));
    }

    if result.ntuples() == 0 {
        return Err(ReplicationError::UnknownRelation { relation_id });
    }

    let schema_name = result
        .getvalue(0, 0)
        .ok_or_else(|| ReplicationError::protocol("NULL schemaname in catalog"))?;
    let table_name = result
        .getvalue(0, 1)
        .ok_or_else(|| ReplicationError::protocol("NULL relname in catalog"))?;

    Ok(format!("{schema_name}.{table_name}"))
}

/// Live columns of a relation in `attnum` order, or `UnknownRelation` when
/// the relation has none.
pub fn table_columns(conn: &PgConnection, relation_id: i32) -> ReplicationResult<Vec<Column>> {
    let relation_id_text = relation_id.to_string();
    let result = conn.exec_params(COLUMNS_QUERY, &[relation_id_text.as_str()])?;

    if !result.is_ok() {
        return Err(ReplicationError::protocol(format!(
            "column lookup failed with status {:?}",
            result.status()
        )));
    }

    if result.ntuples() == 0 {
        return Err(ReplicationError::UnknownRelation { relation_id });
    }

    let mut columns = Vec::with_capacity(result.ntuples() as usize);
    for row in 0..result.ntuples() {
        let name = result
            .getvalue(row, 0)
            .ok_or_else(|| ReplicationError::protocol("NULL attname in catalog"))?;
        let type_name = result
            .getvalue(row, 1)
            .ok_or_else(|| ReplicationError::protocol("NULL column type in catalog"))?;
        columns.push(Column { name, type_name });
    }

    Ok(columns)
}
