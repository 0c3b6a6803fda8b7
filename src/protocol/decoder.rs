//! Logical change decoding for the pgoutput plugin.
//!
//! Insert, Update, and Delete messages share a header (one type byte, then
//! a big-endian int32 relation id) followed by marker-tagged TupleData
//! sub-messages:
//!
//! ```text
//! Insert: 'I' relation_id 'N' TupleData
//! Update: 'U' relation_id [('K'|'O') TupleData] 'N' TupleData
//! Delete: 'D' relation_id ('K'|'O') TupleData
//! ```
//!
//! TupleData is an int16 column count followed by one kind byte per
//! column: `n` (null), `u` (unchanged TOAST), or `t` (int32 length plus
//! UTF-8 text). The decoder pairs values with the catalog column list in
//! attribute order; a count mismatch is fatal.

use crate::catalog::Column;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::buffer::BufferReader;
use crate::utils::binary::buf_recv_i32;
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// The three row-level operations this decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

impl Operation {
    /// Map a pgoutput message-type byte to an operation, `None` for every
    /// other message kind (Begin, Commit, Relation, Type, Truncate, ...).
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(Operation::Insert),
            b'U' => Some(Operation::Update),
            b'D' => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Operation::Insert => 'I',
            Operation::Update => 'U',
            Operation::Delete => 'D',
        }
    }

    /// SQL verb for log lines.
    pub fn verb(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// A decoded column value.
///
/// `Null` and `Toast` both serialize as JSON null; they are distinct in
/// memory because an unchanged TOAST value must never appear in a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    Toast,
    Text(String),
}

impl TupleValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TupleValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for TupleValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TupleValue::Text(s) => serializer.serialize_str(s),
            TupleValue::Null | TupleValue::Toast => serializer.serialize_none(),
        }
    }
}

/// Column name → value, preserving catalog attribute order.
pub type TupleMap = IndexMap<String, TupleValue>;

/// One changed column in an update diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old_value: TupleValue,
    pub new_value: TupleValue,
}

/// A fully decoded row-level change, ready for a sink or handler.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub message_type: Operation,
    pub relation_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<TupleMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<TupleMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<IndexMap<String, FieldChange>>,
}

/// Extract the relation id from a change payload header (`payload[1..5]`)
/// without decoding the tuples.
pub fn relation_id_of(payload: &[u8]) -> ReplicationResult<i32> {
    if payload.len() < 5 {
        return Err(ReplicationError::decode("change payload header too short"));
    }
    Ok(buf_recv_i32(&payload[1..5]))
}

/// Decode one Insert/Update/Delete payload against the resolved column
/// list of its relation.
pub fn decode_change(payload: &[u8], columns: &[Column]) -> ReplicationResult<ChangeEvent> {
    let mut reader = BufferReader::new(payload);

    let type_byte = reader.read_u8()?;
    let operation = Operation::from_byte(type_byte).ok_or_else(|| {
        ReplicationError::decode(format!(
            "unsupported change message type '{}'",
            type_byte as char
        ))
    })?;
    let relation_id = reader.read_i32()?;

    match operation {
        Operation::Insert => {
            expect_marker(&mut reader, b'N')?;
            let new = decode_tuple(&mut reader, columns)?;

            Ok(ChangeEvent {
                message_type: operation,
                relation_id,
                old: None,
                new: Some(new),
                diff: None,
            })
        }
        Operation::Update => {
            let marker = reader.read_u8()?;
            match marker {
                b'K' | b'O' => {
                    let old = decode_tuple(&mut reader, columns)?;
                    expect_marker(&mut reader, b'N')?;
                    let new = decode_tuple(&mut reader, columns)?;
                    let diff = diff_tuples(&old, &new);

                    Ok(ChangeEvent {
                        message_type: operation,
                        relation_id,
                        old: Some(old),
                        new: Some(new),
                        diff: Some(diff),
                    })
                }
                b'N' => {
                    let new = decode_tuple(&mut reader, columns)?;

                    Ok(ChangeEvent {
                        message_type: operation,
                        relation_id,
                        old: None,
                        new: Some(new),
                        diff: None,
                    })
                }
                _ => Err(ReplicationError::decode(format!(
                    "invalid marker '{}' in update message",
                    marker as char
                ))),
            }
        }
        Operation::Delete => {
            let marker = reader.read_u8()?;
            if marker != b'K' && marker != b'O' {
                return Err(ReplicationError::decode(format!(
                    "invalid marker '{}' in delete message",
                    marker as char
                )));
            }
            let old = decode_tuple(&mut reader, columns)?;

            Ok(ChangeEvent {
                message_type: operation,
                relation_id,
                old: Some(old),
                new: None,
                diff: None,
            })
        }
    }
}

/// Decode one TupleData sub-message positioned at the reader's cursor.
fn decode_tuple(reader: &mut BufferReader<'_>, columns: &[Column]) -> ReplicationResult<TupleMap> {
    let n_cols = reader.read_i16()?;
    if n_cols < 0 || n_cols as usize != columns.len() {
        return Err(ReplicationError::decode(format!(
            "tuple has {} columns but the catalog lists {}",
            n_cols,
            columns.len()
        )));
    }

    let mut tuple = TupleMap::with_capacity(columns.len());
    for column in columns {
        let kind = reader.read_u8()?;
        let value = match kind {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Toast,
            b't' => {
                let length = reader.read_i32()?;
                if length < 0 {
                    return Err(ReplicationError::decode("negative tuple value length"));
                }
                TupleValue::Text(reader.read_string(length as usize)?)
            }
            _ => {
                return Err(ReplicationError::decode(format!(
                    "unknown tuple data kind '{}'",
                    kind as char
                )));
            }
        };
        tuple.insert(column.name.clone(), value);
    }

    Ok(tuple)
}

/// Columns present in both tuples whose values differ. Null compares
/// unequal to any text value; a side holding an unchanged TOAST value is
/// skipped because its real content is unknown.
pub fn diff_tuples(old: &TupleMap, new: &TupleMap) -> IndexMap<String, FieldChange> {
    let mut diff = IndexMap::new();

    for (name, old_value) in old {
        let Some(new_value) = new.get(name) else {
            continue;
        };
        if *old_value == TupleValue::Toast || *new_value == TupleValue::Toast {
            continue;
        }
        if old_value != new_value {
            diff.insert(
                name.clone(),
                FieldChange {
                    old_value: old_value.clone(),
                    new_value: new_value.clone(),
                },
            );
        }
    }

    diff
}

fn expect_marker(reader: &mut BufferReader<'_>, expected: u8) -> ReplicationResult<()> {
    let marker = reader.read_u8()?;
    if marker != expected {
        return Err(ReplicationError::decode(format!(
            "expected '{}' marker, got '{}'",
            expected as char, marker as char
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_PAYLOAD: &[u8] = b"I\x00\x00@9N\x00\x07t\x00\x00\x00$2ea2efd6-f0f1-4091-bce2-40dcdb8d2c5et\x00\x00\x00\x06Zapzapt\x00\x00\x00\x16johnboss2002@dummy.comt\x00\x00\x00\x11great_pass_authort\x00\x00\x00\x01tt\x00\x00\x00\x1a2023-10-09 13:13:47.929773t\x00\x00\x00\x1a2023-10-09 13:13:47.929773";

    const UPDATE_PAYLOAD: &[u8] = b"U\x00\x00@9O\x00\x07t\x00\x00\x00$2ea2efd6-f0f1-4091-bce2-40dcdb8d2c5et\x00\x00\x00\x06Zapzapt\x00\x00\x00\x16johnboss2002@dummy.comt\x00\x00\x00\x11great_pass_authort\x00\x00\x00\x01tt\x00\x00\x00\x1a2023-10-09 13:13:47.929773t\x00\x00\x00\x1a2023-10-09 13:13:47.929773N\x00\x07t\x00\x00\x00$2ea2efd6-f0f1-4091-bce2-40dcdb8d2c5et\x00\x00\x00\x06Zapzapt\x00\x00\x00\x0bssx@xyz.comt\x00\x00\x00\x11great_pass_authort\x00\x00\x00\x01tt\x00\x00\x00\x1a2023-10-09 13:13:47.929773t\x00\x00\x00\x1a2023-10-09 13:13:47.929773";

    const DELETE_PAYLOAD: &[u8] = b"D\x00\x00@9O\x00\x07t\x00\x00\x00$2ea2efd6-f0f1-4091-bce2-40dcdb8d2c5et\x00\x00\x00\x06Zapzapt\x00\x00\x00\x0bssx@xyz.comt\x00\x00\x00\x11great_pass_authort\x00\x00\x00\x01tt\x00\x00\x00\x1a2023-10-09 13:13:47.929773t\x00\x00\x00\x1a2023-10-09 13:13:47.929773";

    fn users_schema() -> Vec<Column> {
        [
            ("id", "uuid"),
            ("full_name", "text"),
            ("email", "text"),
            ("password", "text"),
            ("is_verified", "boolean"),
            ("created_at", "timestamp"),
            ("updated_at", "timestamp"),
        ]
        .into_iter()
        .map(|(name, type_name)| Column {
            name: name.to_string(),
            type_name: type_name.to_string(),
        })
        .collect()
    }

    fn text(s: &str) -> TupleValue {
        TupleValue::Text(s.to_string())
    }

    /// Build a synthetic Insert payload from a column/value list.
    fn encode_insert(relation_id: i32, values: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut payload = vec![b'I'];
        payload.extend_from_slice(&relation_id.to_be_bytes());
        payload.push(b'N');
        payload.extend_from_slice(&(values.len() as i16).to_be_bytes());
        for (_, value) in values {
            match value {
                Some(v) => {
                    payload.push(b't');
                    payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    payload.extend_from_slice(v.as_bytes());
                }
                None => payload.push(b'n'),
            }
        }
        payload
    }

    #[test]
    fn decodes_insert_fixture() {
        let event = decode_change(INSERT_PAYLOAD, &users_schema()).unwrap();

        assert_eq!(event.message_type, Operation::Insert);
        assert_eq!(event.relation_id, 16441);
        assert!(event.old.is_none());
        assert!(event.diff.is_none());

        let new = event.new.unwrap();
        assert_eq!(new.len(), 7);
        assert_eq!(new["id"], text("2ea2efd6-f0f1-4091-bce2-40dcdb8d2c5e"));
        assert_eq!(new["full_name"], text("Zapzap"));
        assert_eq!(new["email"], text("johnboss2002@dummy.com"));
        assert_eq!(new["password"], text("great_pass_author"));
        assert_eq!(new["is_verified"], text("t"));
        assert_eq!(new["created_at"], text("2023-10-09 13:13:47.929773"));
        assert_eq!(new["updated_at"], text("2023-10-09 13:13:47.929773"));
    }

    #[test]
    fn decodes_update_fixture_with_diff() {
        let event = decode_change(UPDATE_PAYLOAD, &users_schema()).unwrap();

        assert_eq!(event.message_type, Operation::Update);
        assert_eq!(event.relation_id, 16441);

        let old = event.old.unwrap();
        let new = event.new.unwrap();
        assert_eq!(old.len(), 7);
        assert_eq!(new.len(), 7);
        assert_eq!(old["email"], text("johnboss2002@dummy.com"));
        assert_eq!(new["email"], text("ssx@xyz.com"));

        // Only the changed column appears in the diff.
        let diff = event.diff.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(
            diff["email"],
            FieldChange {
                old_value: text("johnboss2002@dummy.com"),
                new_value: text("ssx@xyz.com"),
            }
        );
    }

    #[test]
    fn decodes_delete_fixture() {
        let event = decode_change(DELETE_PAYLOAD, &users_schema()).unwrap();

        assert_eq!(event.message_type, Operation::Delete);
        assert_eq!(event.relation_id, 16441);
        assert!(event.new.is_none());
        assert!(event.diff.is_none());

        let old = event.old.unwrap();
        assert_eq!(old.len(), 7);
        assert_eq!(old["email"], text("ssx@xyz.com"));
    }

    #[test]
    fn update_without_old_tuple_has_no_diff() {
        // 'U' header followed directly by the new tuple.
        let mut payload = vec![b'U', 0x00, 0x00, 0x40, 0x39];
        payload.extend_from_slice(&INSERT_PAYLOAD[5..]);

        let event = decode_change(&payload, &users_schema()).unwrap();
        assert_eq!(event.message_type, Operation::Update);
        assert!(event.old.is_none());
        assert!(event.diff.is_none());
        assert_eq!(event.new.unwrap().len(), 7);
    }

    #[test]
    fn relation_id_matches_payload_header() {
        for payload in [INSERT_PAYLOAD, UPDATE_PAYLOAD, DELETE_PAYLOAD] {
            let event = decode_change(payload, &users_schema()).unwrap();
            assert_eq!(event.relation_id, relation_id_of(payload).unwrap());
        }
    }

    #[test]
    fn synthetic_insert_round_trips() {
        let values = [
            ("sku", Some("A-100")),
            ("description", None),
            ("price", Some("9.99")),
        ];
        let columns: Vec<Column> = values
            .iter()
            .map(|(name, _)| Column {
                name: name.to_string(),
                type_name: "text".to_string(),
            })
            .collect();

        let payload = encode_insert(31337, &values);
        let event = decode_change(&payload, &columns).unwrap();

        assert_eq!(event.relation_id, 31337);
        let new = event.new.unwrap();
        assert_eq!(new["sku"], text("A-100"));
        assert_eq!(new["description"], TupleValue::Null);
        assert_eq!(new["price"], text("9.99"));
    }

    #[test]
    fn null_and_toast_kinds_serialize_as_null() {
        let columns = vec![
            Column {
                name: "col1".to_string(),
                type_name: "text".to_string(),
            },
            Column {
                name: "col2".to_string(),
                type_name: "text".to_string(),
            },
        ];
        let payload = b"I\x00\x00@9N\x00\x02nu";

        let event = decode_change(payload, &columns).unwrap();
        let new = event.new.as_ref().unwrap();
        assert_eq!(new["col1"], TupleValue::Null);
        assert_eq!(new["col2"], TupleValue::Toast);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["new"]["col1"], serde_json::Value::Null);
        assert_eq!(json["new"]["col2"], serde_json::Value::Null);
        assert_eq!(json["message_type"], "I");
        assert!(json.get("old").is_none());
    }

    #[test]
    fn column_count_mismatch_is_fatal() {
        let columns = users_schema();
        let mut payload = INSERT_PAYLOAD.to_vec();
        // Claim six columns against the seven-column catalog.
        payload[7] = 0x06;

        let err = decode_change(&payload, &columns).unwrap_err();
        assert!(err.to_string().contains("columns"), "{err}");
    }

    #[test]
    fn unknown_tuple_kind_is_fatal() {
        let columns = vec![Column {
            name: "col1".to_string(),
            type_name: "text".to_string(),
        }];
        let payload = b"I\x00\x00@9N\x00\x01x";

        let err = decode_change(payload, &columns).unwrap_err();
        assert!(err.to_string().contains("kind"), "{err}");
    }

    #[test]
    fn delete_requires_key_or_old_marker() {
        let payload = b"D\x00\x00@9N\x00\x07";
        let err = decode_change(payload, &users_schema()).unwrap_err();
        assert!(err.to_string().contains("marker"), "{err}");
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let err = decode_change(&INSERT_PAYLOAD[..20], &users_schema()).unwrap_err();
        assert!(matches!(err, ReplicationError::Decode { .. }));
    }

    #[test]
    fn diff_compares_null_against_text() {
        let old = TupleMap::from_iter([
            ("a".to_string(), TupleValue::Null),
            ("b".to_string(), TupleValue::Null),
            ("c".to_string(), text("same")),
        ]);
        let new = TupleMap::from_iter([
            ("a".to_string(), text("now-set")),
            ("b".to_string(), TupleValue::Null),
            ("c".to_string(), text("same")),
        ]);

        let diff = diff_tuples(&old, &new);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["a"].old_value, TupleValue::Null);
        assert_eq!(diff["a"].new_value, text("now-set"));
    }

    #[test]
    fn diff_skips_unchanged_toast_values() {
        let old = TupleMap::from_iter([
            ("blob".to_string(), TupleValue::Toast),
            ("name".to_string(), text("before")),
        ]);
        let new = TupleMap::from_iter([
            ("blob".to_string(), TupleValue::Null),
            ("name".to_string(), text("after")),
        ]);

        let diff = diff_tuples(&old, &new);
        assert!(!diff.contains_key("blob"));
        assert_eq!(diff["name"].new_value, text("after"));
    }
}
