//! Wire-format handling: buffer cursors, replication stream framing, and
//! the pgoutput change decoder.

pub mod buffer;
pub mod decoder;
pub mod messages;

pub use buffer::{BufferReader, BufferWriter};
pub use decoder::{
    ChangeEvent, FieldChange, Operation, TupleMap, TupleValue, decode_change, diff_tuples,
    relation_id_of,
};
pub use messages::{KeepaliveMessage, StandbyStatusUpdate, XLogDataMessage};
