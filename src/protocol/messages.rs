//! Replication stream framing.
//!
//! The COPY-BOTH stream carries two inbound message shapes, XLogData (`w`)
//! wrapping a logical change payload and primary keepalives (`k`), plus
//! one outbound shape, the standby status update (`r`) used for LSN
//! feedback.
//!
//! <https://www.postgresql.org/docs/current/protocol-replication.html>

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::utils::XLogRecPtr;
use crate::utils::timestamp::TimestampTz;

/// A WAL data message: the starting LSN of the enclosed payload plus the
/// raw logical-decoding bytes produced by the output plugin.
#[derive(Debug, Clone)]
pub struct XLogDataMessage {
    pub data_start: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub payload: Vec<u8>,
}

/// A primary keepalive message. `reply_requested` means the server wants a
/// status update promptly to avoid a timeout disconnect.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveMessage {
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// A standby status update reporting received/flushed/applied LSNs back to
/// the server.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub write_lsn: XLogRecPtr,
    pub flush_lsn: XLogRecPtr,
    pub apply_lsn: XLogRecPtr,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

impl TryFrom<BufferReader<'_>> for XLogDataMessage {
    type Error = ReplicationError;

    fn try_from(mut reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(25) {
            return Err(ReplicationError::protocol("WAL data message too short"));
        }

        let message_type = reader.read_u8()?;
        if message_type != b'w' {
            return Err(ReplicationError::protocol(format!(
                "expected XLogData message, got '{}'",
                message_type as char
            )));
        }

        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let payload = reader.read_bytes(reader.remaining())?;

        Ok(XLogDataMessage {
            data_start,
            wal_end,
            send_time,
            payload,
        })
    }
}

impl TryFrom<BufferReader<'_>> for KeepaliveMessage {
    type Error = ReplicationError;

    fn try_from(mut reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(18) {
            return Err(ReplicationError::protocol("keepalive message too short"));
        }

        let message_type = reader.read_u8()?;
        if message_type != b'k' {
            return Err(ReplicationError::protocol(format!(
                "expected keepalive message, got '{}'",
                message_type as char
            )));
        }

        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;

        Ok(KeepaliveMessage {
            wal_end,
            send_time,
            reply_requested,
        })
    }
}

impl StandbyStatusUpdate {
    /// Wire size: tag byte + three LSNs + timestamp + reply flag.
    pub const WIRE_LEN: usize = 34;

    /// Serialize into the 34-byte `r` message the server expects.
    pub fn write(&self, writer: &mut BufferWriter<'_>) -> ReplicationResult<()> {
        writer.write_u8(b'r')?;
        writer.write_u64(self.write_lsn)?;
        writer.write_u64(self.flush_lsn)?;
        writer.write_u64(self.apply_lsn)?;
        writer.write_i64(self.send_time)?;
        writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
        Ok(())
    }
}

impl TryFrom<BufferReader<'_>> for StandbyStatusUpdate {
    type Error = ReplicationError;

    fn try_from(mut reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(Self::WIRE_LEN) {
            return Err(ReplicationError::protocol(
                "status update message too short",
            ));
        }

        let message_type = reader.read_u8()?;
        if message_type != b'r' {
            return Err(ReplicationError::protocol(format!(
                "expected status update message, got '{}'",
                message_type as char
            )));
        }

        let write_lsn = reader.read_u64()?;
        let flush_lsn = reader.read_u64()?;
        let apply_lsn = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;

        Ok(StandbyStatusUpdate {
            write_lsn,
            flush_lsn,
            apply_lsn,
            send_time,
            reply_requested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlogdata_frame(data_start: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![b'w'];
        frame.extend_from_slice(&data_start.to_be_bytes());
        frame.extend_from_slice(&(data_start + payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(&7_i64.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parses_xlogdata() {
        let frame = xlogdata_frame(124_122, b"I\x00\x00\x40\x39N");
        let msg = XLogDataMessage::try_from(BufferReader::new(&frame)).unwrap();

        assert_eq!(msg.data_start, 124_122);
        assert_eq!(msg.wal_end, 124_128);
        assert_eq!(msg.send_time, 7);
        assert_eq!(msg.payload, b"I\x00\x00\x40\x39N");
    }

    #[test]
    fn rejects_short_or_mistyped_frames() {
        assert!(XLogDataMessage::try_from(BufferReader::new(b"w123")).is_err());

        let mut frame = xlogdata_frame(1, b"x");
        frame[0] = b'k';
        assert!(XLogDataMessage::try_from(BufferReader::new(&frame)).is_err());
    }

    #[test]
    fn parses_keepalive() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&42_u64.to_be_bytes());
        frame.extend_from_slice(&0_i64.to_be_bytes());
        frame.push(1);

        let msg = KeepaliveMessage::try_from(BufferReader::new(&frame)).unwrap();
        assert_eq!(msg.wal_end, 42);
        assert!(msg.reply_requested);
    }

    #[test]
    fn status_update_round_trips() {
        let update = StandbyStatusUpdate {
            write_lsn: 300,
            flush_lsn: 200,
            apply_lsn: 100,
            send_time: 7_777,
            reply_requested: false,
        };

        let mut buf = [0u8; StandbyStatusUpdate::WIRE_LEN];
        let mut writer = BufferWriter::new(&mut buf);
        update.write(&mut writer).unwrap();
        assert_eq!(writer.bytes_written(), StandbyStatusUpdate::WIRE_LEN);

        let parsed = StandbyStatusUpdate::try_from(BufferReader::new(&buf)).unwrap();
        assert_eq!(parsed.write_lsn, 300);
        assert_eq!(parsed.flush_lsn, 200);
        assert_eq!(parsed.apply_lsn, 100);
        assert_eq!(parsed.send_time, 7_777);
        assert!(!parsed.reply_requested);
    }
}
