//! Byte-order helpers for the replication wire format.
//!
//! Every multi-byte integer on the wire is big-endian, two's-complement
//! where signed. These helpers read and write at the start of a slice;
//! callers are responsible for offset management (see `protocol::buffer`
//! for the cursor-based API).

/// Read a big-endian signed 16-bit integer from the start of `buf`.
pub fn buf_recv_i16(buf: &[u8]) -> i16 {
    assert!(buf.len() >= 2);
    i16::from_be_bytes(buf[..2].try_into().unwrap())
}

/// Read a big-endian signed 32-bit integer from the start of `buf`.
pub fn buf_recv_i32(buf: &[u8]) -> i32 {
    assert!(buf.len() >= 4);
    i32::from_be_bytes(buf[..4].try_into().unwrap())
}

/// Read a big-endian signed 64-bit integer from the start of `buf`.
pub fn buf_recv_i64(buf: &[u8]) -> i64 {
    assert!(buf.len() >= 8);
    i64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Read a big-endian unsigned 64-bit integer (an LSN) from the start of `buf`.
pub fn buf_recv_u64(buf: &[u8]) -> u64 {
    assert!(buf.len() >= 8);
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Write a big-endian unsigned 64-bit integer to the start of `buf`.
pub fn buf_send_u64(val: u64, buf: &mut [u8]) {
    assert!(buf.len() >= 8);
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

/// Write a big-endian signed 64-bit integer to the start of `buf`.
pub fn buf_send_i64(val: i64, buf: &mut [u8]) {
    assert!(buf.len() >= 8);
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_big_endian() {
        assert_eq!(buf_recv_i16(&[0x00, 0x07]), 7);
        assert_eq!(buf_recv_i32(&[0x00, 0x00, 0x40, 0x39]), 16441);
        assert_eq!(buf_recv_i64(&[0xff; 8]), -1);
        assert_eq!(
            buf_recv_u64(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00]),
            256
        );
    }

    #[test]
    fn signed_reads_are_twos_complement() {
        assert_eq!(buf_recv_i16(&[0xff, 0xff]), -1);
        assert_eq!(buf_recv_i32(&[0x80, 0x00, 0x00, 0x00]), i32::MIN);
    }

    #[test]
    fn writes_round_trip() {
        let mut buf = [0u8; 8];
        buf_send_u64(0x0123_4567_89ab_cdef, &mut buf);
        assert_eq!(buf_recv_u64(&buf), 0x0123_4567_89ab_cdef);

        buf_send_i64(-42, &mut buf);
        assert_eq!(buf_recv_i64(&buf), -42);
    }
}
