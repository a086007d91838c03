//! The log-buffer metadata trailer (spec §6): default data header,
//! initial term id, MTU, term length, page size, correlation id, EOS
//! position, active term count, and per-partition tail positions.
//!
//! Encoded as a fixed-size little-endian record, matching the teacher
//! crate's `core::header::MessageHeader` encode/decode style.

pub const MAX_PARTITIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMetadata {
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    /// Number of terms rolled over since the log was created; combined
    /// with `initial_term_id` this identifies the current active term.
    pub active_term_count: i32,
    pub mtu: u32,
    pub term_length: u32,
    pub page_size: u32,
    pub correlation_id: i64,
    /// `i64::MAX` until the publication reaches an explicit end of
    /// stream, per spec §4.3 step 6 ("EOS=MAX").
    pub end_of_stream_position: i64,
    pub tail_positions: [i64; MAX_PARTITIONS],
}

impl LogMetadata {
    pub const ENCODED_LEN: usize = 4 * 7 + 8 * (2 + MAX_PARTITIONS);

    pub fn write(&self, buf: &mut [u8]) {
        let mut offset = 0;
        macro_rules! put_i32 {
            ($v:expr) => {
                buf[offset..offset + 4].copy_from_slice(&$v.to_le_bytes());
                offset += 4;
            };
        }
        macro_rules! put_u32 {
            ($v:expr) => {
                buf[offset..offset + 4].copy_from_slice(&$v.to_le_bytes());
                offset += 4;
            };
        }
        macro_rules! put_i64 {
            ($v:expr) => {
                buf[offset..offset + 8].copy_from_slice(&$v.to_le_bytes());
                offset += 8;
            };
        }
        put_i32!(self.session_id);
        put_i32!(self.stream_id);
        put_i32!(self.initial_term_id);
        put_i32!(self.active_term_count);
        put_u32!(self.mtu);
        put_u32!(self.term_length);
        put_u32!(self.page_size);
        put_i64!(self.correlation_id);
        put_i64!(self.end_of_stream_position);
        for tail in &self.tail_positions {
            put_i64!(*tail);
        }
    }

    pub fn read(buf: &[u8]) -> Self {
        let mut offset = 0;
        macro_rules! get_i32 {
            () => {{
                let v = i32::from_le_bytes(buf[offset..offset + 4].try_into().expect("len"));
                offset += 4;
                v
            }};
        }
        macro_rules! get_u32 {
            () => {{
                let v = u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("len"));
                offset += 4;
                v
            }};
        }
        macro_rules! get_i64 {
            () => {{
                let v = i64::from_le_bytes(buf[offset..offset + 8].try_into().expect("len"));
                offset += 8;
                v
            }};
        }
        let session_id = get_i32!();
        let stream_id = get_i32!();
        let initial_term_id = get_i32!();
        let active_term_count = get_i32!();
        let mtu = get_u32!();
        let term_length = get_u32!();
        let page_size = get_u32!();
        let correlation_id = get_i64!();
        let end_of_stream_position = get_i64!();
        let mut tail_positions = [0i64; MAX_PARTITIONS];
        for tail in &mut tail_positions {
            *tail = get_i64!();
        }
        Self {
            session_id,
            stream_id,
            initial_term_id,
            active_term_count,
            mtu,
            term_length,
            page_size,
            correlation_id,
            end_of_stream_position,
            tail_positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let metadata = LogMetadata {
            session_id: -7,
            stream_id: 10,
            initial_term_id: 3,
            active_term_count: 0,
            mtu: 1408,
            term_length: 1 << 20,
            page_size: 4096,
            correlation_id: 555,
            end_of_stream_position: i64::MAX,
            tail_positions: [0, 0, 0],
        };
        let mut buf = vec![0u8; LogMetadata::ENCODED_LEN];
        metadata.write(&mut buf);
        assert_eq!(LogMetadata::read(&buf), metadata);
    }
}
