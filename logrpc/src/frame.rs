//! Wire framing for request/response fragments.
//!
//! Every fragment starts with a fixed-offset header, little-endian as
//! configured by the log:
//!
//! ```text
//! [protocol_id:2][connection_id:8][request_id:8][payload...]
//! ```
//!
//! Send-error blocks additionally carry whole fragments prefixed by a
//! 4-byte length field and padded to an 8-byte boundary:
//!
//! ```text
//! [length:4][header + payload][pad to FRAME_ALIGNMENT]
//! ```

/// Protocol id for correlated request/response exchange.
pub const PROTOCOL_REQUEST_RESPONSE: u16 = 1;

/// Fixed header length in bytes.
pub const HEADER_LENGTH: usize = 18;

/// Length-field size for framed fragments in send-error blocks.
pub const LENGTH_FIELD_LENGTH: usize = 4;

/// Alignment granularity for framed fragments.
pub const FRAME_ALIGNMENT: usize = 8;

const PROTOCOL_ID_OFFSET: usize = 0;
const CONNECTION_ID_OFFSET: usize = 2;
const REQUEST_ID_OFFSET: usize = 10;

/// Fixed fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol_id: u16,
    pub connection_id: u64,
    pub request_id: u64,
}

impl FrameHeader {
    pub fn new(protocol_id: u16, connection_id: u64, request_id: u64) -> Self {
        Self {
            protocol_id,
            connection_id,
            request_id,
        }
    }

    /// Write the header at the start of `buf`.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than [`HEADER_LENGTH`].
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[PROTOCOL_ID_OFFSET..PROTOCOL_ID_OFFSET + 2]
            .copy_from_slice(&self.protocol_id.to_le_bytes());
        buf[CONNECTION_ID_OFFSET..CONNECTION_ID_OFFSET + 8]
            .copy_from_slice(&self.connection_id.to_le_bytes());
        buf[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 8]
            .copy_from_slice(&self.request_id.to_le_bytes());
    }

    /// Read a header from the start of `buf`, or `None` if `buf` is too
    /// short to contain one.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LENGTH {
            return None;
        }
        let protocol_id = u16::from_le_bytes(
            buf[PROTOCOL_ID_OFFSET..PROTOCOL_ID_OFFSET + 2]
                .try_into()
                .ok()?,
        );
        let connection_id = u64::from_le_bytes(
            buf[CONNECTION_ID_OFFSET..CONNECTION_ID_OFFSET + 8]
                .try_into()
                .ok()?,
        );
        let request_id = u64::from_le_bytes(
            buf[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 8]
                .try_into()
                .ok()?,
        );
        Some(Self {
            protocol_id,
            connection_id,
            request_id,
        })
    }
}

/// Round `length` up to the next frame alignment boundary.
#[inline]
pub fn align_up(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Total framed size of a message inside a send-error block: length field
/// plus message, padded to alignment.
#[inline]
pub fn framed_length(message_length: usize) -> usize {
    align_up(LENGTH_FIELD_LENGTH + message_length)
}

/// Append a framed fragment (length prefix + message + padding) to `dst`.
pub fn put_framed(dst: &mut Vec<u8>, message: &[u8]) {
    let start = dst.len();
    dst.extend_from_slice(&(message.len() as u32).to_le_bytes());
    dst.extend_from_slice(message);
    dst.resize(start + framed_length(message.len()), 0);
}

/// One step of a sequential scan over a framed block.
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentRead<'a> {
    /// A complete fragment; `next` is the offset of the following one.
    Fragment { message: &'a [u8], next: usize },
    /// The block is fully consumed.
    End,
    /// The remaining bytes do not form a complete fragment.
    Malformed,
}

/// Read the framed fragment starting at `offset` in `block`.
pub fn read_fragment(block: &[u8], offset: usize) -> FragmentRead<'_> {
    if offset >= block.len() {
        return FragmentRead::End;
    }
    let remaining = &block[offset..];
    if remaining.len() < LENGTH_FIELD_LENGTH {
        return FragmentRead::Malformed;
    }
    let length =
        u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
    let advance = framed_length(length);
    if remaining.len() < LENGTH_FIELD_LENGTH + length {
        return FragmentRead::Malformed;
    }
    FragmentRead::Fragment {
        message: &remaining[LENGTH_FIELD_LENGTH..LENGTH_FIELD_LENGTH + length],
        next: offset + advance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = [0u8; HEADER_LENGTH];
        let header = FrameHeader::new(PROTOCOL_REQUEST_RESPONSE, 42, 99_999);
        header.write_to(&mut buf);

        let decoded = FrameHeader::read_from(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.protocol_id, PROTOCOL_REQUEST_RESPONSE);
        assert_eq!(decoded.connection_id, 42);
        assert_eq!(decoded.request_id, 99_999);
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(FrameHeader::read_from(&[0u8; HEADER_LENGTH - 1]), None);
        assert_eq!(FrameHeader::read_from(&[]), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }

    #[test]
    fn test_framed_length() {
        // 4-byte length field plus message, padded to 8.
        assert_eq!(framed_length(0), 8);
        assert_eq!(framed_length(4), 8);
        assert_eq!(framed_length(5), 16);
        assert_eq!(framed_length(12), 16);
    }

    #[test]
    fn test_fragment_scan() {
        let mut block = Vec::new();
        put_framed(&mut block, b"first");
        put_framed(&mut block, b"second message");
        assert_eq!(block.len() % FRAME_ALIGNMENT, 0);

        let FragmentRead::Fragment { message, next } = read_fragment(&block, 0) else {
            panic!("expected fragment");
        };
        assert_eq!(message, b"first");

        let FragmentRead::Fragment { message, next } = read_fragment(&block, next) else {
            panic!("expected fragment");
        };
        assert_eq!(message, b"second message");

        assert_eq!(read_fragment(&block, next), FragmentRead::End);
    }

    #[test]
    fn test_fragment_scan_malformed() {
        let mut block = Vec::new();
        put_framed(&mut block, b"ok");
        // Truncated length field.
        block.extend_from_slice(&[1, 2]);

        let FragmentRead::Fragment { next, .. } = read_fragment(&block, 0) else {
            panic!("expected fragment");
        };
        assert_eq!(read_fragment(&block, next), FragmentRead::Malformed);
    }

    #[test]
    fn test_fragment_length_beyond_block() {
        let mut block = Vec::new();
        block.extend_from_slice(&1000u32.to_le_bytes());
        block.extend_from_slice(&[0; 8]);
        assert_eq!(read_fragment(&block, 0), FragmentRead::Malformed);
    }
}
