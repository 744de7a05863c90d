//! Inbound channel demultiplexer (client side).
//!
//! Routes channel callbacks to the owning connection and request purely
//! from the small integer identifiers in the frame header. Anything that
//! cannot be routed is logged and dropped; nothing on the channel-handling
//! thread ever panics because of malformed or stale input.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::ConnectionPool;
use crate::frame::{self, FragmentRead, FrameHeader, HEADER_LENGTH};
use crate::log::ChannelListener;

/// Demultiplexer over a [`ConnectionPool`].
pub struct ChannelDemux {
    pool: Arc<ConnectionPool>,
    protocol_id: u16,
}

impl ChannelDemux {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let protocol_id = pool.config().protocol_id;
        Self { pool, protocol_id }
    }

    fn decode(&self, block: &[u8]) -> Option<FrameHeader> {
        let header = match FrameHeader::read_from(block) {
            Some(header) => header,
            None => {
                warn!(len = block.len(), "dropping short frame");
                return None;
            }
        };
        if header.protocol_id != self.protocol_id {
            warn!(
                protocol_id = header.protocol_id,
                expected = self.protocol_id,
                "dropping frame with unknown protocol id"
            );
            return None;
        }
        Some(header)
    }
}

impl ChannelListener for ChannelDemux {
    fn on_receive(&self, channel_id: i32, block: &[u8]) {
        let Some(header) = self.decode(block) else {
            return;
        };
        if !self.pool.process_response(&header, &block[HEADER_LENGTH..]) {
            // At-most-once: no retry is initiated by the transport.
            debug!(
                channel_id,
                connection_id = header.connection_id,
                request_id = header.request_id,
                "dropping response for unknown request"
            );
        }
    }

    fn on_send_error(&self, channel_id: i32, block: &[u8]) {
        // One contiguous block may hold several length-prefixed, padded
        // fragments; scan them sequentially.
        let mut offset = 0;
        loop {
            match frame::read_fragment(block, offset) {
                FragmentRead::Fragment { message, next } => {
                    if let Some(header) = self.decode(message) {
                        if !self
                            .pool
                            .process_send_error(header.connection_id, header.request_id)
                        {
                            debug!(
                                channel_id,
                                connection_id = header.connection_id,
                                request_id = header.request_id,
                                "send error for unknown request"
                            );
                        }
                    }
                    offset = next;
                }
                FragmentRead::End => break,
                FragmentRead::Malformed => {
                    warn!(channel_id, offset, "malformed send-error block");
                    break;
                }
            }
        }
    }

    fn on_channel_closed(&self, channel_id: i32) {
        let failed = self.pool.fail_channel(channel_id);
        if failed > 0 {
            debug!(channel_id, failed, "channel closed with open requests");
        }
    }

    fn on_channel_interrupted(&self, channel_id: i32) {
        // Same consequence as a close: in-flight requests cannot complete.
        self.on_channel_closed(channel_id);
    }
}
