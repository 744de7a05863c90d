//! Collaborator contracts for the append-only log and byte channel.
//!
//! The log primitive itself lives outside this crate; the transport only
//! consumes reserve-then-publish (`claim`/`commit`/`abort`) semantics, a
//! fragment subscription for the server inbound side, and channel lifecycle
//! callbacks for the client inbound side.
//!
//! A [`Reservation`] is a move-only handle: it is produced by a successful
//! `claim` and consumed exactly once by `commit` or `abort`, so
//! double-commit and use-after-release are unrepresentable.

use std::sync::Arc;

/// Outcome of a `claim` on a shared log.
pub enum ClaimOutcome {
    /// The reservation was granted.
    Claimed(Reservation),
    /// Transient condition (end-of-partition padding and the like); the
    /// caller should retry the claim.
    Retry,
    /// The log has no space for a fragment of the requested length.
    Full,
}

/// A single-writer, multi-reader append-only log with reserve-then-publish
/// semantics.
pub trait SharedLog: Send + Sync {
    /// Reserve `length` bytes of log space.
    fn claim(&self, length: usize) -> ClaimOutcome;
}

/// Back end a [`Reservation`] publishes into.
pub trait FragmentSink: Send + Sync {
    /// Make the reserved region visible to readers.
    fn publish(&self, position: u64, bytes: &[u8]);
    /// Discard the reserved region.
    fn discard(&self, position: u64);
}

/// An exclusively owned, not-yet-visible region of the log.
pub struct Reservation {
    position: u64,
    buf: Vec<u8>,
    sink: Arc<dyn FragmentSink>,
}

impl Reservation {
    /// Create a reservation of `length` zeroed bytes at `position`,
    /// publishing into `sink`. Intended for [`SharedLog`] implementations.
    pub fn new(position: u64, length: usize, sink: Arc<dyn FragmentSink>) -> Self {
        Self {
            position,
            buf: vec![0; length],
            sink,
        }
    }

    /// Log position of the reserved region.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Publish the reserved region, consuming the reservation.
    pub fn commit(self) {
        self.sink.publish(self.position, &self.buf);
    }

    /// Discard the reserved region, consuming the reservation.
    pub fn abort(self) {
        self.sink.discard(self.position);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("position", &self.position)
            .field("length", &self.buf.len())
            .finish()
    }
}

/// A poll-driven source of committed fragments.
pub trait Subscription {
    /// Poll up to `limit` fragments, invoking `consumer` with
    /// `(fragment, channel_id, position)` for each. Returns the number of
    /// fragments consumed. Never blocks.
    fn poll(&mut self, consumer: &mut dyn FnMut(&[u8], i32, u64), limit: usize) -> usize;
}

/// Channel lifecycle callbacks, invoked by the channel's I/O thread.
pub trait ChannelListener {
    /// A response block arrived on `channel_id`.
    fn on_receive(&self, channel_id: i32, block: &[u8]);
    /// A send failed; `block` holds the framed fragments that were not
    /// delivered.
    fn on_send_error(&self, channel_id: i32, block: &[u8]);
    /// The channel closed.
    fn on_channel_closed(&self, channel_id: i32);
    /// The channel was interrupted. Treated identically to a close.
    fn on_channel_interrupted(&self, channel_id: i32);
}

/// Payload encoding contract.
///
/// The writer is invoked exactly once, synchronously, while the claimed
/// fragment is being populated; it must not retain the buffer.
pub trait BufferWriter {
    /// Exact number of bytes `write` will produce.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the payload into `buf`, which is exactly `len()` bytes.
    fn write(&self, buf: &mut [u8]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl BufferWriter for &[u8] {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn write(&self, buf: &mut [u8]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        buf.copy_from_slice(self);
        Ok(())
    }
}

impl BufferWriter for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn write(&self, buf: &mut [u8]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        buf.copy_from_slice(self.as_slice());
        Ok(())
    }
}
