//! Server-side deferred responses.
//!
//! A [`DeferredResponse`] represents a reply whose transmission may be
//! postponed until unrelated asynchronous work completes. The pool keeps a
//! FIFO of deferred responses ordered by defer time; as the async-work log
//! advances, entries are resolved strictly from the head (a response
//! deferred earlier can delay those deferred after it, by design).
//!
//! Everything here runs on the single server worker thread; state is plain
//! `Cell`/`RefCell` interior mutability.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::frame::{FrameHeader, HEADER_LENGTH};
use crate::log::{BufferWriter, ClaimOutcome, Reservation, SharedLog};

/// Pool-supplied control object a response uses to enqueue itself into the
/// deferred FIFO and to return itself to the free set.
struct PoolCtl {
    free: ArrayQueue<u32>,
    deferred: RefCell<VecDeque<u32>>,
}

/// One pooled server-side response.
pub struct DeferredResponse {
    index: u32,
    ctl: Rc<PoolCtl>,
    send_log: Arc<dyn SharedLog>,
    protocol_id: u16,
    channel_id: Cell<i32>,
    connection_id: Cell<u64>,
    request_id: Cell<u64>,
    in_use: Cell<bool>,
    is_deferred: Cell<bool>,
    /// Async-work log position recorded at defer time.
    deferred_position: Cell<u64>,
    reservation: RefCell<Option<Reservation>>,
}

impl DeferredResponse {
    #[inline]
    pub fn channel_id(&self) -> i32 {
        self.channel_id.get()
    }

    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id.get()
    }

    #[inline]
    pub fn request_id(&self) -> u64 {
        self.request_id.get()
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.is_deferred.get()
    }

    /// Claim a send-log fragment sized for a `length`-byte payload and
    /// write the response header into it. The transient retry sentinel is
    /// retried; `None` means the log has no space.
    fn claim_with_header(&self, length: usize) -> Option<Reservation> {
        let backoff = Backoff::new();
        let mut reservation = loop {
            match self.send_log.claim(HEADER_LENGTH + length) {
                ClaimOutcome::Claimed(reservation) => break reservation,
                ClaimOutcome::Retry => backoff.snooze(),
                ClaimOutcome::Full => return None,
            }
        };
        FrameHeader::new(self.protocol_id, self.connection_id.get(), self.request_id.get())
            .write_to(&mut reservation.buffer_mut()[..HEADER_LENGTH]);
        Some(reservation)
    }

    /// Claim a fragment for a payload of `length` bytes. Returns `false`
    /// if the log has no space.
    pub fn allocate(&self, length: usize) -> bool {
        match self.claim_with_header(length) {
            Some(reservation) => {
                *self.reservation.borrow_mut() = Some(reservation);
                true
            }
            None => false,
        }
    }

    /// [`allocate`](Self::allocate) and write the payload through `writer`.
    pub fn allocate_and_write(&self, writer: &dyn BufferWriter) -> Result<()> {
        let length = writer.len();
        let Some(mut reservation) = self.claim_with_header(length) else {
            return Err(TransportError::SendBufferFull {
                length: HEADER_LENGTH + length,
            });
        };
        if let Err(e) = writer.write(&mut reservation.buffer_mut()[HEADER_LENGTH..]) {
            reservation.abort();
            return Err(TransportError::WriterFailed(e));
        }
        *self.reservation.borrow_mut() = Some(reservation);
        Ok(())
    }

    /// Postpone transmission until the async-work log has advanced past
    /// `async_position`; registers this response on the deferred FIFO.
    pub fn defer(&self, async_position: u64) {
        self.deferred_position.set(async_position);
        self.is_deferred.set(true);
        self.ctl.deferred.borrow_mut().push_back(self.index);
    }

    /// Publish the allocated fragment and return this response to its
    /// pool.
    pub fn commit(&self) -> Result<()> {
        let reservation = self
            .reservation
            .borrow_mut()
            .take()
            .ok_or(TransportError::NoAllocatedResponse)?;
        reservation.commit();
        self.reclaim();
        Ok(())
    }

    /// Discard the allocated fragment, if any.
    pub fn abort(&self) {
        if let Some(reservation) = self.reservation.borrow_mut().take() {
            reservation.abort();
        }
    }

    /// Resolve a deferred entry: publish if a fragment was allocated, then
    /// return to the pool.
    fn resolve(&self) {
        if let Some(reservation) = self.reservation.borrow_mut().take() {
            reservation.commit();
        }
        self.reclaim();
    }

    /// Return this response to the free set. Guarded so a handler that
    /// commits synchronously composes with the worker's reclaim epilogue.
    fn reclaim(&self) {
        if !self.in_use.replace(false) {
            return;
        }
        self.abort();
        self.is_deferred.set(false);
        self.channel_id.set(0);
        self.connection_id.set(0);
        self.request_id.set(0);
        // Cannot fail: the free queue has room for every slot index.
        let _ = self.ctl.free.push(self.index);
    }
}

impl std::fmt::Debug for DeferredResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredResponse")
            .field("channel_id", &self.channel_id.get())
            .field("connection_id", &self.connection_id.get())
            .field("request_id", &self.request_id.get())
            .field("is_deferred", &self.is_deferred.get())
            .finish()
    }
}

/// Fixed pool of deferred responses plus the deferred FIFO.
pub struct DeferredResponsePool {
    slots: Box<[DeferredResponse]>,
    ctl: Rc<PoolCtl>,
}

impl DeferredResponsePool {
    pub fn new(capacity: usize, send_log: Arc<dyn SharedLog>, protocol_id: u16) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        let ctl = Rc::new(PoolCtl {
            free: ArrayQueue::new(capacity),
            deferred: RefCell::new(VecDeque::with_capacity(capacity)),
        });
        let slots: Box<[DeferredResponse]> = (0..capacity as u32)
            .map(|index| {
                // All slots start free.
                let _ = ctl.free.push(index);
                DeferredResponse {
                    index,
                    ctl: Rc::clone(&ctl),
                    send_log: Arc::clone(&send_log),
                    protocol_id,
                    channel_id: Cell::new(0),
                    connection_id: Cell::new(0),
                    request_id: Cell::new(0),
                    in_use: Cell::new(false),
                    is_deferred: Cell::new(false),
                    deferred_position: Cell::new(0),
                    reservation: RefCell::new(None),
                }
            })
            .collect();
        Self { slots, ctl }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of free response slots. This bounds how many inbound
    /// requests the worker accepts per tick.
    #[inline]
    pub fn pooled_count(&self) -> usize {
        self.ctl.free.len()
    }

    /// Take a free response and stamp it with the originating request's
    /// identity, or `None` when exhausted (the caller drops the inbound
    /// fragment).
    pub fn open(&self, channel_id: i32, connection_id: u64, request_id: u64) -> Option<&DeferredResponse> {
        let index = self.ctl.free.pop()?;
        let response = &self.slots[index as usize];
        response.in_use.set(true);
        response.is_deferred.set(false);
        response.channel_id.set(channel_id);
        response.connection_id.set(connection_id);
        response.request_id.set(request_id);
        Some(response)
    }

    /// Return a response to the pool. No-op if the response already
    /// reclaimed itself through `commit`.
    pub fn reclaim(&self, response: &DeferredResponse) {
        response.reclaim();
    }

    /// The async-work pipeline advanced to `position`: resolve deferred
    /// responses from the FIFO head, in defer order, stopping at the first
    /// entry whose recorded position is not yet available.
    pub fn on_block_available(&self, _block: &[u8], position: u64) -> usize {
        let mut resolved = 0;
        loop {
            let head = self.ctl.deferred.borrow().front().copied();
            let Some(index) = head else { break };
            let response = &self.slots[index as usize];
            if response.deferred_position.get() > position {
                // Head-of-line: later entries wait even if already
                // satisfiable.
                break;
            }
            self.ctl.deferred.borrow_mut().pop_front();
            response.resolve();
            resolved += 1;
        }
        if resolved > 0 {
            debug!(resolved, position, "resolved deferred responses");
        }
        resolved
    }
}

impl std::fmt::Debug for DeferredResponsePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredResponsePool")
            .field("capacity", &self.capacity())
            .field("pooled_count", &self.pooled_count())
            .field("deferred", &self.ctl.deferred.borrow().len())
            .finish()
    }
}
