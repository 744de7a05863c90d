//! Client-side request state machine.
//!
//! A [`TransportRequest`] is one reusable unit representing a single
//! in-flight call. All externally observable transitions are single CAS
//! operations on an atomic state field, so the request pool can be shared
//! across threads without locks. Timeout detection is lazy: it is evaluated
//! on poll rather than by a timer thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::error::{Result, TransportError};
use crate::log::Reservation;

/// Safety-net timeout for [`await`](TransportRequest::await_response)-style
/// waits without an explicit bound. Generous by design; business timeouts
/// belong on the request itself.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(35);

/// Request lifecycle state.
///
/// ```text
/// Closed -> Opening -> Open -> {ResponseAvailable | Failed | TimedOut}
/// ```
///
/// and from any state back to `Closed` via close. `Receiving` is a
/// transient sub-state of `Open` held by the demultiplexer while it copies
/// the response payload; it exists so the payload buffer has exactly one
/// writer at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Receiving = 3,
    ResponseAvailable = 4,
    Failed = 5,
    TimedOut = 6,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Receiving,
            4 => Self::ResponseAvailable,
            5 => Self::Failed,
            6 => Self::TimedOut,
            _ => unreachable!("invalid request state {}", value),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Receiving => "RECEIVING",
            Self::ResponseAvailable => "RESPONSE_AVAILABLE",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

/// Who reclaims the pool slot after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    /// The request was already closed; nothing to do.
    AlreadyClosed,
    /// The caller closed the request and must release the slot.
    Reclaim,
    /// The demultiplexer holds the payload buffer mid-write; it releases
    /// the slot when its publish CAS fails.
    ReceiverReclaims,
    /// The request is not owned by the given connection.
    NotOwned,
}

/// Outcome of routing an inbound response payload to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseOutcome {
    /// The payload was stored and the request is response-available.
    Delivered,
    /// No matching open request; the frame is dropped.
    Ignored,
    /// The request was closed mid-copy; the caller must release the slot.
    ReclaimSlot,
}

/// Monotonic microseconds since process start (first use).
pub(crate) fn monotonic_micros() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// One reusable in-flight request.
pub struct TransportRequest {
    state: AtomicU8,
    connection_id: AtomicU64,
    request_id: AtomicU64,
    channel_id: AtomicI32,
    /// Monotonic micros at `begin`.
    request_time_us: AtomicU64,
    timeout_us: AtomicU64,
    /// Response payload, grown on demand. Written exclusively by the
    /// opener between `begin` and `commit` (buffer reset) and by the
    /// demultiplexer while the state is `Receiving`; read by the caller
    /// only after observing `ResponseAvailable`. The state CAS protocol
    /// makes these phases mutually exclusive.
    response: UnsafeCell<Vec<u8>>,
}

// Safety: the `response` cell is guarded by the state machine documented
// on the field; every other field is atomic.
unsafe impl Sync for TransportRequest {}

impl TransportRequest {
    pub(crate) fn new(response_capacity: usize) -> Self {
        Self {
            state: AtomicU8::new(RequestState::Closed as u8),
            connection_id: AtomicU64::new(0),
            request_id: AtomicU64::new(0),
            channel_id: AtomicI32::new(0),
            request_time_us: AtomicU64::new(0),
            timeout_us: AtomicU64::new(0),
            response: UnsafeCell::new(Vec::with_capacity(response_capacity)),
        }
    }

    #[inline]
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn request_id(&self) -> u64 {
        self.request_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn channel_id(&self) -> i32 {
        self.channel_id.load(Ordering::Relaxed)
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Open this request. Legal only from `Closed`.
    pub(crate) fn begin(
        &self,
        connection_id: u64,
        request_id: u64,
        channel_id: i32,
        now_us: u64,
        timeout: Duration,
    ) -> Result<()> {
        if !self.transition(RequestState::Closed, RequestState::Opening) {
            return Err(TransportError::IllegalState {
                expected: RequestState::Closed.name(),
                actual: self.state().name(),
            });
        }
        self.connection_id.store(connection_id, Ordering::Relaxed);
        self.request_id.store(request_id, Ordering::Relaxed);
        self.channel_id.store(channel_id, Ordering::Relaxed);
        self.request_time_us.store(now_us, Ordering::Relaxed);
        self.timeout_us
            .store(timeout.as_micros() as u64, Ordering::Relaxed);
        // Safety: the slot was just taken from the free queue and is
        // `Opening`; only the opening thread touches the buffer.
        unsafe { (*self.response.get()).clear() };
        Ok(())
    }

    /// Publish the claimed fragment and move `Opening -> Open`.
    ///
    /// The state becomes `Open` before the fragment is published so a
    /// response can never arrive for a request that is not yet open.
    pub(crate) fn commit(&self, reservation: Reservation) -> Result<()> {
        if self.transition(RequestState::Opening, RequestState::Open) {
            reservation.commit();
            Ok(())
        } else {
            let actual = self.state().name();
            reservation.abort();
            Err(TransportError::IllegalState {
                expected: RequestState::Opening.name(),
                actual,
            })
        }
    }

    /// Non-blocking response check.
    ///
    /// Returns `true` iff a response is available. Raises on failure,
    /// timeout, and on polling a closed request (usage error).
    pub fn poll_response(&self, now_us: u64) -> Result<bool> {
        match self.state() {
            RequestState::ResponseAvailable => Ok(true),
            RequestState::Failed => Err(TransportError::RequestFailed {
                channel_id: self.channel_id(),
            }),
            RequestState::TimedOut => Err(self.timeout_error()),
            RequestState::Closed => Err(TransportError::IllegalState {
                expected: RequestState::Open.name(),
                actual: RequestState::Closed.name(),
            }),
            RequestState::Open => {
                let deadline = self
                    .request_time_us
                    .load(Ordering::Relaxed)
                    .saturating_add(self.timeout_us.load(Ordering::Relaxed));
                if now_us > deadline {
                    if self.transition(RequestState::Open, RequestState::TimedOut) {
                        return Err(self.timeout_error());
                    }
                    // Lost the race to a response or failure; re-read.
                    return self.poll_response(now_us);
                }
                Ok(false)
            }
            RequestState::Opening | RequestState::Receiving => Ok(false),
        }
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::RequestTimedOut {
            after: Duration::from_micros(self.timeout_us.load(Ordering::Relaxed)),
        }
    }

    /// Bounded busy-wait for a response: non-blocking polls separated by a
    /// backoff idle strategy. Returns availability; raises on the same
    /// conditions as [`poll_response`](Self::poll_response).
    pub fn await_response(&self, timeout: Duration) -> Result<bool> {
        let deadline = monotonic_micros().saturating_add(timeout.as_micros() as u64);
        let backoff = Backoff::new();
        loop {
            if self.poll_response(monotonic_micros())? {
                return Ok(true);
            }
            if monotonic_micros() >= deadline {
                return Ok(false);
            }
            if backoff.is_completed() {
                std::thread::park_timeout(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Response payload. Legal only once a response is available.
    pub fn response(&self) -> Result<&[u8]> {
        match self.state() {
            // Safety: `ResponseAvailable` was observed with Acquire; the
            // demultiplexer released the buffer when publishing that
            // state, and no writer can run again before a close.
            RequestState::ResponseAvailable => Ok(unsafe { &*self.response.get() }),
            other => Err(TransportError::IllegalState {
                expected: RequestState::ResponseAvailable.name(),
                actual: other.name(),
            }),
        }
    }

    /// Route an inbound response payload to this request.
    pub(crate) fn process_response(&self, request_id: u64, payload: &[u8]) -> ResponseOutcome {
        if self.state() != RequestState::Open
            || self.request_id() != request_id
        {
            return ResponseOutcome::Ignored;
        }
        if !self.transition(RequestState::Open, RequestState::Receiving) {
            return ResponseOutcome::Ignored;
        }
        // Safety: the CAS above grants exclusive buffer ownership until the
        // next state transition.
        unsafe {
            let buf = &mut *self.response.get();
            buf.clear();
            buf.extend_from_slice(payload);
        }
        if self.transition(RequestState::Receiving, RequestState::ResponseAvailable) {
            ResponseOutcome::Delivered
        } else {
            // Closed mid-copy; slot reclamation transferred to us.
            ResponseOutcome::ReclaimSlot
        }
    }

    /// Fail this request because its channel reported a send error.
    /// No-op unless the request is open with a matching id.
    pub(crate) fn process_send_error(&self, request_id: u64) -> bool {
        self.state() == RequestState::Open
            && self.request_id() == request_id
            && self.transition(RequestState::Open, RequestState::Failed)
    }

    /// Fail this request because its channel closed or was interrupted.
    /// No-op unless the request is open on that channel.
    pub(crate) fn process_channel_closed(&self, channel_id: i32) -> bool {
        self.state() == RequestState::Open
            && self.channel_id() == channel_id
            && self.transition(RequestState::Open, RequestState::Failed)
    }

    /// Force the request closed from any state. Idempotent.
    pub(crate) fn force_close(&self) -> CloseOutcome {
        match RequestState::from_u8(self.state.swap(RequestState::Closed as u8, Ordering::AcqRel))
        {
            RequestState::Closed => CloseOutcome::AlreadyClosed,
            RequestState::Receiving => CloseOutcome::ReceiverReclaims,
            _ => CloseOutcome::Reclaim,
        }
    }

    /// Close the request only if it is currently owned by `connection_id`.
    ///
    /// Used by the connection-close sweep; the identity check plus CAS
    /// prevents closing a slot that was recycled to another connection
    /// between observation and transition.
    pub(crate) fn close_if_owned(&self, connection_id: u64) -> CloseOutcome {
        loop {
            let observed = self.state();
            if observed == RequestState::Closed {
                return CloseOutcome::AlreadyClosed;
            }
            if self.connection_id() != connection_id {
                return CloseOutcome::NotOwned;
            }
            if self.transition(observed, RequestState::Closed) {
                return if observed == RequestState::Receiving {
                    CloseOutcome::ReceiverReclaims
                } else {
                    CloseOutcome::Reclaim
                };
            }
        }
    }
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRequest")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .field("request_id", &self.request_id())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}
