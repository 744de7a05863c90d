//! Connections, the connection pool, and the client request pool.
//!
//! Connections are pooled, pre-constructed objects like requests. A
//! connection is "open" while its `active_id` holds a nonzero connection
//! id; close is a CAS of that id back to zero, so a stale closer can never
//! tear down a recycled slot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::Backoff;
use slotpool::SlotPool;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::frame::{FrameHeader, HEADER_LENGTH};
use crate::log::{BufferWriter, ClaimOutcome, Reservation, SharedLog};
use crate::request::{monotonic_micros, CloseOutcome, ResponseOutcome, TransportRequest};

/// One pooled connection.
pub struct Connection {
    /// The connection id while open, zero while closed.
    active_id: AtomicU64,
    /// Request ids handed out by this connection.
    next_request_id: AtomicU64,
    /// Requests opened and not yet closed.
    in_flight: AtomicUsize,
}

impl Connection {
    fn new() -> Self {
        Self {
            active_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Current connection id, or zero when closed.
    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.active_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.connection_id() != 0
    }

    /// Number of requests currently open on this connection.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn on_request_closed(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Fixed pool of reusable [`TransportRequest`]s.
pub struct RequestPool {
    pool: SlotPool<TransportRequest>,
}

impl RequestPool {
    pub fn new(capacity: usize, response_buffer_size: usize) -> Self {
        Self {
            pool: SlotPool::new(capacity, |_| TransportRequest::new(response_buffer_size)),
        }
    }

    /// Take a free request slot, or `None` when exhausted. Never blocks.
    #[inline]
    pub fn get(&self) -> Option<u32> {
        self.pool.acquire()
    }

    /// Return a request slot to the pool. Must pair with a successful
    /// [`get`](Self::get); the handle types do this automatically.
    #[inline]
    pub fn release(&self, index: u32) {
        self.pool.release(index);
    }

    #[inline]
    pub fn request(&self, index: u32) -> &TransportRequest {
        self.pool.get(index)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    #[inline]
    pub fn pooled_count(&self) -> usize {
        self.pool.pooled_count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &TransportRequest)> {
        self.pool.iter().enumerate().map(|(i, r)| (i as u32, r))
    }

    /// Tear the pool down: force-close every live request and drain the
    /// free queue so no further acquisition succeeds.
    pub fn close(&self) {
        let mut closed = 0usize;
        for request in self.pool.iter() {
            if request.force_close() == CloseOutcome::Reclaim {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "request pool closed with live requests");
        }
        while self.pool.acquire().is_some() {}
    }
}

/// Fixed pool of [`Connection`]s sharing one request pool and one send log.
pub struct ConnectionPool {
    connections: SlotPool<Connection>,
    requests: Arc<RequestPool>,
    /// Shared monotonically increasing id sequence; zero is the unowned
    /// sentinel, so ids start at one.
    next_connection_id: AtomicU64,
    send_log: Arc<dyn SharedLog>,
    config: TransportConfig,
}

impl ConnectionPool {
    pub fn new(config: TransportConfig, send_log: Arc<dyn SharedLog>) -> Arc<Self> {
        let requests = Arc::new(RequestPool::new(
            config.capacity,
            config.response_buffer_size,
        ));
        Arc::new(Self {
            connections: SlotPool::new(config.capacity, |_| Connection::new()),
            requests,
            next_connection_id: AtomicU64::new(1),
            send_log,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[inline]
    pub fn request_pool(&self) -> &RequestPool {
        &self.requests
    }

    #[inline]
    pub fn pooled_connections(&self) -> usize {
        self.connections.pooled_count()
    }

    /// Open a connection, or `None` when the pool is exhausted.
    pub fn open_connection(self: &Arc<Self>) -> Option<ConnectionHandle> {
        let index = self.connections.acquire()?;
        let connection = self.connections.get(index);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        connection.next_request_id.store(0, Ordering::Relaxed);
        connection.in_flight.store(0, Ordering::Relaxed);
        connection.active_id.store(connection_id, Ordering::Release);
        Some(ConnectionHandle {
            pool: Arc::clone(self),
            index,
            connection_id,
        })
    }

    /// Locate an open connection by id. Linear scan over the fixed array;
    /// pool sizes are tens of entries, not routing tables.
    pub(crate) fn find_connection(&self, connection_id: u64) -> Option<&Connection> {
        if connection_id == 0 {
            return None;
        }
        self.connections
            .iter()
            .find(|c| c.connection_id() == connection_id)
    }

    /// Route an inbound response to the owning open request.
    /// Returns `false` if no open connection/request matched.
    pub(crate) fn process_response(&self, header: &FrameHeader, payload: &[u8]) -> bool {
        if self.find_connection(header.connection_id).is_none() {
            return false;
        }
        for (index, request) in self.requests.iter() {
            if request.connection_id() != header.connection_id
                || request.request_id() != header.request_id
            {
                continue;
            }
            return match request.process_response(header.request_id, payload) {
                ResponseOutcome::Delivered => true,
                ResponseOutcome::ReclaimSlot => {
                    self.request_closed(index);
                    true
                }
                ResponseOutcome::Ignored => false,
            };
        }
        false
    }

    /// Fail the open request matching `(connection_id, request_id)` after a
    /// send error. Returns `false` if nothing matched.
    pub(crate) fn process_send_error(&self, connection_id: u64, request_id: u64) -> bool {
        if self.find_connection(connection_id).is_none() {
            return false;
        }
        self.requests.iter().any(|(_, request)| {
            request.connection_id() == connection_id && request.process_send_error(request_id)
        })
    }

    /// Fail every open request on `channel_id`. Full sweep: the failing
    /// channel's id is not otherwise indexed.
    pub(crate) fn fail_channel(&self, channel_id: i32) -> usize {
        self.requests
            .iter()
            .filter(|(_, request)| request.process_channel_closed(channel_id))
            .count()
    }

    /// Reclaim a closed request slot and notify its owning connection.
    pub(crate) fn request_closed(&self, index: u32) {
        let request = self.requests.request(index);
        if let Some(connection) = self.find_connection(request.connection_id()) {
            connection.on_request_closed();
        }
        self.requests.release(index);
    }

    /// Claim a send-log fragment, retrying the transient sentinel.
    pub(crate) fn claim_fragment(&self, length: usize) -> Option<Reservation> {
        let backoff = Backoff::new();
        loop {
            match self.send_log.claim(length) {
                ClaimOutcome::Claimed(reservation) => return Some(reservation),
                ClaimOutcome::Retry => backoff.snooze(),
                ClaimOutcome::Full => return None,
            }
        }
    }

    fn close_connection(&self, index: u32, expected_id: u64) -> bool {
        let connection = self.connections.get(index);
        if connection
            .active_id
            .compare_exchange(expected_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Close every request this connection still owns.
        for (request_index, request) in self.requests.iter() {
            match request.close_if_owned(expected_id) {
                CloseOutcome::Reclaim => {
                    connection.on_request_closed();
                    self.requests.release(request_index);
                }
                CloseOutcome::ReceiverReclaims => connection.on_request_closed(),
                CloseOutcome::AlreadyClosed | CloseOutcome::NotOwned => {}
            }
        }
        self.connections.release(index);
        true
    }

    /// Tear the pool down: close every open connection (and its requests),
    /// then the request pool, then drain the connection free queue. Safe to
    /// call once at shutdown.
    pub fn close(&self) {
        let mut closed = 0usize;
        for index in 0..self.connections.capacity() as u32 {
            let id = self.connections.get(index).connection_id();
            if id != 0 && self.close_connection(index, id) {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "connection pool closed with open connections");
        }
        self.requests.close();
        while self.connections.acquire().is_some() {}
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.connections.capacity())
            .field("pooled_connections", &self.pooled_connections())
            .field("pooled_requests", &self.requests.pooled_count())
            .finish()
    }
}

/// Handle to an open pooled connection. Closing (or dropping) the handle
/// closes every request the connection owns and returns it to the pool.
pub struct ConnectionHandle {
    pool: Arc<ConnectionPool>,
    index: u32,
    connection_id: u64,
}

impl ConnectionHandle {
    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.connection().connection_id() == self.connection_id
    }

    /// Number of requests currently open on this connection.
    pub fn in_flight(&self) -> usize {
        self.connection().in_flight()
    }

    fn connection(&self) -> &Connection {
        self.pool.connections.get(self.index)
    }

    /// Open a request on `channel_id` with the configured default timeout.
    pub fn open_request(&self, channel_id: i32, writer: &dyn BufferWriter) -> Result<RequestHandle> {
        self.open_request_with_timeout(channel_id, writer, self.pool.config.request_timeout)
    }

    /// Open a request on `channel_id`: draw a pooled request, claim a
    /// send-log fragment, serialize header and payload (the writer runs
    /// exactly once, synchronously), and publish.
    pub fn open_request_with_timeout(
        &self,
        channel_id: i32,
        writer: &dyn BufferWriter,
        timeout: Duration,
    ) -> Result<RequestHandle> {
        let connection = self.connection();
        if connection.connection_id() != self.connection_id {
            return Err(TransportError::ConnectionNotOpen {
                connection_id: self.connection_id,
            });
        }

        let index = self
            .pool
            .requests
            .get()
            .ok_or(TransportError::NoAvailableRequests)?;
        let request = self.pool.requests.request(index);
        let request_id = connection.next_request_id.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = request.begin(
            self.connection_id,
            request_id,
            channel_id,
            monotonic_micros(),
            timeout,
        ) {
            // A free-queue slot that is not closed is a pool defect.
            debug_assert!(false, "pooled request was not closed: {}", e);
            self.pool.requests.release(index);
            return Err(e);
        }
        connection.in_flight.fetch_add(1, Ordering::Relaxed);

        let length = HEADER_LENGTH + writer.len();
        let Some(mut reservation) = self.pool.claim_fragment(length) else {
            self.abandon(index);
            return Err(TransportError::SendBufferFull { length });
        };

        let buf = reservation.buffer_mut();
        FrameHeader::new(self.pool.config.protocol_id, self.connection_id, request_id)
            .write_to(&mut buf[..HEADER_LENGTH]);
        if let Err(e) = writer.write(&mut buf[HEADER_LENGTH..]) {
            reservation.abort();
            self.abandon(index);
            return Err(TransportError::WriterFailed(e));
        }

        // On CAS failure the request was closed concurrently (connection
        // sweep); the closer already reclaimed the slot.
        request.commit(reservation)?;

        Ok(RequestHandle {
            pool: Arc::clone(&self.pool),
            index,
            connection_id: self.connection_id,
            request_id,
        })
    }

    fn abandon(&self, index: u32) {
        if self.pool.requests.request(index).force_close() == CloseOutcome::Reclaim {
            self.pool.request_closed(index);
        }
    }

    /// Close the connection. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.pool.close_connection(self.index, self.connection_id);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("is_open", &self.is_open())
            .finish()
    }
}

/// Handle to one in-flight request. Closing (or dropping) the handle
/// returns the request to its pool from any state.
pub struct RequestHandle {
    pool: Arc<ConnectionPool>,
    index: u32,
    connection_id: u64,
    request_id: u64,
}

impl RequestHandle {
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The pooled request, provided the slot still belongs to this handle.
    fn current(&self) -> Result<&TransportRequest> {
        let request = self.pool.requests.request(self.index);
        if request.connection_id() == self.connection_id && request.request_id() == self.request_id
        {
            Ok(request)
        } else {
            Err(TransportError::IllegalState {
                expected: "OPEN",
                actual: "CLOSED",
            })
        }
    }

    /// Non-blocking response check. See
    /// [`TransportRequest::poll_response`].
    pub fn poll_response(&self) -> Result<bool> {
        self.current()?.poll_response(monotonic_micros())
    }

    /// Bounded wait for a response. See
    /// [`TransportRequest::await_response`].
    pub fn await_response(&self, timeout: Duration) -> Result<bool> {
        self.current()?.await_response(timeout)
    }

    /// [`await_response`](Self::await_response) with the generous default
    /// safety-net bound.
    pub fn await_response_default(&self) -> Result<bool> {
        self.await_response(crate::request::DEFAULT_AWAIT_TIMEOUT)
    }

    /// Response payload, once available.
    pub fn response(&self) -> Result<&[u8]> {
        self.current()?.response()
    }

    /// Close the request. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        let request = self.pool.requests.request(self.index);
        // Identity-checked close: a sweep may already have reclaimed and
        // recycled this slot.
        if request.request_id() == self.request_id {
            match request.close_if_owned(self.connection_id) {
                CloseOutcome::Reclaim => self.pool.request_closed(self.index),
                CloseOutcome::AlreadyClosed
                | CloseOutcome::ReceiverReclaims
                | CloseOutcome::NotOwned => {}
            }
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("connection_id", &self.connection_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}
