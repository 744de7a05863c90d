//! Server request worker — a single cooperative loop.
//!
//! One tick consumes at most as many inbound request fragments as there are
//! free response slots, then drains async-completion notifications. The
//! free-slot bound is the backpressure mechanism: it is structurally
//! impossible to accept more concurrently outstanding requests than there
//! are response slots.

use tracing::{debug, warn};

use crate::deferred::{DeferredResponse, DeferredResponsePool};
use crate::frame::{FrameHeader, HEADER_LENGTH};
use crate::log::Subscription;

/// Per-request server callback.
///
/// The handler either writes and commits the response synchronously,
/// defers it, or produces no reply at all; in the latter case the response
/// is reclaimed right after the handler returns.
pub trait RequestHandler {
    fn on_request(&mut self, buffer: &[u8], response: &DeferredResponse) -> crate::Result<()>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&[u8], &DeferredResponse) -> crate::Result<()>,
{
    fn on_request(&mut self, buffer: &[u8], response: &DeferredResponse) -> crate::Result<()> {
        self(buffer, response)
    }
}

/// The server-side worker loop.
pub struct RequestWorker {
    response_pool: DeferredResponsePool,
    request_subscription: Box<dyn Subscription>,
    async_feed: Box<dyn Subscription>,
    handler: Box<dyn RequestHandler>,
    protocol_id: u16,
}

impl RequestWorker {
    pub fn new(
        response_pool: DeferredResponsePool,
        request_subscription: Box<dyn Subscription>,
        async_feed: Box<dyn Subscription>,
        handler: Box<dyn RequestHandler>,
        protocol_id: u16,
    ) -> Self {
        Self {
            response_pool,
            request_subscription,
            async_feed,
            handler,
            protocol_id,
        }
    }

    #[inline]
    pub fn response_pool(&self) -> &DeferredResponsePool {
        &self.response_pool
    }

    /// One cooperative tick. Never blocks; returns units of work done for
    /// scheduler fairness.
    pub fn do_work(&mut self) -> usize {
        let Self {
            response_pool,
            request_subscription,
            async_feed,
            handler,
            protocol_id,
        } = self;

        let mut work = 0;

        let free_slots = response_pool.pooled_count();
        if free_slots > 0 {
            work += request_subscription.poll(
                &mut |fragment, channel_id, _position| {
                    handle_fragment(response_pool, handler.as_mut(), *protocol_id, fragment, channel_id);
                },
                free_slots,
            );
        }

        work += async_feed.poll(
            &mut |block, _channel_id, position| {
                response_pool.on_block_available(block, position);
            },
            usize::MAX,
        );

        work
    }
}

fn handle_fragment(
    pool: &DeferredResponsePool,
    handler: &mut dyn RequestHandler,
    protocol_id: u16,
    fragment: &[u8],
    channel_id: i32,
) {
    let Some(header) = FrameHeader::read_from(fragment) else {
        warn!(channel_id, len = fragment.len(), "dropping short request fragment");
        return;
    };
    if header.protocol_id != protocol_id {
        warn!(
            channel_id,
            protocol_id = header.protocol_id,
            expected = protocol_id,
            "dropping request with unknown protocol id"
        );
        return;
    }

    let Some(response) = pool.open(channel_id, header.connection_id, header.request_id) else {
        // At-most-once under overload: the fragment is dropped, the client
        // recovers by timeout.
        debug!(
            channel_id,
            connection_id = header.connection_id,
            request_id = header.request_id,
            "response pool exhausted, dropping request"
        );
        return;
    };

    if let Err(e) = handler.on_request(&fragment[HEADER_LENGTH..], response) {
        warn!(
            connection_id = header.connection_id,
            request_id = header.request_id,
            error = %e,
            "request handler failed"
        );
    }
    if !response.is_deferred() {
        // The handler committed, produced no reply, or failed; either way
        // the slot goes back.
        pool.reclaim(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::log::{ClaimOutcome, FragmentSink, Reservation, SharedLog};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    struct TestLog {
        next_position: AtomicU64,
        sink: Arc<TestSink>,
    }

    #[derive(Default)]
    struct TestSink {
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl FragmentSink for TestSink {
        fn publish(&self, _position: u64, bytes: &[u8]) {
            self.published.lock().unwrap().push(bytes.to_vec());
        }

        fn discard(&self, _position: u64) {}
    }

    impl SharedLog for TestLog {
        fn claim(&self, length: usize) -> ClaimOutcome {
            let position = self.next_position.fetch_add(1, Ordering::Relaxed);
            ClaimOutcome::Claimed(Reservation::new(
                position,
                length,
                self.sink.clone() as Arc<dyn FragmentSink>,
            ))
        }
    }

    /// Queue-backed subscription delivering `(bytes, channel_id, position)`.
    #[derive(Clone, Default)]
    struct QueueFeed {
        items: Rc<RefCell<VecDeque<(Vec<u8>, i32, u64)>>>,
    }

    impl QueueFeed {
        fn push(&self, bytes: Vec<u8>, channel_id: i32, position: u64) {
            self.items.borrow_mut().push_back((bytes, channel_id, position));
        }
    }

    impl Subscription for QueueFeed {
        fn poll(&mut self, consumer: &mut dyn FnMut(&[u8], i32, u64), limit: usize) -> usize {
            let mut count = 0;
            while count < limit {
                let Some((bytes, channel_id, position)) = self.items.borrow_mut().pop_front()
                else {
                    break;
                };
                consumer(&bytes, channel_id, position);
                count += 1;
            }
            count
        }
    }

    fn request_fragment(connection_id: u64, request_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut fragment = vec![0u8; HEADER_LENGTH + payload.len()];
        FrameHeader::new(1, connection_id, request_id).write_to(&mut fragment);
        fragment[HEADER_LENGTH..].copy_from_slice(payload);
        fragment
    }

    fn worker_with_handler(
        capacity: usize,
        handler: Box<dyn RequestHandler>,
    ) -> (RequestWorker, QueueFeed, QueueFeed, Arc<TestSink>) {
        let sink = Arc::new(TestSink::default());
        let log = Arc::new(TestLog {
            next_position: AtomicU64::new(0),
            sink: Arc::clone(&sink),
        });
        let pool = DeferredResponsePool::new(capacity, log, 1);
        let requests = QueueFeed::default();
        let async_feed = QueueFeed::default();
        let worker = RequestWorker::new(
            pool,
            Box::new(requests.clone()),
            Box::new(async_feed.clone()),
            handler,
            1,
        );
        (worker, requests, async_feed, sink)
    }

    #[test]
    fn test_echo_round_trip() {
        let echo = |buffer: &[u8], response: &DeferredResponse| {
            let payload = buffer.to_vec();
            response.allocate_and_write(&payload)?;
            response.commit()
        };
        let (mut worker, requests, _async_feed, sink) =
            worker_with_handler(2, Box::new(echo));

        requests.push(request_fragment(10, 0, b"hello"), 1, 0);
        let work = worker.do_work();
        assert_eq!(work, 1);

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let header = FrameHeader::read_from(&published[0]).unwrap();
        assert_eq!(header.connection_id, 10);
        assert_eq!(header.request_id, 0);
        assert_eq!(&published[0][HEADER_LENGTH..], b"hello");
        assert_eq!(worker.response_pool().pooled_count(), 2);
    }

    #[test]
    fn test_backpressure_bounds_dispatch_per_tick() {
        // Handler defers everything so slots stay consumed.
        let defer_all = |_buffer: &[u8], response: &DeferredResponse| {
            response.defer(u64::MAX);
            Ok(())
        };
        let (mut worker, requests, async_feed, _sink) =
            worker_with_handler(2, Box::new(defer_all));

        for i in 0..5u64 {
            requests.push(request_fragment(10, i, b"x"), 1, i);
        }

        // Exactly `capacity` fragments are dispatched in one tick.
        assert_eq!(worker.do_work(), 2);
        assert_eq!(worker.response_pool().pooled_count(), 0);

        // No free slots: nothing is consumed this tick.
        assert_eq!(worker.do_work(), 0);

        // Resolving the deferred responses frees slots; the free-slot gate
        // is computed at tick start, so dispatch resumes next tick.
        async_feed.push(Vec::new(), 0, u64::MAX);
        assert_eq!(worker.do_work(), 1); // async block drained
        assert_eq!(worker.response_pool().pooled_count(), 2);
        assert_eq!(worker.do_work(), 2); // next two fragments, deferred again
        assert_eq!(worker.do_work(), 0);

        async_feed.push(Vec::new(), 0, u64::MAX);
        assert_eq!(worker.do_work(), 1);
        assert_eq!(worker.do_work(), 1); // the last queued fragment
    }

    #[test]
    fn test_pool_exhaustion_drops_fragment_silently() {
        let defer_all = |_buffer: &[u8], response: &DeferredResponse| {
            response.defer(u64::MAX);
            Ok(())
        };
        let (mut worker, requests, _async_feed, sink) =
            worker_with_handler(1, Box::new(defer_all));

        requests.push(request_fragment(10, 0, b"x"), 1, 0);
        assert_eq!(worker.do_work(), 1);

        // The free-slot gate is computed per tick; a fragment arriving with
        // no free slots is simply not consumed yet.
        requests.push(request_fragment(10, 1, b"y"), 1, 1);
        assert_eq!(worker.do_work(), 0);
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_error_reclaims_response() {
        let failing =
            |_buffer: &[u8], _response: &DeferredResponse| -> crate::Result<()> {
                Err(TransportError::NoAllocatedResponse)
            };
        let (mut worker, requests, _async_feed, sink) =
            worker_with_handler(1, Box::new(failing));

        requests.push(request_fragment(10, 0, b"x"), 1, 0);
        assert_eq!(worker.do_work(), 1);

        assert_eq!(worker.response_pool().pooled_count(), 1);
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_and_foreign_fragments_are_dropped() {
        let echo = |buffer: &[u8], response: &DeferredResponse| {
            let payload = buffer.to_vec();
            response.allocate_and_write(&payload)?;
            response.commit()
        };
        let (mut worker, requests, _async_feed, sink) =
            worker_with_handler(2, Box::new(echo));

        // Too short for a header.
        requests.push(vec![0u8; 4], 1, 0);
        // Wrong protocol id.
        let mut foreign = request_fragment(10, 0, b"x");
        foreign[0] = 0xEE;
        requests.push(foreign, 1, 1);

        worker.do_work();
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(worker.response_pool().pooled_count(), 2);
    }

    #[test]
    fn test_deferred_resolution_happens_during_drain() {
        let defer_at = Rc::new(RefCell::new(VecDeque::from([7u64, 3u64])));
        let positions = Rc::clone(&defer_at);
        let handler = move |buffer: &[u8], response: &DeferredResponse| {
            let payload = buffer.to_vec();
            response.allocate_and_write(&payload)?;
            let position = positions.borrow_mut().pop_front().unwrap_or(0);
            response.defer(position);
            Ok(())
        };
        let (mut worker, requests, async_feed, sink) =
            worker_with_handler(2, Box::new(handler));

        requests.push(request_fragment(10, 0, b"A"), 1, 0);
        requests.push(request_fragment(10, 1, b"B"), 1, 1);
        worker.do_work();

        // B's defer position (3) is lower, but A (7) heads the FIFO.
        async_feed.push(Vec::new(), 0, 5);
        worker.do_work();
        assert!(sink.published.lock().unwrap().is_empty());

        async_feed.push(Vec::new(), 0, 9);
        worker.do_work();
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(&published[0][HEADER_LENGTH..], b"A");
        assert_eq!(&published[1][HEADER_LENGTH..], b"B");
    }
}
