//! Common test utilities: an in-memory log plus a loopback channel pair.
//!
//! The transport consumes the log and channel through narrow traits; these
//! implementations are deliberately simple (a mutex-guarded deque is fine
//! in test code) and add failure injection for claim outcomes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use logrpc::{
    ChannelDemux, ChannelListener, ClaimOutcome, DeferredResponse, DeferredResponsePool,
    FragmentSink, RequestHandler, RequestWorker, Reservation, SharedLog, Subscription,
    TransportConfig,
};

/// In-memory append-only log: claims hand out positions, commits append to
/// a committed-fragment deque that subscriptions drain.
pub struct TestLog {
    inner: Arc<TestLogInner>,
}

pub struct TestLogInner {
    next_position: AtomicU64,
    committed: Mutex<VecDeque<(u64, Vec<u8>)>>,
    aborted: AtomicUsize,
    /// Claims to answer with the transient retry sentinel before granting.
    retries_before_claim: AtomicUsize,
    /// When set, every claim is rejected outright.
    full: AtomicBool,
}

impl TestLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(TestLogInner {
                next_position: AtomicU64::new(0),
                committed: Mutex::new(VecDeque::new()),
                aborted: AtomicUsize::new(0),
                retries_before_claim: AtomicUsize::new(0),
                full: AtomicBool::new(false),
            }),
        })
    }

    /// Drain all committed fragments in commit order.
    pub fn drain(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner.committed.lock().unwrap().drain(..).collect()
    }

    pub fn committed_count(&self) -> usize {
        self.inner.committed.lock().unwrap().len()
    }

    pub fn aborted_count(&self) -> usize {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    pub fn set_full(&self, full: bool) {
        self.inner.full.store(full, Ordering::Relaxed);
    }

    pub fn set_retries_before_claim(&self, retries: usize) {
        self.inner.retries_before_claim.store(retries, Ordering::Relaxed);
    }
}

impl SharedLog for TestLog {
    fn claim(&self, length: usize) -> ClaimOutcome {
        if self.inner.full.load(Ordering::Relaxed) {
            return ClaimOutcome::Full;
        }
        if self
            .inner
            .retries_before_claim
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            return ClaimOutcome::Retry;
        }
        let position = self.inner.next_position.fetch_add(1, Ordering::Relaxed);
        ClaimOutcome::Claimed(Reservation::new(
            position,
            length,
            self.inner.clone() as Arc<dyn FragmentSink>,
        ))
    }
}

impl FragmentSink for TestLogInner {
    fn publish(&self, position: u64, bytes: &[u8]) {
        self.committed
            .lock()
            .unwrap()
            .push_back((position, bytes.to_vec()));
    }

    fn discard(&self, _position: u64) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Subscription that drains a [`TestLog`]'s committed fragments, tagging
/// each with a fixed channel id.
pub struct LogSubscription {
    log: Arc<TestLog>,
    channel_id: i32,
}

impl LogSubscription {
    pub fn new(log: Arc<TestLog>, channel_id: i32) -> Self {
        Self { log, channel_id }
    }
}

impl Subscription for LogSubscription {
    fn poll(&mut self, consumer: &mut dyn FnMut(&[u8], i32, u64), limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            let Some((position, bytes)) = self.log.inner.committed.lock().unwrap().pop_front()
            else {
                break;
            };
            consumer(&bytes, self.channel_id, position);
            count += 1;
        }
        count
    }
}

/// Async-work feed: positions pushed by the test become block-available
/// notifications for the deferred-response pool.
#[derive(Clone, Default)]
pub struct PositionFeed {
    pending: Arc<Mutex<VecDeque<u64>>>,
}

impl PositionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, position: u64) {
        self.pending.lock().unwrap().push_back(position);
    }
}

impl Subscription for PositionFeed {
    fn poll(&mut self, consumer: &mut dyn FnMut(&[u8], i32, u64), limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            let Some(position) = self.pending.lock().unwrap().pop_front() else {
                break;
            };
            consumer(&[], 0, position);
            count += 1;
        }
        count
    }
}

/// Deliver every response the server committed to the client demultiplexer
/// as if it arrived on `channel_id`. Returns the number delivered.
pub fn pump_responses(server_log: &TestLog, demux: &ChannelDemux, channel_id: i32) -> usize {
    let frames = server_log.drain();
    let delivered = frames.len();
    for (_position, frame) in frames {
        demux.on_receive(channel_id, &frame);
    }
    delivered
}

/// Echoes every request payload back.
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn on_request(&mut self, buffer: &[u8], response: &DeferredResponse) -> logrpc::Result<()> {
        let payload = buffer.to_vec();
        response.allocate_and_write(&payload)?;
        response.commit()
    }
}

/// Echoes the payload but defers transmission to a per-request position
/// taken from `positions` (falling back to 0).
pub struct DeferringEchoHandler {
    pub positions: VecDeque<u64>,
}

impl RequestHandler for DeferringEchoHandler {
    fn on_request(&mut self, buffer: &[u8], response: &DeferredResponse) -> logrpc::Result<()> {
        let payload = buffer.to_vec();
        response.allocate_and_write(&payload)?;
        let position = self.positions.pop_front().unwrap_or(0);
        response.defer(position);
        Ok(())
    }
}

/// Build a server worker reading requests from `client_log` and answering
/// into `server_log` with the given handler.
pub fn build_worker(
    config: &TransportConfig,
    client_log: Arc<TestLog>,
    server_log: Arc<TestLog>,
    request_channel_id: i32,
    handler: Box<dyn RequestHandler>,
) -> (RequestWorker, PositionFeed) {
    let response_pool = DeferredResponsePool::new(
        config.capacity,
        server_log as Arc<dyn SharedLog>,
        config.protocol_id,
    );
    let feed = PositionFeed::new();
    let worker = RequestWorker::new(
        response_pool,
        Box::new(LogSubscription::new(client_log, request_channel_id)),
        Box::new(feed.clone()),
        handler,
        config.protocol_id,
    );
    (worker, feed)
}
