//! # logrpc - pooled binary request/response transport over a shared log
//!
//! A client-side connection/request pooling layer and a server-side
//! deferred-response layer that together implement correlated,
//! asynchronous request/response exchange over a single-writer,
//! multi-reader append-only shared log.
//!
//! ## Architecture
//!
//! ```text
//!  client threads                                server worker thread
//!  ──────────────                                ────────────────────
//!  ConnectionPool ──> ConnectionHandle           RequestWorker::do_work()
//!        │                  │                      │ free_slots gate
//!        │           open_request()                ▼
//!        │                  │                 request Subscription
//!        ▼                  ▼                      │
//!   RequestPool ──> TransportRequest          DeferredResponsePool
//!        ▲            claim+write+commit           │ open / defer / commit
//!        │                  │                      ▼
//!   ChannelDemux <── response frames <──────── send log
//!   (on_receive / on_send_error /                  ▲
//!    on_channel_closed)                       async-work feed
//! ```
//!
//! - Any thread may use the client pools; hand-off points are lock-free
//!   MPMC queues and CAS-guarded state fields, never mutexes.
//! - The server side is one cooperative loop that never blocks; the number
//!   of free response slots bounds how many inbound requests are accepted
//!   per tick (backpressure).
//! - Correlation is exact per request via `(connection_id, request_id)`;
//!   no cross-request ordering is promised. Delivery is at-most-once with
//!   caller-driven retry.
//!
//! ## Usage
//!
//! ```ignore
//! use logrpc::{ChannelDemux, ConnectionPool, TransportConfig};
//!
//! let config = TransportConfig::default().with_capacity(32);
//! let pool = ConnectionPool::new(config, send_log);
//! let demux = ChannelDemux::new(pool.clone()); // feed channel callbacks here
//!
//! let conn = pool.open_connection().expect("pool exhausted");
//! let payload: &[u8] = b"ping";
//! let request = conn.open_request(channel_id, &payload)?;
//! if request.await_response_default()? {
//!     let bytes = request.response()?;
//! }
//! request.close();
//! ```
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Configuration ([`TransportConfig`])
//! - [`frame`]: Wire header and fragment framing
//! - [`log`]: Collaborator contracts (log, subscription, channel, writer)
//! - [`request`]: Request state machine ([`TransportRequest`])
//! - [`connection`]: Connections, pools, and client handles
//! - [`demux`]: Inbound channel demultiplexer ([`ChannelDemux`])
//! - [`deferred`]: Server-side deferred responses
//! - [`worker`]: Server request worker ([`RequestWorker`])

pub mod config;
pub mod connection;
pub mod deferred;
pub mod demux;
pub mod error;
pub mod frame;
pub mod log;
pub mod request;
pub mod worker;

// Re-export main types
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionPool, RequestHandle, RequestPool};
pub use deferred::{DeferredResponse, DeferredResponsePool};
pub use demux::ChannelDemux;
pub use error::{Result, TransportError};
pub use frame::{FrameHeader, HEADER_LENGTH, PROTOCOL_REQUEST_RESPONSE};
pub use log::{
    BufferWriter, ChannelListener, ClaimOutcome, FragmentSink, Reservation, SharedLog,
    Subscription,
};
pub use request::{RequestState, TransportRequest, DEFAULT_AWAIT_TIMEOUT};
pub use worker::{RequestHandler, RequestWorker};
