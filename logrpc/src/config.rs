//! Transport configuration.

use std::time::Duration;

use crate::frame::PROTOCOL_REQUEST_RESPONSE;

/// Transport configuration.
///
/// Controls pool sizing, buffering, and the default request timeout for
/// both the client pools and the server response pool.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pool capacity: maximum concurrent requests, connections, and
    /// deferred responses.
    /// Default: 64
    pub capacity: usize,
    /// Initial client response buffer size in bytes, grown on demand.
    /// Default: 1024
    pub response_buffer_size: usize,
    /// Default request timeout.
    /// Default: 5s
    pub request_timeout: Duration,
    /// Protocol id stamped into and required of every frame header.
    /// Default: [`PROTOCOL_REQUEST_RESPONSE`]
    pub protocol_id: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            response_buffer_size: 1024,
            request_timeout: Duration::from_secs(5),
            protocol_id: PROTOCOL_REQUEST_RESPONSE,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the initial response buffer size.
    pub fn with_response_buffer_size(mut self, response_buffer_size: usize) -> Self {
        self.response_buffer_size = response_buffer_size;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Set the protocol id.
    pub fn with_protocol_id(mut self, protocol_id: u16) -> Self {
        self.protocol_id = protocol_id;
        self
    }
}
