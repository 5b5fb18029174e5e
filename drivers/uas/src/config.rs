//! # UAS Configuration

use crate::tag::MAX_TAGS;

/// Session tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UasConfig {
    /// Streams requested from a multi-stream device
    pub max_streams: u16,
    /// Streams requested from a single-stream device
    pub single_stream_max: u16,
    /// How long pre-reset waits for outstanding commands (ms)
    pub drain_timeout_ms: u64,
    /// Per-request timeout reported upward (ms)
    pub request_timeout_ms: u64,
    /// Largest transfer reported upward, in 512-byte sectors
    pub max_sectors: u32,
}

impl UasConfig {
    /// Default stream request
    pub const DEFAULT_MAX_STREAMS: u16 = MAX_TAGS;
    /// Single-stream devices still get two streams allocated
    pub const DEFAULT_SINGLE_STREAM_MAX: u16 = 2;
    /// Default drain timeout: 5s
    pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;
    /// Default request timeout: 5s
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
    /// Default transfer cap
    pub const DEFAULT_MAX_SECTORS: u32 = 128;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            max_streams: Self::DEFAULT_MAX_STREAMS,
            single_stream_max: Self::DEFAULT_SINGLE_STREAM_MAX,
            drain_timeout_ms: Self::DEFAULT_DRAIN_TIMEOUT_MS,
            request_timeout_ms: Self::DEFAULT_REQUEST_TIMEOUT_MS,
            max_sectors: Self::DEFAULT_MAX_SECTORS,
        }
    }

    /// Apply `key=value` overrides
    ///
    /// Recognised keys: `max_streams`, `single_stream_max`,
    /// `drain_timeout_ms`, `request_timeout_ms`, `max_sectors`. Unparseable
    /// values are ignored.
    pub fn with_overrides<'a, F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<usize>().ok());

        if let Some(n) = number("max_streams") {
            self.max_streams = n.min(u16::MAX as usize) as u16;
        }
        if let Some(n) = number("single_stream_max") {
            self.single_stream_max = n.min(u16::MAX as usize) as u16;
        }
        if let Some(ms) = number("drain_timeout_ms") {
            self.drain_timeout_ms = ms as u64;
        }
        if let Some(ms) = number("request_timeout_ms") {
            self.request_timeout_ms = ms as u64;
        }
        if let Some(n) = number("max_sectors") {
            self.max_sectors = n.min(u32::MAX as usize) as u32;
        }
        self.validated()
    }

    /// Clamp stream counts to what the tag pool can address
    pub fn validated(mut self) -> Self {
        self.max_streams = self.max_streams.clamp(1, MAX_TAGS);
        self.single_stream_max = self.single_stream_max.clamp(1, MAX_TAGS);
        self
    }
}

impl Default for UasConfig {
    fn default() -> Self {
        Self::new()
    }
}
