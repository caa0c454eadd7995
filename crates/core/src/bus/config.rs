//! # Bus Configuration
//!
//! Recognized options for an [`EventBus`](super::EventBus). Loadable from JSON;
//! every field is optional and falls back to the documented default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default per-subscription queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
/// Default maximum number of handlers running at once
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 32;
/// Default per-handler timeout
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 30_000;
/// Default wait for queue space under the `block` policy
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;
/// Default number of events kept for `history()`
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// What a full subscriber queue does with a new delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Publisher waits for space (bounded by `block_timeout_ms`)
    Block,
    /// Oldest queued delivery is discarded to make room
    #[default]
    DropOldest,
    /// The new delivery is discarded
    DropNewest,
    /// The new delivery is refused and reported in the publish result
    Error,
}

/// Configuration for the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscription inbound buffer size
    pub queue_depth: usize,
    /// Policy applied when a subscription's buffer is full
    pub overflow_policy: OverflowPolicy,
    /// Per-handler timeout in milliseconds (`None` disables it)
    pub handler_timeout_ms: Option<u64>,
    /// Maximum parallel handler executions across the bus
    pub dispatch_concurrency: usize,
    /// Separator between topic segments
    pub topic_delimiter: String,
    /// Token matching exactly one segment in a pattern
    pub wildcard_token: String,
    /// How long a `block` publisher waits for space before giving up
    pub block_timeout_ms: u64,
    /// Number of recent events retained for introspection
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            overflow_policy: OverflowPolicy::DropOldest,
            handler_timeout_ms: Some(DEFAULT_HANDLER_TIMEOUT_MS),
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            topic_delimiter: ".".to_string(),
            wildcard_token: "*".to_string(),
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BusConfig {
    /// Parse a configuration from JSON, then validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&raw)
    }

    /// Set the queue depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the overflow policy
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set (or clear) the per-handler timeout
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout_ms = timeout.map(millis_ceil);
        self
    }

    /// Set the dispatch pool size
    pub fn with_dispatch_concurrency(mut self, concurrency: usize) -> Self {
        self.dispatch_concurrency = concurrency;
        self
    }

    /// Set the block-policy wait
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = millis_ceil(timeout);
        self
    }

    /// Per-handler timeout as a `Duration`
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Block-policy wait as a `Duration`
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Reject option combinations the bus cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }
        if self.dispatch_concurrency == 0 {
            return Err(Error::Config(
                "dispatch_concurrency must be at least 1".into(),
            ));
        }
        if self.handler_timeout_ms == Some(0) {
            return Err(Error::Config(
                "handler_timeout_ms must be positive or null".into(),
            ));
        }
        if self.topic_delimiter.is_empty() {
            return Err(Error::Config("topic_delimiter must not be empty".into()));
        }
        if self.wildcard_token.is_empty() {
            return Err(Error::Config("wildcard_token must not be empty".into()));
        }
        if self.topic_delimiter == self.wildcard_token {
            return Err(Error::Config(
                "topic_delimiter and wildcard_token must differ".into(),
            ));
        }
        if self.topic_delimiter.chars().any(is_segment_char) {
            return Err(Error::Config(format!(
                "topic_delimiter '{}' overlaps the segment charset [A-Za-z0-9_-]",
                self.topic_delimiter
            )));
        }
        if self.wildcard_token.contains(self.topic_delimiter.as_str()) {
            return Err(Error::Config(
                "wildcard_token must not contain the delimiter".into(),
            ));
        }
        if self.wildcard_token.chars().all(is_segment_char) {
            return Err(Error::Config(format!(
                "wildcard_token '{}' is indistinguishable from a literal segment",
                self.wildcard_token
            )));
        }
        Ok(())
    }
}

/// Whole milliseconds, rounded up so a sub-millisecond timeout stays positive
fn millis_ceil(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

/// Characters allowed inside a topic segment
pub(crate) fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}
