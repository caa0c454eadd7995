//! # Call Options
//!
//! Per-call knobs for `publish_with` and `subscribe_with`.

use std::time::Duration;

use super::config::OverflowPolicy;
use super::event::EventMetadata;

/// Options for a single publish
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Correlation id and source to stamp on the event; its id and timestamp
    /// are replaced by fresh ones on every publish
    pub metadata: Option<EventMetadata>,
    /// Wait for every matched subscriber, up to this long
    pub aggregate: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given metadata
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Switch to aggregated-result mode with a deadline
    pub fn aggregate(mut self, timeout: Duration) -> Self {
        self.aggregate = Some(timeout);
        self
    }
}

/// Options for a single subscription; unset fields use the bus configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub queue_depth: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = Some(policy);
        self
    }
}
