//! # Publish and Shutdown Results

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::registry::SubscriberRef;
use crate::error::Error;

/// Why a delivery was refused back to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Queue full under the `error` policy
    QueueFull,
    /// Queue stayed full for the whole `block` wait
    BlockTimeout,
    /// Subscription was removed before the delivery was queued
    Closed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::QueueFull => "queue full",
            Self::BlockTimeout => "queue stayed full past the block timeout",
            Self::Closed => "subscription closed",
        };
        f.write_str(reason)
    }
}

/// A delivery that was not queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub subscriber: SubscriberRef,
    pub reason: RejectReason,
}

/// Outcome of `publish`
#[derive(Debug)]
pub struct PublishResult {
    /// Id of the published event
    pub event_id: Uuid,
    /// Subscriptions whose pattern matched the topic
    pub matched: usize,
    /// Deliveries placed in a subscriber queue
    pub accepted: usize,
    /// Deliveries refused by backpressure
    pub rejected: Vec<Rejection>,
    /// Present only in aggregated mode
    pub aggregate: Option<AggregatedResult>,
}

/// A subscriber whose handler completed
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberSuccess {
    pub subscriber: SubscriberRef,
    pub value: Option<Value>,
}

impl Rejection {
    /// The rejection as an aggregated-mode failure
    pub(crate) fn into_failure(self) -> SubscriberFailure {
        let error = Error::DeliveryRejected {
            subscriber_id: self.subscriber.subscriber_id.clone(),
            reason: self.reason,
        };
        SubscriberFailure {
            subscriber: self.subscriber,
            error,
        }
    }
}

/// A subscriber whose handler failed, or whose delivery was dropped or
/// rejected
#[derive(Debug)]
pub struct SubscriberFailure {
    pub subscriber: SubscriberRef,
    pub error: Error,
}

/// Per-subscriber results collected in aggregated mode
#[derive(Debug, Default)]
pub struct AggregatedResult {
    pub successes: Vec<SubscriberSuccess>,
    pub failures: Vec<SubscriberFailure>,
    /// Handler timeouts and subscribers still running at the deadline
    pub timed_out: Vec<SubscriberRef>,
}

impl AggregatedResult {
    /// True when every matched subscriber completed successfully
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.timed_out.is_empty()
    }

    /// Ids of subscribers that failed or timed out
    pub fn unsuccessful_subscribers(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.subscriber.subscriber_id.as_str())
            .chain(self.timed_out.iter().map(|s| s.subscriber_id.as_str()))
            .collect()
    }
}

/// Outcome of `shutdown`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Worker tasks that finished within the grace period
    pub completed: usize,
    /// Worker tasks aborted after the grace period
    pub cancelled: usize,
    /// Queued deliveries discarded without running
    pub discarded: usize,
}
