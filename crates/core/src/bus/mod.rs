//! # The Bus
//!
//! In-process publish/subscribe with wildcard topics, bounded per-subscriber
//! queues and failure isolation. Handler failures never reach the publisher;
//! they are reported as events on [`ERROR_TOPIC`].

pub mod config;
mod dispatcher;
pub mod event;
pub mod event_bus;
pub mod handler;
mod history;
mod mailbox;
pub mod options;
mod registry;
pub mod result;
pub mod topic;

pub use config::{BusConfig, OverflowPolicy};
pub use event::{ErrorReport, Event, EventMetadata, FailureKind, ERROR_TOPIC};
pub use event_bus::{EventBus, WeakEventBus};
pub use handler::{handler_fn, EventHandler, FnHandler};
pub use history::StatsSnapshot;
pub use options::{PublishOptions, SubscribeOptions};
pub use registry::{SubscriberRef, SubscriptionHandle};
pub use result::{
    AggregatedResult, PublishResult, RejectReason, Rejection, ShutdownReport, SubscriberFailure,
    SubscriberSuccess,
};
pub use topic::{TopicPattern, TopicSyntax};
