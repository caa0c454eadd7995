//! # Event Bus
//!
//! Public façade over the registry and dispatcher. A bus is constructed
//! explicitly and cloned into whoever needs it; clones share one instance.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::BusConfig;
use super::dispatcher::Dispatcher;
use super::event::{Event, EventMetadata};
use super::handler::EventHandler;
use super::history::StatsSnapshot;
use super::mailbox::{DeliveryOutcome, Mailbox};
use super::options::{PublishOptions, SubscribeOptions};
use super::registry::{SubscriberRef, Subscription, SubscriptionHandle, SubscriptionRegistry};
use super::result::{
    AggregatedResult, PublishResult, Rejection, ShutdownReport, SubscriberFailure,
    SubscriberSuccess,
};
use super::topic::TopicSyntax;
use crate::error::{Error, Result};

struct BusInner {
    config: BusConfig,
    syntax: TopicSyntax,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

/// In-process publish/subscribe bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Non-owning reference to an [`EventBus`]
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<BusInner>,
}

impl WeakEventBus {
    /// The bus, if it is still alive
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventBus {
    /// Create a bus from a validated configuration
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        let syntax = TopicSyntax::new(&config)?;
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            syntax.clone(),
            Arc::clone(&registry),
        ));
        tracing::info!(
            queue_depth = config.queue_depth,
            overflow_policy = ?config.overflow_policy,
            dispatch_concurrency = config.dispatch_concurrency,
            "Event bus created"
        );
        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                syntax,
                registry,
                dispatcher,
            }),
        })
    }

    /// Configuration the bus was built with
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Weak handle that does not keep the bus alive
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True once `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Fire-and-forget publish
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishResult> {
        self.publish_with(topic, payload, PublishOptions::default())
            .await
    }

    /// Publish and wait for every matched subscriber, up to `timeout`
    pub async fn publish_aggregated(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<AggregatedResult> {
        let result = self
            .publish_with(topic, payload, PublishOptions::new().aggregate(timeout))
            .await?;
        Ok(result.aggregate.unwrap_or_default())
    }

    /// Publish with explicit metadata and/or aggregated-result mode
    ///
    /// Returns as soon as the event is queued for every matching subscriber,
    /// except when a `block` queue is full (waits for space) or aggregated
    /// mode is requested (waits for results).
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        if self.is_closed() {
            return Err(Error::BusClosed);
        }
        self.inner.syntax.validate_publish_topic(topic)?;

        let deadline = options.aggregate.map(|timeout| Instant::now() + timeout);
        // Id and timestamp always belong to this publish; only the
        // correlation and source fields carry over from the caller.
        let metadata = match options.metadata {
            Some(given) => EventMetadata {
                correlation_id: given.correlation_id,
                source_agent_id: given.source_agent_id,
                ..EventMetadata::new()
            },
            None => EventMetadata::new(),
        };
        let event = Arc::new(Event::new(topic, payload, metadata));
        let event_id = event.id();

        let ticket = self
            .inner
            .dispatcher
            .dispatch(event, deadline.is_some())
            .await?;

        let aggregate = match deadline {
            Some(deadline) => {
                let mut aggregate = collect(ticket.pending, deadline).await;
                aggregate
                    .failures
                    .extend(ticket.rejected.iter().cloned().map(Rejection::into_failure));
                Some(aggregate)
            }
            None => None,
        };

        Ok(PublishResult {
            event_id,
            matched: ticket.matched,
            accepted: ticket.accepted,
            rejected: ticket.rejected,
            aggregate,
        })
    }

    /// Register `handler` for topics matching `pattern`
    ///
    /// Only events published after this returns are delivered. Must be called
    /// from within a Tokio runtime.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        subscriber_id: &str,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_with(pattern, handler, subscriber_id, SubscribeOptions::default())
    }

    /// Register with a per-subscription queue depth or overflow policy
    pub fn subscribe_with(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        subscriber_id: &str,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        if self.is_closed() {
            return Err(Error::BusClosed);
        }
        let pattern = self.inner.syntax.parse_pattern(pattern)?;
        let config = &self.inner.config;
        let depth = options.queue_depth.unwrap_or(config.queue_depth);
        if depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }
        let policy = options.overflow_policy.unwrap_or(config.overflow_policy);

        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            seq: self.inner.registry.next_sequence(),
            pattern,
            subscriber_id: subscriber_id.to_string(),
            handler,
            mailbox: Mailbox::new(depth, policy),
        });
        let handle = subscription.handle();
        self.inner.dispatcher.attach(Arc::clone(&subscription));

        // Lost a race with shutdown: do not leave a live worker behind.
        if self.is_closed() {
            self.inner.dispatcher.abandon(&subscription);
            return Err(Error::BusClosed);
        }

        tracing::info!(
            subscription_id = %handle.id(),
            subscriber_id,
            pattern = %handle.pattern(),
            queue_depth = depth,
            overflow_policy = ?policy,
            "Subscribed"
        );
        Ok(handle)
    }

    /// Remove a subscription; calling it again is a no-op
    ///
    /// Returns `true` if this call removed it. A handler already running is
    /// not cancelled; queued deliveries are discarded.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.dispatcher.detach(&handle.id())
    }

    /// Hold deliveries to every subscription of `subscriber_id`
    ///
    /// Events keep queueing under each subscription's overflow policy.
    pub fn pause_subscriber(&self, subscriber_id: &str) {
        self.inner.dispatcher.pause(subscriber_id);
    }

    /// Resume deliveries held by `pause_subscriber`, in original order
    pub fn resume_subscriber(&self, subscriber_id: &str) {
        self.inner.dispatcher.resume(subscriber_id);
    }

    pub(crate) fn forget_subscriber(&self, subscriber_id: &str) {
        self.inner.dispatcher.forget(subscriber_id);
    }

    /// Most recent events, oldest first, optionally for one exact topic
    pub fn history(&self, topic: Option<&str>, limit: usize) -> Vec<Event> {
        self.inner.dispatcher.history().query(topic, limit)
    }

    /// Delivery counters
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.dispatcher.stats().snapshot()
    }

    /// Stop accepting publishes and subscriptions, discard queued deliveries,
    /// wait up to `grace_period` for running handlers, then cancel the rest
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, grace_period: Duration) -> ShutdownReport {
        let report = self.inner.dispatcher.shutdown(grace_period).await;
        tracing::info!(
            completed = report.completed,
            cancelled = report.cancelled,
            discarded = report.discarded,
            "Event bus shut down"
        );
        report
    }
}

/// Build a metadata block stamped with the publishing agent
pub(crate) fn metadata_from(agent_id: &str, base: Option<EventMetadata>) -> EventMetadata {
    let mut metadata = base.unwrap_or_default();
    metadata.source_agent_id = Some(agent_id.to_string());
    metadata
}

async fn collect(
    pending: Vec<(SubscriberRef, tokio::sync::oneshot::Receiver<DeliveryOutcome>)>,
    deadline: Instant,
) -> AggregatedResult {
    let mut result = AggregatedResult::default();
    for (subscriber, reply) in pending {
        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(DeliveryOutcome::Completed(value))) => {
                result.successes.push(SubscriberSuccess { subscriber, value })
            }
            Ok(Ok(DeliveryOutcome::Failed(message))) => {
                let error = Error::Handler {
                    subscriber_id: subscriber.subscriber_id.clone(),
                    message,
                };
                result.failures.push(SubscriberFailure { subscriber, error });
            }
            Ok(Ok(DeliveryOutcome::TimedOut(_))) | Err(_) => result.timed_out.push(subscriber),
            Ok(Err(_)) => {
                let error = Error::DeliveryDropped {
                    subscriber_id: subscriber.subscriber_id.clone(),
                };
                result.failures.push(SubscriberFailure { subscriber, error });
            }
        }
    }
    result
}
