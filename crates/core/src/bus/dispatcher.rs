//! # Dispatcher
//!
//! Fans each event out to the mailboxes of matching subscriptions and runs
//! one worker task per subscription.
//!
//! ```text
//! publish ──▶ resolve ──▶ mailbox(sub A) ──▶ worker A ──▶ handler task
//!                    └──▶ mailbox(sub B) ──▶ worker B ──▶ handler task
//!                                                  │
//!                                   failure ──▶ `_error` event
//! ```
//!
//! A worker pops one delivery at a time, so a subscription never sees two of
//! its handlers overlap and sees events in publish order. Handler executions
//! across the bus are bounded by a shared semaphore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::{BusConfig, OverflowPolicy};
use super::event::{ErrorReport, Event, FailureKind};
use super::history::{BusStats, EventHistory};
use super::mailbox::{Delivery, DeliveryOutcome, Offer};
use super::registry::{SubscriberRef, Subscription, SubscriptionRegistry};
use super::result::{RejectReason, Rejection, ShutdownReport};
use super::topic::TopicSyntax;
use crate::error::{Error, Result};

/// What happened when an event was handed to the matching mailboxes
pub(crate) struct DispatchTicket {
    pub(crate) matched: usize,
    pub(crate) accepted: usize,
    pub(crate) rejected: Vec<Rejection>,
    /// Reply channels, only filled when results were requested
    pub(crate) pending: Vec<(SubscriberRef, oneshot::Receiver<DeliveryOutcome>)>,
}

pub(crate) struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    syntax: TopicSyntax,
    semaphore: Arc<Semaphore>,
    /// Pause gates keyed by subscriber id; `true` means paused
    gates: DashMap<String, watch::Sender<bool>>,
    workers: DashMap<Uuid, JoinHandle<()>>,
    handler_timeout: Option<Duration>,
    block_timeout: Duration,
    history: EventHistory,
    stats: BusStats,
    closed: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &BusConfig,
        syntax: TopicSyntax,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            registry,
            syntax,
            semaphore: Arc::new(Semaphore::new(config.dispatch_concurrency)),
            gates: DashMap::new(),
            workers: DashMap::new(),
            handler_timeout: config.handler_timeout(),
            block_timeout: config.block_timeout(),
            history: EventHistory::new(config.history_limit),
            stats: BusStats::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn history(&self) -> &EventHistory {
        &self.history
    }

    pub(crate) fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Register a subscription and start its worker
    pub(crate) fn attach(self: &Arc<Self>, subscription: Arc<Subscription>) {
        let gate = self.gate_for(&subscription.subscriber_id);
        let worker = tokio::spawn(run_worker(
            Arc::downgrade(self),
            Arc::clone(&subscription),
            gate,
            Arc::clone(&self.semaphore),
            self.handler_timeout,
        ));
        self.workers.insert(subscription.id, worker);
        self.registry.insert(subscription);
    }

    /// Undo an `attach` that raced with shutdown
    ///
    /// Closes the mailbox even when `drain` already took the subscription out
    /// of the registry, so its worker never outlives the bus.
    pub(crate) fn abandon(&self, subscription: &Subscription) {
        self.registry.remove(&subscription.id);
        let discarded = subscription.mailbox.close();
        BusStats::add(&self.stats.dropped, discarded);
    }

    /// Remove a subscription; queued deliveries are discarded, a running
    /// handler is left to finish
    pub(crate) fn detach(&self, id: &Uuid) -> bool {
        let Some(subscription) = self.registry.remove(id) else {
            return false;
        };
        let discarded = subscription.mailbox.close();
        BusStats::add(&self.stats.dropped, discarded);
        tracing::info!(
            subscription_id = %id,
            subscriber_id = %subscription.subscriber_id,
            pattern = %subscription.pattern,
            discarded,
            "Unsubscribed"
        );
        true
    }

    fn gate_for(&self, subscriber_id: &str) -> watch::Receiver<bool> {
        self.gates
            .entry(subscriber_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Hold deliveries for every subscription owned by `subscriber_id`
    pub(crate) fn pause(&self, subscriber_id: &str) {
        self.gates
            .entry(subscriber_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
        tracing::debug!(subscriber_id, "Subscriber paused");
    }

    /// Release held deliveries in their original order
    pub(crate) fn resume(&self, subscriber_id: &str) {
        if let Some(gate) = self.gates.get(subscriber_id) {
            gate.send_replace(false);
        }
        self.release_gate(subscriber_id);
        tracing::debug!(subscriber_id, "Subscriber resumed");
    }

    /// Drop a gate no worker listens to, unless it still holds a pause
    ///
    /// Runs under the shard lock, so a concurrent `attach` either keeps the
    /// gate alive or creates a fresh one.
    fn release_gate(&self, subscriber_id: &str) {
        self.gates.remove_if(subscriber_id, |_, gate| {
            gate.receiver_count() == 0 && !*gate.borrow()
        });
    }

    /// Drop the pause gate of a subscriber that no longer exists
    pub(crate) fn forget(&self, subscriber_id: &str) {
        if let Some((_, gate)) = self.gates.remove(subscriber_id) {
            gate.send_replace(false);
        }
    }

    /// Hand an event to every matching subscription
    ///
    /// Mailboxes with room are filled first; subscriptions under the `block`
    /// policy are then waited on, so a full queue never delays the others.
    pub(crate) async fn dispatch(&self, event: Arc<Event>, collect: bool) -> Result<DispatchTicket> {
        let parts = self.syntax.split_topic(event.topic())?;
        let subscriptions = self.registry.resolve(&parts);
        drop(parts);

        self.history.record(Arc::clone(&event));
        BusStats::bump(&self.stats.published);

        let mut ticket = DispatchTicket {
            matched: subscriptions.len(),
            accepted: 0,
            rejected: Vec::new(),
            pending: Vec::new(),
        };
        let mut blocked = Vec::new();

        for subscription in subscriptions {
            let delivery = self.prepare(&subscription, &event, collect, &mut ticket);
            match subscription.mailbox.offer(delivery) {
                Offer::Full(delivery)
                    if subscription.mailbox.policy() == OverflowPolicy::Block =>
                {
                    blocked.push((subscription, delivery));
                }
                offer => self.settle(&subscription, offer, RejectReason::QueueFull, &mut ticket),
            }
        }

        if !blocked.is_empty() {
            let deadline = Instant::now() + self.block_timeout;
            for (subscription, delivery) in blocked {
                tracing::debug!(
                    subscriber_id = %subscription.subscriber_id,
                    capacity = subscription.mailbox.capacity(),
                    "Queue full, publisher waiting for space"
                );
                let offer = subscription.mailbox.offer_until(delivery, deadline).await;
                self.settle(&subscription, offer, RejectReason::BlockTimeout, &mut ticket);
            }
        }

        tracing::debug!(
            topic = %event.topic(),
            event_id = %event.id(),
            matched = ticket.matched,
            accepted = ticket.accepted,
            rejected = ticket.rejected.len(),
            "Event dispatched"
        );
        Ok(ticket)
    }

    fn prepare(
        &self,
        subscription: &Subscription,
        event: &Arc<Event>,
        collect: bool,
        ticket: &mut DispatchTicket,
    ) -> Delivery {
        if collect {
            let (delivery, rx) = Delivery::with_reply(Arc::clone(event));
            ticket.pending.push((subscription.subscriber(), rx));
            delivery
        } else {
            Delivery::new(Arc::clone(event))
        }
    }

    fn settle(
        &self,
        subscription: &Subscription,
        offer: Offer,
        full_reason: RejectReason,
        ticket: &mut DispatchTicket,
    ) {
        let reason = match offer {
            Offer::Queued => {
                ticket.accepted += 1;
                return;
            }
            Offer::Evicted(old) => {
                ticket.accepted += 1;
                BusStats::bump(&self.stats.dropped);
                tracing::debug!(
                    subscriber_id = %subscription.subscriber_id,
                    dropped_event_id = %old.event.id(),
                    queued = subscription.mailbox.len(),
                    "Queue full, dropped oldest delivery"
                );
                return;
            }
            Offer::Discarded(new) => {
                BusStats::bump(&self.stats.dropped);
                tracing::debug!(
                    subscriber_id = %subscription.subscriber_id,
                    dropped_event_id = %new.event.id(),
                    "Queue full, dropped newest delivery"
                );
                return;
            }
            Offer::Full(_) => full_reason,
            Offer::Closed(_) => RejectReason::Closed,
        };

        // The refused delivery is not pending: its subscriber shows up as rejected.
        ticket
            .pending
            .retain(|(s, _)| s.subscription_id != subscription.id);
        BusStats::bump(&self.stats.rejected);
        tracing::warn!(
            subscriber_id = %subscription.subscriber_id,
            subscription_id = %subscription.id,
            ?reason,
            "Delivery rejected"
        );
        ticket.rejected.push(Rejection {
            subscriber: subscription.subscriber(),
            reason,
        });
    }

    /// Record a finished invocation, reply to a waiting publisher and report
    /// failures on the error topic
    fn complete(self: &Arc<Self>, subscription: &Subscription, delivery: Delivery, outcome: DeliveryOutcome) {
        let event = Arc::clone(&delivery.event);
        let failure = match &outcome {
            DeliveryOutcome::Completed(_) => {
                BusStats::bump(&self.stats.delivered);
                tracing::debug!(
                    subscriber_id = %subscription.subscriber_id,
                    event_id = %event.id(),
                    "Delivery completed"
                );
                None
            }
            DeliveryOutcome::Failed(message) => {
                BusStats::bump(&self.stats.failed);
                let error = Error::Handler {
                    subscriber_id: subscription.subscriber_id.clone(),
                    message: message.clone(),
                };
                Some((FailureKind::HandlerError, error.to_string()))
            }
            DeliveryOutcome::TimedOut(limit) => {
                BusStats::bump(&self.stats.timed_out);
                let error = Error::DispatchTimeout {
                    subscriber_id: subscription.subscriber_id.clone(),
                    timeout: *limit,
                };
                Some((FailureKind::DispatchTimeout, error.to_string()))
            }
        };

        if let Some(reply) = delivery.reply {
            let _ = reply.send(outcome);
        }

        let Some((kind, description)) = failure else {
            return;
        };
        tracing::warn!(
            subscriber_id = %subscription.subscriber_id,
            topic = %event.topic(),
            event_id = %event.id(),
            error = %description,
            "Handler failed"
        );

        if event.is_error_event() {
            // Failures while handling failures are only logged.
            return;
        }
        let report = ErrorReport {
            original_topic: event.topic().to_string(),
            subscriber_id: subscription.subscriber_id.clone(),
            subscription_id: subscription.id,
            error_description: description,
            original_event_id: event.id(),
            kind,
        };
        self.emit_error(report, &event);
    }

    fn emit_error(self: &Arc<Self>, report: ErrorReport, original: &Event) {
        if self.is_closed() {
            return;
        }
        let error_event = Arc::new(report.into_event(original));
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(error_event, false).await {
                tracing::warn!("Failed to publish error event: {}", e);
            }
        });
    }

    /// Close every subscription, wait up to `grace` for running handlers,
    /// then abort what is left
    pub(crate) async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.closed.store(true, Ordering::Release);
        // Workers waiting for a permit have not started their delivery yet.
        self.semaphore.close();

        // Take the handles before closing mailboxes: a woken worker removes
        // its own entry on exit.
        let ids: Vec<Uuid> = self.workers.iter().map(|e| *e.key()).collect();
        let workers: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.workers.remove(id).map(|(_, worker)| worker))
            .collect();

        let mut report = ShutdownReport::default();
        for subscription in self.registry.drain() {
            report.discarded += subscription.mailbox.close();
        }
        BusStats::add(&self.stats.dropped, report.discarded);

        let deadline = Instant::now() + grace;
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(_) => report.completed += 1,
                Err(_) => {
                    worker.abort();
                    report.cancelled += 1;
                }
            }
        }

        for gate in self.gates.iter() {
            gate.send_replace(false);
        }
        report
    }
}

/// Aborts the wrapped handler task when dropped
struct HandlerTask(JoinHandle<anyhow::Result<Option<serde_json::Value>>>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn invoke(subscription: &Subscription, event: &Arc<Event>, timeout: Option<Duration>) -> DeliveryOutcome {
    let handler = Arc::clone(&subscription.handler);
    let event = Arc::clone(event);
    let mut task = HandlerTask(tokio::spawn(async move { handler.handle_event(&event).await }));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => return DeliveryOutcome::TimedOut(limit),
        },
        None => (&mut task.0).await,
    };

    match joined {
        Ok(Ok(value)) => DeliveryOutcome::Completed(value),
        Ok(Err(e)) => DeliveryOutcome::Failed(format!("{e:#}")),
        Err(e) if e.is_panic() => DeliveryOutcome::Failed("handler panicked".to_string()),
        Err(_) => DeliveryOutcome::Failed("handler task was cancelled".to_string()),
    }
}

/// Resolves once the gate is open (or its sender is gone)
async fn wait_until_open(gate: &mut watch::Receiver<bool>) {
    let _ = gate.wait_for(|paused| !*paused).await.map(|_| ());
}

async fn run_worker(
    dispatcher: Weak<Dispatcher>,
    subscription: Arc<Subscription>,
    mut gate: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
    handler_timeout: Option<Duration>,
) {
    loop {
        let paused = *gate.borrow();
        if paused {
            tokio::select! {
                _ = wait_until_open(&mut gate) => {}
                _ = subscription.mailbox.closed() => break,
            }
        }
        if !subscription.mailbox.ready().await {
            break;
        }
        // Paused while idle: leave the delivery queued.
        if *gate.borrow() {
            continue;
        }
        let Some(delivery) = subscription.mailbox.try_recv() else {
            continue;
        };

        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if subscription.mailbox.is_closed() {
            break;
        }
        let outcome = invoke(&subscription, &delivery.event, handler_timeout).await;
        drop(permit);

        match dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.complete(&subscription, delivery, outcome),
            None => break,
        }
    }

    drop(gate);
    if let Some(dispatcher) = dispatcher.upgrade() {
        dispatcher.release_gate(&subscription.subscriber_id);
        dispatcher.workers.remove(&subscription.id);
    }
    tracing::debug!(subscription_id = %subscription.id, "Worker stopped");
}
