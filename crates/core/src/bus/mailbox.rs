//! # Subscriber Mailbox
//!
//! Bounded inbound queue for one subscription. The dispatcher is the only
//! writer and the subscription's worker task the only reader.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::config::OverflowPolicy;
use super::event::Event;

/// How a single handler invocation ended
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeliveryOutcome {
    Completed(Option<Value>),
    Failed(String),
    TimedOut(Duration),
}

/// One queued event for one subscription
pub(crate) struct Delivery {
    pub(crate) event: Arc<Event>,
    /// Present only when the publisher waits for results
    pub(crate) reply: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl Delivery {
    pub(crate) fn new(event: Arc<Event>) -> Self {
        Self { event, reply: None }
    }

    pub(crate) fn with_reply(event: Arc<Event>) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Result of offering a delivery to a mailbox
pub(crate) enum Offer {
    /// Queued without displacing anything
    Queued,
    /// Queued after discarding the oldest delivery
    Evicted(Delivery),
    /// The new delivery was discarded
    Discarded(Delivery),
    /// Queue is full and the policy refuses or waits
    Full(Delivery),
    /// Subscription has been removed
    Closed(Delivery),
}

struct MailboxState {
    queue: VecDeque<Delivery>,
    closed: bool,
}

pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    capacity: usize,
    policy: OverflowPolicy,
    available: Notify,
    space: Notify,
}

impl Mailbox {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            policy,
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Apply the overflow policy without waiting
    pub(crate) fn offer(&self, delivery: Delivery) -> Offer {
        let mut state = self.lock();
        if state.closed {
            return Offer::Closed(delivery);
        }

        if state.queue.len() < self.capacity {
            state.queue.push_back(delivery);
            drop(state);
            self.available.notify_one();
            return Offer::Queued;
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                let evicted = state.queue.pop_front();
                state.queue.push_back(delivery);
                drop(state);
                self.available.notify_one();
                match evicted {
                    Some(old) => Offer::Evicted(old),
                    None => Offer::Queued,
                }
            }
            OverflowPolicy::DropNewest => Offer::Discarded(delivery),
            OverflowPolicy::Block | OverflowPolicy::Error => Offer::Full(delivery),
        }
    }

    /// Offer, waiting for space until `deadline` while the queue is full
    ///
    /// Returns `Offer::Full` if the deadline passes first.
    pub(crate) async fn offer_until(&self, mut delivery: Delivery, deadline: Instant) -> Offer {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(delivery) {
                Offer::Full(returned) => delivery = returned,
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.offer(delivery);
            }
        }
    }

    /// Waits until a delivery is queued (`true`) or the mailbox is closed
    /// and empty (`false`) without taking anything
    pub(crate) async fn ready(&self) -> bool {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if state.closed {
                    return false;
                }
            }

            notified.await;
        }
    }

    /// Take the next delivery in publish order, if any
    pub(crate) fn try_recv(&self) -> Option<Delivery> {
        let delivery = self.lock().queue.pop_front();
        if delivery.is_some() {
            self.space.notify_waiters();
        }
        delivery
    }

    /// Resolves once the mailbox has been closed
    pub(crate) async fn closed(&self) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse further deliveries and discard queued ones
    ///
    /// Returns how many queued deliveries were discarded.
    pub(crate) fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        let count = discarded.len();
        drop(discarded);
        self.available.notify_waiters();
        self.space.notify_waiters();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::EventMetadata;
    use serde_json::json;

    fn delivery(n: u64) -> Delivery {
        Delivery::new(Arc::new(Event::new(
            "t.x",
            json!({ "n": n }),
            EventMetadata::new(),
        )))
    }

    async fn next(mailbox: &Mailbox) -> Option<Delivery> {
        while mailbox.ready().await {
            if let Some(delivery) = mailbox.try_recv() {
                return Some(delivery);
            }
        }
        None
    }

    fn number(delivery: &Delivery) -> u64 {
        delivery.event.payload()["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mailbox = Mailbox::new(4, OverflowPolicy::DropOldest);
        for n in 1..=3 {
            assert!(matches!(mailbox.offer(delivery(n)), Offer::Queued));
        }
        assert_eq!(mailbox.len(), 3);
        for n in 1..=3 {
            assert_eq!(number(&next(&mailbox).await.unwrap()), n);
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let mailbox = Mailbox::new(1, OverflowPolicy::DropOldest);
        assert!(matches!(mailbox.offer(delivery(1)), Offer::Queued));
        match mailbox.offer(delivery(2)) {
            Offer::Evicted(old) => assert_eq!(number(&old), 1),
            _ => panic!("expected eviction"),
        }
        assert_eq!(number(&next(&mailbox).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_drop_newest_and_error_policies() {
        let mailbox = Mailbox::new(1, OverflowPolicy::DropNewest);
        mailbox.offer(delivery(1));
        assert!(matches!(mailbox.offer(delivery(2)), Offer::Discarded(_)));
        assert_eq!(number(&next(&mailbox).await.unwrap()), 1);

        let mailbox = Mailbox::new(1, OverflowPolicy::Error);
        mailbox.offer(delivery(1));
        assert!(matches!(mailbox.offer(delivery(2)), Offer::Full(_)));
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let mailbox = Arc::new(Mailbox::new(1, OverflowPolicy::Block));
        mailbox.offer(delivery(1));

        let reader = Arc::clone(&mailbox);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            next(&reader).await
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(matches!(
            mailbox.offer_until(delivery(2), deadline).await,
            Offer::Queued
        ));
    }

    #[tokio::test]
    async fn test_block_gives_up_at_deadline() {
        let mailbox = Mailbox::new(1, OverflowPolicy::Block);
        mailbox.offer(delivery(1));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            mailbox.offer_until(delivery(2), deadline).await,
            Offer::Full(_)
        ));
    }

    #[tokio::test]
    async fn test_close_discards_and_wakes_reader() {
        let mailbox = Arc::new(Mailbox::new(4, OverflowPolicy::DropOldest));
        mailbox.offer(delivery(1));
        mailbox.offer(delivery(2));
        assert_eq!(mailbox.close(), 2);
        assert!(next(&mailbox).await.is_none());
        assert!(matches!(mailbox.offer(delivery(3)), Offer::Closed(_)));

        let waiting = Arc::new(Mailbox::new(1, OverflowPolicy::DropOldest));
        let reader = Arc::clone(&waiting);
        let task = tokio::spawn(async move { next(&reader).await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiting.close();
        assert!(task.await.unwrap());
        waiting.closed().await;
    }

    #[tokio::test]
    async fn test_dropped_reply_is_observable() {
        let mailbox = Mailbox::new(1, OverflowPolicy::DropNewest);
        mailbox.offer(delivery(1));
        let (second, rx) = Delivery::with_reply(Arc::new(Event::new(
            "t.x",
            json!({"n": 2}),
            EventMetadata::new(),
        )));
        match mailbox.offer(second) {
            Offer::Discarded(dropped) => drop(dropped),
            _ => panic!("expected discard"),
        }
        assert!(rx.await.is_err());
    }
}
