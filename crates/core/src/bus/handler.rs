//! # Event Handlers
//!
//! The capability the dispatcher invokes for each delivery.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::event::Event;

/// Receives events delivered to a subscription
///
/// The returned value is only observed by publishers using aggregated mode.
/// Returning `Err` never reaches the publisher: the dispatcher turns it into an
/// `_error` event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &Event) -> anyhow::Result<Option<Value>>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    async fn handle_event(&self, event: &Event) -> anyhow::Result<Option<Value>> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```rust,ignore
/// let handler = handler_fn(|event| async move {
///     Ok(Some(json!({ "seen": event.topic() })))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
