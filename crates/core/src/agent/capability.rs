//! # Agent Capability
//!
//! The contract every concrete agent implements, and the context it gets to
//! talk back to the bus.

use async_trait::async_trait;
use serde_json::Value;

use crate::bus::event_bus::metadata_from;
use crate::bus::{Event, EventMetadata, PublishOptions, PublishResult, WeakEventBus};
use crate::error::{Error, Result};

/// An autonomous participant on the bus
///
/// Agents never call each other. They declare the topic patterns they care
/// about through [`Agent::capabilities`] and react to events in
/// [`Agent::handle_event`]. An agent handles at most one event at a time, so
/// `&mut self` state needs no extra locking.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Registered type name (e.g. `"architect"`)
    fn agent_type(&self) -> &str;

    /// Topic patterns to subscribe to
    fn capabilities(&self) -> Vec<String>;

    /// React to a delivered event
    ///
    /// The returned value is surfaced to aggregated publishers. Errors are
    /// passed to [`Agent::on_error`] and reported on the `_error` topic.
    async fn handle_event(
        &mut self,
        event: &Event,
        ctx: &AgentContext,
    ) -> anyhow::Result<Option<Value>>;

    /// Runs after subscriptions exist; failure aborts creation
    async fn on_start(&mut self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once when the agent is terminated
    async fn on_stop(&mut self, _ctx: &AgentContext) {}

    /// Runs when `handle_event` fails, before the failure is reported
    async fn on_error(&mut self, error: &anyhow::Error, event: &Event, ctx: &AgentContext) {
        tracing::warn!(
            agent_id = %ctx.agent_id(),
            topic = %event.topic(),
            "Agent failed to handle event: {:#}",
            error
        );
    }
}

/// Handle an agent uses to publish as itself
#[derive(Clone)]
pub struct AgentContext {
    agent_id: String,
    bus: WeakEventBus,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    pub(crate) fn new(agent_id: impl Into<String>, bus: WeakEventBus) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Publish with this agent stamped as the source
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishResult> {
        self.publish_with(topic, payload, PublishOptions::default())
            .await
    }

    /// Publish with options; the source is always this agent
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        let bus = self.bus.upgrade().ok_or(Error::BusClosed)?;
        let metadata = metadata_from(&self.agent_id, options.metadata);
        let options = PublishOptions {
            metadata: Some(metadata),
            ..options
        };
        bus.publish_with(topic, payload, options).await
    }

    /// Publish a reply correlated with `request`
    pub async fn reply(&self, request: &Event, topic: &str, payload: Value) -> Result<PublishResult> {
        let correlation = request
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| request.id().to_string());
        let options = PublishOptions::new()
            .with_metadata(EventMetadata::new().with_correlation_id(correlation));
        self.publish_with(topic, payload, options).await
    }
}
