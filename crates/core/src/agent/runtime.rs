//! # Agent Runtime
//!
//! Binds one [`Agent`] to the bus: the lifecycle state, the live subscription
//! handles and the handler the dispatcher invokes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::capability::{Agent, AgentContext};
use super::lifecycle::{AgentState, AgentStatus};
use crate::bus::{Event, EventBus, EventHandler, SubscriptionHandle};
use crate::error::{Error, Result};

struct Tracking {
    state: AgentState,
    started_at: Option<DateTime<Utc>>,
    subscriptions: Vec<SubscriptionHandle>,
}

pub(crate) struct AgentCell {
    id: String,
    agent_type: String,
    capabilities: Vec<String>,
    context: AgentContext,
    tracking: Mutex<Tracking>,
    agent: tokio::sync::Mutex<Box<dyn Agent>>,
}

impl AgentCell {
    pub(crate) fn new(id: String, agent: Box<dyn Agent>, bus: &EventBus) -> Arc<Self> {
        Arc::new(Self {
            context: AgentContext::new(id.clone(), bus.downgrade()),
            agent_type: agent.agent_type().to_string(),
            capabilities: agent.capabilities(),
            id,
            tracking: Mutex::new(Tracking {
                state: AgentState::Created,
                started_at: None,
                subscriptions: Vec::new(),
            }),
            agent: tokio::sync::Mutex::new(agent),
        })
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> AgentState {
        self.tracking().state
    }

    /// Apply a lifecycle transition, returning the previous state
    pub(crate) fn transition(&self, to: AgentState) -> Result<AgentState> {
        let mut tracking = self.tracking();
        let from = tracking.state;
        if !from.can_transition(to) {
            return Err(Error::InvalidTransition {
                agent_id: self.id.clone(),
                from,
                to,
            });
        }
        tracking.state = to;
        if to == AgentState::Active && tracking.started_at.is_none() {
            tracking.started_at = Some(Utc::now());
        }
        tracing::debug!(agent_id = %self.id, %from, %to, "Agent state changed");
        Ok(from)
    }

    /// Subscribe every declared pattern, then move to `Registered`
    ///
    /// On failure the subscriptions made so far stay tracked so that
    /// [`AgentCell::release`] can remove them.
    pub(crate) fn register(self: &Arc<Self>, bus: &EventBus) -> Result<()> {
        for pattern in &self.capabilities {
            let handler = Arc::new(AgentHandler {
                cell: Arc::downgrade(self),
            });
            let handle = bus.subscribe(pattern, handler, &self.id)?;
            self.tracking().subscriptions.push(handle);
        }
        self.transition(AgentState::Registered)?;
        Ok(())
    }

    /// Run the startup hook and move to `Active`
    pub(crate) async fn start(&self) -> Result<()> {
        {
            let mut agent = self.agent.lock().await;
            agent
                .on_start(&self.context)
                .await
                .map_err(|source| Error::AgentStart {
                    agent_id: self.id.clone(),
                    source,
                })?;
        }
        self.transition(AgentState::Active)?;
        Ok(())
    }

    /// Remove every subscription and the pause gate
    pub(crate) fn release(&self, bus: &EventBus) {
        let subscriptions = std::mem::take(&mut self.tracking().subscriptions);
        for handle in &subscriptions {
            bus.unsubscribe(handle);
        }
        bus.forget_subscriber(&self.id);
    }

    /// Move to `Terminated`, unsubscribe, and run the stop hook if the agent
    /// had started
    pub(crate) async fn shut_down(&self, bus: &EventBus) -> Result<()> {
        let previous = self.transition(AgentState::Terminated)?;
        self.release(bus);
        if matches!(previous, AgentState::Active | AgentState::Paused) {
            self.agent.lock().await.on_stop(&self.context).await;
        }
        Ok(())
    }

    pub(crate) fn status(&self) -> AgentStatus {
        let tracking = self.tracking();
        AgentStatus {
            agent_id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            state: tracking.state,
            started_at: tracking.started_at,
            uptime_seconds: tracking
                .started_at
                .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0),
            subscriptions: tracking
                .subscriptions
                .iter()
                .map(|h| h.pattern().to_string())
                .collect(),
        }
    }
}

/// Shared view of a live agent, as returned by the factory
#[derive(Clone)]
pub struct AgentHandle {
    cell: Arc<AgentCell>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.cell.id)
            .field("agent_type", &self.cell.agent_type)
            .field("state", &self.state())
            .finish()
    }
}

impl AgentHandle {
    pub(crate) fn new(cell: Arc<AgentCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<AgentCell> {
        &self.cell
    }

    pub fn id(&self) -> &str {
        &self.cell.id
    }

    pub fn agent_type(&self) -> &str {
        &self.cell.agent_type
    }

    /// Patterns the agent declared at creation
    pub fn capabilities(&self) -> &[String] {
        &self.cell.capabilities
    }

    pub fn state(&self) -> AgentState {
        self.cell.state()
    }

    pub fn status(&self) -> AgentStatus {
        self.cell.status()
    }

    /// Context for publishing on this agent's behalf
    pub fn context(&self) -> &AgentContext {
        &self.cell.context
    }
}

/// Dispatcher-facing adapter; holds the agent weakly so the bus never keeps
/// a terminated agent alive
struct AgentHandler {
    cell: Weak<AgentCell>,
}

#[async_trait]
impl EventHandler for AgentHandler {
    async fn handle_event(&self, event: &Event) -> anyhow::Result<Option<Value>> {
        let Some(cell) = self.cell.upgrade() else {
            return Ok(None);
        };
        // Agents do not process their own messages.
        if event.source_agent_id() == Some(cell.id()) {
            return Ok(None);
        }

        let mut agent = cell.agent.lock().await;
        if cell.state().is_terminal() {
            return Ok(None);
        }
        match agent.handle_event(event, &cell.context).await {
            Ok(value) => Ok(value),
            Err(error) => {
                agent.on_error(&error, event, &cell.context).await;
                Err(error)
            }
        }
    }
}
