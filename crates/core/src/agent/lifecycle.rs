//! # Agent Lifecycle
//!
//! ```text
//! Created ──▶ Registered ──▶ Active ◀──▶ Paused
//!    │            │            │           │
//!    └────────────┴────────────┴───────────┴──▶ Terminated
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Constructed, no subscriptions yet
    Created,
    /// Every declared pattern has a live subscription
    Registered,
    /// Startup hook completed; receiving events
    Active,
    /// Subscriptions kept, deliveries held in queue
    Paused,
    /// Final: unsubscribed and removed from the directory
    Terminated,
}

impl AgentState {
    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Created, Registered)
                | (Registered, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Created | Registered | Active | Paused, Terminated)
        )
    }

    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        self == AgentState::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Registered => "registered",
            AgentState::Active => "active",
            AgentState::Paused => "paused",
            AgentState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_type: String,
    pub state: AgentState,
    /// When the agent became active
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<f64>,
    /// Patterns with a live subscription
    pub subscriptions: Vec<String>,
}

impl AgentStatus {
    /// Whether the agent is currently handling events
    pub fn is_running(&self) -> bool {
        self.state == AgentState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        assert!(AgentState::Created.can_transition(AgentState::Registered));
        assert!(AgentState::Registered.can_transition(AgentState::Active));
        assert!(AgentState::Active.can_transition(AgentState::Paused));
        assert!(AgentState::Paused.can_transition(AgentState::Active));
        assert!(AgentState::Paused.can_transition(AgentState::Terminated));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!AgentState::Created.can_transition(AgentState::Active));
        assert!(!AgentState::Registered.can_transition(AgentState::Paused));
        assert!(!AgentState::Active.can_transition(AgentState::Registered));
        assert!(!AgentState::Active.can_transition(AgentState::Active));
        for to in [
            AgentState::Created,
            AgentState::Registered,
            AgentState::Active,
            AgentState::Paused,
            AgentState::Terminated,
        ] {
            assert!(!AgentState::Terminated.can_transition(to));
        }
        assert!(AgentState::Terminated.is_terminal());
    }

    #[test]
    fn test_display_and_serde_agree() {
        assert_eq!(AgentState::Paused.to_string(), "paused");
        assert_eq!(
            serde_json::to_value(AgentState::Terminated).unwrap(),
            serde_json::json!("terminated")
        );
    }
}
