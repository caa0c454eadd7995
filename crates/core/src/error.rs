//! # Errors
//!
//! Error kinds surfaced by the bus, the agent lifecycle and the factory.
//!
//! Structural errors (`InvalidTopic`, `InvalidPattern`, `DuplicateId`,
//! `NotFound`, `BusClosed`) are returned to the caller that triggered them.
//! Handler-level errors (`Handler`, `DispatchTimeout`, `DeliveryDropped`,
//! `DeliveryRejected`) never reach the publisher as `Err`; they show up in
//! `_error` events and in aggregated publish results.

use std::time::Duration;

use crate::agent::AgentState;
use crate::bus::result::RejectReason;

/// Errors produced by Switchboard
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topic is empty, malformed or reserved
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Subscription pattern is malformed
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Agent id already issued during this process
    #[error("agent id '{0}' is already in use")]
    DuplicateId(String),

    /// No agent with this id in the directory
    #[error("agent '{0}' not found")]
    NotFound(String),

    /// Operation attempted after shutdown
    #[error("event bus is closed")]
    BusClosed,

    /// A handler returned an error or panicked
    #[error("handler for subscriber '{subscriber_id}' failed: {message}")]
    Handler {
        subscriber_id: String,
        message: String,
    },

    /// A handler did not finish within the configured timeout
    #[error("handler for subscriber '{subscriber_id}' timed out after {timeout:?}")]
    DispatchTimeout {
        subscriber_id: String,
        timeout: Duration,
    },

    /// The delivery was discarded before its handler ran
    #[error("delivery to subscriber '{subscriber_id}' was dropped before it ran")]
    DeliveryDropped { subscriber_id: String },

    /// Backpressure refused the delivery, so the handler never ran
    #[error("delivery to subscriber '{subscriber_id}' was rejected: {reason}")]
    DeliveryRejected {
        subscriber_id: String,
        reason: RejectReason,
    },

    /// Factory has no constructor registered under this name
    #[error("unknown agent type '{requested}' (available: {available})")]
    UnknownAgentType { requested: String, available: String },

    /// Lifecycle state machine rejected a transition
    #[error("agent '{agent_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        agent_id: String,
        from: AgentState,
        to: AgentState,
    },

    /// The registered constructor refused the configuration
    #[error("could not build agent of type '{agent_type}': {source}")]
    AgentBuild {
        agent_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// The agent's startup hook failed
    #[error("agent '{agent_id}' failed to start: {source}")]
    AgentStart {
        agent_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
