//! # Agents
//!
//! Agents are capabilities bound to the bus. Each one declares the topic
//! patterns it listens to and handles one event at a time.
//!
//! ## Modules
//!
//! - `capability` - The [`Agent`] trait and [`AgentContext`]
//! - `lifecycle` - [`AgentState`] machine and [`AgentStatus`] snapshots
//! - `runtime` - Subscription wiring between an agent and the bus

pub mod capability;
pub mod lifecycle;
mod runtime;

pub use capability::{Agent, AgentContext};
pub use lifecycle::{AgentState, AgentStatus};
pub use runtime::AgentHandle;
pub(crate) use runtime::AgentCell;
