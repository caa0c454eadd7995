//! # Switchboard Core
//!
//! Event routing and agent lifecycle for the Switchboard multi-agent system.
//! Agents never call each other; they publish and subscribe to events on a
//! shared, explicitly constructed [`bus::EventBus`].
//!
//! ## Architecture
//!
//! - `bus/` - Topic matching, per-subscriber queues, dispatch and `_error` reporting
//! - `agent/` - The [`agent::Agent`] capability and its lifecycle state machine
//! - `factory/` - Agent construction, id assignment and the live-agent directory
//! - `error` - Crate-wide [`Error`] and [`Result`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchboard_core::bus::{handler_fn, BusConfig, EventBus};
//!
//! let bus = EventBus::new(BusConfig::default())?;
//! bus.subscribe(
//!     "user.*",
//!     handler_fn(|event| async move { Ok(Some(json!({"seen": event.topic()}))) }),
//!     "logger",
//! )?;
//! bus.publish("user.request", json!({"data": "hello"})).await?;
//! bus.shutdown(Duration::from_secs(5)).await;
//! ```

pub mod agent;
pub mod bus;
pub mod error;
pub mod factory;

pub use error::{Error, Result};
