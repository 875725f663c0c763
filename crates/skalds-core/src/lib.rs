//! Core of the Skalds system controller.
//!
//! Synthesizes an authoritative in-memory view of fleet and task liveness
//! from the cache and the store, assigns eligible tasks to eligible
//! executors, reconciles heartbeat observations onto lifecycle transitions,
//! and exposes the live view to the HTTP layer.

pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod monitor;
pub mod reconcile;
pub mod runtime;
pub mod state;
