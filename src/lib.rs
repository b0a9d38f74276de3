//! Reaction aggregation engine.
//!
//! Records who reacted to what with which reaction type, and keeps weighted
//! per-reactant counts consistent under concurrent writers. The reaction
//! store is the source of truth; aggregates are a cache that
//! [`Engine::recount`](engine::Engine::recount) can always rebuild.

pub mod aggregates;
pub mod config;
pub mod consts;
mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod reactions;
pub mod registry;

pub use error::{Error, Result};
