//! Shared value model for the Trellis rules engine.
//!
//! This crate holds the ground data types that cross the boundary between
//! the engine core and its callers: the [`Value`] sum type, attribute keys,
//! and the id aliases used for facts throughout the workspace.

/// Core value and identifier types for the Trellis engine
pub mod types;

pub use types::{AttrKey, FactId, Value};
