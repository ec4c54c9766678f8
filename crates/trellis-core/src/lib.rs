//! Trellis: an incremental production-rule engine built on the Rete match
//! algorithm.
//!
//! The engine maintains the set of all ways a collection of productions can
//! be satisfied by a changing collection of facts, in time proportional to
//! the change in the match set rather than to the size of working memory.
//! Fact mutations decompose into WME triples, filter through a constant-test
//! alpha network, join in a left-deep beta network with partial-match
//! memories (including negation-as-failure and negated-conjunction nodes),
//! and land in a conflict set of complete matches ready to fire.

use tracing::{debug, instrument};

pub mod alpha_memory;
pub mod beta_network;
pub mod conditions;
pub mod conflict_set;
pub mod engine;
pub mod error;
pub mod fact_store;
pub mod rete_network;
/// Core data types shared across the network modules
pub mod types;

pub use conditions::{AttrPath, BindSpec, Condition, Pattern, PatternValue, TestSpec};
pub use conflict_set::ConflictSet;
pub use engine::{Engine, EngineConfig, EngineStats};
pub use error::{ProductionId, TrellisError, TrellisResult};
pub use fact_store::{FactStore, StoredFact};
pub use rete_network::{NetworkStats, ReteNetwork};
pub use types::{Action, Bindings, Fact, Match, Production, Wme};

pub use trellis_types::{AttrKey, FactId, Value};

/// Initialize the core engine components
#[instrument]
pub fn init() -> anyhow::Result<()> {
    debug!("Initializing Trellis core engine");
    Ok(())
}
