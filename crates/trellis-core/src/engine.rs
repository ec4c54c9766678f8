//! Engine facade: owns working memory, the Rete network, and the conflict
//! set, and orchestrates insert/remove propagation.
//!
//! The engine is single-threaded and not reentrant: every operation takes
//! `&mut self` and fully propagates before returning. Actions invoked from
//! [`Engine::fire`] receive the engine as an explicit context parameter and
//! may call back into the mutating API; each such mutation propagates
//! synchronously before control returns to the action.

use crate::conflict_set::ConflictSet;
use crate::error::{ProductionId, TrellisError, TrellisResult};
use crate::fact_store::{FactStore, StoredFact};
use crate::rete_network::{NetworkStats, ReteNetwork};
use crate::types::{Fact, Match, Production, Wme};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument};
use trellis_types::{AttrKey, FactId, Value};

/// Engine construction options.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// When true, a test or bind function that returns an error surfaces
    /// as [`TrellisError::Test`] instead of being treated as a failed
    /// test.
    pub strict_tests: bool,
    /// Expected working-memory size; pre-sizes the WME and token arenas
    pub capacity: usize,
}

/// The production-rule engine.
pub struct Engine {
    facts: FactStore,
    network: ReteNetwork,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            facts: FactStore::new(),
            network: ReteNetwork::with_capacity(config.strict_tests, config.capacity),
        }
    }

    /// Create an engine pre-sized for an expected number of WMEs
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(EngineConfig { capacity, ..EngineConfig::default() })
    }

    /// Insert a fact into working memory and propagate its WMEs. Returns
    /// the assigned fact id.
    #[instrument(skip(self, fact))]
    pub fn add_fact(&mut self, fact: Fact) -> TrellisResult<FactId> {
        let id = self.facts.insert(fact);
        let attrs: Vec<(AttrKey, Value)> = self
            .facts
            .get(id)
            .expect("fact just inserted")
            .attributes()
            .map(|(attr, value)| (attr, value.clone()))
            .collect();
        for (attr, value) in attrs {
            self.network.add_wme(Wme { fact: id, attr, value })?;
        }
        Ok(id)
    }

    /// Remove a fact, retracting all matches that depended on it
    #[instrument(skip(self))]
    pub fn remove_fact(&mut self, id: FactId) -> TrellisResult<()> {
        self.facts.remove(id)?;
        self.network.remove_fact(id)
    }

    /// Replace a fact's contents under the same id. Matches depending on
    /// retracted WMEs are withdrawn before matches for new WMEs are
    /// asserted; only attributes whose values actually changed are
    /// propagated.
    #[instrument(skip(self, fact))]
    pub fn update_fact(&mut self, id: FactId, fact: Fact) -> TrellisResult<()> {
        let old = self.facts.replace(id, fact)?;
        let old_attrs: BTreeMap<AttrKey, Value> =
            old.attributes().map(|(attr, value)| (attr, value.clone())).collect();
        let new_attrs: BTreeMap<AttrKey, Value> = self
            .facts
            .get(id)
            .expect("fact present")
            .attributes()
            .map(|(attr, value)| (attr, value.clone()))
            .collect();

        for (attr, value) in &old_attrs {
            let keep = new_attrs.get(attr).map(|nv| nv == value).unwrap_or(false);
            if !keep {
                self.network.remove_wme(id, attr)?;
            }
        }
        for (attr, value) in &new_attrs {
            let keep = old_attrs.get(attr).map(|ov| ov == value).unwrap_or(false);
            if !keep {
                self.network.add_wme(Wme { fact: id, attr: attr.clone(), value: value.clone() })?;
            }
        }
        debug!(fact_id = id, "fact updated");
        Ok(())
    }

    /// Look up a fact's current contents
    pub fn get_fact(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(id)
    }

    /// Look up a fact with its insertion metadata
    pub fn fact_entry(&self, id: FactId) -> Option<&StoredFact> {
        self.facts.entry(id)
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Compile a production into the network. Existing facts are matched
    /// immediately; compile errors leave the network unchanged.
    pub fn add_production(&mut self, production: Production) -> TrellisResult<ProductionId> {
        self.network.add_production(production)
    }

    /// Remove a production without perturbing other productions' matches
    pub fn remove_production(&mut self, id: ProductionId) -> TrellisResult<()> {
        self.network.remove_production(id)
    }

    pub fn production_count(&self) -> usize {
        self.network.production_count()
    }

    /// Enumerate the current conflict set in insertion order
    pub fn matches(&self) -> impl Iterator<Item = Match> + '_ {
        self.network.conflict_set().iter()
    }

    pub fn match_count(&self) -> usize {
        self.network.conflict_set().len()
    }

    /// Fire a match: invoke its production's action with arguments
    /// resolved from the binding environment. Fails with a stale-match
    /// error when the entry has been retracted since it was enumerated.
    ///
    /// Mutations the action performs propagate before it returns; if the
    /// action then errors, everything it already did stays committed.
    #[instrument(skip(self, m), fields(production = %m.production_name))]
    pub fn fire(&mut self, m: &Match) -> TrellisResult<Option<Value>> {
        let entry = self.network.conflict_set().entry_for(m).ok_or_else(|| {
            TrellisError::stale_match(
                m.production,
                format!("match for '{}' is no longer valid", m.production_name),
            )
        })?;
        let bindings = entry.bindings.clone();
        let record = self
            .network
            .production_record(m.production)
            .ok_or_else(|| TrellisError::stale_match(m.production, "production no longer exists"))?;
        let action = record.action.clone();
        let name = record.name.clone();
        let args: Vec<Value> = action
            .params
            .iter()
            .map(|param| {
                bindings.get(param).cloned().ok_or_else(|| {
                    TrellisError::internal(format!(
                        "action parameter '{param}' missing from binding environment"
                    ))
                })
            })
            .collect::<TrellisResult<_>>()?;

        (action.func)(self, &args).map_err(|err| TrellisError::action(&name, err.to_string()))
    }

    /// Direct access to the conflict set
    pub fn conflict_set(&self) -> &ConflictSet {
        self.network.conflict_set()
    }

    /// Network-level size and lifetime counters
    pub fn network_stats(&self) -> NetworkStats {
        self.network.stats()
    }

    /// Engine-level statistics
    pub fn stats(&self) -> EngineStats {
        let network = self.network.stats();
        EngineStats {
            fact_count: self.facts.len(),
            production_count: network.production_count,
            match_count: network.match_count,
            node_count: network.alpha_node_count + network.beta_node_count,
            wme_count: network.wme_count,
            matches_asserted: self.network.conflict_set().total_asserted(),
            matches_retracted: self.network.conflict_set().total_retracted(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("facts", &self.facts.len())
            .field("productions", &self.network.production_count())
            .field("matches", &self.network.conflict_set().len())
            .finish()
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub fact_count: usize,
    pub production_count: usize,
    pub match_count: usize,
    pub node_count: usize,
    pub wme_count: usize,
    pub matches_asserted: u64,
    pub matches_retracted: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Statistics ===")?;
        writeln!(f, "Facts: {}", self.fact_count)?;
        writeln!(f, "Productions: {}", self.production_count)?;
        writeln!(f, "Matches: {}", self.match_count)?;
        writeln!(f, "Network Nodes: {}", self.node_count)?;
        writeln!(f, "WMEs: {}", self.wme_count)?;
        writeln!(
            f,
            "Lifetime: {} matches asserted / {} retracted",
            self.matches_asserted, self.matches_retracted
        )?;
        Ok(())
    }
}
