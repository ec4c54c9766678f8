//! Working memory: canonical storage of facts with stable identifiers.
//!
//! Fact ids are assigned monotonically on insertion and never reused within
//! a session, so two facts with equal contents inserted separately remain
//! distinct. The store knows nothing about the match network; the engine
//! decomposes stored facts into WME triples and drives propagation.

use crate::error::{TrellisError, TrellisResult};
use crate::types::Fact;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;
use trellis_types::FactId;

/// A fact as held in working memory, with its assigned id and insertion
/// timestamp. The timestamp is diagnostic only and never used for matching.
#[derive(Debug, Clone)]
pub struct StoredFact {
    pub id: FactId,
    pub inserted_at: DateTime<Utc>,
    pub fact: Fact,
}

/// The working memory fact store.
#[derive(Debug, Default)]
pub struct FactStore {
    facts: BTreeMap<FactId, StoredFact>,
    next_id: FactId,
    inserted: u64,
    removed: u64,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fact and assign its id
    pub fn insert(&mut self, fact: Fact) -> FactId {
        let id = self.next_id;
        self.next_id += 1;
        self.facts.insert(id, StoredFact { id, inserted_at: Utc::now(), fact });
        self.inserted += 1;
        debug!(fact_id = id, "fact inserted");
        id
    }

    /// Remove a fact, returning its contents
    pub fn remove(&mut self, id: FactId) -> TrellisResult<Fact> {
        match self.facts.remove(&id) {
            Some(stored) => {
                self.removed += 1;
                debug!(fact_id = id, "fact removed");
                Ok(stored.fact)
            }
            None => Err(TrellisError::fact_store(id, "remove", "unknown fact id")),
        }
    }

    /// Replace a fact's contents in place, keeping its id. Returns the
    /// previous contents so the caller can diff WME decompositions.
    pub fn replace(&mut self, id: FactId, fact: Fact) -> TrellisResult<Fact> {
        match self.facts.get_mut(&id) {
            Some(stored) => Ok(std::mem::replace(&mut stored.fact, fact)),
            None => Err(TrellisError::fact_store(id, "update", "unknown fact id")),
        }
    }

    pub fn get(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id).map(|stored| &stored.fact)
    }

    pub fn entry(&self, id: FactId) -> Option<&StoredFact> {
        self.facts.get(&id)
    }

    pub fn contains(&self, id: FactId) -> bool {
        self.facts.contains_key(&id)
    }

    /// Iterate stored facts in id order
    pub fn iter(&self) -> impl Iterator<Item = &StoredFact> {
        self.facts.values()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Total facts inserted over the store's lifetime
    pub fn total_inserted(&self) -> u64 {
        self.inserted
    }

    /// Total facts removed over the store's lifetime
    pub fn total_removed(&self) -> u64 {
        self.removed
    }
}
