//! Conflict set: the multiset of currently valid complete matches.
//!
//! Entries are keyed by `(production, supporting token)`; each distinct
//! supporting token is a distinct match and nothing is deduplicated. The
//! exposed iteration order is insertion order, which is stable and
//! documented as this engine's conflict-set ordering.

use crate::error::ProductionId;
use crate::types::{Bindings, Match, TokenId, GENERATED_PREFIX};
use std::collections::{BTreeMap, HashMap};

/// One complete match held by the conflict set. `bindings` is the full
/// binding environment including compiler-generated variables; the
/// user-visible view is filtered when a [`Match`] is produced.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub production: ProductionId,
    pub production_name: String,
    pub token: TokenId,
    pub seq: u64,
    pub bindings: Bindings,
}

impl ConflictEntry {
    fn to_match(&self) -> Match {
        let bindings = self
            .bindings
            .iter()
            .filter(|(name, _)| !name.starts_with(GENERATED_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Match {
            production: self.production,
            production_name: self.production_name.clone(),
            token: self.token,
            seq: self.seq,
            bindings,
        }
    }
}

/// The conflict set, ordered by assertion sequence.
#[derive(Debug, Default)]
pub struct ConflictSet {
    entries: BTreeMap<u64, ConflictEntry>,
    index: HashMap<(ProductionId, TokenId), u64>,
    next_seq: u64,
    asserted: u64,
    retracted: u64,
}

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert a complete match
    pub fn insert(
        &mut self,
        production: ProductionId,
        production_name: String,
        token: TokenId,
        bindings: Bindings,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert((production, token), seq);
        self.entries.insert(
            seq,
            ConflictEntry { production, production_name, token, seq, bindings },
        );
        self.asserted += 1;
    }

    /// Retract the match supported by `token`, if present
    pub fn remove(&mut self, production: ProductionId, token: TokenId) -> bool {
        if let Some(seq) = self.index.remove(&(production, token)) {
            self.entries.remove(&seq);
            self.retracted += 1;
            true
        } else {
            false
        }
    }

    /// Look up the live entry for a previously produced [`Match`]. Returns
    /// `None` when the match has been retracted since (or the sequence
    /// number no longer agrees, meaning the entry was re-asserted).
    pub fn entry_for(&self, m: &Match) -> Option<&ConflictEntry> {
        let seq = self.index.get(&(m.production, m.token))?;
        if *seq != m.seq {
            return None;
        }
        self.entries.get(seq)
    }

    /// Enumerate current matches in insertion order
    pub fn iter(&self) -> impl Iterator<Item = Match> + '_ {
        self.entries.values().map(ConflictEntry::to_match)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total matches asserted over the engine's lifetime
    pub fn total_asserted(&self) -> u64 {
        self.asserted
    }

    /// Total matches retracted over the engine's lifetime
    pub fn total_retracted(&self) -> u64 {
        self.retracted
    }
}
