//! The Rete network: builder, activation protocol, and removal plumbing.
//!
//! This module owns the alpha network, the beta node arena, the token and
//! WME arenas, the production registry, and the conflict set, and drives
//! all propagation between them:
//!
//! ```text
//! add_wme ──► alpha network ──► alpha memories ──► right activations
//!                                                      │
//!                    left activations ◄── joins ◄──────┘
//!                          │
//!                  memories / negative / NCC / filter / bind
//!                          │
//!                  production nodes ──► conflict set
//! ```
//!
//! Compiling a production walks its condition chains, reusing any existing
//! node with the same parent, right input, and local semantics; per-node
//! production refcounts govern teardown. Removal is symmetric: every token
//! derived from a retracted WME is traced through parent pointers and the
//! WME/token back-indexes and deleted downstream, with negative and NCC
//! nodes re-evaluating liveness as their witness sets drain.

use crate::alpha_memory::AlphaNetwork;
use crate::beta_network::{join_extend, witness_matches, BetaNode, BetaNodeKind, Token};
use crate::conditions::{compile, BindSpec, CompiledStep, TestSpec, TripleCondition};
use crate::conflict_set::ConflictSet;
use crate::error::{ProductionId, TrellisError, TrellisResult};
use crate::types::{
    Action, AlphaMemoryId, AlphaNodeId, BetaNodeId, Bindings, Production, TokenId, Wme, WmeId,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use trellis_types::{AttrKey, FactId, Value};

/// A WME plus the back-references that make O(1) removal possible: the
/// alpha memories containing it, the tokens built from it, and the
/// negative-node tokens it currently falsifies.
#[derive(Debug)]
pub(crate) struct WmeEntry {
    pub wme: Wme,
    pub alpha_memories: Vec<AlphaMemoryId>,
    pub tokens: Vec<TokenId>,
    pub negative_results: Vec<TokenId>,
}

/// Everything the network knows about one production: its action, its
/// terminal node and attachment points, and the nodes and alpha paths it
/// holds references on (in build order, for deepest-first release).
pub(crate) struct ProductionRecord {
    pub id: ProductionId,
    pub name: String,
    pub action: Action,
    pub pnode: BetaNodeId,
    pub pnode_parents: Vec<BetaNodeId>,
    pub beta_nodes: Vec<BetaNodeId>,
    pub alpha_paths: Vec<(Vec<AlphaNodeId>, AlphaMemoryId)>,
}

#[derive(Debug, Clone, Default)]
struct NetworkCounters {
    wmes_added: u64,
    wmes_removed: u64,
    tokens_created: u64,
    tokens_deleted: u64,
    activations: u64,
}

/// The Rete discrimination/join network.
pub struct ReteNetwork {
    alpha: AlphaNetwork,
    nodes: HashMap<BetaNodeId, BetaNode>,
    tokens: HashMap<TokenId, Token>,
    wmes: HashMap<WmeId, WmeEntry>,
    /// (fact, attribute) to WME handle; at most one WME per pair
    wmes_by_fact: HashMap<FactId, BTreeMap<AttrKey, WmeId>>,
    productions: HashMap<ProductionId, ProductionRecord>,
    conflict_set: ConflictSet,
    root: BetaNodeId,
    next_node_id: BetaNodeId,
    next_token_id: TokenId,
    next_wme_id: WmeId,
    next_production_id: ProductionId,
    strict_tests: bool,
    counters: NetworkCounters,
}

/// A lightweight copy of the data one activation step needs, extracted
/// before recursing so the node arena is free for mutation.
enum NodeAction {
    Memory { children: Vec<BetaNodeId> },
    Join { children: Vec<BetaNodeId>, alpha: AlphaMemoryId, condition: TripleCondition },
    Negative { children: Vec<BetaNodeId>, alpha: AlphaMemoryId, condition: TripleCondition },
    Ncc { children: Vec<BetaNodeId>, partner: BetaNodeId },
    NccPartner { ncc: BetaNodeId, chain_len: usize },
    Filter { children: Vec<BetaNodeId>, test: TestSpec },
    Bind { children: Vec<BetaNodeId>, bind: BindSpec },
    Production { production: ProductionId },
}

impl ReteNetwork {
    pub fn new(strict_tests: bool) -> Self {
        Self::with_capacity(strict_tests, 0)
    }

    /// Create a network pre-sized for an expected number of WMEs
    pub fn with_capacity(strict_tests: bool, capacity: usize) -> Self {
        let mut nodes = HashMap::new();
        let mut tokens = HashMap::with_capacity(capacity);
        let root = 0;
        let root_token = 0;
        nodes.insert(
            root,
            BetaNode::new(root, None, BetaNodeKind::Memory { tokens: vec![root_token] }),
        );
        tokens.insert(
            root_token,
            Token::new(root_token, None, None, root, Bindings::new()),
        );
        Self {
            alpha: AlphaNetwork::new(),
            nodes,
            tokens,
            wmes: HashMap::with_capacity(capacity),
            wmes_by_fact: HashMap::with_capacity(capacity / 4), // Estimate facts per WME
            productions: HashMap::new(),
            conflict_set: ConflictSet::new(),
            root,
            next_node_id: 1,
            next_token_id: 1,
            next_wme_id: 0,
            next_production_id: 0,
            strict_tests,
            counters: NetworkCounters::default(),
        }
    }

    pub fn conflict_set(&self) -> &ConflictSet {
        &self.conflict_set
    }

    pub(crate) fn production_record(&self, id: ProductionId) -> Option<&ProductionRecord> {
        self.productions.get(&id)
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    // ---------------------------------------------------------------------
    // Working memory propagation
    // ---------------------------------------------------------------------

    /// Insert a WME and propagate it through the network. Alpha memories
    /// are activated one at a time, each fully propagating before the
    /// next, which is what keeps joins over multiple memories containing
    /// the same WME from producing duplicate matches.
    #[instrument(skip(self, wme), fields(wme = %wme))]
    pub fn add_wme(&mut self, wme: Wme) -> TrellisResult<WmeId> {
        let fact = wme.fact;
        let attr = wme.attr.clone();
        let by_fact = self.wmes_by_fact.entry(fact).or_default();
        if by_fact.contains_key(&attr) {
            return Err(TrellisError::internal(format!(
                "duplicate WME for fact {fact} attribute {attr}"
            )));
        }
        let id = self.next_wme_id;
        self.next_wme_id += 1;
        by_fact.insert(attr, id);

        let memories = self.alpha.matching_memories(&wme);
        self.wmes.insert(
            id,
            WmeEntry {
                wme,
                alpha_memories: Vec::new(),
                tokens: Vec::new(),
                negative_results: Vec::new(),
            },
        );
        self.counters.wmes_added += 1;

        for memory in memories {
            self.alpha.memory_mut(memory).wmes.push(id);
            self.wmes.get_mut(&id).expect("wme just inserted").alpha_memories.push(memory);
            let successors = self.alpha.memory(memory).successors.clone();
            for successor in successors {
                self.right_activate(successor, id)?;
            }
        }
        Ok(id)
    }

    /// Retract the WME for one (fact, attribute) pair
    pub fn remove_wme(&mut self, fact: FactId, attr: &AttrKey) -> TrellisResult<()> {
        let wme_id = self
            .wmes_by_fact
            .get_mut(&fact)
            .and_then(|map| map.remove(attr))
            .ok_or_else(|| {
                TrellisError::fact_store(fact, "remove", format!("no WME for attribute {attr}"))
            })?;
        if self.wmes_by_fact.get(&fact).map(|m| m.is_empty()).unwrap_or(false) {
            self.wmes_by_fact.remove(&fact);
        }
        self.retract_wme(wme_id)
    }

    /// Retract all WMEs of a fact, in attribute order
    pub fn remove_fact(&mut self, fact: FactId) -> TrellisResult<()> {
        let wme_ids: Vec<WmeId> = self
            .wmes_by_fact
            .remove(&fact)
            .map(|map| map.into_values().collect())
            .unwrap_or_default();
        for wme_id in wme_ids {
            self.retract_wme(wme_id)?;
        }
        Ok(())
    }

    fn retract_wme(&mut self, wme_id: WmeId) -> TrellisResult<()> {
        let entry = self
            .wmes
            .remove(&wme_id)
            .ok_or_else(|| TrellisError::internal("WME missing during retraction"))?;
        self.counters.wmes_removed += 1;

        for memory in &entry.alpha_memories {
            self.alpha.memory_mut(*memory).remove_wme(wme_id);
        }

        // Every token built from this WME goes, along with its descendants
        for token_id in &entry.tokens {
            if self.tokens.contains_key(token_id) {
                self.delete_token_and_descendents(*token_id)?;
            }
        }

        // Tokens this WME was falsifying may come back to life
        for owner in &entry.negative_results {
            let revived = match self.tokens.get_mut(owner) {
                Some(token) => {
                    token.join_results.retain(|w| *w != wme_id);
                    if token.join_results.is_empty() {
                        Some((token.node, token.binding.clone()))
                    } else {
                        None
                    }
                }
                None => None,
            };
            if let Some((node, binding)) = revived {
                let children =
                    self.nodes.get(&node).map(|n| n.children.clone()).unwrap_or_default();
                for child in children {
                    self.left_activate(child, *owner, None, binding.clone())?;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Activation protocol
    // ---------------------------------------------------------------------

    fn make_token(
        &mut self,
        node: BetaNodeId,
        parent: Option<TokenId>,
        wme: Option<WmeId>,
        binding: Bindings,
    ) -> TokenId {
        let id = self.next_token_id;
        self.next_token_id += 1;
        if let Some(parent_id) = parent {
            self.tokens.get_mut(&parent_id).expect("parent token exists").children.push(id);
        }
        if let Some(wme_id) = wme {
            self.wmes.get_mut(&wme_id).expect("wme exists").tokens.push(id);
        }
        self.tokens.insert(id, Token::new(id, parent, wme, node, binding));
        if let Some(list) = self.nodes.get_mut(&node).and_then(|n| n.tokens_mut()) {
            list.push(id);
        }
        self.counters.tokens_created += 1;
        id
    }

    fn node_action(&self, node_id: BetaNodeId) -> NodeAction {
        let node = &self.nodes[&node_id];
        match &node.kind {
            BetaNodeKind::Memory { .. } => NodeAction::Memory { children: node.children.clone() },
            BetaNodeKind::Join { alpha, condition } => NodeAction::Join {
                children: node.children.clone(),
                alpha: *alpha,
                condition: condition.clone(),
            },
            BetaNodeKind::Negative { alpha, condition, .. } => NodeAction::Negative {
                children: node.children.clone(),
                alpha: *alpha,
                condition: condition.clone(),
            },
            BetaNodeKind::Ncc { partner, .. } => {
                NodeAction::Ncc { children: node.children.clone(), partner: *partner }
            }
            BetaNodeKind::NccPartner { ncc, chain_len, .. } => {
                NodeAction::NccPartner { ncc: *ncc, chain_len: *chain_len }
            }
            BetaNodeKind::Filter { test, .. } => {
                NodeAction::Filter { children: node.children.clone(), test: test.clone() }
            }
            BetaNodeKind::Bind { bind, .. } => {
                NodeAction::Bind { children: node.children.clone(), bind: bind.clone() }
            }
            BetaNodeKind::Production { production, .. } => {
                NodeAction::Production { production: *production }
            }
        }
    }

    /// Deliver a token (with the WME added at this level, if any) into a
    /// node. Every kind except join creates a token here; joins pair the
    /// incoming token with their right input instead.
    fn left_activate(
        &mut self,
        node_id: BetaNodeId,
        parent_token: TokenId,
        wme: Option<WmeId>,
        binding: Bindings,
    ) -> TrellisResult<()> {
        self.counters.activations += 1;
        match self.node_action(node_id) {
            NodeAction::Memory { children } => {
                let token = self.make_token(node_id, Some(parent_token), wme, binding.clone());
                for child in children {
                    self.left_activate(child, token, None, binding.clone())?;
                }
            }
            NodeAction::Join { children, alpha, condition } => {
                let wme_ids = self.alpha.memory(alpha).wmes.clone();
                for wme_id in wme_ids {
                    let candidate = self.wmes[&wme_id].wme.clone();
                    if let Some(extended) = join_extend(&condition, &binding, &candidate) {
                        for child in &children {
                            self.left_activate(*child, parent_token, Some(wme_id), extended.clone())?;
                        }
                    }
                }
            }
            NodeAction::Negative { children, alpha, condition } => {
                let token = self.make_token(node_id, Some(parent_token), wme, binding.clone());
                let wme_ids = self.alpha.memory(alpha).wmes.clone();
                let mut blocked = false;
                for wme_id in wme_ids {
                    let candidate = self.wmes[&wme_id].wme.clone();
                    if witness_matches(&condition, &binding, &candidate) {
                        self.tokens.get_mut(&token).expect("token").join_results.push(wme_id);
                        self.wmes
                            .get_mut(&wme_id)
                            .expect("wme")
                            .negative_results
                            .push(token);
                        blocked = true;
                    }
                }
                if !blocked {
                    for child in children {
                        self.left_activate(child, token, None, binding.clone())?;
                    }
                }
            }
            NodeAction::Ncc { children, partner } => {
                let token = self.make_token(node_id, Some(parent_token), wme, binding.clone());
                // Subnetwork results for this very activation wave were
                // buffered by the partner before this token existed.
                let buffered = match &mut self.nodes.get_mut(&partner).expect("partner").kind {
                    BetaNodeKind::NccPartner { buffer, .. } => std::mem::take(buffer),
                    _ => Vec::new(),
                };
                for result in &buffered {
                    if let Some(result_token) = self.tokens.get_mut(result) {
                        result_token.owner = Some(token);
                    }
                }
                let blocked = !buffered.is_empty();
                self.tokens.get_mut(&token).expect("token").ncc_results.extend(buffered);
                if !blocked {
                    for child in children {
                        self.left_activate(child, token, None, binding.clone())?;
                    }
                }
            }
            NodeAction::NccPartner { ncc, chain_len } => {
                let result = self.make_token(node_id, Some(parent_token), wme, binding);
                // Ascend one (token, wme) level per subnetwork condition to
                // find the pair the owner token in the NCC head was built on.
                let mut owner_token = parent_token;
                let mut owner_wme = wme;
                let mut ascended = true;
                for _ in 0..chain_len {
                    let current = self
                        .tokens
                        .get(&owner_token)
                        .ok_or_else(|| TrellisError::internal("token missing during NCC ascent"))?;
                    owner_wme = current.wme;
                    match current.parent {
                        Some(parent) => owner_token = parent,
                        None => {
                            ascended = false;
                            break;
                        }
                    }
                }
                let owner = if ascended {
                    let candidates = match &self.nodes[&ncc].kind {
                        BetaNodeKind::Ncc { tokens, .. } => tokens.clone(),
                        _ => Vec::new(),
                    };
                    candidates.into_iter().find(|candidate| {
                        let token = &self.tokens[candidate];
                        token.parent == Some(owner_token) && token.wme == owner_wme
                    })
                } else {
                    None
                };
                match owner {
                    Some(owner_id) => {
                        let was_live = self.tokens[&owner_id].ncc_results.is_empty();
                        self.tokens.get_mut(&owner_id).expect("owner").ncc_results.push(result);
                        self.tokens.get_mut(&result).expect("result").owner = Some(owner_id);
                        if was_live {
                            self.delete_descendants(owner_id)?;
                        }
                    }
                    None => {
                        if let Some(node) = self.nodes.get_mut(&node_id) {
                            if let BetaNodeKind::NccPartner { buffer, .. } = &mut node.kind {
                                buffer.push(result);
                            }
                        }
                    }
                }
            }
            NodeAction::Filter { children, test } => {
                let args = self.resolve_params(&test.params, &binding)?;
                match (test.func)(&args) {
                    Ok(true) => {
                        let token =
                            self.make_token(node_id, Some(parent_token), wme, binding.clone());
                        for child in children {
                            self.left_activate(child, token, None, binding.clone())?;
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        if self.strict_tests {
                            return Err(TrellisError::test_failure(err.to_string()));
                        }
                        debug!(error = %err, "test raised; treated as false");
                    }
                }
            }
            NodeAction::Bind { children, bind } => {
                let args = self.resolve_params(&bind.params, &binding)?;
                match (bind.func)(&args) {
                    Ok(value) => {
                        let mut extended = binding;
                        extended.insert(bind.variable.clone(), value);
                        let token =
                            self.make_token(node_id, Some(parent_token), wme, extended.clone());
                        for child in children {
                            self.left_activate(child, token, None, extended.clone())?;
                        }
                    }
                    Err(err) => {
                        if self.strict_tests {
                            return Err(TrellisError::test_failure(err.to_string()));
                        }
                        debug!(error = %err, "bind raised; token dropped");
                    }
                }
            }
            NodeAction::Production { production } => {
                let token = self.make_token(node_id, Some(parent_token), wme, binding.clone());
                let name = self
                    .productions
                    .get(&production)
                    .map(|record| record.name.clone())
                    .unwrap_or_default();
                self.conflict_set.insert(production, name, token, binding);
            }
        }
        Ok(())
    }

    /// A WME entered this node's right input
    fn right_activate(&mut self, node_id: BetaNodeId, wme_id: WmeId) -> TrellisResult<()> {
        self.counters.activations += 1;
        match self.node_action(node_id) {
            NodeAction::Join { children, condition, .. } => {
                let parent = self.nodes[&node_id]
                    .parent
                    .ok_or_else(|| TrellisError::internal("join node has no parent memory"))?;
                let parent_tokens =
                    self.nodes[&parent].tokens().cloned().unwrap_or_default();
                let candidate = self.wmes[&wme_id].wme.clone();
                for token_id in parent_tokens {
                    let binding = match self.tokens.get(&token_id) {
                        Some(token) => token.binding.clone(),
                        None => continue,
                    };
                    if let Some(extended) = join_extend(&condition, &binding, &candidate) {
                        for child in &children {
                            self.left_activate(*child, token_id, Some(wme_id), extended.clone())?;
                        }
                    }
                }
            }
            NodeAction::Negative { condition, .. } => {
                let own_tokens = match &self.nodes[&node_id].kind {
                    BetaNodeKind::Negative { tokens, .. } => tokens.clone(),
                    _ => Vec::new(),
                };
                let candidate = self.wmes[&wme_id].wme.clone();
                for token_id in own_tokens {
                    if !self.tokens.contains_key(&token_id) {
                        continue;
                    }
                    let binding = self.tokens[&token_id].binding.clone();
                    if witness_matches(&condition, &binding, &candidate) {
                        let was_live = self.tokens[&token_id].join_results.is_empty();
                        self.tokens
                            .get_mut(&token_id)
                            .expect("token")
                            .join_results
                            .push(wme_id);
                        self.wmes
                            .get_mut(&wme_id)
                            .expect("wme")
                            .negative_results
                            .push(token_id);
                        if was_live {
                            // A new witness retracts all downstream
                            // consequences of the token
                            self.delete_descendants(token_id)?;
                        }
                    }
                }
            }
            _ => {
                return Err(TrellisError::internal(
                    "only join and negative nodes take right activations",
                ));
            }
        }
        Ok(())
    }

    fn resolve_params(&self, params: &[String], binding: &Bindings) -> TrellisResult<Vec<Value>> {
        params
            .iter()
            .map(|param| {
                binding.get(param).cloned().ok_or_else(|| {
                    TrellisError::internal(format!(
                        "parameter '{param}' missing from binding environment"
                    ))
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Token removal
    // ---------------------------------------------------------------------

    fn delete_descendants(&mut self, token_id: TokenId) -> TrellisResult<()> {
        loop {
            let child = self.tokens.get(&token_id).and_then(|t| t.children.first().copied());
            match child {
                Some(child_id) => self.delete_token_and_descendents(child_id)?,
                None => return Ok(()),
            }
        }
    }

    fn delete_token_and_descendents(&mut self, token_id: TokenId) -> TrellisResult<()> {
        loop {
            let child = self.tokens.get(&token_id).and_then(|t| t.children.first().copied());
            match child {
                Some(child_id) => self.delete_token_and_descendents(child_id)?,
                None => break,
            }
        }
        let token = self
            .tokens
            .remove(&token_id)
            .ok_or_else(|| TrellisError::internal("token missing during deletion"))?;
        self.counters.tokens_deleted += 1;

        // Detach from the owning node; production tokens retract their
        // conflict-set entry.
        let mut production = None;
        if let Some(node) = self.nodes.get_mut(&token.node) {
            match &mut node.kind {
                BetaNodeKind::Memory { tokens }
                | BetaNodeKind::Negative { tokens, .. }
                | BetaNodeKind::Ncc { tokens, .. }
                | BetaNodeKind::Filter { tokens, .. }
                | BetaNodeKind::Bind { tokens, .. } => tokens.retain(|t| *t != token_id),
                BetaNodeKind::Production { production: id, tokens } => {
                    tokens.retain(|t| *t != token_id);
                    production = Some(*id);
                }
                BetaNodeKind::NccPartner { buffer, .. } => buffer.retain(|t| *t != token_id),
                BetaNodeKind::Join { .. } => {}
            }
        }
        if let Some(production) = production {
            self.conflict_set.remove(production, token_id);
        }

        if let Some(wme_id) = token.wme {
            if let Some(entry) = self.wmes.get_mut(&wme_id) {
                entry.tokens.retain(|t| *t != token_id);
            }
        }
        if let Some(parent) = token.parent {
            if let Some(parent_token) = self.tokens.get_mut(&parent) {
                parent_token.children.retain(|t| *t != token_id);
            }
        }

        // Negative-node tokens release their witnesses
        for wme_id in &token.join_results {
            if let Some(entry) = self.wmes.get_mut(wme_id) {
                entry.negative_results.retain(|t| *t != token_id);
            }
        }

        // NCC head tokens take their subnetwork result tokens with them
        for result_id in &token.ncc_results {
            if let Some(result) = self.tokens.remove(result_id) {
                self.counters.tokens_deleted += 1;
                if let Some(wme_id) = result.wme {
                    if let Some(entry) = self.wmes.get_mut(&wme_id) {
                        entry.tokens.retain(|t| *t != *result_id);
                    }
                }
                if let Some(parent) = result.parent {
                    if let Some(parent_token) = self.tokens.get_mut(&parent) {
                        parent_token.children.retain(|t| *t != *result_id);
                    }
                }
            }
        }

        // A subnetwork result token detaches from its owner; removing the
        // last result re-asserts the owner's downstream consequences.
        if let Some(owner_id) = token.owner {
            let revived = match self.tokens.get_mut(&owner_id) {
                Some(owner) => {
                    owner.ncc_results.retain(|t| *t != token_id);
                    if owner.ncc_results.is_empty() {
                        Some((owner.node, owner.binding.clone()))
                    } else {
                        None
                    }
                }
                None => None,
            };
            if let Some((ncc_node, binding)) = revived {
                let children =
                    self.nodes.get(&ncc_node).map(|n| n.children.clone()).unwrap_or_default();
                for child in children {
                    self.left_activate(child, owner_id, None, binding.clone())?;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Production compilation
    // ---------------------------------------------------------------------

    /// Compile a production into the network, sharing prefixes with
    /// existing productions. Validation happens before any mutation, so a
    /// compile error leaves the network unchanged.
    #[instrument(skip(self, production), fields(name = %production.name))]
    pub fn add_production(&mut self, production: Production) -> TrellisResult<ProductionId> {
        let Production { name, condition, action } = production;
        let compiled = compile(&condition).map_err(|e| e.with_production(&name))?;
        let visible = compiled.common_bound();
        for param in &action.params {
            if !visible.contains(param) {
                return Err(TrellisError::compile_variable(
                    param,
                    "action parameter is not bound by the condition",
                )
                .with_production(&name));
            }
        }

        let id = self.next_production_id;
        self.next_production_id += 1;

        let pnode = self.new_node(
            None,
            BetaNodeKind::Production { production: id, tokens: Vec::new() },
        );
        self.nodes.get_mut(&pnode).expect("pnode").production_refs = 1;
        self.productions.insert(
            id,
            ProductionRecord {
                id,
                name,
                action,
                pnode,
                pnode_parents: Vec::new(),
                beta_nodes: Vec::new(),
                alpha_paths: Vec::new(),
            },
        );

        let mut used_nodes = Vec::new();
        let mut alpha_paths = Vec::new();
        let mut tails = Vec::with_capacity(compiled.disjuncts.len());
        for steps in &compiled.disjuncts {
            let (tail, _levels) =
                self.build_chain(self.root, steps, &mut used_nodes, &mut alpha_paths)?;
            tails.push(tail);
        }
        // All disjunct paths share the one terminal node, so the conflict
        // set sees a single production with possibly multiple matches.
        for tail in &tails {
            self.nodes.get_mut(tail).expect("tail").children.push(pnode);
            if self.nodes[&pnode].parent.is_none() {
                self.nodes.get_mut(&pnode).expect("pnode").parent = Some(*tail);
            }
            self.update_new_node(pnode, *tail)?;
        }

        let record = self.productions.get_mut(&id).expect("record just inserted");
        record.pnode_parents = tails;
        record.beta_nodes = used_nodes;
        record.alpha_paths = alpha_paths;
        debug!(production = id, "production compiled into network");
        Ok(id)
    }

    /// Remove a production, releasing its references on shared nodes and
    /// destroying whatever it alone was keeping alive. Other productions'
    /// conflict-set entries are untouched.
    #[instrument(skip(self))]
    pub fn remove_production(&mut self, id: ProductionId) -> TrellisResult<()> {
        let record = self.productions.remove(&id).ok_or_else(|| {
            TrellisError::network("production", format!("unknown production {id}"))
        })?;

        for parent in &record.pnode_parents {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.retain(|c| *c != record.pnode);
            }
        }
        self.delete_beta_node(record.pnode)?;

        for node_id in record.beta_nodes.iter().rev() {
            let remaining = {
                let node = self.nodes.get_mut(node_id).ok_or_else(|| {
                    TrellisError::internal("node missing during production removal")
                })?;
                node.production_refs -= 1;
                node.production_refs
            };
            if remaining == 0 {
                self.delete_beta_node(*node_id)?;
            }
        }

        for (path, memory) in record.alpha_paths.iter().rev() {
            if let Some(removed) = self.alpha.release_path(path, *memory) {
                for wme_id in &removed.wmes {
                    if let Some(entry) = self.wmes.get_mut(wme_id) {
                        entry.alpha_memories.retain(|m| *m != removed.id);
                    }
                }
            }
        }
        debug!(production = id, "production removed from network");
        Ok(())
    }

    fn delete_beta_node(&mut self, node_id: BetaNodeId) -> TrellisResult<()> {
        let owned: Vec<TokenId> =
            self.nodes.get(&node_id).and_then(|n| n.tokens().cloned()).unwrap_or_default();
        for token_id in owned {
            if self.tokens.contains_key(&token_id) {
                self.delete_token_and_descendents(token_id)?;
            }
        }
        let buffered: Vec<TokenId> = match self.nodes.get(&node_id).map(|n| &n.kind) {
            Some(BetaNodeKind::NccPartner { buffer, .. }) => buffer.clone(),
            _ => Vec::new(),
        };
        for token_id in buffered {
            if self.tokens.contains_key(&token_id) {
                self.delete_token_and_descendents(token_id)?;
            }
        }

        let node = self
            .nodes
            .remove(&node_id)
            .ok_or_else(|| TrellisError::internal("node missing during deletion"))?;
        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != node_id);
            }
        }
        match &node.kind {
            BetaNodeKind::Join { alpha, .. } | BetaNodeKind::Negative { alpha, .. } => {
                self.alpha.memory_mut(*alpha).successors.retain(|s| *s != node_id);
            }
            _ => {}
        }
        debug!(node = node_id, kind = node.kind_name(), "destroyed beta node");
        Ok(())
    }

    fn new_node(&mut self, parent: Option<BetaNodeId>, kind: BetaNodeKind) -> BetaNodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(id, BetaNode::new(id, parent, kind));
        id
    }

    fn build_chain(
        &mut self,
        parent: BetaNodeId,
        steps: &[CompiledStep],
        used_nodes: &mut Vec<BetaNodeId>,
        alpha_paths: &mut Vec<(Vec<AlphaNodeId>, AlphaMemoryId)>,
    ) -> TrellisResult<(BetaNodeId, usize)> {
        let mut current = parent;
        let mut levels = 0usize;
        for step in steps {
            match step {
                CompiledStep::Triple(condition) => {
                    let memory = self.build_or_share_memory(current, used_nodes)?;
                    let alpha = self.build_or_share_alpha_memory(condition, alpha_paths);
                    current = self.build_or_share_join(memory, alpha, condition, used_nodes)?;
                    levels += 1;
                }
                CompiledStep::Negative(condition) => {
                    let alpha = self.build_or_share_alpha_memory(condition, alpha_paths);
                    current =
                        self.build_or_share_negative(current, alpha, condition, used_nodes)?;
                    levels += 1;
                }
                CompiledStep::Ncc(inner) => {
                    current = self.build_ncc(current, inner, used_nodes, alpha_paths)?;
                    levels += 1;
                }
                CompiledStep::Test(spec) => {
                    current = self.build_or_share_filter(current, spec, used_nodes)?;
                    levels += 1;
                }
                CompiledStep::Bind(spec) => {
                    current = self.build_or_share_bind(current, spec, used_nodes)?;
                    levels += 1;
                }
            }
        }
        Ok((current, levels))
    }

    fn share_node(&mut self, id: BetaNodeId, used_nodes: &mut Vec<BetaNodeId>) -> BetaNodeId {
        self.nodes.get_mut(&id).expect("node exists").production_refs += 1;
        used_nodes.push(id);
        id
    }

    fn build_or_share_memory(
        &mut self,
        parent: BetaNodeId,
        used_nodes: &mut Vec<BetaNodeId>,
    ) -> TrellisResult<BetaNodeId> {
        let existing = self.nodes[&parent]
            .children
            .iter()
            .copied()
            .find(|c| matches!(self.nodes[c].kind, BetaNodeKind::Memory { .. }));
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.new_node(Some(parent), BetaNodeKind::Memory { tokens: Vec::new() });
                self.nodes.get_mut(&parent).expect("parent").children.push(id);
                self.update_new_node(id, parent)?;
                id
            }
        };
        Ok(self.share_node(id, used_nodes))
    }

    fn build_or_share_alpha_memory(
        &mut self,
        condition: &TripleCondition,
        alpha_paths: &mut Vec<(Vec<AlphaNodeId>, AlphaMemoryId)>,
    ) -> AlphaMemoryId {
        let tests = AlphaNetwork::tests_for(condition);
        let path = self.alpha.build_path(&tests);
        if path.memory_created {
            // Back-fill the new memory from the WME arena, in id order
            let constraints = self.alpha.memory(path.memory).tests.clone();
            let mut matching: Vec<WmeId> = self
                .wmes
                .iter()
                .filter(|(_, entry)| constraints.iter().all(|t| t.passes(&entry.wme)))
                .map(|(id, _)| *id)
                .collect();
            matching.sort_unstable();
            for wme_id in matching {
                self.alpha.memory_mut(path.memory).wmes.push(wme_id);
                self.wmes
                    .get_mut(&wme_id)
                    .expect("wme")
                    .alpha_memories
                    .push(path.memory);
            }
        }
        let memory = path.memory;
        alpha_paths.push((path.nodes, memory));
        memory
    }

    fn build_or_share_join(
        &mut self,
        parent: BetaNodeId,
        alpha: AlphaMemoryId,
        condition: &TripleCondition,
        used_nodes: &mut Vec<BetaNodeId>,
    ) -> TrellisResult<BetaNodeId> {
        let existing = self.nodes[&parent].children.iter().copied().find(|c| {
            match &self.nodes[c].kind {
                BetaNodeKind::Join { alpha: a, condition: cond } => {
                    *a == alpha && cond == condition
                }
                _ => false,
            }
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.new_node(
                    Some(parent),
                    BetaNodeKind::Join { alpha, condition: condition.clone() },
                );
                self.nodes.get_mut(&parent).expect("parent").children.push(id);
                // Head insertion keeps descendants before ancestors in the
                // successor list; right-activating deepest-first is what
                // prevents duplicate tokens when one alpha memory feeds
                // several joins on the same path.
                self.alpha.memory_mut(alpha).successors.insert(0, id);
                // Joins own no state; their children are back-filled when
                // they are attached.
                id
            }
        };
        Ok(self.share_node(id, used_nodes))
    }

    fn build_or_share_negative(
        &mut self,
        parent: BetaNodeId,
        alpha: AlphaMemoryId,
        condition: &TripleCondition,
        used_nodes: &mut Vec<BetaNodeId>,
    ) -> TrellisResult<BetaNodeId> {
        let existing = self.nodes[&parent].children.iter().copied().find(|c| {
            match &self.nodes[c].kind {
                BetaNodeKind::Negative { alpha: a, condition: cond, .. } => {
                    *a == alpha && cond == condition
                }
                _ => false,
            }
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.new_node(
                    Some(parent),
                    BetaNodeKind::Negative {
                        alpha,
                        condition: condition.clone(),
                        tokens: Vec::new(),
                    },
                );
                self.nodes.get_mut(&parent).expect("parent").children.push(id);
                self.alpha.memory_mut(alpha).successors.insert(0, id);
                self.update_new_node(id, parent)?;
                id
            }
        };
        Ok(self.share_node(id, used_nodes))
    }

    fn build_or_share_filter(
        &mut self,
        parent: BetaNodeId,
        spec: &TestSpec,
        used_nodes: &mut Vec<BetaNodeId>,
    ) -> TrellisResult<BetaNodeId> {
        let existing = self.nodes[&parent].children.iter().copied().find(|c| {
            match &self.nodes[c].kind {
                BetaNodeKind::Filter { test, .. } => {
                    Arc::ptr_eq(&test.func, &spec.func) && test.params == spec.params
                }
                _ => false,
            }
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.new_node(
                    Some(parent),
                    BetaNodeKind::Filter { test: spec.clone(), tokens: Vec::new() },
                );
                self.nodes.get_mut(&parent).expect("parent").children.push(id);
                self.update_new_node(id, parent)?;
                id
            }
        };
        Ok(self.share_node(id, used_nodes))
    }

    fn build_or_share_bind(
        &mut self,
        parent: BetaNodeId,
        spec: &BindSpec,
        used_nodes: &mut Vec<BetaNodeId>,
    ) -> TrellisResult<BetaNodeId> {
        let existing = self.nodes[&parent].children.iter().copied().find(|c| {
            match &self.nodes[c].kind {
                BetaNodeKind::Bind { bind, .. } => {
                    Arc::ptr_eq(&bind.func, &spec.func)
                        && bind.variable == spec.variable
                        && bind.params == spec.params
                }
                _ => false,
            }
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.new_node(
                    Some(parent),
                    BetaNodeKind::Bind { bind: spec.clone(), tokens: Vec::new() },
                );
                self.nodes.get_mut(&parent).expect("parent").children.push(id);
                self.update_new_node(id, parent)?;
                id
            }
        };
        Ok(self.share_node(id, used_nodes))
    }

    fn build_ncc(
        &mut self,
        parent: BetaNodeId,
        inner: &[CompiledStep],
        used_nodes: &mut Vec<BetaNodeId>,
        alpha_paths: &mut Vec<(Vec<AlphaNodeId>, AlphaMemoryId)>,
    ) -> TrellisResult<BetaNodeId> {
        // The subnetwork is built first so its nodes precede the NCC head
        // in the parent's child order; results then reach the partner (and
        // get buffered) before the head sees each activation wave.
        let (tail, levels) = self.build_chain(parent, inner, used_nodes, alpha_paths)?;

        let existing = self.nodes[&parent].children.iter().copied().find(|c| {
            match &self.nodes[c].kind {
                BetaNodeKind::Ncc { partner, .. } => match self.nodes.get(partner) {
                    Some(partner_node) => match &partner_node.kind {
                        BetaNodeKind::NccPartner { chain_len, .. } => {
                            partner_node.parent == Some(tail) && *chain_len == levels
                        }
                        _ => false,
                    },
                    None => false,
                },
                _ => false,
            }
        });
        if let Some(ncc) = existing {
            let partner = match &self.nodes[&ncc].kind {
                BetaNodeKind::Ncc { partner, .. } => *partner,
                _ => unreachable!("checked above"),
            };
            self.share_node(ncc, used_nodes);
            self.share_node(partner, used_nodes);
            return Ok(ncc);
        }

        let ncc = self.new_node(Some(parent), BetaNodeKind::Ncc { partner: 0, tokens: Vec::new() });
        let partner = self.new_node(
            Some(tail),
            BetaNodeKind::NccPartner { ncc, chain_len: levels, buffer: Vec::new() },
        );
        if let BetaNodeKind::Ncc { partner: slot, .. } =
            &mut self.nodes.get_mut(&ncc).expect("ncc").kind
        {
            *slot = partner;
        }
        self.nodes.get_mut(&parent).expect("parent").children.push(ncc);
        self.nodes.get_mut(&tail).expect("tail").children.push(partner);
        self.share_node(ncc, used_nodes);
        self.share_node(partner, used_nodes);

        // The head populates before the partner so subnetwork matches find
        // their owners instead of buffering forever.
        self.update_new_node(ncc, parent)?;
        self.update_new_node(partner, tail)?;
        Ok(ncc)
    }

    /// Back-fill a newly attached node from the matches its parent already
    /// holds.
    fn update_new_node(&mut self, node: BetaNodeId, parent: BetaNodeId) -> TrellisResult<()> {
        enum Replay {
            Tokens(Vec<(TokenId, Bindings)>),
            Join { tokens: Vec<TokenId>, alpha: AlphaMemoryId, condition: TripleCondition },
        }
        let replay = match &self.nodes[&parent].kind {
            BetaNodeKind::Memory { tokens }
            | BetaNodeKind::Filter { tokens, .. }
            | BetaNodeKind::Bind { tokens, .. } => Replay::Tokens(
                tokens.iter().map(|t| (*t, self.tokens[t].binding.clone())).collect(),
            ),
            BetaNodeKind::Negative { tokens, .. } => Replay::Tokens(
                tokens
                    .iter()
                    .filter(|t| self.tokens[*t].join_results.is_empty())
                    .map(|t| (*t, self.tokens[t].binding.clone()))
                    .collect(),
            ),
            BetaNodeKind::Ncc { tokens, .. } => Replay::Tokens(
                tokens
                    .iter()
                    .filter(|t| self.tokens[*t].ncc_results.is_empty())
                    .map(|t| (*t, self.tokens[t].binding.clone()))
                    .collect(),
            ),
            BetaNodeKind::Join { alpha, condition } => {
                let grandparent = self.nodes[&parent]
                    .parent
                    .ok_or_else(|| TrellisError::internal("join node has no parent memory"))?;
                Replay::Join {
                    tokens: self.nodes[&grandparent].tokens().cloned().unwrap_or_default(),
                    alpha: *alpha,
                    condition: condition.clone(),
                }
            }
            BetaNodeKind::NccPartner { .. } | BetaNodeKind::Production { .. } => {
                return Err(TrellisError::internal(
                    "cannot attach nodes under terminal or partner nodes",
                ));
            }
        };
        match replay {
            Replay::Tokens(list) => {
                for (token_id, binding) in list {
                    self.left_activate(node, token_id, None, binding)?;
                }
            }
            Replay::Join { tokens, alpha, condition } => {
                let wme_ids = self.alpha.memory(alpha).wmes.clone();
                for token_id in tokens {
                    let binding = self.tokens[&token_id].binding.clone();
                    for wme_id in &wme_ids {
                        let candidate = self.wmes[wme_id].wme.clone();
                        if let Some(extended) = join_extend(&condition, &binding, &candidate) {
                            self.left_activate(node, token_id, Some(*wme_id), extended)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            alpha_node_count: self.alpha.node_count(),
            alpha_memory_count: self.alpha.memory_count(),
            beta_node_count: self.nodes.len(),
            token_count: self.tokens.len(),
            wme_count: self.wmes.len(),
            production_count: self.productions.len(),
            match_count: self.conflict_set.len(),
            wmes_added: self.counters.wmes_added,
            wmes_removed: self.counters.wmes_removed,
            tokens_created: self.counters.tokens_created,
            tokens_deleted: self.counters.tokens_deleted,
            activations: self.counters.activations,
        }
    }
}

impl fmt::Debug for ReteNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReteNetwork")
            .field("beta_nodes", &self.nodes.len())
            .field("tokens", &self.tokens.len())
            .field("wmes", &self.wmes.len())
            .field("productions", &self.productions.len())
            .field("matches", &self.conflict_set.len())
            .finish()
    }
}

/// Snapshot of network size and lifetime counters.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub alpha_node_count: usize,
    pub alpha_memory_count: usize,
    pub beta_node_count: usize,
    pub token_count: usize,
    pub wme_count: usize,
    pub production_count: usize,
    pub match_count: usize,
    pub wmes_added: u64,
    pub wmes_removed: u64,
    pub tokens_created: u64,
    pub tokens_deleted: u64,
    pub activations: u64,
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Rete Network Statistics ===")?;
        writeln!(f, "Alpha Nodes: {}", self.alpha_node_count)?;
        writeln!(f, "Alpha Memories: {}", self.alpha_memory_count)?;
        writeln!(f, "Beta Nodes: {}", self.beta_node_count)?;
        writeln!(f, "Tokens: {}", self.token_count)?;
        writeln!(f, "WMEs: {}", self.wme_count)?;
        writeln!(f, "Productions: {}", self.production_count)?;
        writeln!(f, "Matches: {}", self.match_count)?;
        writeln!(
            f,
            "Lifetime: {} WMEs added / {} removed, {} tokens created / {} deleted, {} activations",
            self.wmes_added,
            self.wmes_removed,
            self.tokens_created,
            self.tokens_deleted,
            self.activations
        )?;
        Ok(())
    }
}
