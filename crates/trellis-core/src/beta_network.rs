//! Beta network node and token structures.
//!
//! The beta network is a left-deep tree of nodes, each holding one variant
//! of [`BetaNodeKind`]: memories of partial matches, joins against alpha
//! memories, negative and NCC nodes for negation-as-failure, filter and
//! bind nodes for functional tests, and production (terminal) nodes.
//! All variants share a uniform activation interface driven by
//! [`crate::rete_network::ReteNetwork`]; there is no inheritance and no
//! trait-object dispatch.
//!
//! Every kind except `Join` owns tokens. Joins are stateless combinators:
//! they pair tokens from their parent memory with WMEs from their right
//! alpha memory and emit extended activations downstream.

use crate::conditions::{resolve_path, BindSpec, PatternValue, TestSpec, TripleCondition};
use crate::error::ProductionId;
use crate::types::{AlphaMemoryId, BetaNodeId, Bindings, TokenId, Wme, WmeId};
use trellis_types::Value;

/// The node variants of the beta network.
#[derive(Debug)]
pub enum BetaNodeKind {
    /// Stores partial matches; the left input of join nodes. The network
    /// root is a memory holding a single empty token.
    Memory { tokens: Vec<TokenId> },
    /// Pairs parent-memory tokens with right-input WMEs under the triple
    /// condition's consistency tests
    Join { alpha: AlphaMemoryId, condition: TripleCondition },
    /// Negation of a single triple: holds, per token, the set of WMEs that
    /// falsify it; a token is live downstream iff that set is empty
    Negative { alpha: AlphaMemoryId, condition: TripleCondition, tokens: Vec<TokenId> },
    /// Negated conjunction head: a token is live iff no subnetwork match
    /// extends it
    Ncc { partner: BetaNodeId, tokens: Vec<TokenId> },
    /// End of an NCC subnetwork: routes subnetwork matches to their owner
    /// token in the NCC head, buffering results that arrive before the
    /// owner exists
    NccPartner { ncc: BetaNodeId, chain_len: usize, buffer: Vec<TokenId> },
    /// Evaluates a pure predicate over the binding environment and passes
    /// the token through unchanged iff it holds
    Filter { test: TestSpec, tokens: Vec<TokenId> },
    /// Evaluates a pure expression and augments the binding environment
    Bind { bind: BindSpec, tokens: Vec<TokenId> },
    /// Terminal node: every token reaching it is a complete match
    Production { production: ProductionId, tokens: Vec<TokenId> },
}

/// A beta network node: one parent, ordered children, and a kind-specific
/// payload. Production refcounts govern node destruction when productions
/// are removed.
#[derive(Debug)]
pub struct BetaNode {
    pub id: BetaNodeId,
    pub parent: Option<BetaNodeId>,
    pub children: Vec<BetaNodeId>,
    pub kind: BetaNodeKind,
    pub production_refs: usize,
}

impl BetaNode {
    pub fn new(id: BetaNodeId, parent: Option<BetaNodeId>, kind: BetaNodeKind) -> Self {
        Self { id, parent, children: Vec::new(), kind, production_refs: 0 }
    }

    /// Node kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            BetaNodeKind::Memory { .. } => "memory",
            BetaNodeKind::Join { .. } => "join",
            BetaNodeKind::Negative { .. } => "negative",
            BetaNodeKind::Ncc { .. } => "ncc",
            BetaNodeKind::NccPartner { .. } => "ncc-partner",
            BetaNodeKind::Filter { .. } => "filter",
            BetaNodeKind::Bind { .. } => "bind",
            BetaNodeKind::Production { .. } => "production",
        }
    }

    /// The token list for token-owning kinds; `None` for joins and the
    /// partner buffer (partner results are owned by their NCC tokens).
    pub fn tokens(&self) -> Option<&Vec<TokenId>> {
        match &self.kind {
            BetaNodeKind::Memory { tokens }
            | BetaNodeKind::Negative { tokens, .. }
            | BetaNodeKind::Ncc { tokens, .. }
            | BetaNodeKind::Filter { tokens, .. }
            | BetaNodeKind::Bind { tokens, .. }
            | BetaNodeKind::Production { tokens, .. } => Some(tokens),
            BetaNodeKind::Join { .. } | BetaNodeKind::NccPartner { .. } => None,
        }
    }

    pub fn tokens_mut(&mut self) -> Option<&mut Vec<TokenId>> {
        match &mut self.kind {
            BetaNodeKind::Memory { tokens }
            | BetaNodeKind::Negative { tokens, .. }
            | BetaNodeKind::Ncc { tokens, .. }
            | BetaNodeKind::Filter { tokens, .. }
            | BetaNodeKind::Bind { tokens, .. }
            | BetaNodeKind::Production { tokens, .. } => Some(tokens),
            BetaNodeKind::Join { .. } | BetaNodeKind::NccPartner { .. } => None,
        }
    }
}

/// A partial match: one parent link and WME per level, plus the derived
/// binding environment. Negative, NCC, filter, and bind levels carry no WME.
///
/// `join_results` is used only on tokens owned by negative nodes (the WMEs
/// currently falsifying the token); `ncc_results` and `owner` only on NCC
/// head tokens and their subnetwork result tokens.
#[derive(Debug)]
pub struct Token {
    pub id: TokenId,
    pub parent: Option<TokenId>,
    pub wme: Option<WmeId>,
    pub node: BetaNodeId,
    pub children: Vec<TokenId>,
    pub binding: Bindings,
    pub join_results: Vec<WmeId>,
    pub ncc_results: Vec<TokenId>,
    pub owner: Option<TokenId>,
}

impl Token {
    pub fn new(
        id: TokenId,
        parent: Option<TokenId>,
        wme: Option<WmeId>,
        node: BetaNodeId,
        binding: Bindings,
    ) -> Self {
        Self {
            id,
            parent,
            wme,
            node,
            children: Vec::new(),
            binding,
            join_results: Vec::new(),
            ncc_results: Vec::new(),
            owner: None,
        }
    }
}

/// Test a (token, WME) pair against a triple condition and, on success,
/// return the extended binding environment.
///
/// The fact variable binds the WME's fact id on first occurrence and is an
/// equality constraint afterwards; likewise the value variable against the
/// path-resolved value. Constant values are re-checked even though the
/// alpha network already guarantees them for WMEs arriving from this
/// node's own memory.
pub(crate) fn join_extend(
    condition: &TripleCondition,
    binding: &Bindings,
    wme: &Wme,
) -> Option<Bindings> {
    let fact_ref = Value::FactRef(wme.fact);
    let mut extended: Option<Bindings> = None;
    match binding.get(&condition.id_var) {
        Some(bound) if *bound != fact_ref => return None,
        Some(_) => {}
        None => {
            let mut next = binding.clone();
            next.insert(condition.id_var.clone(), fact_ref);
            extended = Some(next);
        }
    }

    let resolved = resolve_path(&wme.value, &condition.path)?;
    match &condition.value {
        PatternValue::Constant(expected) => {
            if resolved != expected {
                return None;
            }
        }
        PatternValue::Variable(var) => {
            let current = extended.as_ref().unwrap_or(binding);
            match current.get(var) {
                Some(bound) if bound != resolved => return None,
                Some(_) => {}
                None => {
                    let mut next = extended.take().unwrap_or_else(|| binding.clone());
                    next.insert(var.clone(), resolved.clone());
                    extended = Some(next);
                }
            }
        }
        PatternValue::Wildcard => {}
    }

    Some(extended.unwrap_or_else(|| binding.clone()))
}

/// Test whether a WME is a witness against a negated triple under the
/// current bindings. Variables without a binding act as local wildcards and
/// never bind; nothing escapes a negation.
pub(crate) fn witness_matches(
    condition: &TripleCondition,
    binding: &Bindings,
    wme: &Wme,
) -> bool {
    if let Some(bound) = binding.get(&condition.id_var) {
        if *bound != Value::FactRef(wme.fact) {
            return false;
        }
    }
    let resolved = match resolve_path(&wme.value, &condition.path) {
        Some(value) => value,
        None => return false,
    };
    match &condition.value {
        PatternValue::Constant(expected) => resolved == expected,
        PatternValue::Variable(var) => match binding.get(var) {
            Some(bound) => bound == resolved,
            None => true,
        },
        PatternValue::Wildcard => true,
    }
}
