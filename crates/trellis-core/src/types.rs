//! Core data types shared across the Rete network modules: facts, working
//! memory elements, binding environments, and productions.

use crate::engine::Engine;
use crate::error::ProductionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use trellis_types::{AttrKey, FactId, Value};

/// Handle for nodes in the alpha discrimination tree.
pub type AlphaNodeId = u64;
/// Handle for alpha memories.
pub type AlphaMemoryId = u64;
/// Handle for beta network nodes.
pub type BetaNodeId = u64;
/// Handle for tokens in the beta network.
pub type TokenId = u64;
/// Handle for working memory elements.
pub type WmeId = u64;

/// A fact: an ordered sequence of positional values plus a map of named
/// attributes. Facts contain only ground [`Value`]s, so they can never hold
/// pattern variables; identity is the engine-assigned [`FactId`], and two
/// facts with equal contents inserted separately remain distinct.
///
/// The named map is ordered so the WME decomposition of a fact is
/// deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fact {
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl Fact {
    /// Create an empty fact
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named attribute
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Look up an attribute by key
    pub fn get(&self, key: &AttrKey) -> Option<&Value> {
        match key {
            AttrKey::Position(i) => self.positional.get(*i),
            AttrKey::Name(name) => self.named.get(name),
        }
    }

    /// Iterate all attributes in deterministic order: positions first,
    /// then named attributes in key order.
    pub fn attributes(&self) -> impl Iterator<Item = (AttrKey, &Value)> {
        let positional = self
            .positional
            .iter()
            .enumerate()
            .map(|(i, v)| (AttrKey::Position(i), v));
        let named = self.named.iter().map(|(k, v)| (AttrKey::Name(k.clone()), v));
        positional.chain(named)
    }

    /// Number of attributes this fact decomposes into
    pub fn attribute_count(&self) -> usize {
        self.positional.len() + self.named.len()
    }
}

/// A working memory element: one `(fact-id, attribute, value)` triple.
///
/// Nested object values are kept whole; path expressions navigate into them
/// at match time instead of exploding them into further WMEs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wme {
    pub fact: FactId,
    pub attr: AttrKey,
    pub value: Value,
}

impl fmt::Display for Wme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} ^{} {})", self.fact, self.attr, self.value)
    }
}

/// Binding environment: variable name to resolved value. Fact-binding
/// variables resolve to [`Value::FactRef`].
pub type Bindings = HashMap<String, Value>;

/// Variables generated by the compiler carry this prefix; user variables
/// may not use it, which keeps the two namespaces disjoint.
pub const GENERATED_PREFIX: &str = "__";

/// Signature of a user test predicate: receives the values of its declared
/// parameters in declaration order.
pub type TestFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<bool> + Send + Sync>;

/// Signature of a user bind computation.
pub type BindFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Signature of a production action. The engine passes itself as the
/// explicit context so actions can call back into the mutating API, plus
/// the values of the action's declared parameters.
pub type ActionFn =
    Arc<dyn Fn(&mut Engine, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// The right-hand side of a production: a function plus the variable names
/// it consumes, resolved from the match's binding environment at fire time.
#[derive(Clone)]
pub struct Action {
    pub params: Vec<String>,
    pub func: ActionFn,
}

impl Action {
    pub fn new<F>(params: &[&str], func: F) -> Self
    where
        F: Fn(&mut Engine, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            func: Arc::new(func),
        }
    }

    /// An action with no parameters and no effect, useful when only the
    /// conflict set is of interest.
    pub fn noop() -> Self {
        Self::new(&[], |_, _| Ok(None))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("params", &self.params).finish_non_exhaustive()
    }
}

/// A production: a condition expression paired with an action.
#[derive(Debug, Clone)]
pub struct Production {
    pub name: String,
    pub condition: crate::conditions::Condition,
    pub action: Action,
}

impl Production {
    pub fn new(
        name: impl Into<String>,
        condition: crate::conditions::Condition,
        action: Action,
    ) -> Self {
        Self { name: name.into(), condition, action }
    }
}

/// A currently valid complete match: one conflict-set entry.
///
/// `bindings` is the user-visible binding environment; compiler-generated
/// variables are filtered out. The `seq` field records conflict-set
/// insertion order, which is the engine's documented iteration order.
#[derive(Debug, Clone)]
pub struct Match {
    pub production: ProductionId,
    pub production_name: String,
    pub token: TokenId,
    pub seq: u64,
    pub bindings: Bindings,
}

impl Match {
    /// Look up a variable in the match's binding environment
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.bindings.get(variable)
    }
}
