//! Pattern language and condition compilation.
//!
//! A production's left-hand side is an algebraic [`Condition`]: positive
//! fact patterns combined with AND/OR/NOT plus functional tests and binds.
//! Compilation normalizes the expression to disjunctive normal form,
//! expands each fact pattern into one triple condition per attribute slot
//! (all slots sharing the pattern's fact-binding variable), and validates
//! lexical variable scoping. The resulting linear chains are what the
//! network builder turns into beta nodes.

use crate::error::{TrellisError, TrellisResult};
use crate::types::{BindFn, TestFn, GENERATED_PREFIX};
use std::collections::HashSet;
use std::fmt;
use trellis_types::{AttrKey, Value};

/// An attribute key plus an optional path into nested object values.
///
/// The textual form `name__sub1__sub2` means: look up `name` on the fact,
/// then index the object value by `sub1`, then `sub2`. The final segment's
/// value is what the constraint applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrPath {
    pub key: AttrKey,
    pub path: Vec<String>,
}

impl AttrPath {
    /// Parse a named attribute, splitting `__` path segments
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.split("__");
        let key = AttrKey::Name(parts.next().unwrap_or_default().to_string());
        Self { key, path: parts.map(str::to_string).collect() }
    }

    /// A positional attribute (paths never apply to positions directly)
    pub fn position(index: usize) -> Self {
        Self { key: AttrKey::Position(index), path: Vec::new() }
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for seg in &self.path {
            write!(f, "__{}", seg)?;
        }
        Ok(())
    }
}

/// Navigate a value through a path of object keys. Returns `None` when a
/// segment is missing or an intermediate value is not an object.
pub(crate) fn resolve_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// One slot of a fact pattern: a constant constraint, a variable, or a
/// wildcard (the attribute must exist but its value is unconstrained).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternValue {
    Constant(Value),
    Variable(String),
    Wildcard,
}

/// A positive fact pattern: a template of attribute constraints, optionally
/// prefixed by a fact-binding variable that binds the matched fact's id.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    pub binding: Option<String>,
    pub slots: Vec<(AttrPath, PatternValue)>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the matched fact's id to `variable`
    pub fn bind(mut self, variable: impl Into<String>) -> Self {
        self.binding = Some(variable.into());
        self
    }

    /// Constrain a named attribute (path syntax allowed) to a constant
    pub fn eq(mut self, attr: &str, value: impl Into<Value>) -> Self {
        self.slots.push((AttrPath::parse(attr), PatternValue::Constant(value.into())));
        self
    }

    /// Bind a named attribute (path syntax allowed) to a variable
    pub fn var(mut self, attr: &str, variable: impl Into<String>) -> Self {
        self.slots.push((AttrPath::parse(attr), PatternValue::Variable(variable.into())));
        self
    }

    /// Require a named attribute to exist without constraining its value
    pub fn wildcard(mut self, attr: &str) -> Self {
        self.slots.push((AttrPath::parse(attr), PatternValue::Wildcard));
        self
    }

    /// Constrain a positional attribute to a constant
    pub fn pos_eq(mut self, index: usize, value: impl Into<Value>) -> Self {
        self.slots.push((AttrPath::position(index), PatternValue::Constant(value.into())));
        self
    }

    /// Bind a positional attribute to a variable
    pub fn pos_var(mut self, index: usize, variable: impl Into<String>) -> Self {
        self.slots.push((AttrPath::position(index), PatternValue::Variable(variable.into())));
        self
    }
}

/// A pure predicate over previously bound variables.
#[derive(Clone)]
pub struct TestSpec {
    pub params: Vec<String>,
    pub func: TestFn,
}

impl fmt::Debug for TestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSpec").field("params", &self.params).finish_non_exhaustive()
    }
}

/// A pure computation assigning a new variable from previously bound ones.
#[derive(Clone)]
pub struct BindSpec {
    pub variable: String,
    pub params: Vec<String>,
    pub func: BindFn,
}

impl fmt::Debug for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindSpec")
            .field("variable", &self.variable)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// The condition algebra forming a production's left-hand side.
#[derive(Debug, Clone)]
pub enum Condition {
    Pattern(Pattern),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Test(TestSpec),
    Bind(BindSpec),
}

impl Condition {
    /// Conjunction of conditions
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    /// Disjunction of conditions; eliminated at compile time by DNF
    /// distribution
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    /// Negation-as-failure of a condition
    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// A functional test over previously bound variables
    pub fn test<F>(params: &[&str], func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Condition::Test(TestSpec {
            params: params.iter().map(|p| p.to_string()).collect(),
            func: std::sync::Arc::new(func),
        })
    }

    /// A functional bind assigning `variable` from previously bound ones
    pub fn bind<F>(variable: &str, params: &[&str], func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Condition::Bind(BindSpec {
            variable: variable.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            func: std::sync::Arc::new(func),
        })
    }
}

impl From<Pattern> for Condition {
    fn from(pattern: Pattern) -> Self {
        Condition::Pattern(pattern)
    }
}

/// One compiled triple condition: the unit the beta network joins on.
/// `id_var` is the pattern's fact-binding variable (user-supplied or
/// generated); `attr` and `path` are constants; `value` may bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleCondition {
    pub id_var: String,
    pub attr: AttrKey,
    pub path: Vec<String>,
    pub value: PatternValue,
}

/// One step of a compiled, linear condition chain.
#[derive(Debug, Clone)]
pub enum CompiledStep {
    /// A positive triple condition: beta memory + join node
    Triple(TripleCondition),
    /// A negated single triple: negative node
    Negative(TripleCondition),
    /// A negated conjunction: private subnetwork + NCC node pair
    Ncc(Vec<CompiledStep>),
    /// Filter node evaluating a pure predicate
    Test(TestSpec),
    /// Bind node extending the binding environment
    Bind(BindSpec),
}

/// A production condition compiled to DNF: one linear chain per disjunct,
/// plus the set of user-visible variables bound in every disjunct.
#[derive(Debug)]
pub struct CompiledCondition {
    pub disjuncts: Vec<Vec<CompiledStep>>,
    pub bound: Vec<HashSet<String>>,
}

impl CompiledCondition {
    /// Variables bound in every disjunct; action parameters must come from
    /// this set.
    pub fn common_bound(&self) -> HashSet<String> {
        let mut iter = self.bound.iter();
        let mut common = iter.next().cloned().unwrap_or_default();
        for set in iter {
            common.retain(|v| set.contains(v));
        }
        common
    }
}

/// Compile a condition expression: DNF normalization, pattern expansion,
/// and scope validation. Fails without side effects on malformed input.
pub fn compile(condition: &Condition) -> TrellisResult<CompiledCondition> {
    let disjuncts = to_dnf(condition);
    let mut compiled = Vec::with_capacity(disjuncts.len());
    let mut bound_sets = Vec::with_capacity(disjuncts.len());
    for leaves in &disjuncts {
        // The generated-variable counter restarts per disjunct so identical
        // patterns compile to identical triples and share network nodes.
        let mut ctx = CompileCtx::default();
        let steps = ctx.to_steps(leaves, false)?;
        let mut bound = HashSet::new();
        validate_steps(&steps, &mut bound)?;
        bound.retain(|v| !v.starts_with(GENERATED_PREFIX));
        compiled.push(steps);
        bound_sets.push(bound);
    }
    Ok(CompiledCondition { disjuncts: compiled, bound: bound_sets })
}

/// Intermediate DNF leaf: patterns, tests, and binds pass through;
/// negations hold their own normalized conjunction.
enum Leaf<'a> {
    Pattern(&'a Pattern),
    Test(&'a TestSpec),
    Bind(&'a BindSpec),
    Not(Vec<Leaf<'a>>),
}

/// Distribute to disjunctive normal form. `A & (B | C)` becomes
/// `(A & B) | (A & C)`; `NOT (A | B)` becomes `NOT A & NOT B`.
fn to_dnf(condition: &Condition) -> Vec<Vec<Leaf<'_>>> {
    match condition {
        Condition::Pattern(p) => vec![vec![Leaf::Pattern(p)]],
        Condition::Test(t) => vec![vec![Leaf::Test(t)]],
        Condition::Bind(b) => vec![vec![Leaf::Bind(b)]],
        Condition::And(parts) => {
            let mut result: Vec<Vec<Leaf>> = vec![Vec::new()];
            for part in parts {
                let branches = to_dnf(part);
                let mut next = Vec::with_capacity(result.len() * branches.len());
                for prefix in &result {
                    for branch in &branches {
                        let mut combined: Vec<Leaf> =
                            prefix.iter().map(clone_leaf).collect();
                        combined.extend(branch.iter().map(clone_leaf));
                        next.push(combined);
                    }
                }
                result = next;
            }
            result
        }
        Condition::Or(parts) => parts.iter().flat_map(to_dnf).collect(),
        Condition::Not(inner) => {
            let branches = to_dnf(inner);
            vec![branches
                .into_iter()
                .map(Leaf::Not)
                .collect()]
        }
    }
}

fn clone_leaf<'a>(leaf: &Leaf<'a>) -> Leaf<'a> {
    match leaf {
        Leaf::Pattern(p) => Leaf::Pattern(p),
        Leaf::Test(t) => Leaf::Test(t),
        Leaf::Bind(b) => Leaf::Bind(b),
        Leaf::Not(inner) => Leaf::Not(inner.iter().map(clone_leaf).collect()),
    }
}

#[derive(Default)]
struct CompileCtx {
    next_fact_var: usize,
}

impl CompileCtx {
    fn fresh_fact_var(&mut self) -> String {
        let var = format!("{}f{}", GENERATED_PREFIX, self.next_fact_var);
        self.next_fact_var += 1;
        var
    }

    fn to_steps(&mut self, leaves: &[Leaf<'_>], in_negation: bool) -> TrellisResult<Vec<CompiledStep>> {
        let mut steps = Vec::new();
        for leaf in leaves {
            match leaf {
                Leaf::Pattern(pattern) => {
                    if pattern.slots.is_empty() {
                        return Err(TrellisError::compile(
                            "pattern has no attribute constraints",
                        ));
                    }
                    if let Some(binding) = &pattern.binding {
                        check_user_variable(binding)?;
                    }
                    let id_var = match &pattern.binding {
                        Some(binding) => binding.clone(),
                        None => self.fresh_fact_var(),
                    };
                    for (attr, value) in &pattern.slots {
                        if let PatternValue::Variable(v) = value {
                            check_user_variable(v)?;
                        }
                        steps.push(CompiledStep::Triple(TripleCondition {
                            id_var: id_var.clone(),
                            attr: attr.key.clone(),
                            path: attr.path.clone(),
                            value: value.clone(),
                        }));
                    }
                }
                Leaf::Test(test) => steps.push(CompiledStep::Test((*test).clone())),
                Leaf::Bind(bind) => {
                    if in_negation {
                        return Err(TrellisError::compile_variable(
                            &bind.variable,
                            "bind inside a negation cannot escape its scope",
                        ));
                    }
                    check_user_variable(&bind.variable)?;
                    steps.push(CompiledStep::Bind((*bind).clone()));
                }
                Leaf::Not(inner) => {
                    let mut inner_steps = self.to_steps(inner, true)?;
                    let single_triple =
                        inner_steps.len() == 1 && matches!(inner_steps[0], CompiledStep::Triple(_));
                    if single_triple {
                        if let Some(CompiledStep::Triple(triple)) = inner_steps.pop() {
                            steps.push(CompiledStep::Negative(triple));
                        }
                    } else {
                        steps.push(CompiledStep::Ncc(inner_steps));
                    }
                }
            }
        }
        Ok(steps)
    }
}

fn check_user_variable(name: &str) -> TrellisResult<()> {
    if name.starts_with(GENERATED_PREFIX) {
        return Err(TrellisError::compile_variable(
            name,
            format!("variable names starting with '{}' are reserved", GENERATED_PREFIX),
        ));
    }
    Ok(())
}

/// Lexical scoping: a test or bind may only reference variables bound by a
/// strictly earlier positive condition or bind. Negations reference outer
/// bindings but bind nothing themselves.
fn validate_steps(steps: &[CompiledStep], bound: &mut HashSet<String>) -> TrellisResult<()> {
    for step in steps {
        match step {
            CompiledStep::Triple(triple) => {
                bound.insert(triple.id_var.clone());
                if let PatternValue::Variable(v) = &triple.value {
                    bound.insert(v.clone());
                }
            }
            // Negative conditions bind nothing; unbound variables inside
            // them act as local wildcards.
            CompiledStep::Negative(_) => {}
            CompiledStep::Ncc(inner) => {
                let mut local = bound.clone();
                validate_steps(inner, &mut local)?;
            }
            CompiledStep::Test(test) => {
                for param in &test.params {
                    if !bound.contains(param) {
                        return Err(TrellisError::compile_variable(
                            param,
                            "test references a variable not bound by an earlier condition",
                        ));
                    }
                }
            }
            CompiledStep::Bind(bind) => {
                for param in &bind.params {
                    if !bound.contains(param) {
                        return Err(TrellisError::compile_variable(
                            param,
                            "bind references a variable not bound by an earlier condition",
                        ));
                    }
                }
                if !bound.insert(bind.variable.clone()) {
                    return Err(TrellisError::compile_variable(
                        &bind.variable,
                        "bind target is already bound",
                    ));
                }
            }
        }
    }
    Ok(())
}
