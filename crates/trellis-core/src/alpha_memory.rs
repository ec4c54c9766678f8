//! Alpha network: the constant-test discrimination tree.
//!
//! Interior nodes each test one constant property of a single WME
//! (attribute identity, value equality, or equality of a path-navigated
//! sub-value), so a root-to-terminal walk encodes a conjunction of constant
//! tests. Terminals are alpha memories holding the currently matching WMEs
//! and feeding the beta network's join and negative nodes.
//!
//! Building a path for a new pattern reuses existing nodes whose test
//! matches the next required test, giving O(unique tests) nodes rather than
//! O(conditions). Per-node and per-memory production refcounts govern
//! teardown when productions are removed.

use crate::conditions::{resolve_path, PatternValue, TripleCondition};
use crate::types::{AlphaMemoryId, AlphaNodeId, BetaNodeId, Wme, WmeId};
use std::collections::HashMap;
use tracing::debug;
use trellis_types::{AttrKey, Value};

/// A single constant test performed by an interior alpha node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlphaTest {
    /// The WME's attribute equals this key
    Attribute(AttrKey),
    /// The WME's value equals this constant
    Value(Value),
    /// Navigating the WME's value through `path` yields this constant
    PathValue { path: Vec<String>, value: Value },
}

impl AlphaTest {
    /// Check whether a WME satisfies this test
    pub fn passes(&self, wme: &Wme) -> bool {
        match self {
            AlphaTest::Attribute(key) => wme.attr == *key,
            AlphaTest::Value(value) => wme.value == *value,
            AlphaTest::PathValue { path, value } => {
                resolve_path(&wme.value, path) == Some(value)
            }
        }
    }
}

/// Interior node of the discrimination tree. The root carries no test; a
/// node may simultaneously have children (further tests) and a terminal
/// memory (patterns that end here).
#[derive(Debug)]
pub struct AlphaNode {
    pub id: AlphaNodeId,
    pub test: Option<AlphaTest>,
    pub children: Vec<AlphaNodeId>,
    pub memory: Option<AlphaMemoryId>,
    pub production_refs: usize,
}

/// Terminal alpha memory: the set of WMEs satisfying the conjunction of
/// constant tests on the path from the root.
#[derive(Debug)]
pub struct AlphaMemory {
    pub id: AlphaMemoryId,
    /// The full constant-test conjunction, kept for back-filling newly
    /// created memories and for invariant checks.
    pub tests: Vec<AlphaTest>,
    pub wmes: Vec<WmeId>,
    /// Beta nodes right-activated by this memory, deepest-first:
    /// descendants precede ancestors so one WME cannot be paired twice on
    /// a single path
    pub successors: Vec<BetaNodeId>,
    pub production_refs: usize,
}

impl AlphaMemory {
    /// Check whether a WME satisfies this memory's full constraint set
    pub fn constraints_satisfied(&self, wme: &Wme) -> bool {
        self.tests.iter().all(|t| t.passes(wme))
    }

    pub fn remove_wme(&mut self, wme_id: WmeId) {
        self.wmes.retain(|w| *w != wme_id);
    }
}

/// Outcome of building (or sharing) an alpha path for one triple condition.
pub struct AlphaPath {
    /// Interior nodes from the root's child down to the terminal, in order
    pub nodes: Vec<AlphaNodeId>,
    pub memory: AlphaMemoryId,
    /// True when the terminal memory was created by this call and still
    /// needs back-filling from the WME arena
    pub memory_created: bool,
}

/// The discrimination tree plus its terminal memories.
#[derive(Debug)]
pub struct AlphaNetwork {
    nodes: HashMap<AlphaNodeId, AlphaNode>,
    memories: HashMap<AlphaMemoryId, AlphaMemory>,
    root: AlphaNodeId,
    next_node_id: AlphaNodeId,
    next_memory_id: AlphaMemoryId,
}

impl AlphaNetwork {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let root = 0;
        nodes.insert(
            root,
            AlphaNode { id: root, test: None, children: Vec::new(), memory: None, production_refs: 0 },
        );
        Self { nodes, memories: HashMap::new(), root, next_node_id: 1, next_memory_id: 0 }
    }

    /// The constant tests a triple condition contributes to the alpha
    /// network. Variable and wildcard values contribute nothing; they are
    /// handled by the joins.
    pub fn tests_for(triple: &TripleCondition) -> Vec<AlphaTest> {
        let mut tests = vec![AlphaTest::Attribute(triple.attr.clone())];
        if let PatternValue::Constant(value) = &triple.value {
            if triple.path.is_empty() {
                tests.push(AlphaTest::Value(value.clone()));
            } else {
                tests.push(AlphaTest::PathValue {
                    path: triple.path.clone(),
                    value: value.clone(),
                });
            }
        }
        tests
    }

    /// Walk from the root reusing nodes whose test matches; create only the
    /// missing suffix and the terminal memory. Bumps production refcounts
    /// along the path.
    pub fn build_path(&mut self, tests: &[AlphaTest]) -> AlphaPath {
        let mut current = self.root;
        let mut path = Vec::with_capacity(tests.len());
        for test in tests {
            let existing = self.nodes[&current]
                .children
                .iter()
                .copied()
                .find(|child| self.nodes[child].test.as_ref() == Some(test));
            let child = match existing {
                Some(id) => id,
                None => {
                    let id = self.next_node_id;
                    self.next_node_id += 1;
                    self.nodes.insert(
                        id,
                        AlphaNode {
                            id,
                            test: Some(test.clone()),
                            children: Vec::new(),
                            memory: None,
                            production_refs: 0,
                        },
                    );
                    self.nodes.get_mut(&current).expect("parent node exists").children.push(id);
                    debug!(node = id, "created alpha node");
                    id
                }
            };
            self.nodes.get_mut(&child).expect("child node exists").production_refs += 1;
            path.push(child);
            current = child;
        }

        let terminal = self.nodes.get_mut(&current).expect("terminal node exists");
        let (memory, memory_created) = match terminal.memory {
            Some(id) => (id, false),
            None => {
                let id = self.next_memory_id;
                self.next_memory_id += 1;
                terminal.memory = Some(id);
                self.memories.insert(
                    id,
                    AlphaMemory {
                        id,
                        tests: tests.to_vec(),
                        wmes: Vec::new(),
                        successors: Vec::new(),
                        production_refs: 0,
                    },
                );
                debug!(memory = id, "created alpha memory");
                (id, true)
            }
        };
        self.memories.get_mut(&memory).expect("memory exists").production_refs += 1;

        AlphaPath { nodes: path, memory, memory_created }
    }

    /// Top-down traversal for a WME: every child whose test the WME
    /// satisfies is visited, and each reached terminal memory is reported
    /// in a deterministic order.
    pub fn matching_memories(&self, wme: &Wme) -> Vec<AlphaMemoryId> {
        let mut reached = Vec::new();
        let mut stack = vec![self.root];
        while let Some(node_id) = stack.pop() {
            let node = &self.nodes[&node_id];
            if let Some(memory) = node.memory {
                reached.push(memory);
            }
            // Reverse keeps visit order equal to child insertion order
            for child in node.children.iter().rev() {
                if self.nodes[child].test.as_ref().map(|t| t.passes(wme)).unwrap_or(true) {
                    stack.push(*child);
                }
            }
        }
        reached
    }

    pub fn memory(&self, id: AlphaMemoryId) -> &AlphaMemory {
        &self.memories[&id]
    }

    pub fn memory_mut(&mut self, id: AlphaMemoryId) -> &mut AlphaMemory {
        self.memories.get_mut(&id).expect("alpha memory exists")
    }

    /// Release one production's use of a path. Memories and interior nodes
    /// whose refcount reaches zero are destroyed; a destroyed memory is
    /// returned so the caller can clean WME back-references.
    pub fn release_path(
        &mut self,
        path: &[AlphaNodeId],
        memory: AlphaMemoryId,
    ) -> Option<AlphaMemory> {
        let mem = self.memories.get_mut(&memory).expect("alpha memory exists");
        mem.production_refs -= 1;
        let removed_memory = if mem.production_refs == 0 {
            let removed = self.memories.remove(&memory);
            if let Some(terminal) = path.last() {
                if let Some(node) = self.nodes.get_mut(terminal) {
                    node.memory = None;
                }
            }
            debug!(memory, "destroyed alpha memory");
            removed
        } else {
            None
        };

        for (index, node_id) in path.iter().enumerate().rev() {
            let node = self.nodes.get_mut(node_id).expect("alpha node exists");
            node.production_refs -= 1;
            if node.production_refs == 0 && node.children.is_empty() && node.memory.is_none() {
                self.nodes.remove(node_id);
                let parent = if index == 0 { self.root } else { path[index - 1] };
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.retain(|c| c != node_id);
                }
                debug!(node = node_id, "destroyed alpha node");
            }
        }
        removed_memory
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    pub fn memories(&self) -> impl Iterator<Item = &AlphaMemory> {
        self.memories.values()
    }
}

impl Default for AlphaNetwork {
    fn default() -> Self {
        Self::new()
    }
}
