//! Dependency graph for the items of one group, and cycle detection over it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::CycleError;
use crate::state::ProgressRecord;

/// Edges point from an item to the items it depends on.
///
/// Rebuilt every poll from the tracked records' `depends_on`. Dependencies on
/// items outside the graph are kept as edges but have no outgoing edges of their own.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<u64, BTreeSet<u64>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(number, record)` pairs; records without detected deps add a bare node.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a ProgressRecord)>,
    {
        let mut graph = Self::new();
        for (number, record) in records {
            let deps = record.depends_on.clone().unwrap_or_default();
            graph.add_item(number, deps);
        }
        graph
    }

    pub fn add_item(&mut self, number: u64, depends_on: impl IntoIterator<Item = u64>) {
        self.edges.entry(number).or_default().extend(depends_on);
    }

    pub fn remove(&mut self, number: u64) {
        self.edges.remove(&number);
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Items `number` depends on.
    pub fn dependencies(&self, number: u64) -> Vec<u64> {
        self.edges
            .get(&number)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Depth-first search with an explicit stack; returns the first cycle found.
    ///
    /// Nodes are visited in ascending order, so the result is deterministic.
    /// Linear in nodes plus edges.
    pub fn check_for_cycles(&self) -> Result<(), CycleError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            OnStack,
            Done,
        }

        struct Frame {
            node: u64,
            deps: Vec<u64>,
            cursor: usize,
        }

        let mut marks: HashMap<u64, Mark> = HashMap::with_capacity(self.edges.len());

        for &start in self.edges.keys() {
            if marks.contains_key(&start) {
                continue;
            }
            marks.insert(start, Mark::OnStack);
            let mut stack = vec![Frame {
                node: start,
                deps: self.dependencies(start),
                cursor: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                let node = frame.node;
                let next = frame.deps.get(frame.cursor).copied();
                frame.cursor += 1;

                let Some(dep) = next else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };

                match marks.get(&dep).copied() {
                    Some(Mark::Done) => {}
                    Some(Mark::OnStack) => {
                        let entry = stack.iter().position(|f| f.node == dep).unwrap_or(0);
                        return Err(CycleError {
                            path: stack[entry..].iter().map(|f| f.node).collect(),
                        });
                    }
                    None => {
                        marks.insert(dep, Mark::OnStack);
                        stack.push(Frame {
                            node: dep,
                            deps: self.dependencies(dep),
                            cursor: 0,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Every disjoint cycle: after each one is reported its members are removed
    /// and the search runs again on what remains.
    pub fn find_cycles(&self) -> Vec<CycleError> {
        let mut remaining = self.clone();
        let mut cycles = Vec::new();
        while let Err(cycle) = remaining.check_for_cycles() {
            for node in &cycle.path {
                remaining.remove(*node);
            }
            cycles.push(cycle);
        }
        cycles
    }
}
