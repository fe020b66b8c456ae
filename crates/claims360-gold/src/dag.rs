//! Stage dependency graph.
//!
//! Edges point from an input to the stage that reads it. Topological order
//! breaks ties by insertion rank, so the same declarations always produce
//! the same plan.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};

/// A directed graph of stages with deterministic ordering.
#[derive(Debug, Clone)]
pub(crate) struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index: HashMap<T, NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    pub(crate) fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a node, or returns the existing one.
    pub(crate) fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index.insert(value, idx);
        idx
    }

    /// Adds an edge `from -> to` between existing nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DagNodeNotFound`] if either node is missing.
    pub(crate) fn add_edge(&mut self, from: &T, to: &T) -> Result<()> {
        let from = self.node(from)?;
        let to = self.node(to)?;
        if !self.graph.contains_edge(from, to) {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    /// Nodes that point at `value`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DagNodeNotFound`] if the node is missing.
    pub(crate) fn upstream(&self, value: &T) -> Result<Vec<T>> {
        let idx = self.node(value)?;
        let mut inputs: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        inputs.sort_unstable();
        Ok(inputs
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect())
    }

    /// Kahn's algorithm; among ready nodes the earliest inserted goes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] naming every node left unordered.
    pub(crate) fn toposort(&self) -> Result<Vec<T>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        // Node indices are assigned in insertion order, so the index is the rank.
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(rank, _)| Reverse(rank))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(rank)) = ready.pop() {
            let idx = NodeIndex::new(rank);
            if let Some(value) = self.graph.node_weight(idx) {
                order.push(value.clone());
            }
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(next.index()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(next.index()));
                    }
                }
            }
        }

        if order.len() < self.graph.node_count() {
            let cycle = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .filter_map(|(rank, _)| self.graph.node_weight(NodeIndex::new(rank)))
                .map(ToString::to_string)
                .collect();
            return Err(Error::CycleDetected { cycle });
        }
        Ok(order)
    }

    fn node(&self, value: &T) -> Result<NodeIndex> {
        self.index
            .get(value)
            .copied()
            .ok_or_else(|| Error::DagNodeNotFound {
                node: value.to_string(),
            })
    }
}
