use std::collections::BTreeMap;
use std::fmt::Debug;

use dpm_core::errors::ErrorInfo;
use dpm_core::{DpmError, RngHandle};
use rand::distributions::{Distribution, WeightedIndex};

/// Immutable adjacency table over discrete model-indicator values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborGraph {
    adjacency: BTreeMap<i64, Vec<i64>>,
}

impl NeighborGraph {
    /// Builds the graph, requiring a symmetric, loop-free adjacency where every
    /// value has at least one neighbor.
    pub fn new(adjacency: BTreeMap<i64, Vec<i64>>) -> Result<Self, DpmError> {
        let mut normalized = BTreeMap::new();
        for (value, neighbors) in adjacency {
            let mut neighbors = neighbors;
            neighbors.sort_unstable();
            neighbors.dedup();
            if neighbors.is_empty() {
                return Err(graph_error("isolated-value", "value has no neighbors", value));
            }
            if neighbors.contains(&value) {
                return Err(graph_error("self-loop", "value lists itself as neighbor", value));
            }
            normalized.insert(value, neighbors);
        }
        for (value, neighbors) in &normalized {
            for neighbor in neighbors {
                let symmetric = normalized
                    .get(neighbor)
                    .map(|back| back.contains(value))
                    .unwrap_or(false);
                if !symmetric {
                    return Err(graph_error(
                        "asymmetric-graph",
                        "neighbor graph must be symmetric",
                        *value,
                    )
                    .with_context("to", neighbor));
                }
            }
        }
        Ok(Self {
            adjacency: normalized,
        })
    }

    /// The five-value site-model averaging network: `1-3, 2-3, 3-4, 4-5`.
    pub fn site_model_network() -> Self {
        let adjacency = BTreeMap::from([
            (1, vec![3]),
            (2, vec![3]),
            (3, vec![1, 2, 4]),
            (4, vec![3, 5]),
            (5, vec![4]),
        ]);
        Self { adjacency }
    }

    /// Sorted neighbors of `value`, if the value is part of the graph.
    pub fn neighbors(&self, value: i64) -> Option<&[i64]> {
        self.adjacency.get(&value).map(Vec::as_slice)
    }

    /// Returns `true` when `a` and `b` are adjacent.
    pub fn are_neighbors(&self, a: i64, b: i64) -> bool {
        self.neighbors(a)
            .map(|neighbors| neighbors.binary_search(&b).is_ok())
            .unwrap_or(false)
    }

    /// Values of the graph in ascending order.
    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        self.adjacency.keys().copied()
    }

    /// Raw adjacency table.
    pub fn adjacency(&self) -> &BTreeMap<i64, Vec<i64>> {
        &self.adjacency
    }
}

fn graph_error(code: &str, message: &str, value: i64) -> DpmError {
    DpmError::Kernel(ErrorInfo::new(code, message).with_context("value", value))
}

/// Conditional categorical distribution over the value domain.
///
/// Slot `k` of a density table corresponds to value `k + offset`.
pub trait ConditionalCategorical: Debug + Send + Sync {
    /// Offset between table slots and values.
    fn offset(&self) -> i64;

    /// Unnormalized density table of moving away from `current`.
    fn neighbor_densities(&self, current: i64, graph: &NeighborGraph) -> Vec<f64>;
}

/// Uniform choice among the neighbors of the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformNeighborCategorical {
    offset: i64,
    domain_size: usize,
}

impl UniformNeighborCategorical {
    /// Covers values `offset..offset + domain_size`.
    pub fn new(offset: i64, domain_size: usize) -> Self {
        Self {
            offset,
            domain_size,
        }
    }

    /// Sizes the domain to span every value of `graph`.
    pub fn spanning(graph: &NeighborGraph) -> Self {
        let min = graph.values().next().unwrap_or(0);
        let max = graph.values().last().unwrap_or(min);
        Self::new(min, (max - min + 1) as usize)
    }
}

impl ConditionalCategorical for UniformNeighborCategorical {
    fn offset(&self) -> i64 {
        self.offset
    }

    fn neighbor_densities(&self, current: i64, graph: &NeighborGraph) -> Vec<f64> {
        let mut table = vec![0.0; self.domain_size];
        if let Some(neighbors) = graph.neighbors(current) {
            let mass = 1.0 / neighbors.len() as f64;
            for neighbor in neighbors {
                let slot = neighbor - self.offset;
                if slot >= 0 && (slot as usize) < table.len() {
                    table[slot as usize] = mass;
                }
            }
        }
        table
    }
}

/// Candidate value drawn by [`DiscreteNeighborKernel::propose`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscreteDraw {
    /// Proposed indicator value.
    pub value: i64,
    /// `log P(value | old)`.
    pub log_density: f64,
}

/// Proposes a neighboring value for the discrete site-model indicator.
#[derive(Debug)]
pub struct DiscreteNeighborKernel {
    graph: NeighborGraph,
    distribution: Box<dyn ConditionalCategorical>,
}

impl DiscreteNeighborKernel {
    /// Creates the kernel from an injected graph and density source.
    pub fn new(graph: NeighborGraph, distribution: impl ConditionalCategorical + 'static) -> Self {
        Self {
            graph,
            distribution: Box::new(distribution),
        }
    }

    /// Uniform-neighbor kernel over `graph`.
    pub fn uniform(graph: NeighborGraph) -> Self {
        let distribution = UniformNeighborCategorical::spanning(&graph);
        Self::new(graph, distribution)
    }

    /// Adjacency the kernel is restricted to.
    pub fn graph(&self) -> &NeighborGraph {
        &self.graph
    }

    /// Draws a neighbor of `old`.
    pub fn propose(&self, old: i64, rng: &mut RngHandle) -> Result<DiscreteDraw, DpmError> {
        let table = self.table(old)?;
        let index = WeightedIndex::new(&table).map_err(|err| {
            DpmError::Kernel(
                ErrorInfo::new("invalid-density-table", err.to_string()).with_context("from", old),
            )
        })?;
        let slot = index.sample(rng);
        let value = slot as i64 + self.distribution.offset();
        Ok(DiscreteDraw {
            value,
            log_density: normalized_log(&table, slot),
        })
    }

    /// `log P(old | new)`: the density of the move that would recreate `old`
    /// when starting from `new`.
    pub fn reverse_log_density(&self, old: i64, new: i64) -> Result<f64, DpmError> {
        let table = self.table(new)?;
        let slot = old - self.distribution.offset();
        if slot < 0 || slot as usize >= table.len() {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(normalized_log(&table, slot as usize))
    }

    fn table(&self, current: i64) -> Result<Vec<f64>, DpmError> {
        if self.graph.neighbors(current).is_none() {
            return Err(graph_error(
                "unknown-indicator",
                "indicator value is not part of the neighbor graph",
                current,
            ));
        }
        let table = self.distribution.neighbor_densities(current, &self.graph);
        let offset = self.distribution.offset();
        for (slot, density) in table.iter().enumerate() {
            let value = slot as i64 + offset;
            if !(density.is_finite() && *density >= 0.0) {
                return Err(graph_error("invalid-density", "density must be finite", value)
                    .with_context("from", current));
            }
            if *density > 0.0 && !self.graph.are_neighbors(current, value) {
                return Err(graph_error(
                    "density-outside-neighborhood",
                    "density table weights a non-neighbor",
                    value,
                )
                .with_context("from", current));
            }
        }
        Ok(table)
    }
}

fn normalized_log(table: &[f64], slot: usize) -> f64 {
    let total: f64 = table.iter().sum();
    (table[slot] / total).ln()
}
