//! Dependency graph construction and deterministic topological ordering.
//!
//! The builder takes the units of one feature and constructs a directed
//! graph where an edge `u -> v` means "v depends on u" (u runs first).

use crate::errors::ConductorError;
use crate::manifest::WorkUnit;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Index into the unit list.
pub type UnitIndex = usize;

/// Dependency graph over the units of one feature.
///
/// Rebuilt for every run and never persisted.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Units indexed by their position
    units: Vec<WorkUnit>,
    /// Map from unit id to index
    index_map: HashMap<String, UnitIndex>,
    /// Forward edges: index -> units that depend on it
    forward_edges: Vec<Vec<UnitIndex>>,
    /// Reverse edges: index -> units it depends on
    reverse_edges: Vec<Vec<UnitIndex>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate ids and unknown dependencies.
    ///
    /// Cycles are not checked here; `topological_order` reports them.
    pub fn build(units: Vec<WorkUnit>) -> Result<Self, ConductorError> {
        let mut index_map = HashMap::new();
        for (i, unit) in units.iter().enumerate() {
            if index_map.insert(unit.id.clone(), i).is_some() {
                return Err(ConductorError::DuplicateUnit {
                    id: unit.id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); units.len()];
        let mut reverse_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); units.len()];

        for (to_idx, unit) in units.iter().enumerate() {
            for dep in unit.dependency_ids() {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    ConductorError::UnresolvedDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                if !forward_edges[from_idx].contains(&to_idx) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        Ok(Self {
            units,
            index_map,
            forward_edges,
            reverse_edges,
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Get a unit by its id.
    pub fn get(&self, id: &str) -> Option<&WorkUnit> {
        self.index_map.get(id).and_then(|&i| self.units.get(i))
    }

    pub fn get_index(&self, id: &str) -> Option<UnitIndex> {
        self.index_map.get(id).copied()
    }

    /// Units that depend directly on the given unit.
    pub fn dependents(&self, index: UnitIndex) -> &[UnitIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Units the given unit depends on directly.
    pub fn dependencies(&self, index: UnitIndex) -> &[UnitIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Every unit that transitively depends on `id`, sorted by id.
    pub fn dependents_transitive(&self, id: &str) -> Vec<String> {
        let Some(start) = self.get_index(id) else {
            return Vec::new();
        };

        let mut seen: HashSet<UnitIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &dependent in self.dependents(node) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }

        let mut ids: Vec<String> = seen
            .into_iter()
            .map(|i| self.units[i].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Kahn's algorithm with increasing-id tie-break.
    ///
    /// Fails with `CycleDetected` naming every unit whose in-degree never
    /// reached zero. No partial order is ever returned.
    pub fn topological_order(&self) -> Result<Vec<String>, ConductorError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();

        let mut ready: BTreeSet<(&str, UnitIndex)> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| (self.units[i].id.as_str(), i))
            .collect();

        let mut order = Vec::with_capacity(self.units.len());

        while let Some((id, node)) = ready.pop_first() {
            order.push(id.to_string());
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert((self.units[dependent].id.as_str(), dependent));
                }
            }
        }

        if order.len() < self.units.len() {
            let mut units: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.units[i].id.clone())
                .collect();
            units.sort();
            return Err(ConductorError::CycleDetected { units });
        }

        Ok(order)
    }

    /// Group units into waves of mutually independent units.
    ///
    /// Assumes an acyclic graph; units on a cycle never appear.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut done: HashSet<UnitIndex> = HashSet::new();

        loop {
            let mut wave: Vec<UnitIndex> = (0..self.units.len())
                .filter(|i| !done.contains(i))
                .filter(|&i| self.dependencies(i).iter().all(|d| done.contains(d)))
                .collect();

            if wave.is_empty() {
                break;
            }

            done.extend(wave.iter().copied());
            wave.sort_by(|a, b| self.units[*a].id.cmp(&self.units[*b].id));
            waves.push(wave.into_iter().map(|i| self.units[i].id.clone()).collect());
        }

        waves
    }
}

/// Build the graph and return a valid execution order.
pub fn resolve(units: &[WorkUnit]) -> Result<Vec<String>, ConductorError> {
    let graph = DependencyGraph::build(units.to_vec())?;
    let order = graph.topological_order()?;
    tracing::debug!(units = order.len(), "resolved execution order");
    Ok(order)
}
