use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::controller::ConfigurationError;
use super::value::FieldId;

/// Field dependency edges. `dependencies[a]` holds the fields `a` reads,
/// `dependents[b]` the fields that read `b`.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<FieldId, BTreeSet<FieldId>>,
    dependents: BTreeMap<FieldId, BTreeSet<FieldId>>,
}

impl DependencyGraph {
    /// Builds the graph from `(dependent, dependency)` pairs and rejects it
    /// when the edges contain a cycle.
    pub fn build(
        edges: impl IntoIterator<Item = (FieldId, FieldId)>,
    ) -> Result<Self, ConfigurationError> {
        let mut graph = Self::default();
        for (dependent, dependency) in edges {
            graph
                .dependents
                .entry(dependency.clone())
                .or_default()
                .insert(dependent.clone());
            graph
                .dependencies
                .entry(dependent)
                .or_default()
                .insert(dependency);
        }
        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigurationError::DependencyCycle {
                cycle: cycle.iter().map(|id| id.key().to_string()).collect(),
            });
        }
        Ok(graph)
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependents_of(&self, field: &FieldId) -> BTreeSet<FieldId> {
        self.dependents.get(field).cloned().unwrap_or_default()
    }

    pub fn dependencies_of(&self, field: &FieldId) -> BTreeSet<FieldId> {
        self.dependencies.get(field).cloned().unwrap_or_default()
    }

    pub(super) fn depends_on_any(&self, field: &FieldId, sources: &BTreeSet<FieldId>) -> bool {
        self.dependencies
            .get(field)
            .is_some_and(|dependencies| !dependencies.is_disjoint(sources))
    }

    /// Every field reachable from `field` through dependent edges, ordered so
    /// that each entry follows all of its own dependencies in the list.
    pub fn transitive_dependents(&self, field: &FieldId) -> Vec<FieldId> {
        self.propagation_order(std::slice::from_ref(field))
    }

    /// Topological order of everything downstream of `roots`, the roots
    /// themselves excluded.
    pub fn propagation_order(&self, roots: &[FieldId]) -> Vec<FieldId> {
        let roots = roots.iter().cloned().collect::<BTreeSet<_>>();
        let mut reachable = BTreeSet::new();
        let mut queue = roots.iter().cloned().collect::<VecDeque<_>>();
        while let Some(field) = queue.pop_front() {
            for dependent in self.dependents.get(&field).into_iter().flatten() {
                if !roots.contains(dependent) && reachable.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }

        let mut in_degree = reachable
            .iter()
            .map(|field| {
                let degree = self
                    .dependencies
                    .get(field)
                    .map(|dependencies| {
                        dependencies
                            .iter()
                            .filter(|dependency| reachable.contains(*dependency))
                            .count()
                    })
                    .unwrap_or(0);
                (field.clone(), degree)
            })
            .collect::<BTreeMap<_, _>>();

        let mut ready = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(field, _)| field.clone())
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(reachable.len());
        while let Some(field) = ready.pop_front() {
            for dependent in self.dependents.get(&field).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent.clone());
                    }
                }
            }
            order.push(field);
        }
        order
    }

    /// Iterative DFS over dependency edges. Returns the path of the first
    /// cycle found, closed with its starting field.
    fn find_cycle(&self) -> Option<Vec<FieldId>> {
        let mut visited = BTreeSet::new();
        for start in self.dependencies.keys() {
            if visited.contains(start) {
                continue;
            }

            let mut path: Vec<FieldId> = Vec::new();
            let mut on_path = BTreeSet::new();
            let mut stack: Vec<(FieldId, Vec<FieldId>)> = vec![(start.clone(), Vec::new())];
            let mut entering = true;

            while let Some((field, pending)) = stack.last_mut() {
                if entering {
                    visited.insert(field.clone());
                    on_path.insert(field.clone());
                    path.push(field.clone());
                    *pending = self
                        .dependencies
                        .get(field)
                        .map(|dependencies| dependencies.iter().rev().cloned().collect())
                        .unwrap_or_default();
                }

                match pending.pop() {
                    Some(next) if on_path.contains(&next) => {
                        let start = path.iter().position(|field| *field == next).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Some(next) if visited.contains(&next) => {
                        entering = false;
                    }
                    Some(next) => {
                        stack.push((next, Vec::new()));
                        entering = true;
                    }
                    None => {
                        if let Some(done) = path.pop() {
                            on_path.remove(&done);
                        }
                        stack.pop();
                        entering = false;
                    }
                }
            }
        }
        None
    }
}
