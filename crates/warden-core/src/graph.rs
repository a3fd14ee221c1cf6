//! Agent dependency graph and launch planning
//!
//! Edges point from an agent to the agents it requires. Validation reports
//! every unknown reference and every cycle found in one traversal; planning
//! peels zero-indegree layers (Kahn) into launch batches.

use crate::agent::AgentId;
use crate::error::{FleetError, Result};
use crate::manifest::Fleet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, instrument};

/// Topologically ordered launch batches. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    batches: Vec<Vec<AgentId>>,
}

impl LaunchPlan {
    pub fn batches(&self) -> &[Vec<AgentId>] {
        &self.batches
    }

    pub fn batch_index(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|member| member.as_str() == id))
    }

    pub fn agent_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validated, acyclic dependency graph over a fleet.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<AgentId, BTreeSet<AgentId>>,
    dependents: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

impl DependencyGraph {
    /// Build and validate; any unknown reference or cycle fails.
    pub fn build(fleet: &Fleet) -> Result<Self> {
        let (graph, errors) = Self::build_all(fleet);
        if errors.is_empty() {
            Ok(graph)
        } else {
            Err(FleetError::Validation(errors))
        }
    }

    /// Build the graph and collect every validation error found.
    #[instrument(skip(fleet), fields(agents = fleet.len()))]
    pub fn build_all(fleet: &Fleet) -> (Self, Vec<FleetError>) {
        let mut errors = Vec::new();
        let mut dependencies: BTreeMap<AgentId, BTreeSet<AgentId>> = BTreeMap::new();
        let mut dependents: BTreeMap<AgentId, BTreeSet<AgentId>> = BTreeMap::new();

        for id in fleet.ids() {
            dependencies.entry(id.clone()).or_default();
            dependents.entry(id.clone()).or_default();
        }

        for spec in fleet.agents() {
            for reference in &spec.dependencies {
                let targets = fleet.resolve_reference(reference);
                if targets.is_empty() {
                    if fleet.is_rejected(reference) {
                        debug!(
                            agent = %spec.id,
                            dependency = %reference,
                            "Dependency entry was rejected"
                        );
                        continue;
                    }
                    errors.push(FleetError::UnknownDependency {
                        agent: spec.id.clone(),
                        dependency: reference.clone(),
                    });
                    continue;
                }
                for target in targets {
                    dependents
                        .entry(target.clone())
                        .or_default()
                        .insert(spec.id.clone());
                    dependencies
                        .entry(spec.id.clone())
                        .or_default()
                        .insert(target);
                }
            }
        }

        let graph = Self {
            dependencies,
            dependents,
        };
        errors.extend(
            graph
                .find_cycles()
                .into_iter()
                .map(|path| FleetError::CyclicDependency { path }),
        );
        (graph, errors)
    }

    /// Iterative three-color DFS. Each back-edge yields the cycle path, which
    /// starts and ends at the same agent.
    fn find_cycles(&self) -> Vec<Vec<AgentId>> {
        let mut marks: HashMap<&AgentId, Mark> = self
            .dependencies
            .keys()
            .map(|id| (id, Mark::Unvisited))
            .collect();
        let mut cycles = Vec::new();

        for root in self.dependencies.keys() {
            if marks.get(root) != Some(&Mark::Unvisited) {
                continue;
            }

            let mut stack = vec![(root, self.edges_from(root))];
            marks.insert(root, Mark::InProgress);

            loop {
                let next = match stack.last_mut() {
                    Some((_, edges)) => edges.next(),
                    None => break,
                };

                match next {
                    Some(child) => match marks.get(child).copied().unwrap_or(Mark::Done) {
                        Mark::Unvisited => {
                            marks.insert(child, Mark::InProgress);
                            stack.push((child, self.edges_from(child)));
                        }
                        Mark::InProgress => {
                            let start = stack
                                .iter()
                                .position(|(node, _)| *node == child)
                                .unwrap_or(0);
                            let mut path: Vec<AgentId> =
                                stack[start..].iter().map(|(node, _)| (*node).clone()).collect();
                            path.push(child.clone());
                            debug!(?path, "Back-edge found");
                            cycles.push(path);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        if let Some((node, _)) = stack.pop() {
                            marks.insert(node, Mark::Done);
                        }
                    }
                }
            }
        }

        cycles
    }

    fn edges_from<'a>(&'a self, id: &AgentId) -> std::collections::btree_set::Iter<'a, AgentId> {
        static EMPTY: BTreeSet<AgentId> = BTreeSet::new();
        self.dependencies.get(id).unwrap_or(&EMPTY).iter()
    }

    /// Kahn's algorithm. Agents within a batch are ordered by id.
    pub fn launch_plan(&self) -> LaunchPlan {
        let mut remaining: BTreeMap<&AgentId, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id, deps.len()))
            .collect();

        let mut batches = Vec::new();
        let mut ready: BTreeSet<&AgentId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while !ready.is_empty() {
            let mut next = BTreeSet::new();
            for id in &ready {
                remaining.remove(*id);
                for dependent in self.dependents_of(id.as_str()) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            batches.push(ready.into_iter().cloned().collect());
            ready = next;
        }

        LaunchPlan { batches }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentId> {
        self.dependencies.keys()
    }

    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &AgentId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &AgentId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// All `(from, to)` edges: `from` requires `to`.
    pub fn edges(&self) -> impl Iterator<Item = (&AgentId, &AgentId)> {
        self.dependencies
            .iter()
            .flat_map(|(from, deps)| deps.iter().map(move |to| (from, to)))
    }

    /// Everything that transitively requires `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<AgentId> {
        Self::reach(id, &self.dependents)
    }

    /// Everything `id` transitively requires.
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<AgentId> {
        Self::reach(id, &self.dependencies)
    }

    fn reach(id: &str, adjacency: &BTreeMap<AgentId, BTreeSet<AgentId>>) -> BTreeSet<AgentId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&AgentId> = adjacency.get(id).into_iter().flatten().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(adjacency.get(next).into_iter().flatten());
            }
        }
        seen
    }
}
