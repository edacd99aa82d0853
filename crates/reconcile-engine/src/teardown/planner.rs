//! Dependency-ordered teardown planning.
//!
//! Kind-level edges from the [`DependencyGraph`] are resolved transitively
//! through kinds that have no handles present, so `A before X before B`
//! still orders `A` before `B` when nothing of kind `X` is being torn down.
//! Handles are then sorted with Kahn's algorithm; ties go to the handle that
//! appeared first in the input, which makes the plan deterministic.

use super::types::{DependencyGraph, ResourceHandle};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use reconcile_common::{ResourceId, ResourceKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("cyclic teardown dependency between kinds: {}", join_kinds(.kinds))]
    CyclicDependency { kinds: Vec<ResourceKind> },

    #[error("{resource} appears more than once")]
    DuplicateHandle { resource: ResourceId },
}

fn join_kinds(kinds: &[ResourceKind]) -> String {
    kinds
        .iter()
        .map(ResourceKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub handle: ResourceHandle,
    /// Position of the handle in the planner's input
    pub input_index: usize,
    /// Indices of the steps that must finish before this one starts
    pub after: Vec<usize>,
}

/// Handles in teardown order (dependents first)
#[derive(Debug, Clone, Default)]
pub struct TeardownPlan {
    pub steps: Vec<PlanStep>,
}

impl TeardownPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.steps.iter().map(|s| &s.handle.id)
    }
}

pub struct TeardownPlanner;

impl TeardownPlanner {
    /// Order `handles` so that every handle comes after all handles of the
    /// kinds that must be torn down before it.
    pub fn plan(
        handles: Vec<ResourceHandle>,
        graph: &DependencyGraph,
    ) -> Result<TeardownPlan, PlanError> {
        let mut seen = HashSet::with_capacity(handles.len());
        for handle in &handles {
            if !seen.insert(&handle.id) {
                return Err(PlanError::DuplicateHandle {
                    resource: handle.id.clone(),
                });
            }
        }

        // Present kinds, in discovery order
        let mut kinds: Vec<&ResourceKind> = Vec::new();
        for handle in &handles {
            if !kinds.contains(&handle.kind()) {
                kinds.push(handle.kind());
            }
        }
        let present: HashSet<&ResourceKind> = kinds.iter().copied().collect();

        let mut kind_graph: DiGraph<&ResourceKind, ()> = DiGraph::new();
        let nodes: HashMap<&ResourceKind, NodeIndex> = kinds
            .iter()
            .map(|k| (*k, kind_graph.add_node(*k)))
            .collect();
        let mut predecessors: HashMap<&ResourceKind, Vec<&ResourceKind>> = HashMap::new();
        for kind in &kinds {
            let preds = present_predecessors(kind, graph, &present);
            for pred in &preds {
                kind_graph.add_edge(nodes[pred], nodes[kind], ());
            }
            predecessors.insert(*kind, preds);
        }

        let mut cyclic: Vec<&ResourceKind> = tarjan_scc(&kind_graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || kind_graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| kind_graph[idx])
            .collect();
        if !cyclic.is_empty() {
            cyclic.sort_by_key(|k| kinds.iter().position(|p| p == k));
            return Err(PlanError::CyclicDependency {
                kinds: cyclic.into_iter().cloned().collect(),
            });
        }

        let mut by_kind: HashMap<&ResourceKind, Vec<usize>> = HashMap::new();
        for (i, handle) in handles.iter().enumerate() {
            by_kind.entry(handle.kind()).or_default().push(i);
        }

        // Handle-level edges: every handle of a predecessor kind
        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); handles.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); handles.len()];
        for (i, handle) in handles.iter().enumerate() {
            for pred_kind in &predecessors[handle.kind()] {
                for &j in &by_kind[pred_kind] {
                    incoming[i].push(j);
                    outgoing[j].push(i);
                }
            }
        }

        let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..handles.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(handles.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &outgoing[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        // The kind graph is acyclic, so every handle was ordered
        debug_assert_eq!(order.len(), handles.len());

        let mut position = vec![0; handles.len()];
        for (step, &i) in order.iter().enumerate() {
            position[i] = step;
        }

        let mut slots: Vec<Option<ResourceHandle>> = handles.into_iter().map(Some).collect();
        let steps = order
            .iter()
            .filter_map(|&i| {
                let mut after: Vec<usize> = incoming[i].iter().map(|&j| position[j]).collect();
                after.sort_unstable();
                slots[i].take().map(|handle| PlanStep {
                    handle,
                    input_index: i,
                    after,
                })
            })
            .collect();

        Ok(TeardownPlan { steps })
    }
}

/// Present kinds that must be torn down before `kind`, following edges
/// through absent kinds.
fn present_predecessors<'a>(
    kind: &ResourceKind,
    graph: &'a DependencyGraph,
    present: &HashSet<&'a ResourceKind>,
) -> Vec<&'a ResourceKind> {
    let mut found: Vec<&'a ResourceKind> = Vec::new();
    let mut visited: HashSet<&'a ResourceKind> = HashSet::new();
    let mut stack: Vec<&'a ResourceKind> = graph.torn_down_before(kind).collect();
    stack.reverse();

    while let Some(candidate) = stack.pop() {
        if !visited.insert(candidate) {
            continue;
        }
        if present.contains(candidate) {
            found.push(candidate);
        } else {
            let mut next: Vec<_> = graph.torn_down_before(candidate).collect();
            next.reverse();
            stack.extend(next);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(kind: &str, id: &str) -> ResourceHandle {
        ResourceHandle::new(ResourceId::new(kind, id))
    }

    fn order(plan: &TeardownPlan) -> Vec<String> {
        plan.resources().map(ToString::to_string).collect()
    }

    #[test]
    fn test_dependents_first() {
        let mut graph = DependencyGraph::new();
        graph.depends_on("job_queue", "compute_env");

        let plan = TeardownPlanner::plan(
            vec![handle("compute_env", "ce"), handle("job_queue", "jq")],
            &graph,
        )
        .unwrap();

        assert_eq!(order(&plan), vec!["job_queue/jq", "compute_env/ce"]);
        assert_eq!(plan.steps[1].after, vec![0]);
        assert_eq!(plan.steps[1].input_index, 0);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let plan = TeardownPlanner::plan(
            vec![handle("b", "1"), handle("a", "1"), handle("b", "2")],
            &DependencyGraph::new(),
        )
        .unwrap();
        assert_eq!(order(&plan), vec!["b/1", "a/1", "b/2"]);
        assert!(plan.steps.iter().all(|s| s.after.is_empty()));
    }

    #[test]
    fn test_ordering_through_absent_kind() {
        // instance before eni before security_group; no ENIs are present
        let mut graph = DependencyGraph::new();
        graph.add("eni", ["instance"]);
        graph.add("security_group", ["eni"]);

        let plan = TeardownPlanner::plan(
            vec![handle("security_group", "sg"), handle("instance", "i")],
            &graph,
        )
        .unwrap();
        assert_eq!(order(&plan), vec!["instance/i", "security_group/sg"]);
    }

    #[test]
    fn test_cycle_names_every_kind() {
        let mut graph = DependencyGraph::new();
        graph.add("a", ["b"]);
        graph.add("b", ["c"]);
        graph.add("c", ["a"]);

        let err = TeardownPlanner::plan(
            vec![handle("c", "1"), handle("a", "1"), handle("b", "1"), handle("d", "1")],
            &graph,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::CyclicDependency {
                kinds: vec!["c".into(), "a".into(), "b".into()]
            }
        );
        assert_eq!(err.to_string(), "cyclic teardown dependency between kinds: c, a, b");
    }

    #[test]
    fn test_cycle_through_absent_kind() {
        let mut graph = DependencyGraph::new();
        graph.add("a", ["x"]);
        graph.add("x", ["a"]);

        let err = TeardownPlanner::plan(vec![handle("a", "1")], &graph).unwrap_err();
        assert!(matches!(err, PlanError::CyclicDependency { ref kinds } if kinds == &vec![ResourceKind::from("a")]));
    }

    #[test]
    fn test_cycle_among_absent_kinds_is_ignored() {
        let mut graph = DependencyGraph::new();
        graph.add("x", ["y"]);
        graph.add("y", ["x"]);

        let plan = TeardownPlanner::plan(vec![handle("a", "1")], &graph).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let err = TeardownPlanner::plan(
            vec![handle("a", "1"), handle("a", "1")],
            &DependencyGraph::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::DuplicateHandle {
                resource: ResourceId::new("a", "1")
            }
        );
    }

    #[test]
    fn test_empty_plan() {
        let plan = TeardownPlanner::plan(Vec::new(), &DependencyGraph::new()).unwrap();
        assert!(plan.is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn kind_name(k: usize) -> String {
            format!("kind{k}")
        }

        proptest! {
            /// Every handle comes after all handles of kinds that must precede it
            #[test]
            fn plan_respects_dependencies(
                edges in prop::collection::vec((0usize..6, 0usize..6), 0..12),
                handle_kinds in prop::collection::vec(0usize..6, 0..20),
            ) {
                // Only lower -> higher edges, so the graph is acyclic
                let mut graph = DependencyGraph::new();
                for (a, b) in &edges {
                    if a < b {
                        graph.add(kind_name(*b), [kind_name(*a)]);
                    }
                }
                let handles: Vec<_> = handle_kinds
                    .iter()
                    .enumerate()
                    .map(|(i, k)| handle(&kind_name(*k), &i.to_string()))
                    .collect();

                let plan = TeardownPlanner::plan(handles.clone(), &graph).unwrap();
                prop_assert_eq!(plan.len(), handles.len());

                for (pos, step) in plan.steps.iter().enumerate() {
                    for &a in &step.after {
                        prop_assert!(a < pos);
                    }
                    for before_kind in graph.torn_down_before(step.handle.kind()) {
                        for earlier in plan.steps.iter().skip(pos) {
                            prop_assert_ne!(earlier.handle.kind(), before_kind);
                        }
                    }
                }

                let again = TeardownPlanner::plan(handles, &graph).unwrap();
                prop_assert_eq!(order(&plan), order(&again));
            }
        }
    }
}
