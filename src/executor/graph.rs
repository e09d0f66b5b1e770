// Dependency graph helpers: ready sets, skip cascade, stuck detection, wave planning

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::task::{StuckReport, StuckTask, SubTask, TaskDefinition, TaskStatus};

/// Pending tasks whose dependencies are all `Completed`, in step order
pub fn ready_set(tasks: &BTreeMap<String, SubTask>) -> Vec<String> {
    let mut ready: Vec<&SubTask> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on.iter().all(|dep| {
                tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
        .collect();
    ready.sort_by(|a, b| {
        a.sequence_number
            .cmp(&b.sequence_number)
            .then_with(|| a.id.cmp(&b.id))
    });
    ready.into_iter().map(|t| t.id.clone()).collect()
}

/// Pending tasks that depend on a failed or skipped task, transitively.
///
/// Returns `(task id, reason)` pairs without mutating anything.
pub fn blocked_by_failures(tasks: &BTreeMap<String, SubTask>) -> Vec<(String, String)> {
    let mut dead: HashSet<&str> = tasks
        .values()
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
        .map(|t| t.id.as_str())
        .collect();
    let mut blocked = Vec::new();

    loop {
        let newly: Vec<(&str, &str)> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !dead.contains(t.id.as_str()))
            .filter_map(|t| {
                t.depends_on
                    .iter()
                    .find(|dep| dead.contains(dep.as_str()))
                    .map(|dep| (t.id.as_str(), dep.as_str()))
            })
            .collect();
        if newly.is_empty() {
            break;
        }
        for (id, dep) in newly {
            dead.insert(id);
            blocked.push((id.to_string(), format!("dependency {dep} did not complete")));
        }
    }
    blocked
}

fn dependency_cycles(
    ids: &[&str],
    edges: impl Iterator<Item = (String, String)>,
) -> Vec<Vec<String>> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for &id in ids {
        nodes.insert(id, graph.add_node(id.to_string()));
    }

    let mut self_loops = Vec::new();
    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (nodes.get(from.as_str()), nodes.get(to.as_str())) {
            if a == b {
                self_loops.push(vec![from.clone()]);
            }
            graph.add_edge(a, b, ());
        }
    }

    let mut cycles: Vec<Vec<String>> = petgraph::algo::tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let mut ids: Vec<String> = component.iter().map(|&idx| graph[idx].clone()).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.extend(self_loops);
    cycles.sort();
    cycles
}

/// Why the remaining pending tasks can never become ready
pub fn stuck_report(tasks: &BTreeMap<String, SubTask>) -> StuckReport {
    let pending: Vec<&SubTask> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();

    let stuck = pending
        .iter()
        .map(|t| StuckTask {
            id: t.id.clone(),
            unmet_dependencies: t
                .depends_on
                .iter()
                .filter(|dep| {
                    tasks
                        .get(*dep)
                        .map_or(true, |d| d.status != TaskStatus::Completed)
                })
                .cloned()
                .collect(),
        })
        .collect();

    let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
    let edges = pending
        .iter()
        .flat_map(|t| t.depends_on.iter().map(|dep| (dep.clone(), t.id.clone())));
    StuckReport {
        pending: stuck,
        cycles: dependency_cycles(&ids, edges),
    }
}

/// Static wave layout of a workflow, assuming every task succeeds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WavePlan {
    pub waves: Vec<Vec<String>>,
    pub unschedulable: Option<StuckReport>,
}

pub fn plan_waves(definitions: &[TaskDefinition]) -> WavePlan {
    let mut tasks: BTreeMap<String, SubTask> = definitions
        .iter()
        .cloned()
        .map(|d| (d.id.clone(), SubTask::from_definition(d)))
        .collect();

    let mut waves = Vec::new();
    loop {
        let ready = ready_set(&tasks);
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            if let Some(task) = tasks.get_mut(id) {
                task.status = TaskStatus::Completed;
            }
        }
        waves.push(ready);
    }

    let has_pending = tasks.values().any(|t| t.status == TaskStatus::Pending);
    WavePlan {
        waves,
        unschedulable: has_pending.then(|| stuck_report(&tasks)),
    }
}
