//! Directed Acyclic Graph (DAG) for workflow execution order
//!
//! Dependency edges (`depends_on`) and routing edges (`on_success`,
//! `on_failure`, `on_decision`, `fail_safe`) form a single graph. A step named
//! by any routing field is a branch target and only runs once activated.

use crate::run::{StepState, StepStatus};
use crate::template::StepDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagValidationError {
    #[error("Cycle detected in workflow: {0}")]
    CycleDetected(String),

    #[error("Missing dependency: step {step} depends on {dependency} which does not exist")]
    MissingDependency { step: String, dependency: String },

    #[error("Unknown route target: step {step} routes to {target} which does not exist")]
    UnknownRouteTarget { step: String, target: String },

    #[error("Empty workflow: no steps defined")]
    EmptyWorkflow,

    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(String),
}

/// Result of evaluating step states against the graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Pending steps whose preconditions hold, in declaration order
    pub ready: Vec<String>,
    /// Pending steps that can no longer run, in declaration order
    pub skipped: Vec<String>,
}

/// Directed Acyclic Graph representation of a workflow
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    step_to_node: HashMap<String, NodeIndex>,
    node_to_step: HashMap<NodeIndex, String>,
    steps: HashMap<String, StepDefinition>,
    /// Step ids in declaration order
    order: Vec<String>,
    /// For each branch target, the steps that can route to it
    route_sources: HashMap<String, Vec<String>>,
}

impl WorkflowDag {
    /// Create a new workflow DAG from step definitions
    pub fn new(steps: &[StepDefinition]) -> Result<Self, DagValidationError> {
        if steps.is_empty() {
            return Err(DagValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut step_to_node = HashMap::new();
        let mut node_to_step = HashMap::new();
        let mut step_map = HashMap::new();
        let mut order = Vec::with_capacity(steps.len());

        for step in steps {
            if step_to_node.contains_key(&step.id) {
                return Err(DagValidationError::DuplicateStepId(step.id.clone()));
            }
            let node = graph.add_node(step.id.clone());
            step_to_node.insert(step.id.clone(), node);
            node_to_step.insert(node, step.id.clone());
            step_map.insert(step.id.clone(), step.clone());
            order.push(step.id.clone());
        }

        let mut route_sources: HashMap<String, Vec<String>> = HashMap::new();

        for step in steps {
            let node = step_to_node[&step.id];

            for dep_id in &step.depends_on {
                let from = step_to_node.get(dep_id).ok_or_else(|| {
                    DagValidationError::MissingDependency {
                        step: step.id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                graph.add_edge(*from, node, ());
            }

            for target in step.route_targets() {
                let to = step_to_node.get(target).ok_or_else(|| {
                    DagValidationError::UnknownRouteTarget {
                        step: step.id.clone(),
                        target: target.to_string(),
                    }
                })?;
                graph.add_edge(node, *to, ());
                route_sources
                    .entry(target.to_string())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        let dag = Self {
            graph,
            step_to_node,
            node_to_step,
            steps: step_map,
            order,
            route_sources,
        };

        dag.validate()?;

        Ok(dag)
    }

    /// Validate the DAG for cycles
    pub fn validate(&self) -> Result<(), DagValidationError> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            let cycle = self.find_cycle();
            return Err(DagValidationError::CycleDetected(cycle));
        }

        Ok(())
    }

    /// Find a cycle in the graph (for error reporting)
    fn find_cycle(&self) -> String {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in self.graph.node_indices() {
            if let Some(cycle) = self.find_cycle_util(node, &mut visited, &mut rec_stack) {
                return cycle
                    .iter()
                    .rev()
                    .map(|n| self.node_to_step[n].clone())
                    .collect::<Vec<_>>()
                    .join(" -> ");
            }
        }

        "unknown".to_string()
    }

    fn find_cycle_util(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        rec_stack: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        if rec_stack.contains(&node) {
            return Some(vec![node]);
        }

        if visited.contains(&node) {
            return None;
        }

        visited.insert(node);
        rec_stack.insert(node);

        for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(mut cycle) = self.find_cycle_util(neighbor, visited, rec_stack) {
                cycle.push(node);
                return Some(cycle);
            }
        }

        rec_stack.remove(&node);
        None
    }

    /// Steps in topological order (dependencies and route sources first)
    pub fn topological_sort(&self) -> Vec<String> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(nodes) => nodes
                .into_iter()
                .map(|node| self.node_to_step[&node].clone())
                .collect(),
            // Unreachable for a graph built through `new`
            Err(_) => self.order.clone(),
        }
    }

    pub fn get_step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.get(step_id)
    }

    /// Step ids in declaration order
    pub fn step_ids(&self) -> &[String] {
        &self.order
    }

    /// Steps that can route to `step_id`
    pub fn route_sources(&self, step_id: &str) -> &[String] {
        self.route_sources
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_branch_target(&self, step_id: &str) -> bool {
        self.route_sources.contains_key(step_id)
    }

    /// Root steps: no dependencies and not a branch target
    pub fn get_root_steps(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.steps[*id].depends_on.is_empty() && !self.is_branch_target(id)
            })
            .cloned()
            .collect()
    }

    /// Steps that list `step_id` in `depends_on`
    pub fn get_dependents(&self, step_id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.steps[*id].depends_on.iter().any(|d| d == step_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Work out which pending steps can start and which can never run.
    ///
    /// Skips propagate until a fixpoint is reached, so a skipped branch
    /// cascades into everything downstream of it in one call.
    pub fn evaluate(&self, states: &BTreeMap<String, StepState>) -> Evaluation {
        let mut status: HashMap<&str, StepStatus> = self
            .order
            .iter()
            .map(|id| {
                let s = states.get(id).map(|s| s.status).unwrap_or(StepStatus::Pending);
                (id.as_str(), s)
            })
            .collect();
        let activated = |id: &str| states.get(id).map(|s| s.activated).unwrap_or(false);

        let mut skipped = Vec::new();
        loop {
            let mut changed = false;
            for id in &self.order {
                if status[id.as_str()] != StepStatus::Pending {
                    continue;
                }
                if self.classify(id, activated(id.as_str()), &status) == Some(Readiness::Skip) {
                    status.insert(id.as_str(), StepStatus::Skipped);
                    skipped.push(id.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let ready = self
            .order
            .iter()
            .filter(|id| status[id.as_str()] == StepStatus::Pending)
            .filter(|id| self.classify(id, activated(id.as_str()), &status) == Some(Readiness::Ready))
            .cloned()
            .collect();

        Evaluation { ready, skipped }
    }

    fn classify(
        &self,
        id: &str,
        activated: bool,
        status: &HashMap<&str, StepStatus>,
    ) -> Option<Readiness> {
        let step = &self.steps[id];
        let sources = self.route_sources(id);

        if !sources.is_empty() && !activated {
            let all_sources_done = sources.iter().all(|s| status[s.as_str()].is_terminal());
            return all_sources_done.then_some(Readiness::Skip);
        }

        let deps: Vec<(&str, StepStatus)> = step
            .depends_on
            .iter()
            .map(|d| (d.as_str(), status[d.as_str()]))
            .collect();

        if step.is_merge() {
            if !deps.iter().all(|(_, s)| s.is_terminal()) {
                return None;
            }
            let any_succeeded = deps.is_empty()
                || deps.iter().any(|(_, s)| *s == StepStatus::Succeeded);
            return Some(if any_succeeded {
                Readiness::Ready
            } else {
                Readiness::Skip
            });
        }

        // A dependency that routed to this step satisfies it whatever its outcome
        let routed_from = |dep: &str| activated && sources.iter().any(|s| s == dep);

        let mut all_satisfied = true;
        for (dep, s) in &deps {
            let satisfied = match s {
                StepStatus::Succeeded => true,
                s if s.is_terminal() && routed_from(dep) => true,
                StepStatus::Failed | StepStatus::Skipped => return Some(Readiness::Skip),
                _ => false,
            };
            all_satisfied &= satisfied;
        }

        all_satisfied.then_some(Readiness::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Skip,
}
