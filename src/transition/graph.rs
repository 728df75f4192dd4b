//! Transition graph model.
//!
//! A graph is a set of synapses: each gates a batch of output actions on a
//! set of input actions that must be confirmed first. The policy engine
//! computes graphs; this module validates and tracks them while the engine
//! executes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use serde::Deserialize;

/// What kind of work an action represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// An operation on a resource, executed by a node's executor.
    Resource,
    /// No I/O; confirmed the moment it is runnable.
    Pseudo,
    /// Multicast to peers (e.g. a shutdown request).
    ClusterWide,
    /// Handed to the fencing coordinator.
    Fencing,
}

/// Mutable status of one action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Waiting,
    InFlight,
    Confirmed,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Confirmed | ActionStatus::Failed)
    }
}

/// One action of the graph.
#[derive(Clone, Debug)]
pub struct Action {
    pub id: u32,
    pub kind: ActionKind,
    pub target: Option<String>,
    pub task: String,
    pub timeout_ms: u64,
    pub rsc_id: Option<String>,
    pub interval_ms: u32,
    /// The rc this action must produce to be considered successful.
    pub target_rc: i32,
    pub params: HashMap<String, String>,
    /// Cluster-wide ops: confirm rather than fail when the ack timer
    /// expires.
    pub confirm_on_timeout: bool,
    pub status: ActionStatus,
    /// Set when dispatched.
    pub deadline: Option<Instant>,
}

/// Execution state of a synapse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SynapseState {
    /// Inputs not yet satisfied.
    Pending,
    /// Outputs dispatched, awaiting confirmation.
    Ready,
    /// Done, possibly with a tolerated or fatal failure.
    Confirmed,
}

/// One synapse: an AND of inputs gating an AND of outputs.
#[derive(Clone, Debug)]
pub struct Synapse {
    pub id: u32,
    pub priority: i32,
    /// Ids of actions elsewhere in the graph that must confirm first.
    pub inputs: Vec<u32>,
    pub actions: Vec<Action>,
    pub state: SynapseState,
    pub failed: bool,
    pub failure_tolerated: bool,
}

/// Validation errors for incoming graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    DuplicateActionId(u32),
    UnknownInput { synapse: u32, action: u32 },
    Cycle,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateActionId(id) => {
                write!(f, "Graph reuses action id {}", id)
            }
            GraphError::UnknownInput { synapse, action } => write!(
                f,
                "Synapse {} gates on action {} which is not in the graph",
                synapse, action
            ),
            GraphError::Cycle => write!(f, "Graph contains a cycle"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Wire form of an action, as emitted by the policy engine.
#[derive(Clone, Debug, Deserialize)]
pub struct ActionInput {
    pub id: u32,
    pub kind: ActionKind,
    #[serde(default)]
    pub target: Option<String>,
    pub task: String,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub rsc_id: Option<String>,
    #[serde(default)]
    pub interval_ms: u32,
    #[serde(default)]
    pub target_rc: i32,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub confirm_on_timeout: bool,
}

fn default_timeout() -> u64 {
    20_000
}

/// Wire form of a synapse.
#[derive(Clone, Debug, Deserialize)]
pub struct SynapseInput {
    pub id: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub inputs: Vec<u32>,
    pub actions: Vec<ActionInput>,
    #[serde(default)]
    pub failure_tolerated: bool,
}

/// Wire form of a whole graph.
#[derive(Clone, Debug, Deserialize)]
pub struct GraphInput {
    pub id: u32,
    #[serde(default)]
    pub batch_limit: u32,
    pub synapses: Vec<SynapseInput>,
}

/// A validated transition graph under execution.
#[derive(Debug)]
pub struct Graph {
    pub id: u32,
    pub synapses: Vec<Synapse>,
    /// 0 means unlimited.
    pub batch_limit: u32,
    pub abort_priority: i32,
    pub complete: bool,
}

impl Graph {
    /// Validate and adopt a graph from the policy engine. Synapses are
    /// ordered by descending priority.
    pub fn from_input(input: GraphInput) -> Result<Self, GraphError> {
        let mut action_ids = HashSet::new();
        for synapse in &input.synapses {
            for action in &synapse.actions {
                if !action_ids.insert(action.id) {
                    return Err(GraphError::DuplicateActionId(action.id));
                }
            }
        }
        for synapse in &input.synapses {
            for input_id in &synapse.inputs {
                if !action_ids.contains(input_id) {
                    return Err(GraphError::UnknownInput {
                        synapse: synapse.id,
                        action: *input_id,
                    });
                }
            }
        }
        Self::check_acyclic(&input)?;

        let mut synapses: Vec<Synapse> = input
            .synapses
            .into_iter()
            .map(|s| Synapse {
                id: s.id,
                priority: s.priority,
                inputs: s.inputs,
                actions: s
                    .actions
                    .into_iter()
                    .map(|a| Action {
                        id: a.id,
                        kind: a.kind,
                        target: a.target,
                        task: a.task,
                        timeout_ms: a.timeout_ms,
                        rsc_id: a.rsc_id,
                        interval_ms: a.interval_ms,
                        target_rc: a.target_rc,
                        params: a.params,
                        confirm_on_timeout: a.confirm_on_timeout,
                        status: ActionStatus::Waiting,
                        deadline: None,
                    })
                    .collect(),
                state: SynapseState::Pending,
                failed: false,
                failure_tolerated: s.failure_tolerated,
            })
            .collect();
        synapses.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Graph {
            id: input.id,
            synapses,
            batch_limit: input.batch_limit,
            abort_priority: 0,
            complete: false,
        })
    }

    /// Kahn's toposort over the synapse dependency relation.
    fn check_acyclic(input: &GraphInput) -> Result<(), GraphError> {
        // Which synapse produces each action.
        let mut producer: HashMap<u32, u32> = HashMap::new();
        for synapse in &input.synapses {
            for action in &synapse.actions {
                producer.insert(action.id, synapse.id);
            }
        }

        let mut indegree: HashMap<u32, usize> = HashMap::new();
        let mut edges: HashMap<u32, Vec<u32>> = HashMap::new();
        for synapse in &input.synapses {
            indegree.entry(synapse.id).or_insert(0);
            for input_id in &synapse.inputs {
                let from = producer[input_id];
                if from == synapse.id {
                    return Err(GraphError::Cycle);
                }
                edges.entry(from).or_default().push(synapse.id);
                *indegree.entry(synapse.id).or_insert(0) += 1;
            }
        }

        let mut queue: Vec<u32> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(next) = edges.get(&id) {
                for n in next {
                    let d = indegree.get_mut(n).expect("indegree entry");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(*n);
                    }
                }
            }
        }
        if visited != input.synapses.len() {
            return Err(GraphError::Cycle);
        }
        Ok(())
    }

    pub fn action(&self, id: u32) -> Option<&Action> {
        self.synapses
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| a.id == id)
    }

    pub fn action_mut(&mut self, id: u32) -> Option<&mut Action> {
        self.synapses
            .iter_mut()
            .flat_map(|s| s.actions.iter_mut())
            .find(|a| a.id == id)
    }

    /// Priority of the synapse owning an action.
    pub fn synapse_priority(&self, action_id: u32) -> i32 {
        self.synapses
            .iter()
            .find(|s| s.actions.iter().any(|a| a.id == action_id))
            .map(|s| s.priority)
            .unwrap_or(0)
    }

    fn confirmed_action_ids(&self) -> HashSet<u32> {
        self.synapses
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.status == ActionStatus::Confirmed)
            .map(|a| a.id)
            .collect()
    }

    fn failed_action_ids(&self) -> HashSet<u32> {
        self.synapses
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.status == ActionStatus::Failed)
            .map(|a| a.id)
            .collect()
    }

    /// All inputs satisfied? A failed input still satisfies a synapse
    /// that tolerates input failures; it must not wait forever on a
    /// confirmation that will never come.
    pub fn synapse_ready(&self, synapse: &Synapse) -> bool {
        let confirmed = self.confirmed_action_ids();
        let failed = self.failed_action_ids();
        synapse.inputs.iter().all(|id| {
            confirmed.contains(id) || (synapse.failure_tolerated && failed.contains(id))
        })
    }

    /// Any input failed?
    pub fn synapse_input_failed(&self, synapse: &Synapse) -> bool {
        let failed = self.failed_action_ids();
        synapse.inputs.iter().any(|id| failed.contains(id))
    }

    /// Re-derive synapse states after an action changed. Returns true if
    /// the graph just became complete.
    pub fn update(&mut self) -> bool {
        for i in 0..self.synapses.len() {
            if self.synapses[i].state != SynapseState::Ready {
                continue;
            }
            let all_terminal = self.synapses[i]
                .actions
                .iter()
                .all(|a| a.status.is_terminal());
            if !all_terminal {
                continue;
            }
            let any_failed = self.synapses[i]
                .actions
                .iter()
                .any(|a| a.status == ActionStatus::Failed);
            self.synapses[i].state = SynapseState::Confirmed;
            self.synapses[i].failed = any_failed;
        }

        if !self.complete
            && self
                .synapses
                .iter()
                .all(|s| s.state == SynapseState::Confirmed)
        {
            self.complete = true;
            return true;
        }
        false
    }

    pub fn confirm_action(&mut self, id: u32) -> bool {
        match self.action_mut(id) {
            Some(action) if !action.status.is_terminal() => {
                action.status = ActionStatus::Confirmed;
                true
            }
            _ => false,
        }
    }

    pub fn fail_action(&mut self, id: u32) -> bool {
        match self.action_mut(id) {
            Some(action) if !action.status.is_terminal() => {
                action.status = ActionStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Actions dispatched but not yet terminal.
    pub fn in_flight_count(&self) -> usize {
        self.synapses
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.status == ActionStatus::InFlight)
            .count()
    }

    /// Unconfirmed actions of a given kind (used when the fencer drops).
    pub fn unconfirmed_of_kind(&self, kind: ActionKind) -> Vec<u32> {
        self.synapses
            .iter()
            .filter(|s| s.state != SynapseState::Confirmed)
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.kind == kind && !a.status.is_terminal())
            .map(|a| a.id)
            .collect()
    }

    /// Did any synapse confirm with a failure?
    pub fn any_failures(&self) -> bool {
        self.synapses.iter().any(|s| s.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: u32, kind: ActionKind, task: &str) -> ActionInput {
        ActionInput {
            id,
            kind,
            target: Some("node1".to_string()),
            task: task.to_string(),
            timeout_ms: 60_000,
            rsc_id: Some("db".to_string()),
            interval_ms: 0,
            target_rc: 0,
            params: HashMap::new(),
            confirm_on_timeout: false,
        }
    }

    fn two_step_graph() -> GraphInput {
        GraphInput {
            id: 1,
            batch_limit: 0,
            synapses: vec![
                SynapseInput {
                    id: 0,
                    priority: 0,
                    inputs: vec![],
                    actions: vec![action(1, ActionKind::Resource, "stop")],
                    failure_tolerated: false,
                },
                SynapseInput {
                    id: 1,
                    priority: 0,
                    inputs: vec![1],
                    actions: vec![action(2, ActionKind::Resource, "start")],
                    failure_tolerated: false,
                },
            ],
        }
    }

    #[test]
    fn test_validation_accepts_wellformed() {
        let graph = Graph::from_input(two_step_graph()).unwrap();
        assert_eq!(graph.id, 1);
        assert_eq!(graph.synapses.len(), 2);
        assert!(!graph.complete);
    }

    #[test]
    fn test_duplicate_action_id_rejected() {
        let mut input = two_step_graph();
        input.synapses[1].actions[0].id = 1;
        assert_eq!(
            Graph::from_input(input).unwrap_err(),
            GraphError::DuplicateActionId(1)
        );
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut input = two_step_graph();
        input.synapses[1].inputs = vec![99];
        assert_eq!(
            Graph::from_input(input).unwrap_err(),
            GraphError::UnknownInput { synapse: 1, action: 99 }
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let mut input = two_step_graph();
        // Synapse 0 now also gates on synapse 1's action.
        input.synapses[0].inputs = vec![2];
        assert_eq!(Graph::from_input(input).unwrap_err(), GraphError::Cycle);
    }

    #[test]
    fn test_readiness_follows_confirmation() {
        let mut graph = Graph::from_input(two_step_graph()).unwrap();
        let second = graph.synapses.iter().find(|s| s.id == 1).cloned().unwrap();
        assert!(!graph.synapse_ready(&second));

        graph.confirm_action(1);
        assert!(graph.synapse_ready(&second));
    }

    #[test]
    fn test_completion_with_tolerated_failure() {
        let mut input = two_step_graph();
        input.synapses[0].failure_tolerated = true;
        let mut graph = Graph::from_input(input).unwrap();

        // Fire both synapses' bookkeeping by hand.
        for synapse in &mut graph.synapses {
            synapse.state = SynapseState::Ready;
        }
        graph.fail_action(1);
        graph.confirm_action(2);
        assert!(graph.update());
        assert!(graph.complete);
        assert!(graph.any_failures());
    }

    #[test]
    fn test_tolerated_failed_input_satisfies_readiness() {
        let mut input = two_step_graph();
        input.synapses[1].failure_tolerated = true;
        let mut graph = Graph::from_input(input).unwrap();

        graph.fail_action(1);
        let second = graph.synapses.iter().find(|s| s.id == 1).cloned().unwrap();
        assert!(graph.synapse_ready(&second));

        // Without the tolerance the same failure blocks readiness.
        let mut strict = Graph::from_input(two_step_graph()).unwrap();
        strict.fail_action(1);
        let second = strict.synapses.iter().find(|s| s.id == 1).cloned().unwrap();
        assert!(!strict.synapse_ready(&second));
        assert!(strict.synapse_input_failed(&second));
    }

    #[test]
    fn test_confirm_is_idempotent_and_terminal() {
        let mut graph = Graph::from_input(two_step_graph()).unwrap();
        assert!(graph.confirm_action(1));
        assert!(!graph.confirm_action(1));
        // Terminal states never flip.
        assert!(!graph.fail_action(1));
        assert_eq!(graph.action(1).unwrap().status, ActionStatus::Confirmed);
    }

    #[test]
    fn test_priority_ordering() {
        let mut input = two_step_graph();
        input.synapses[0].priority = 1;
        input.synapses[1].priority = 10;
        input.synapses[1].inputs = vec![];
        let graph = Graph::from_input(input).unwrap();
        assert_eq!(graph.synapses[0].id, 1);
    }

    #[test]
    fn test_unconfirmed_of_kind() {
        let mut input = two_step_graph();
        input.synapses[1].actions[0].kind = ActionKind::Fencing;
        let graph = Graph::from_input(input).unwrap();
        assert_eq!(graph.unconfirmed_of_kind(ActionKind::Fencing), vec![2]);
        assert!(graph.unconfirmed_of_kind(ActionKind::ClusterWide).is_empty());
    }
}
