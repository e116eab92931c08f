use super::{
    Allocation, AllocationDiff, DeploymentId, EvalId, EvalToken, Job, JobId, JobVersion, LogIndex,
    Namespace, NodeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Successful,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub namespace: Namespace,
    pub job_id: JobId,
    pub job_version: JobVersion,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub status_description: String,
}

/// A scheduler's proposed outcome for one evaluation. Transient and
/// leader-only: plans are never written to the log, only their committed
/// subset is (as [`ApplyPlanResultsRequest`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub eval_token: EvalToken,
    pub priority: i32,
    /// Reject the whole plan if any node rejects, instead of committing the
    /// feasible subset.
    pub all_at_once: bool,
    pub job: Option<Job>,
    /// Allocations to create or update in place, by target node.
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to stop or evict, by current node.
    pub node_update: BTreeMap<NodeId, Vec<AllocationDiff>>,
    /// Allocations preempted to make room, by current node.
    pub node_preemptions: BTreeMap<NodeId, Vec<AllocationDiff>>,
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// State index the scheduler planned against.
    pub snapshot_index: LogIndex,
}

impl Plan {
    pub fn is_no_op(&self) -> bool {
        self.node_allocation.is_empty()
            && self.node_update.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }
}

/// The subset of a plan the leader actually committed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanResult {
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_update: BTreeMap<NodeId, Vec<AllocationDiff>>,
    pub node_preemptions: BTreeMap<NodeId, Vec<AllocationDiff>>,
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// When any node was rejected: the state index the scheduler should
    /// re-snapshot at (or after) before retrying.
    pub refresh_index: LogIndex,
    /// Index of the committed `ApplyPlanResults` entry; 0 for no-op results.
    pub alloc_index: LogIndex,
}

impl PlanResult {
    /// A full commit placed everything the plan asked for.
    pub fn full_commit(&self, plan: &Plan) -> bool {
        let proposed: usize = plan.node_allocation.values().map(|a| a.len()).sum();
        let committed: usize = self.node_allocation.values().map(|a| a.len()).sum();
        proposed == committed
    }
}

/// Replicated log payload committing a plan result. Stops and preemptions are
/// diffs; the FSM materializes them against current state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplyPlanResultsRequest {
    pub eval_id: EvalId,
    pub job: Option<Job>,
    pub allocs_updated: Vec<Allocation>,
    /// Sorted by allocation ID before encoding so replicas apply in identical
    /// order.
    pub allocs_stopped: Vec<AllocationDiff>,
    pub allocs_preempted: Vec<AllocationDiff>,
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    pub snapshot_index: LogIndex,
}
