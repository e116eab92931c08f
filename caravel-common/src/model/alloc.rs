use super::{AllocId, DeploymentId, EvalId, Job, JobId, LogIndex, Namespace, NodeId, Resources};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

impl Display for DesiredStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DesiredStatus::Run => write!(f, "run"),
            DesiredStatus::Stop => write!(f, "stop"),
            DesiredStatus::Evict => write!(f, "evict"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

impl ClientStatus {
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

impl Display for ClientStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientStatus::Pending => write!(f, "pending"),
            ClientStatus::Running => write!(f, "running"),
            ClientStatus::Complete => write!(f, "complete"),
            ClientStatus::Failed => write!(f, "failed"),
            ClientStatus::Lost => write!(f, "lost"),
            ClientStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// `pending`, `running` or `dead`.
    pub state: String,
    pub failed: bool,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<TaskEvent>,
}

/// Append-only client-status transition log on an allocation. The heartbeat
/// tracker reads the most recent `unknown` entry to decide whether the
/// disconnect window has elapsed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStateTransition {
    pub client_status: ClientStatus,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub eval_id: EvalId,
    pub namespace: Namespace,
    pub job_id: JobId,
    /// Snapshot of the job at plan time; schedulers compare its version
    /// against the live job on reconnect.
    pub job: Job,
    pub task_group: String,
    pub node_id: NodeId,
    pub resources: Resources,
    pub desired_status: DesiredStatus,
    pub desired_description: String,
    pub client_status: ClientStatus,
    pub client_description: String,
    pub task_states: BTreeMap<String, TaskState>,
    pub alloc_states: Vec<AllocStateTransition>,
    pub previous_allocation: Option<AllocId>,
    pub next_allocation: Option<AllocId>,
    pub followup_eval_id: Option<EvalId>,
    pub deployment_id: Option<DeploymentId>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl Allocation {
    /// Terminal from the server's perspective: it will never run again.
    pub fn terminal_status(&self) -> bool {
        match self.desired_status {
            DesiredStatus::Stop | DesiredStatus::Evict => true,
            DesiredStatus::Run => self.client_status.terminal(),
        }
    }

    pub fn push_state(&mut self, client_status: ClientStatus, time: DateTime<Utc>) {
        self.alloc_states.push(AllocStateTransition {
            client_status,
            time,
        });
    }

    /// Timestamp of the most recent transition to `unknown`, if any.
    pub fn last_unknown_at(&self) -> Option<DateTime<Utc>> {
        self.alloc_states
            .iter()
            .rev()
            .find(|s| s.client_status == ClientStatus::Unknown)
            .map(|s| s.time)
    }

    /// Whether the disconnect window declared by the task group still covers
    /// this allocation at `now`.
    pub fn within_disconnect_window(&self, now: DateTime<Utc>) -> bool {
        let Some(window) = self
            .job
            .lookup_task_group(&self.task_group)
            .and_then(|tg| tg.max_client_disconnect)
        else {
            return false;
        };
        let since = match self.last_unknown_at() {
            Some(at) => at,
            None => return true,
        };
        let elapsed = now.signed_duration_since(since);
        elapsed.to_std().map(|e| e < window).unwrap_or(true)
    }

    pub fn apply_diff(&mut self, diff: &AllocationDiff) {
        self.desired_status = diff.desired_status;
        self.desired_description = diff.desired_description.clone();
        if diff.next_allocation.is_some() {
            self.next_allocation = diff.next_allocation;
        }
        if diff.followup_eval_id.is_some() {
            self.followup_eval_id = diff.followup_eval_id;
        }
        self.modify_time = diff.modify_time;
    }
}

/// Compact transmission form for stopped and preempted allocations in a plan
/// result. The FSM re-reads the full allocation from state and applies the
/// diff, keeping `ApplyPlanResults` log entries small.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDiff {
    pub id: AllocId,
    pub desired_status: DesiredStatus,
    pub desired_description: String,
    /// Set when the server concludes a client state on the client's behalf,
    /// e.g. `lost` after the disconnect window.
    pub client_status: Option<ClientStatus>,
    pub next_allocation: Option<AllocId>,
    pub followup_eval_id: Option<EvalId>,
    pub modify_time: DateTime<Utc>,
}

/// Listing row for `Alloc.List` and `Node.GetAllocs` summaries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocListStub {
    pub id: AllocId,
    pub eval_id: EvalId,
    pub namespace: Namespace,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    pub desired_status: DesiredStatus,
    pub client_status: ClientStatus,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl From<&Allocation> for AllocListStub {
    fn from(alloc: &Allocation) -> Self {
        AllocListStub {
            id: alloc.id,
            eval_id: alloc.eval_id,
            namespace: alloc.namespace.clone(),
            job_id: alloc.job_id.clone(),
            task_group: alloc.task_group.clone(),
            node_id: alloc.node_id,
            desired_status: alloc.desired_status,
            client_status: alloc.client_status,
            create_time: alloc.create_time,
            modify_time: alloc.modify_time,
            create_index: alloc.create_index,
            modify_index: alloc.modify_index,
        }
    }
}
