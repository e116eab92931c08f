use super::{EvalId, Job, JobId, JobType, LogIndex, Namespace, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl EvalStatus {
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled
        )
    }
}

impl Display for EvalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::Blocked => write!(f, "blocked"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
            EvalStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    NodeDrain,
    PeriodicJob,
    RollingUpdate,
    Deployment,
    AllocStop,
    Reconnect,
    MaxDisconnectTimeout,
    FailedFollowUp,
    RetryFailed,
}

impl Display for TriggeredBy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggeredBy::JobRegister => "job-register",
            TriggeredBy::JobDeregister => "job-deregister",
            TriggeredBy::NodeUpdate => "node-update",
            TriggeredBy::NodeDrain => "node-drain",
            TriggeredBy::PeriodicJob => "periodic-job",
            TriggeredBy::RollingUpdate => "rolling-update",
            TriggeredBy::Deployment => "deployment",
            TriggeredBy::AllocStop => "alloc-stop",
            TriggeredBy::Reconnect => "reconnect",
            TriggeredBy::MaxDisconnectTimeout => "max-disconnect-timeout",
            TriggeredBy::FailedFollowUp => "failed-follow-up",
            TriggeredBy::RetryFailed => "retry-failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: Namespace,
    pub job_id: JobId,
    pub priority: i32,
    /// Which scheduler type processes this eval; copied from the job.
    pub job_type: JobType,
    pub triggered_by: TriggeredBy,
    pub status: EvalStatus,
    pub status_description: String,
    pub previous_eval: Option<EvalId>,
    pub next_eval: Option<EvalId>,
    pub blocked_eval: Option<EvalId>,
    /// Computed-class digests this blocked eval already found exhausted.
    pub class_eligibility: BTreeMap<String, bool>,
    /// Set when the job's constraints reference attributes outside the class
    /// digest, so any node change may unblock it.
    pub escaped_computed_class: bool,
    pub node_id: Option<NodeId>,
    pub node_modify_index: Option<LogIndex>,
    /// State index the scheduler snapshotted at dequeue time.
    pub snapshot_index: Option<LogIndex>,
    /// Do not dequeue before this time (failed-follow-up scheduling).
    pub wait_until: Option<DateTime<Utc>>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(job: &Job, triggered_by: TriggeredBy) -> Self {
        let now = Utc::now();
        Evaluation {
            id: EvalId::new_v4(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            priority: job.priority,
            job_type: job.job_type,
            triggered_by,
            status: EvalStatus::Pending,
            status_description: String::new(),
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            node_id: None,
            node_modify_index: None,
            snapshot_index: None,
            wait_until: None,
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    /// An eval the broker should offer to schedulers.
    pub fn should_enqueue(&self) -> bool {
        self.status == EvalStatus::Pending
    }

    /// An eval the blocked tracker should retain.
    pub fn should_block(&self) -> bool {
        self.status == EvalStatus::Blocked
    }

    pub fn terminal(&self) -> bool {
        self.status.terminal()
    }
}
