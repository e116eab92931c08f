use super::{JobId, LogIndex, Meta, Namespace, NetworkResource, Resources};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Separator between a periodic parent's ID and the launch timestamp in a
/// derived child's ID. Chosen so the launch time can be recovered by parsing
/// the child ID alone, which keeps the parent/child mapping stateless across
/// leader failover.
pub const PERIODIC_LAUNCH_SUFFIX: &str = "/periodic-";

pub const MIN_JOB_PRIORITY: i32 = 1;
pub const MAX_JOB_PRIORITY: i32 = 100;
pub const DEFAULT_JOB_PRIORITY: i32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Service,
    Batch,
    System,
    SysBatch,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Service,
        JobType::Batch,
        JobType::System,
        JobType::SysBatch,
    ];

    /// System and sysbatch jobs place one allocation per eligible node rather
    /// than a counted set.
    pub fn is_system(&self) -> bool {
        matches!(self, JobType::System | JobType::SysBatch)
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Service => write!(f, "service"),
            JobType::Batch => write!(f, "batch"),
            JobType::System => write!(f, "system"),
            JobType::SysBatch => write!(f, "sysbatch"),
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(JobType::Service),
            "batch" => Ok(JobType::Batch),
            "system" => Ok(JobType::System),
            "sysbatch" => Ok(JobType::SysBatch),
            other => Err(format!("Invalid job type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperand {
    Eq,
    Ne,
    Regex,
    Version,
    SetContains,
}

/// A single placement constraint. `l_target` is an attribute reference such
/// as `node.datacenter` or `attr.kernel.name`; an empty `l_target` with the
/// `Eq` operand is rejected at validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub l_target: String,
    pub r_target: String,
    pub operand: ConstraintOperand,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub l_target: String,
    pub r_target: String,
    pub operand: ConstraintOperand,
    /// -100..=100; negative weights repel.
    pub weight: i8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadTarget {
    pub value: String,
    pub percent: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spread {
    pub attribute: String,
    pub weight: i8,
    pub targets: Vec<SpreadTarget>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    #[default]
    Fail,
    Delay,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub mode: RestartMode,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            interval: Duration::from_secs(30 * 60),
            delay: Duration::from_secs(15),
            mode: RestartMode::Fail,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            interval: Duration::from_secs(60 * 60),
            delay: Duration::from_secs(30),
            unlimited: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicSpec {
    /// Five-field cron expression, evaluated in `timezone`.
    pub cron: String,
    pub timezone: Option<String>,
    pub prohibit_overlap: bool,
    pub enabled: bool,
}

impl PeriodicSpec {
    pub fn schedule(&self) -> Result<cron::Schedule, String> {
        // The cron crate wants a seconds field; operator specs are the
        // conventional five-field form.
        let fields = self.cron.split_whitespace().count();
        let expr = if fields == 5 {
            format!("0 {}", self.cron)
        } else {
            self.cron.clone()
        };
        cron::Schedule::from_str(&expr).map_err(|err| format!("Invalid cron '{}': {err}", self.cron))
    }

    pub fn tz(&self) -> Result<Tz, String> {
        match &self.timezone {
            None => Ok(chrono_tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| format!("Invalid timezone '{name}'")),
        }
    }

    /// Next launch strictly after `after`, in UTC.
    pub fn next(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
        let schedule = self.schedule()?;
        let tz = self.tz()?;
        let local = after.with_timezone(&tz);
        Ok(schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    pub resources: Resources,
    pub env: Meta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub tasks: Vec<Task>,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub spreads: Vec<Spread>,
    pub networks: Vec<NetworkResource>,
    pub restart_policy: RestartPolicy,
    pub reschedule_policy: ReschedulePolicy,
    /// How long allocations on a partitioned node stay `unknown` before they
    /// are marked lost. `None` means lost immediately.
    #[serde(default, with = "humantime_serde::option")]
    pub max_client_disconnect: Option<Duration>,
}

impl TaskGroup {
    /// Sum of the group's task asks, the unit the scheduler places.
    pub fn combined_resources(&self) -> Resources {
        let mut total = Resources::default();
        for task in &self.tasks {
            total.add(&task.resources);
        }
        total
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: Namespace,
    pub name: String,
    pub job_type: JobType,
    pub priority: i32,
    pub datacenters: Vec<String>,
    pub node_pool: String,
    pub constraints: Vec<Constraint>,
    pub task_groups: Vec<TaskGroup>,
    pub periodic: Option<PeriodicSpec>,
    pub parent_id: Option<JobId>,
    pub stop: bool,
    pub status: JobStatus,
    pub version: u64,
    pub submit_time: DateTime<Utc>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
    pub meta: Meta,
}

impl Job {
    pub fn is_periodic(&self) -> bool {
        self.periodic.as_ref().map(|p| p.enabled).unwrap_or(false)
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// ID of the child job materializing the launch at `launch`, truncated to
    /// whole seconds.
    pub fn derived_periodic_id(&self, launch: DateTime<Utc>) -> JobId {
        JobId(format!(
            "{}{}{}",
            self.id, PERIODIC_LAUNCH_SUFFIX, launch.timestamp(),
        ))
    }

    /// Recovers the launch time encoded in a derived periodic child ID.
    pub fn periodic_launch_time(child_id: &JobId) -> Option<DateTime<Utc>> {
        let (_, seconds) = child_id.0.rsplit_once(PERIODIC_LAUNCH_SUFFIX)?;
        let seconds: i64 = seconds.parse().ok()?;
        Utc.timestamp_opt(seconds, 0).single()
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors: Vec<String> = Vec::new();
        if self.id.as_str().is_empty() {
            errors.push("job ID must not be empty".to_string());
        }
        if !(MIN_JOB_PRIORITY..=MAX_JOB_PRIORITY).contains(&self.priority) {
            errors.push(format!(
                "job priority must be between {MIN_JOB_PRIORITY} and {MAX_JOB_PRIORITY}"
            ));
        }
        if self.datacenters.is_empty() {
            errors.push("job must specify at least one datacenter".to_string());
        }
        if self.task_groups.is_empty() {
            errors.push("job must have at least one task group".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for tg in &self.task_groups {
            if !seen.insert(tg.name.as_str()) {
                errors.push(format!("duplicate task group '{}'", tg.name));
            }
            if tg.tasks.is_empty() {
                errors.push(format!("task group '{}' has no tasks", tg.name));
            }
        }
        if let Some(periodic) = &self.periodic {
            if self.job_type != JobType::Batch && self.job_type != JobType::SysBatch {
                errors.push("periodic can only be used with batch jobs".to_string());
            }
            if let Err(err) = periodic.schedule() {
                errors.push(err);
            }
            if let Err(err) = periodic.tz() {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct JobDeregisterOptions {
    /// Remove the job from state entirely instead of marking it stopped.
    pub purge: bool,
}

/// Listing row for `Job.List`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobListStub {
    pub id: JobId,
    pub namespace: Namespace,
    pub name: String,
    pub job_type: JobType,
    pub priority: i32,
    pub status: JobStatus,
    pub stop: bool,
    pub parent_id: Option<JobId>,
    pub submit_time: DateTime<Utc>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl From<&Job> for JobListStub {
    fn from(job: &Job) -> Self {
        JobListStub {
            id: job.id.clone(),
            namespace: job.namespace.clone(),
            name: job.name.clone(),
            job_type: job.job_type,
            priority: job.priority,
            status: job.status,
            stop: job.stop,
            parent_id: job.parent_id.clone(),
            submit_time: job.submit_time,
            create_index: job.create_index,
            modify_index: job.modify_index,
        }
    }
}

/// Last-launch bookkeeping for a periodic job, persisted so launch derivation
/// is deterministic across leader failover.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodicLaunch {
    pub namespace: Namespace,
    pub job_id: JobId,
    pub launch: DateTime<Utc>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}
