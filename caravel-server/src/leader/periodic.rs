use crate::metrics;
use crate::state::StateStore;
use async_trait::async_trait;
use caravel_common::model::{
    EvalId, Job, JobId, JobStatus, Namespace, PeriodicLaunch, RpcError,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type JobKey = (Namespace, JobId);

/// Commits a derived periodic child (job plus pending eval in one log entry)
/// and the launch bookkeeping. Implemented by the RPC server; the dispatcher
/// stays decoupled from the log machinery.
#[async_trait]
pub trait JobEvalDispatcher: Send + Sync {
    async fn dispatch_job(&self, job: Job) -> Result<EvalId, RpcError>;
    async fn record_launch(&self, launch: PeriodicLaunch) -> Result<(), RpcError>;
    async fn deregister_job(&self, namespace: Namespace, job_id: JobId) -> Result<(), RpcError>;
}

struct PeriodicInner {
    enabled: bool,
    /// Launch schedule ordered by next fire time, with a per-job index for
    /// O(log n) add/update/remove.
    schedule: BTreeSet<(DateTime<Utc>, JobKey)>,
    next_by_job: HashMap<JobKey, DateTime<Utc>>,
    tracked: HashMap<JobKey, Job>,
}

impl PeriodicInner {
    fn unschedule(&mut self, key: &JobKey) {
        if let Some(at) = self.next_by_job.remove(key) {
            self.schedule.remove(&(at, key.clone()));
        }
    }

    fn schedule_at(&mut self, key: JobKey, at: DateTime<Utc>) {
        self.unschedule(&key);
        self.schedule.insert((at, key.clone()));
        self.next_by_job.insert(key, at);
    }
}

/// Materializes time-driven instances of periodic jobs as derived children.
/// Leader-only; all in-memory schedule state flushes on leadership loss and
/// is rebuilt from the state store on gain.
pub struct PeriodicDispatcher {
    state: Arc<StateStore>,
    dispatcher: OnceLock<Arc<dyn JobEvalDispatcher>>,
    inner: Mutex<PeriodicInner>,
    update: Notify,
}

impl PeriodicDispatcher {
    pub fn new(state: Arc<StateStore>) -> Arc<PeriodicDispatcher> {
        Arc::new(PeriodicDispatcher {
            state,
            dispatcher: OnceLock::new(),
            inner: Mutex::new(PeriodicInner {
                enabled: false,
                schedule: BTreeSet::new(),
                next_by_job: HashMap::new(),
                tracked: HashMap::new(),
            }),
            update: Notify::new(),
        })
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn JobEvalDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().expect("periodic lock poisoned");
        inner.enabled = enabled;
        if !enabled {
            inner.schedule.clear();
            inner.next_by_job.clear();
            inner.tracked.clear();
        }
        drop(inner);
        self.update.notify_waiters();
    }

    /// Starts or updates tracking for a periodic job. Called from the FSM on
    /// job registration and from leadership restore.
    pub fn add(&self, job: &Job) {
        let Some(spec) = job.periodic.as_ref().filter(|p| p.enabled) else {
            self.remove(&job.namespace, &job.id);
            return;
        };
        if job.stop {
            self.remove(&job.namespace, &job.id);
            return;
        }
        let next = match spec.next(Utc::now()) {
            Ok(Some(next)) => next,
            Ok(None) => {
                warn!(job_id = %job.id, "periodic job has no future launch");
                return;
            }
            Err(err) => {
                warn!(job_id = %job.id, %err, "invalid periodic spec");
                return;
            }
        };
        let mut inner = self.inner.lock().expect("periodic lock poisoned");
        if !inner.enabled {
            return;
        }
        let key = (job.namespace.clone(), job.id.clone());
        debug!(job_id = %job.id, %next, "tracking periodic job");
        inner.tracked.insert(key.clone(), job.clone());
        inner.schedule_at(key, next);
        drop(inner);
        self.update.notify_waiters();
    }

    pub fn remove(&self, namespace: &Namespace, job_id: &JobId) {
        let mut inner = self.inner.lock().expect("periodic lock poisoned");
        let key = (namespace.clone(), job_id.clone());
        inner.unschedule(&key);
        if inner.tracked.remove(&key).is_some() {
            debug!(job_id = %job_id, "stopped tracking periodic job");
        }
        drop(inner);
        self.update.notify_waiters();
    }

    /// Rebuilds tracking from the state store on leadership gain.
    pub fn restore(&self) {
        let snapshot = self.state.snapshot();
        let jobs: Vec<Job> = snapshot
            .jobs()
            .filter(|job| job.is_periodic() && !job.stop && job.parent_id.is_none())
            .cloned()
            .collect();
        let count = jobs.len();
        for job in jobs {
            self.add(&job);
        }
        info!(count, "restored periodic jobs");
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().expect("periodic lock poisoned").tracked.len()
    }

    /// The launch loop: sleeps until the soonest launch, wakes early on
    /// add/remove, dispatches due jobs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let soonest = {
                let inner = self.inner.lock().expect("periodic lock poisoned");
                inner.schedule.iter().next().cloned()
            };
            match soonest {
                None => {
                    tokio::select! {
                        _ = self.update.notified() => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
                Some((at, key)) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.dispatch_due(&key, at).await;
                        }
                        _ = self.update.notified() => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn dispatch_due(&self, key: &JobKey, launch_time: DateTime<Utc>) {
        let job = {
            let mut inner = self.inner.lock().expect("periodic lock poisoned");
            if !inner.enabled || inner.next_by_job.get(key) != Some(&launch_time) {
                return;
            }
            let Some(job) = inner.tracked.get(key).cloned() else {
                inner.unschedule(key);
                return;
            };
            // Advance the schedule before dispatching so a dispatch failure
            // cannot wedge the loop on the same instant.
            let next = job
                .periodic
                .as_ref()
                .and_then(|spec| spec.next(launch_time).ok().flatten());
            match next {
                Some(next) => inner.schedule_at(key.clone(), next),
                None => inner.unschedule(key),
            }
            job
        };

        let Some(dispatcher) = self.dispatcher.get().cloned() else {
            warn!(job_id = %job.id, "no dispatcher wired, skipping launch");
            return;
        };

        if job
            .periodic
            .as_ref()
            .map(|p| p.prohibit_overlap)
            .unwrap_or(false)
        {
            let snapshot = self.state.snapshot();
            let running = snapshot
                .active_periodic_children(&job.namespace, &job.id)
                .next()
                .is_some();
            if running {
                metrics::PERIODIC_SKIPPED_OVERLAP.inc();
                info!(job_id = %job.id, "skipping launch, previous instance still running");
                return;
            }
        }

        // Deriving the child deep-copies an operator-supplied spec; a panic
        // here must not take down the other periodic jobs.
        let derived = catch_unwind(AssertUnwindSafe(|| derive_child(&job, launch_time)));
        let child = match derived {
            Ok(child) => child,
            Err(_) => {
                error!(job_id = %job.id, "panic deriving periodic child, deregistering job");
                self.remove(&job.namespace, &job.id);
                let _ = dispatcher
                    .deregister_job(job.namespace.clone(), job.id.clone())
                    .await;
                return;
            }
        };

        match dispatcher.dispatch_job(child).await {
            Ok(eval_id) => {
                metrics::PERIODIC_LAUNCHES.inc();
                info!(job_id = %job.id, %eval_id, launch = %launch_time, "dispatched periodic instance");
                let launch = PeriodicLaunch {
                    namespace: job.namespace.clone(),
                    job_id: job.id.clone(),
                    launch: launch_time,
                    create_index: 0,
                    modify_index: 0,
                };
                if let Err(err) = dispatcher.record_launch(launch).await {
                    warn!(job_id = %job.id, %err, "failed to record periodic launch");
                }
            }
            Err(err) => {
                warn!(job_id = %job.id, %err, "failed to dispatch periodic instance");
            }
        }
    }
}

/// Deep-copies the parent into a launch instance: derived ID carrying the
/// launch time, periodic spec cleared, parent link set.
fn derive_child(parent: &Job, launch_time: DateTime<Utc>) -> Job {
    let mut child = parent.clone();
    child.id = parent.derived_periodic_id(launch_time);
    child.parent_id = Some(parent.id.clone());
    child.periodic = None;
    child.status = JobStatus::Pending;
    child.stop = false;
    child.version = 0;
    child.create_index = 0;
    child.modify_index = 0;
    child.submit_time = launch_time;
    child
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use caravel_common::model::{
        JobType, Meta, PeriodicSpec, ReschedulePolicy, RestartPolicy, Task, TaskGroup,
        DEFAULT_JOB_PRIORITY,
    };
    use caravel_common::model::Resources;

    fn periodic_job(id: &str, cron: &str) -> Job {
        Job {
            id: JobId::new(id),
            namespace: Namespace::default(),
            name: id.to_string(),
            job_type: JobType::Batch,
            priority: DEFAULT_JOB_PRIORITY,
            datacenters: vec!["dc1".to_string()],
            node_pool: "default".to_string(),
            constraints: vec![],
            task_groups: vec![TaskGroup {
                name: "main".to_string(),
                count: 1,
                tasks: vec![Task {
                    name: "work".to_string(),
                    driver: "exec".to_string(),
                    resources: Resources::new(100, 64),
                    env: Meta::new(),
                }],
                constraints: vec![],
                affinities: vec![],
                spreads: vec![],
                networks: vec![],
                restart_policy: RestartPolicy::default(),
                reschedule_policy: ReschedulePolicy::default(),
                max_client_disconnect: None,
            }],
            periodic: Some(PeriodicSpec {
                cron: cron.to_string(),
                timezone: None,
                prohibit_overlap: false,
                enabled: true,
            }),
            parent_id: None,
            stop: false,
            status: JobStatus::Pending,
            version: 0,
            submit_time: Utc::now(),
            create_index: 1,
            modify_index: 1,
            meta: Meta::new(),
        }
    }

    #[test]
    fn derived_child_clears_periodic_and_links_parent() {
        let parent = periodic_job("report", "*/5 * * * *");
        let launch = Utc::now();
        let child = derive_child(&parent, launch);
        assert!(child.periodic.is_none());
        assert_eq!(child.parent_id.as_ref(), Some(&parent.id));
        assert_eq!(Job::periodic_launch_time(&child.id).unwrap().timestamp(), launch.timestamp());
    }

    #[test]
    async fn add_and_remove_maintain_schedule() {
        let dispatcher = PeriodicDispatcher::new(Arc::new(StateStore::new()));
        dispatcher.set_enabled(true);

        let job = periodic_job("report", "*/5 * * * *");
        dispatcher.add(&job);
        assert_eq!(dispatcher.tracked_count(), 1);

        // Re-adding updates in place rather than duplicating.
        dispatcher.add(&job);
        assert_eq!(dispatcher.tracked_count(), 1);
        {
            let inner = dispatcher.inner.lock().unwrap();
            assert_eq!(inner.schedule.len(), 1);
        }

        dispatcher.remove(&job.namespace, &job.id);
        assert_eq!(dispatcher.tracked_count(), 0);
    }

    #[test]
    async fn disabled_dispatcher_flushes_state() {
        let dispatcher = PeriodicDispatcher::new(Arc::new(StateStore::new()));
        dispatcher.set_enabled(true);
        dispatcher.add(&periodic_job("report", "*/5 * * * *"));
        dispatcher.set_enabled(false);
        assert_eq!(dispatcher.tracked_count(), 0);
    }
}
