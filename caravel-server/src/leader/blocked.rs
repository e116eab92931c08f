use super::broker::EvalBroker;
use caravel_common::model::{EvalId, Evaluation, JobId, LogIndex, Namespace};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

type JobKey = (Namespace, JobId);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockedStats {
    pub total_blocked: usize,
    pub total_escaped: usize,
}

#[derive(Clone)]
struct ClassDemand {
    count: u64,
    last_change: Instant,
}

struct BlockedInner {
    enabled: bool,
    captured: HashMap<EvalId, Evaluation>,
    by_job: HashMap<JobKey, EvalId>,
    escaped: HashSet<EvalId>,
    /// Blocked demand per computed class, for metrics and backpressure.
    class_demand: HashMap<String, ClassDemand>,
    /// Older blocked evals superseded by a newer one for the same job; the
    /// leader cancels these.
    duplicates: Vec<Evaluation>,
}

/// Retains evaluations that could not fully place due to capacity, and
/// re-enqueues them when a state change could free the blocker: node upsert,
/// node becoming ready, drain release.
pub struct BlockedEvals {
    broker: Arc<EvalBroker>,
    inner: Mutex<BlockedInner>,
}

impl BlockedEvals {
    pub fn new(broker: Arc<EvalBroker>) -> Arc<BlockedEvals> {
        Arc::new(BlockedEvals {
            broker,
            inner: Mutex::new(BlockedInner {
                enabled: false,
                captured: HashMap::new(),
                by_job: HashMap::new(),
                escaped: HashSet::new(),
                class_demand: HashMap::new(),
                duplicates: Vec::new(),
            }),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().expect("blocked lock poisoned");
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if !enabled {
            inner.captured.clear();
            inner.by_job.clear();
            inner.escaped.clear();
            inner.class_demand.clear();
            inner.duplicates.clear();
        }
    }

    /// Tracks a blocked eval. At most one blocked eval is retained per job;
    /// an older one is superseded and queued for cancellation.
    pub fn block(&self, eval: Evaluation) {
        let mut inner = self.inner.lock().expect("blocked lock poisoned");
        if !inner.enabled {
            return;
        }
        let job_key = (eval.namespace.clone(), eval.job_id.clone());
        if let Some(previous_id) = inner.by_job.insert(job_key, eval.id) {
            if previous_id != eval.id {
                if let Some(previous) = inner.captured.remove(&previous_id) {
                    inner.escaped.remove(&previous_id);
                    inner.duplicates.push(previous);
                }
            }
        }
        if eval.escaped_computed_class {
            inner.escaped.insert(eval.id);
        }
        let now = Instant::now();
        for (class, eligible) in &eval.class_eligibility {
            if !eligible {
                let demand = inner
                    .class_demand
                    .entry(class.clone())
                    .or_insert(ClassDemand {
                        count: 0,
                        last_change: now,
                    });
                demand.count += 1;
                demand.last_change = now;
            }
        }
        debug!(eval_id = %eval.id, job_id = %eval.job_id, "eval blocked on capacity");
        inner.captured.insert(eval.id, eval);
    }

    /// Forgets a blocked eval without re-enqueueing (deleted or superseded
    /// elsewhere).
    pub fn untrack(&self, eval_id: &EvalId) {
        let mut inner = self.inner.lock().expect("blocked lock poisoned");
        if let Some(eval) = inner.captured.remove(eval_id) {
            inner.escaped.remove(eval_id);
            let job_key = (eval.namespace.clone(), eval.job_id.clone());
            if inner.by_job.get(&job_key) == Some(eval_id) {
                inner.by_job.remove(&job_key);
            }
            Self::release_demand(&mut inner, &eval);
        }
    }

    /// A node of `computed_class` changed in a way that may free capacity.
    /// Re-enqueues every eval that did not explicitly rule the class out,
    /// plus all escaped evals (their constraints depend on attributes the
    /// class digest does not capture).
    pub fn unblock(&self, computed_class: &str, index: LogIndex) {
        let to_run = {
            let mut inner = self.inner.lock().expect("blocked lock poisoned");
            if !inner.enabled {
                return;
            }
            let ids: Vec<EvalId> = inner
                .captured
                .values()
                .filter(|eval| {
                    inner.escaped.contains(&eval.id)
                        || eval
                            .class_eligibility
                            .get(computed_class)
                            .copied()
                            .unwrap_or(true)
                })
                .map(|eval| eval.id)
                .collect();
            let mut evals = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(eval) = inner.captured.remove(&id) {
                    inner.escaped.remove(&id);
                    let job_key = (eval.namespace.clone(), eval.job_id.clone());
                    if inner.by_job.get(&job_key) == Some(&id) {
                        inner.by_job.remove(&job_key);
                    }
                    Self::release_demand(&mut inner, &eval);
                    evals.push(eval);
                }
            }
            evals
        };
        for eval in to_run {
            debug!(eval_id = %eval.id, index, computed_class, "unblocking eval");
            self.broker.enqueue(eval);
        }
    }

    fn release_demand(inner: &mut BlockedInner, eval: &Evaluation) {
        let now = Instant::now();
        for (class, eligible) in &eval.class_eligibility {
            if !eligible {
                if let Some(demand) = inner.class_demand.get_mut(class) {
                    demand.count = demand.count.saturating_sub(1);
                    demand.last_change = now;
                }
            }
        }
    }

    /// Superseded evals awaiting cancellation by the leader.
    pub fn drain_duplicates(&self) -> Vec<Evaluation> {
        let mut inner = self.inner.lock().expect("blocked lock poisoned");
        std::mem::take(&mut inner.duplicates)
    }

    /// Drops zero-valued per-class demand entries that have not changed since
    /// `older_than`.
    pub fn prune(&self, older_than: Instant) {
        let mut inner = self.inner.lock().expect("blocked lock poisoned");
        inner
            .class_demand
            .retain(|_, demand| demand.count > 0 || demand.last_change >= older_than);
    }

    pub fn stats(&self) -> BlockedStats {
        let inner = self.inner.lock().expect("blocked lock poisoned");
        BlockedStats {
            total_blocked: inner.captured.len(),
            total_escaped: inner.escaped.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::BrokerConfig;
    use caravel_common::model::{EvalStatus, JobType, TriggeredBy};
    use chrono::Utc;
    use std::time::Duration;

    fn blocked_eval(job: &str, exhausted_class: Option<&str>, escaped: bool) -> Evaluation {
        let now = Utc::now();
        let mut class_eligibility = std::collections::BTreeMap::new();
        if let Some(class) = exhausted_class {
            class_eligibility.insert(class.to_string(), false);
        }
        Evaluation {
            id: EvalId::new_v4(),
            namespace: Namespace::default(),
            job_id: JobId::new(job),
            priority: 50,
            job_type: JobType::Service,
            triggered_by: TriggeredBy::JobRegister,
            status: EvalStatus::Blocked,
            status_description: String::new(),
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            class_eligibility,
            escaped_computed_class: escaped,
            node_id: None,
            node_modify_index: None,
            snapshot_index: None,
            wait_until: None,
            create_index: 1,
            modify_index: 1,
            create_time: now,
            modify_time: now,
        }
    }

    fn tracker() -> (Arc<EvalBroker>, Arc<BlockedEvals>) {
        let broker = EvalBroker::new(BrokerConfig::default());
        broker.set_enabled(true);
        let blocked = BlockedEvals::new(broker.clone());
        blocked.set_enabled(true);
        (broker, blocked)
    }

    #[test]
    async fn unblock_matching_class_requeues() {
        let (broker, blocked) = tracker();
        blocked.block(blocked_eval("job1", Some("v1:dc1:default:"), false));
        assert_eq!(blocked.stats().total_blocked, 1);

        // The class the eval ruled out as ineligible does not wake it.
        blocked.unblock("v1:dc1:default:", 10);
        assert_eq!(blocked.stats().total_blocked, 1);

        // A class the eval never ruled out does.
        blocked.unblock("v1:dc1:other:", 11);
        assert_eq!(blocked.stats().total_blocked, 0);
        assert_eq!(broker.stats().total_ready, 1);
    }

    #[test]
    async fn escaped_evals_wake_on_any_class() {
        let (broker, blocked) = tracker();
        blocked.block(blocked_eval("job1", Some("v1:dc1:default:"), true));
        assert_eq!(blocked.stats().total_escaped, 1);

        blocked.unblock("v1:dc1:default:", 10);
        assert_eq!(blocked.stats().total_blocked, 0);
        assert_eq!(broker.stats().total_ready, 1);
    }

    #[test]
    async fn duplicate_blocked_evals_collapse_per_job() {
        let (_broker, blocked) = tracker();
        let first = blocked_eval("job1", None, false);
        let second = blocked_eval("job1", None, false);
        blocked.block(first.clone());
        blocked.block(second);
        assert_eq!(blocked.stats().total_blocked, 1);
        let duplicates = blocked.drain_duplicates();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].id, first.id);
    }

    #[test]
    async fn prune_drops_stale_zero_demand() {
        let (_broker, blocked) = tracker();
        let eval = blocked_eval("job1", Some("v1:dc1:default:"), false);
        let id = eval.id;
        blocked.block(eval);
        blocked.untrack(&id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        blocked.prune(Instant::now());
        let inner = blocked.inner.lock().unwrap();
        assert!(inner.class_demand.is_empty());
    }
}
