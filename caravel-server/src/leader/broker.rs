use crate::config::BrokerConfig;
use caravel_common::model::{
    EvalId, EvalToken, Evaluation, JobId, JobType, LogIndex, Namespace,
};
use chrono::Utc;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

type JobKey = (Namespace, JobId);

#[derive(Clone, Debug)]
struct QueuedEval {
    priority: i32,
    create_index: LogIndex,
    eval: Evaluation,
}

impl PartialEq for QueuedEval {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.create_index == other.create_index
    }
}

impl Eq for QueuedEval {}

impl Ord for QueuedEval {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO by create index.
        self.priority
            .cmp(&other.priority)
            .then(other.create_index.cmp(&self.create_index))
    }
}

impl PartialOrd for QueuedEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Outstanding {
    eval: Evaluation,
    token: EvalToken,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_waiting: usize,
    pub total_failed: usize,
}

struct BrokerInner {
    enabled: bool,
    ready: BTreeMap<JobType, BinaryHeap<QueuedEval>>,
    unack: HashMap<EvalId, Outstanding>,
    /// Jobs currently serialized: either an eval is unacked or it is parked
    /// in a nack backoff. Value is the eval holding the lock.
    outstanding_jobs: HashMap<JobKey, EvalId>,
    /// Evals for a locked job, waiting their turn.
    waiting_by_job: HashMap<JobKey, Vec<Evaluation>>,
    delivery_counts: HashMap<EvalId, u32>,
    /// Evals past the delivery limit, awaiting the leader's failure reaper.
    failed: VecDeque<Evaluation>,
}

/// Priority queue of pending evaluations, partitioned by scheduler type with
/// per-job dequeue serialization: at most one eval per (namespace, job) is
/// outstanding at a time. Leader-only; disabled brokers drop everything.
pub struct EvalBroker {
    config: BrokerConfig,
    inner: Mutex<BrokerInner>,
    notify: Notify,
    /// Invalidates in-flight backoff and wait-until timers across
    /// enable/disable cycles.
    generation: AtomicU64,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Arc<EvalBroker> {
        Arc::new(EvalBroker {
            config,
            inner: Mutex::new(BrokerInner {
                enabled: false,
                ready: BTreeMap::new(),
                unack: HashMap::new(),
                outstanding_jobs: HashMap::new(),
                waiting_by_job: HashMap::new(),
                delivery_counts: HashMap::new(),
                failed: VecDeque::new(),
            }),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
        if !enabled {
            inner.ready.clear();
            inner.unack.clear();
            inner.outstanding_jobs.clear();
            inner.waiting_by_job.clear();
            inner.delivery_counts.clear();
            inner.failed.clear();
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn enabled(&self) -> bool {
        self.inner.lock().expect("broker lock poisoned").enabled
    }

    /// Offers an eval for scheduling. Wait-until evals are parked until due;
    /// evals for a locked job wait for the outstanding one to settle.
    pub fn enqueue(self: &Arc<Self>, eval: Evaluation) {
        if let Some(wait_until) = eval.wait_until {
            let delay = wait_until.signed_duration_since(Utc::now());
            if let Ok(delay) = delay.to_std() {
                if !delay.is_zero() {
                    self.enqueue_after(eval, delay);
                    return;
                }
            }
        }
        self.enqueue_now(eval);
    }

    fn enqueue_after(self: &Arc<Self>, eval: Evaluation, delay: Duration) {
        if !self.enabled() {
            return;
        }
        let broker = Arc::clone(self);
        let generation = self.generation.load(AtomicOrdering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if broker.generation.load(AtomicOrdering::SeqCst) == generation {
                broker.enqueue_now(eval);
            }
        });
    }

    fn enqueue_now(self: &Arc<Self>, eval: Evaluation) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if !inner.enabled {
            return;
        }
        if inner.unack.contains_key(&eval.id) {
            return;
        }
        let job_key = (eval.namespace.clone(), eval.job_id.clone());
        if inner.outstanding_jobs.contains_key(&job_key) {
            trace!(eval_id = %eval.id, job_id = %eval.job_id, "job locked, eval waits");
            let waiting = inner.waiting_by_job.entry(job_key).or_default();
            if !waiting.iter().any(|w| w.id == eval.id) {
                waiting.push(eval);
            }
            return;
        }
        Self::push_ready(&mut inner, eval);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn push_ready(inner: &mut BrokerInner, eval: Evaluation) {
        let heap = inner.ready.entry(eval.job_type).or_default();
        if heap.iter().any(|q| q.eval.id == eval.id) {
            return;
        }
        heap.push(QueuedEval {
            priority: eval.priority,
            create_index: eval.create_index,
            eval,
        });
    }

    /// Blocks until an eval of one of the requested scheduler types is
    /// available, or the timeout elapses.
    pub async fn dequeue(
        &self,
        types: &[JobType],
        timeout: Duration,
    ) -> Option<(Evaluation, EvalToken)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_dequeue(types) {
                return Some(result);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.try_dequeue(types);
                }
            }
        }
    }

    fn try_dequeue(&self, types: &[JobType]) -> Option<(Evaluation, EvalToken)> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if !inner.enabled {
            return None;
        }
        // Pick the best-priority eval across the requested partitions.
        let best_type = types
            .iter()
            .filter_map(|t| inner.ready.get(t).and_then(|h| h.peek()).map(|q| (*t, q.clone())))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(t, _)| t)?;
        let queued = inner.ready.get_mut(&best_type)?.pop()?;
        let eval = queued.eval;
        let token = EvalToken::new_v4();
        let job_key = (eval.namespace.clone(), eval.job_id.clone());
        inner.outstanding_jobs.insert(job_key, eval.id);
        *inner.delivery_counts.entry(eval.id).or_insert(0) += 1;
        inner.unack.insert(
            eval.id,
            Outstanding {
                eval: eval.clone(),
                token,
            },
        );
        debug!(eval_id = %eval.id, job_id = %eval.job_id, "eval dequeued");
        Some((eval, token))
    }

    /// Token presented by the current holder of an outstanding eval, used by
    /// plan-apply to reject stale submissions.
    pub fn outstanding_token(&self, eval_id: &EvalId) -> Option<EvalToken> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        inner.unack.get(eval_id).map(|o| o.token)
    }

    /// Positive acknowledgement: the eval reached a terminal or blocked
    /// state. Releases the job lock and promotes the next waiter.
    pub fn ack(self: &Arc<Self>, eval_id: &EvalId, token: &EvalToken) -> Result<(), BrokerError> {
        let next = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let outstanding = inner.unack.get(eval_id).ok_or(BrokerError::NotOutstanding)?;
            if &outstanding.token != token {
                return Err(BrokerError::TokenMismatch);
            }
            let outstanding = inner.unack.remove(eval_id).expect("checked above");
            inner.delivery_counts.remove(eval_id);
            let job_key = (
                outstanding.eval.namespace.clone(),
                outstanding.eval.job_id.clone(),
            );
            inner.outstanding_jobs.remove(&job_key);
            Self::promote_waiter(&mut inner, &job_key)
        };
        if let Some(eval) = next {
            self.enqueue_now(eval);
        }
        Ok(())
    }

    /// Negative acknowledgement: re-deliver after backoff, or fail the eval
    /// once the delivery limit is reached.
    pub fn nack(self: &Arc<Self>, eval_id: &EvalId, token: &EvalToken) -> Result<(), BrokerError> {
        let (eval, deliveries) = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let outstanding = inner.unack.get(eval_id).ok_or(BrokerError::NotOutstanding)?;
            if &outstanding.token != token {
                return Err(BrokerError::TokenMismatch);
            }
            let outstanding = inner.unack.remove(eval_id).expect("checked above");
            let deliveries = inner.delivery_counts.get(eval_id).copied().unwrap_or(1);
            (outstanding.eval, deliveries)
        };

        if deliveries >= self.config.delivery_limit {
            let next = {
                let mut inner = self.inner.lock().expect("broker lock poisoned");
                inner.delivery_counts.remove(eval_id);
                let job_key = (eval.namespace.clone(), eval.job_id.clone());
                inner.outstanding_jobs.remove(&job_key);
                inner.failed.push_back(eval);
                Self::promote_waiter(&mut inner, &job_key)
            };
            if let Some(eval) = next {
                self.enqueue_now(eval);
            }
            return Ok(());
        }

        // Exponential backoff; the job stays locked so no other eval for it
        // can slip in ahead of the retry.
        let exp = deliveries.saturating_sub(1).min(16);
        let backoff = self
            .config
            .nack_initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.nack_max_backoff);
        let broker = Arc::clone(self);
        let generation = self.generation.load(AtomicOrdering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if broker.generation.load(AtomicOrdering::SeqCst) != generation {
                return;
            }
            let mut inner = broker.inner.lock().expect("broker lock poisoned");
            if !inner.enabled {
                return;
            }
            let job_key = (eval.namespace.clone(), eval.job_id.clone());
            inner.outstanding_jobs.remove(&job_key);
            Self::push_ready(&mut inner, eval);
            drop(inner);
            broker.notify.notify_waiters();
        });
        Ok(())
    }

    fn promote_waiter(inner: &mut BrokerInner, job_key: &JobKey) -> Option<Evaluation> {
        let waiting = inner.waiting_by_job.get_mut(job_key)?;
        if waiting.is_empty() {
            inner.waiting_by_job.remove(job_key);
            return None;
        }
        // Highest priority, then oldest.
        let best = waiting
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.priority, std::cmp::Reverse(e.create_index)))
            .map(|(i, _)| i)
            .expect("non-empty");
        let eval = waiting.remove(best);
        if waiting.is_empty() {
            inner.waiting_by_job.remove(job_key);
        }
        Some(eval)
    }

    /// Evals that exhausted their delivery limit, handed to the failure
    /// reaper which persists the failed status and schedules follow-ups.
    pub fn drain_failed(&self) -> Vec<Evaluation> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.failed.drain(..).collect()
    }

    /// Jittered delay for a failed-follow-up eval.
    pub fn followup_delay(&self) -> Duration {
        let jitter = self.config.failed_followup_jitter.as_millis() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter)
        };
        self.config.failed_followup_baseline + Duration::from_millis(extra)
    }

    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock().expect("broker lock poisoned");
        BrokerStats {
            total_ready: inner.ready.values().map(|h| h.len()).sum(),
            total_unacked: inner.unack.len(),
            total_waiting: inner.waiting_by_job.values().map(|v| v.len()).sum(),
            total_failed: inner.failed.len(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("evaluation is not outstanding")]
    NotOutstanding,
    #[error("evaluation token does not match")]
    TokenMismatch,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use caravel_common::model::{EvalStatus, TriggeredBy};
    use chrono::Utc;

    fn eval(job: &str, priority: i32, create_index: LogIndex) -> Evaluation {
        let now = Utc::now();
        Evaluation {
            id: EvalId::new_v4(),
            namespace: Namespace::default(),
            job_id: JobId::new(job),
            priority,
            job_type: JobType::Batch,
            triggered_by: TriggeredBy::JobRegister,
            status: EvalStatus::Pending,
            status_description: String::new(),
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            class_eligibility: Default::default(),
            escaped_computed_class: false,
            node_id: None,
            node_modify_index: None,
            snapshot_index: None,
            wait_until: None,
            create_index,
            modify_index: create_index,
            create_time: now,
            modify_time: now,
        }
    }

    fn test_broker() -> Arc<EvalBroker> {
        let broker = EvalBroker::new(BrokerConfig {
            delivery_limit: 2,
            nack_initial_backoff: Duration::from_millis(10),
            nack_max_backoff: Duration::from_millis(50),
            failed_followup_baseline: Duration::from_millis(100),
            failed_followup_jitter: Duration::from_millis(50),
        });
        broker.set_enabled(true);
        broker
    }

    #[test]
    async fn dequeue_orders_by_priority_then_fifo() {
        let broker = test_broker();
        broker.enqueue(eval("low", 10, 1));
        broker.enqueue(eval("high", 90, 2));
        broker.enqueue(eval("mid", 50, 3));

        let (first, t1) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.job_id.as_str(), "high");
        broker.ack(&first.id, &t1).unwrap();

        let (second, t2) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.job_id.as_str(), "mid");
        broker.ack(&second.id, &t2).unwrap();
    }

    #[test]
    async fn per_job_evals_are_serialized() {
        let broker = test_broker();
        broker.enqueue(eval("job1", 50, 1));
        broker.enqueue(eval("job1", 50, 2));

        let (first, token) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();

        // The second eval for job1 must wait for the first to be acked.
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await
            .is_none());
        assert_eq!(broker.stats().total_waiting, 1);

        broker.ack(&first.id, &token).unwrap();
        let (second, _) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.job_id.as_str(), "job1");
        assert_ne!(second.id, first.id);
    }

    #[test]
    async fn ack_requires_matching_token() {
        let broker = test_broker();
        broker.enqueue(eval("job1", 50, 1));
        let (eval, _token) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();
        let wrong = EvalToken::new_v4();
        assert_eq!(
            broker.ack(&eval.id, &wrong),
            Err(BrokerError::TokenMismatch)
        );
        assert_eq!(
            broker.ack(&EvalId::new_v4(), &wrong),
            Err(BrokerError::NotOutstanding)
        );
    }

    #[test]
    async fn nack_redelivers_then_fails_at_limit() {
        let broker = test_broker();
        broker.enqueue(eval("job1", 50, 1));

        let (first, token) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(1))
            .await
            .unwrap();
        broker.nack(&first.id, &token).unwrap();

        // Redelivered after backoff.
        let (second, token) = broker
            .dequeue(&[JobType::Batch], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);

        // Delivery limit is 2: the next nack fails the eval.
        broker.nack(&second.id, &token).unwrap();
        let failed = broker.drain_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, first.id);
    }

    #[test]
    async fn dequeue_blocks_until_enqueue() {
        let broker = test_broker();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .dequeue(&[JobType::Batch], Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.enqueue(eval("job1", 50, 1));
        let result = waiter.await.unwrap();
        assert!(result.is_some());
    }

    #[test]
    async fn disabled_broker_drops_state() {
        let broker = test_broker();
        broker.enqueue(eval("job1", 50, 1));
        broker.set_enabled(false);
        assert_eq!(broker.stats().total_ready, 0);
        broker.enqueue(eval("job2", 50, 2));
        assert_eq!(broker.stats().total_ready, 0);
    }

    #[test]
    async fn wait_until_parks_eval() {
        let broker = test_broker();
        let mut parked = eval("job1", 50, 1);
        parked.wait_until = Some(Utc::now() + chrono::Duration::milliseconds(80));
        broker.enqueue(parked);

        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(20))
            .await
            .is_none());
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_secs(2))
            .await
            .is_some());
    }
}
