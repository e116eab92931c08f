use super::{scheduler_for, FailedPlacement};
use crate::rpc::RpcServer;
use caravel_common::model::{
    EvalStatus, EvalToken, Evaluation, JobType, RpcError,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEQUEUE_WAIT: Duration = Duration::from_millis(500);

/// One scheduler worker: drains the broker, computes plans, submits them to
/// the leader's plan-apply pipeline, and settles the eval.
pub async fn run_worker(server: Arc<RpcServer>, worker_id: usize, shutdown: CancellationToken) {
    info!(worker_id, "scheduler worker started");
    loop {
        let dequeued = tokio::select! {
            _ = shutdown.cancelled() => break,
            dequeued = server.broker.dequeue(&JobType::ALL, DEQUEUE_WAIT) => dequeued,
        };
        let Some((eval, token)) = dequeued else {
            continue;
        };
        debug!(worker_id, eval_id = %eval.id, job_id = %eval.job_id, "processing eval");
        if let Err(err) = process_eval(&server, &eval, token).await {
            warn!(worker_id, eval_id = %eval.id, %err, "eval processing failed, nacking");
            if let Err(nack_err) = server.broker.nack(&eval.id, &token) {
                warn!(eval_id = %eval.id, %nack_err, "nack failed");
            }
        }
    }
    info!(worker_id, "scheduler worker stopped");
}

async fn process_eval(
    server: &Arc<RpcServer>,
    eval: &Evaluation,
    token: EvalToken,
) -> Result<(), RpcError> {
    let scheduler = scheduler_for(eval.job_type);
    let max_retries = server.config.scheduler.max_plan_refresh_retries;
    let mut attempt = 0u32;

    loop {
        let snapshot = server.state.snapshot();
        let mut outcome = scheduler.process(eval, &snapshot)?;
        outcome.plan.eval_token = token;
        outcome.plan.snapshot_index = snapshot.index;

        if outcome.plan.is_no_op() {
            // Nothing to change; the eval still settles (and may block).
            let blocked = build_blocked_eval(eval, &outcome.failed);
            finalize(server, eval, token, outcome.followup_evals, blocked).await?;
            return Ok(());
        }

        let result = server.plan_queue.submit(outcome.plan.clone()).await?;
        let fully_committed = result.full_commit(&outcome.plan);

        if !fully_committed && attempt < max_retries {
            // Concurrent state drift beat this plan; retry against a
            // snapshot at or past the refresh floor.
            attempt += 1;
            debug!(
                eval_id = %eval.id,
                attempt,
                refresh_index = result.refresh_index,
                "plan partially rejected, refreshing"
            );
            continue;
        }

        let mut failed = outcome.failed;
        if !fully_committed {
            failed.push(FailedPlacement {
                task_group: String::new(),
                reason: format!(
                    "placements rejected by plan apply after {attempt} retries"
                ),
                class_eligibility: Default::default(),
                escaped: false,
            });
        }
        let blocked = build_blocked_eval(eval, &failed);
        finalize(server, eval, token, outcome.followup_evals, blocked).await?;
        return Ok(());
    }
}

/// A child eval retained by the blocked tracker until capacity changes.
fn build_blocked_eval(eval: &Evaluation, failed: &[FailedPlacement]) -> Option<Evaluation> {
    if failed.is_empty() {
        return None;
    }
    let now = Utc::now();
    let mut blocked = eval.clone();
    blocked.id = caravel_common::model::EvalId::new_v4();
    blocked.status = EvalStatus::Blocked;
    blocked.status_description = failed
        .iter()
        .map(|f| {
            if f.task_group.is_empty() {
                f.reason.clone()
            } else {
                format!("{}: {}", f.task_group, f.reason)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    blocked.previous_eval = Some(eval.id);
    blocked.next_eval = None;
    blocked.blocked_eval = None;
    blocked.wait_until = None;
    blocked.snapshot_index = None;
    blocked.create_index = 0;
    blocked.modify_index = 0;
    blocked.create_time = now;
    blocked.modify_time = now;
    blocked.class_eligibility = Default::default();
    blocked.escaped_computed_class = failed.iter().any(|f| f.escaped);
    for failure in failed {
        for (class, eligible) in &failure.class_eligibility {
            let entry = blocked
                .class_eligibility
                .entry(class.clone())
                .or_insert(*eligible);
            *entry = *entry && *eligible;
        }
    }
    Some(blocked)
}

/// Persists the eval's terminal state (plus follow-ups and the blocked
/// child) and acks the broker.
async fn finalize(
    server: &Arc<RpcServer>,
    eval: &Evaluation,
    token: EvalToken,
    followups: Vec<Evaluation>,
    blocked: Option<Evaluation>,
) -> Result<(), RpcError> {
    let now = Utc::now();
    let mut updated = eval.clone();
    updated.status = EvalStatus::Complete;
    updated.modify_time = now;
    updated.snapshot_index = Some(server.state.last_index());
    if let Some(blocked) = &blocked {
        updated.blocked_eval = Some(blocked.id);
        updated.status_description = "created blocked eval for failed placements".to_string();
    }

    let mut evals = vec![updated];
    evals.extend(followups);
    if let Some(blocked) = blocked {
        evals.push(blocked);
    }
    server.commit_evals(evals).await?;

    server.broker.ack(&eval.id, &token)?;
    Ok(())
}
