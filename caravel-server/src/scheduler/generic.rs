use super::feasibility::{check_node, escapes_computed_class};
use super::rank::rank_nodes;
use super::reconcile::reconcile_task_group;
use super::{FailedPlacement, PlanBuilder, Scheduler, SchedulerOutcome};
use crate::state::StateSnapshot;
use caravel_common::model::{
    Allocation, EvalId, EvalToken, Evaluation, Job, NodePoolSchedulerConfig, Resources,
    SchedulerAlgorithm, TaskGroup, TriggeredBy,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Scheduler for `service` and `batch` jobs: a counted set of allocations
/// per task group, reconciled against current state and placed by rank.
pub struct GenericScheduler;

impl Scheduler for GenericScheduler {
    fn process(
        &self,
        eval: &Evaluation,
        snapshot: &StateSnapshot,
    ) -> Result<SchedulerOutcome, caravel_common::model::RpcError> {
        let now = Utc::now();
        let job = snapshot.job(&eval.namespace, &eval.job_id).cloned();
        let token = EvalToken(uuid::Uuid::nil());
        let mut builder = PlanBuilder::new(snapshot, eval, token, job.clone(), now);
        let mut followups: Vec<Evaluation> = Vec::new();
        let mut failed: Vec<FailedPlacement> = Vec::new();

        match job {
            None => {
                // Purged job: retire everything still tracked.
                for alloc in snapshot.allocs_for_job(&eval.namespace, &eval.job_id) {
                    if !alloc.terminal_status() {
                        builder.stop(alloc, "alloc not needed since job was deregistered", None);
                    }
                }
            }
            Some(ref job) if job.stop => {
                for alloc in snapshot.allocs_for_job(&eval.namespace, &eval.job_id) {
                    if !alloc.terminal_status() {
                        builder.stop(alloc, "alloc not needed since job was stopped", None);
                    }
                }
            }
            Some(ref job) => {
                for tg in &job.task_groups {
                    compute_task_group(
                        snapshot,
                        eval,
                        job,
                        tg,
                        &mut builder,
                        &mut followups,
                        &mut failed,
                        now,
                    );
                }
            }
        }

        Ok(SchedulerOutcome {
            plan: builder.finish(),
            followup_evals: followups,
            failed,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_task_group(
    snapshot: &StateSnapshot,
    eval: &Evaluation,
    job: &Job,
    tg: &TaskGroup,
    builder: &mut PlanBuilder<'_>,
    followups: &mut Vec<Evaluation>,
    failed: &mut Vec<FailedPlacement>,
    now: DateTime<Utc>,
) {
    let existing: Vec<&Allocation> = snapshot
        .allocs_for_job(&eval.namespace, &eval.job_id)
        .into_iter()
        .filter(|alloc| alloc.task_group == tg.name)
        .collect();
    let rec = reconcile_task_group(snapshot, job, tg, &existing, now);
    debug!(
        job_id = %job.id,
        task_group = %tg.name,
        place = rec.place.len(),
        stop = rec.stop.len(),
        disconnecting = rec.disconnecting.len(),
        reconnecting = rec.reconnecting.len(),
        ignored = rec.ignored,
        "reconciled task group"
    );

    for stop in &rec.stop {
        builder.stop(&stop.alloc, &stop.description, stop.client_status);
    }

    // Disconnecting allocations stay `unknown` but gain a timeout follow-up:
    // when the window elapses unreconciled they are marked lost by the eval
    // created here.
    if !rec.disconnecting.is_empty() {
        let earliest_expiry = rec
            .disconnecting
            .iter()
            .filter_map(|alloc| {
                let window = tg.max_client_disconnect?;
                let since = alloc.last_unknown_at()?;
                Some(since + chrono::Duration::from_std(window).unwrap_or_default())
            })
            .min();
        let mut followup = Evaluation::new(job, TriggeredBy::MaxDisconnectTimeout);
        followup.previous_eval = Some(eval.id);
        followup.wait_until = earliest_expiry;
        let followup_id = followup.id;
        followups.push(followup);

        for alloc in &rec.disconnecting {
            let mut updated = alloc.clone();
            updated.followup_eval_id = Some(followup_id);
            updated.modify_time = now;
            builder.update_in_place(updated);
        }
    }

    for request in &rec.place {
        place_one(snapshot, job, tg, builder, failed, request.previous, eval.id);
    }
}

/// Selects a node for one placement, or records the failure digest.
pub(crate) fn place_one(
    snapshot: &StateSnapshot,
    job: &Job,
    tg: &TaskGroup,
    builder: &mut PlanBuilder<'_>,
    failed: &mut Vec<FailedPlacement>,
    previous: Option<caravel_common::model::AllocId>,
    _eval_id: EvalId,
) {
    let ask = tg.combined_resources();
    let mut class_eligibility: BTreeMap<String, bool> = BTreeMap::new();
    let mut last_reason = "no nodes available".to_string();

    let mut candidates: Vec<(&caravel_common::model::Node, Resources)> = Vec::new();
    for node in snapshot.nodes() {
        if let Err(reason) = check_node(job, tg, node) {
            // Constraint-level ineligibility: more capacity in this class
            // cannot help, so the blocked tracker may keep sleeping on it.
            class_eligibility
                .entry(node.computed_class())
                .or_insert(false);
            last_reason = reason;
            continue;
        }
        // The class is eligible; a capacity miss still records `true` so a
        // node upsert in this class re-wakes the eval.
        class_eligibility.insert(node.computed_class(), true);
        let used = builder.projected_usage(&node.id);
        if let Err(dimension) = used.fits_with(&ask, &node.available_resources()) {
            last_reason = format!("{dimension} on node {}", node.id);
            continue;
        }
        candidates.push((node, used));
    }

    if candidates.is_empty() {
        failed.push(FailedPlacement {
            task_group: tg.name.clone(),
            reason: last_reason,
            class_eligibility,
            escaped: escapes_computed_class(job, tg),
        });
        return;
    }

    let algorithm = snapshot
        .node_pool(&job.node_pool)
        .and_then(|pool| pool.scheduler_config.as_ref())
        .map(|config: &NodePoolSchedulerConfig| config.scheduler_algorithm)
        .unwrap_or(SchedulerAlgorithm::Binpack);
    let ranked = rank_nodes(candidates, &ask, algorithm, &tg.affinities);
    let best = ranked[0].node;
    builder.place(job, tg, best.id, previous);
}
