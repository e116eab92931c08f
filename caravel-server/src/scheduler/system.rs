use super::feasibility::{check_node, escapes_computed_class};
use super::{FailedPlacement, PlanBuilder, Scheduler, SchedulerOutcome};
use crate::state::StateSnapshot;
use caravel_common::model::{
    Allocation, ClientStatus, EvalToken, Evaluation, JobType, NodeId,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};

/// Scheduler for `system` and `sysbatch` jobs: one allocation of each task
/// group on every eligible node, counts ignored.
pub struct SystemScheduler;

impl Scheduler for SystemScheduler {
    fn process(
        &self,
        eval: &Evaluation,
        snapshot: &StateSnapshot,
    ) -> Result<SchedulerOutcome, caravel_common::model::RpcError> {
        let now = Utc::now();
        let job = snapshot.job(&eval.namespace, &eval.job_id).cloned();
        let token = EvalToken(uuid::Uuid::nil());
        let mut builder = PlanBuilder::new(snapshot, eval, token, job.clone(), now);
        let mut failed: Vec<FailedPlacement> = Vec::new();

        let Some(job) = job else {
            for alloc in snapshot.allocs_for_job(&eval.namespace, &eval.job_id) {
                if !alloc.terminal_status() {
                    builder.stop(alloc, "alloc not needed since job was deregistered", None);
                }
            }
            return Ok(SchedulerOutcome {
                plan: builder.finish(),
                followup_evals: vec![],
                failed,
            });
        };
        if job.stop {
            for alloc in snapshot.allocs_for_job(&eval.namespace, &eval.job_id) {
                if !alloc.terminal_status() {
                    builder.stop(alloc, "alloc not needed since job was stopped", None);
                }
            }
            return Ok(SchedulerOutcome {
                plan: builder.finish(),
                followup_evals: vec![],
                failed,
            });
        }

        let is_sysbatch = job.job_type == JobType::SysBatch;
        let existing: Vec<&Allocation> = snapshot
            .allocs_for_job(&eval.namespace, &eval.job_id)
            .into_iter()
            .collect();

        for tg in &job.task_groups {
            let live: Vec<&&Allocation> = existing
                .iter()
                .filter(|alloc| alloc.task_group == tg.name && !alloc.terminal_status())
                .collect();
            let covered: HashSet<NodeId> = live.iter().map(|a| a.node_id).collect();
            // Nodes that already ran this sysbatch group to completion are
            // done, not candidates for another round.
            let completed: HashSet<NodeId> = if is_sysbatch {
                existing
                    .iter()
                    .filter(|alloc| {
                        alloc.task_group == tg.name
                            && alloc.client_status == ClientStatus::Complete
                    })
                    .map(|a| a.node_id)
                    .collect()
            } else {
                HashSet::new()
            };

            // Stop allocations on nodes that no longer qualify.
            for alloc in &live {
                match snapshot.node(&alloc.node_id) {
                    None => builder.stop(
                        alloc,
                        "alloc lost since node was deregistered",
                        Some(ClientStatus::Lost),
                    ),
                    Some(node) if check_node(&job, tg, node).is_err() => {
                        builder.stop(alloc, "node no longer eligible for system job", None);
                    }
                    Some(_) => {}
                }
            }

            // Place on every eligible node that lacks a live allocation.
            let ask = tg.combined_resources();
            let mut class_eligibility: BTreeMap<String, bool> = BTreeMap::new();
            let mut any_capacity_failure: Option<String> = None;
            for node in snapshot.nodes() {
                if covered.contains(&node.id) || completed.contains(&node.id) {
                    continue;
                }
                if check_node(&job, tg, node).is_err() {
                    continue;
                }
                let used = builder.projected_usage(&node.id);
                if let Err(dimension) = used.fits_with(&ask, &node.available_resources()) {
                    class_eligibility.insert(node.computed_class(), true);
                    any_capacity_failure =
                        Some(format!("{dimension} on node {}", node.id));
                    continue;
                }
                builder.place(&job, tg, node.id, None);
            }
            if let Some(reason) = any_capacity_failure {
                failed.push(FailedPlacement {
                    task_group: tg.name.clone(),
                    reason,
                    class_eligibility,
                    escaped: escapes_computed_class(&job, tg),
                });
            }
        }

        Ok(SchedulerOutcome {
            plan: builder.finish(),
            followup_evals: vec![],
            failed,
        })
    }
}
