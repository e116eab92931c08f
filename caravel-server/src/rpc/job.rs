use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::fsm::{DeregisterJobEntry, RegisterJobEntry};
use crate::state::Table;
use caravel_common::model::{
    Evaluation, Job, JobDeregisterRequest, JobDeregisterResponse, JobListRequest, JobListResponse,
    JobListStub, JobRegisterRequest, JobRegisterResponse, JobSpecificRequest, JobStatus, RpcError,
    SingleJobResponse, TriggeredBy,
};
use caravel_common::wire::MessageType;
use chrono::Utc;
use tracing::info;

/// Whether two versions of a job describe the same specification. Server
/// bookkeeping (indices, status, version, submit time) is ignored: an
/// identical re-register must not bump the version, so the reconciler sees a
/// no-op.
fn spec_equal(a: &Job, b: &Job) -> bool {
    a.name == b.name
        && a.job_type == b.job_type
        && a.priority == b.priority
        && a.datacenters == b.datacenters
        && a.node_pool == b.node_pool
        && a.constraints == b.constraints
        && a.task_groups == b.task_groups
        && a.periodic == b.periodic
        && a.meta == b.meta
}

impl RpcServer {
    /// `Job.Register`: validates and commits a job, creating its evaluation
    /// in the same log entry. Periodic parents get no eval; the dispatcher
    /// launches their children.
    pub async fn job_register(
        &self,
        req: JobRegisterRequest,
    ) -> Result<JobRegisterResponse, RpcError> {
        self.ensure_write(&req.write)?;

        let mut job = req.job;
        if job.namespace.as_str().is_empty() {
            job.namespace = req.write.namespace.clone();
        }
        if job.node_pool.is_empty() {
            job.node_pool = caravel_common::model::NODE_POOL_DEFAULT.to_string();
        }
        job.validate().map_err(RpcError::Validation)?;
        if self.state.snapshot().node_pool(&job.node_pool).is_none() {
            return Err(RpcError::validation(format!(
                "node pool '{}' does not exist",
                job.node_pool
            )));
        }

        let snapshot = self.state.snapshot();
        let existing = snapshot.job(&job.namespace, &job.id);
        if let Some(enforce_index) = req.enforce_index {
            let current = existing.map(|j| j.modify_index).unwrap_or(0);
            if current != enforce_index {
                return Err(RpcError::validation(format!(
                    "enforce_index {enforce_index} does not match current job modify index {current}"
                )));
            }
        }

        match existing {
            Some(existing) if spec_equal(existing, &job) => {
                job.version = existing.version;
            }
            Some(existing) => {
                job.version = existing.version + 1;
            }
            None => {
                job.version = 0;
            }
        }
        job.stop = false;
        job.status = JobStatus::Pending;
        job.submit_time = Utc::now();

        let eval = if job.is_periodic() {
            None
        } else {
            Some(Evaluation::new(&job, TriggeredBy::JobRegister))
        };
        let eval_id = eval.as_ref().map(|e| e.id);
        let job_id = job.id.clone();

        let entry = RegisterJobEntry { job, eval };
        let index = self.raft_apply(MessageType::RegisterJob, &entry).await?;
        info!(job_id = %job_id, index, eval = ?eval_id, "job registered");

        Ok(JobRegisterResponse {
            eval_id,
            job_modify_index: index,
            warnings: String::new(),
            index,
        })
    }

    /// `Job.Deregister`: stops (or purges) a job and creates the eval that
    /// retires its allocations.
    pub async fn job_deregister(
        &self,
        req: JobDeregisterRequest,
    ) -> Result<JobDeregisterResponse, RpcError> {
        self.ensure_write(&req.write)?;

        let namespace = req.write.namespace.clone();
        let snapshot = self.state.snapshot();
        let Some(job) = snapshot.job(&namespace, &req.job_id) else {
            return Err(RpcError::not_found(format!(
                "job '{}' not found in namespace '{}'",
                req.job_id, namespace
            )));
        };

        // Periodic parents have no allocations of their own to retire.
        let eval = if job.is_periodic() {
            None
        } else {
            let mut eval = Evaluation::new(job, TriggeredBy::JobDeregister);
            eval.status_description = String::new();
            Some(eval)
        };
        let eval_id = eval.as_ref().map(|e| e.id);

        let entry = DeregisterJobEntry {
            namespace,
            job_id: req.job_id.clone(),
            purge: req.options.purge,
            eval,
        };
        let index = self.raft_apply(MessageType::DeregisterJob, &entry).await?;
        info!(job_id = %req.job_id, index, purge = req.options.purge, "job deregistered");

        Ok(JobDeregisterResponse {
            eval_id,
            index,
        })
    }

    /// `Job.Get`: blocking single-job read.
    pub async fn job_get(&self, req: JobSpecificRequest) -> Result<SingleJobResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let job_id = req.job_id.clone();
        let (job, meta) = blocking_query(self, &req.query, &[Table::Jobs], move |snapshot| {
            let job = snapshot.job(&namespace, &job_id).cloned();
            let index = job
                .as_ref()
                .map(|j| j.modify_index)
                .unwrap_or_else(|| snapshot.table_index(Table::Jobs));
            Ok((job, index))
        })
        .await?;
        Ok(SingleJobResponse { job, meta })
    }

    /// `Job.List`: blocking listing of the namespace, optionally by prefix.
    pub async fn job_list(&self, req: JobListRequest) -> Result<JobListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let prefix = req.prefix.clone().unwrap_or_default();
        let (jobs, meta) = blocking_query(self, &req.query, &[Table::Jobs], move |snapshot| {
            let jobs: Vec<JobListStub> = snapshot
                .jobs_in_namespace(&namespace)
                .filter(|job| prefix.is_empty() || job.id.as_str().starts_with(&prefix))
                .map(JobListStub::from)
                .collect();
            let index = snapshot.table_index(Table::Jobs);
            Ok((jobs, index))
        })
        .await?;
        Ok(JobListResponse { jobs, meta })
    }
}
