use crate::config::ServerConfig;
use crate::leader::blocked::BlockedEvals;
use crate::leader::broker::EvalBroker;
use crate::leader::heartbeat::HeartbeatTracker;
use crate::leader::periodic::{JobEvalDispatcher, PeriodicDispatcher};
use crate::leader::plan_apply::PlanQueue;
use crate::raft::RaftHandle;
use crate::state::fsm::{DeregisterJobEntry, RegisterJobEntry, UpsertPeriodicLaunchEntry};
use crate::state::StateStore;
use async_trait::async_trait;
use auth::{AuthIdentity, Authenticator};
use caravel_common::model::{
    EvalId, Evaluation, Job, JobId, JobStatus, LogIndex, Namespace, PeriodicLaunch, QueryMeta,
    QueryOptions, RpcError, TriggeredBy, WriteRequest,
};
use caravel_common::wire::MessageType;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod auth;
pub mod blocking;

mod alloc;
mod eval;
mod job;
mod node;
mod node_pool;
mod plan;
mod search;
mod service_registration;
mod variable;

/// The typed RPC surface of the server. The HTTP/wire gateway in front of it
/// is an external collaborator; handlers here receive already-decoded
/// requests and run authenticate → authorize → forward-or-serve.
pub struct RpcServer {
    pub config: ServerConfig,
    pub state: Arc<StateStore>,
    pub raft: Arc<RaftHandle>,
    pub broker: Arc<EvalBroker>,
    pub blocked: Arc<BlockedEvals>,
    pub periodic: Arc<PeriodicDispatcher>,
    pub heartbeats: Arc<HeartbeatTracker>,
    pub plan_queue: Arc<PlanQueue>,
    pub auth: Authenticator,
    pub shutdown: CancellationToken,
}

impl RpcServer {
    /// Requests for another region would be forwarded by the gateway's
    /// region router; a request arriving here for elsewhere has no path.
    pub(crate) fn check_region(&self, region: &str) -> Result<(), RpcError> {
        if region.is_empty() || region == self.config.region {
            Ok(())
        } else {
            Err(RpcError::NoRegionPath(region.to_string()))
        }
    }

    pub(crate) fn ensure_leader(&self) -> Result<(), RpcError> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(RpcError::NoLeader)
        }
    }

    /// Write path: region route, leader check, authentication, write
    /// authorization.
    pub(crate) fn ensure_write(&self, write: &WriteRequest) -> Result<AuthIdentity, RpcError> {
        self.check_region(&write.region)?;
        self.ensure_leader()?;
        let identity = self.auth.authenticate(write.auth_token.as_deref())?;
        self.auth.authorize_write(&identity)?;
        Ok(identity)
    }

    /// Read path: region route, authentication; consistent reads require the
    /// leader unless the caller allows stale data.
    pub(crate) fn ensure_read(&self, query: &QueryOptions) -> Result<AuthIdentity, RpcError> {
        self.check_region(&query.region)?;
        if !query.allow_stale {
            self.ensure_leader()?;
        }
        self.auth.authenticate(query.auth_token.as_deref())
    }

    /// Appends a log entry and surfaces its deterministic business outcome.
    pub(crate) async fn raft_apply<T: Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<LogIndex, RpcError> {
        let (index, outcome) = self
            .raft
            .apply(message_type, payload)
            .await
            .map_err(crate::raft::raft_error_to_rpc)?;
        outcome?;
        Ok(index)
    }

    pub(crate) fn query_meta(&self, index: LogIndex) -> QueryMeta {
        QueryMeta {
            index: index.max(1),
            known_leader: self.raft.is_leader(),
        }
    }
}

/// The periodic dispatcher commits launches through the server so child job
/// and eval land in one log entry.
#[async_trait]
impl JobEvalDispatcher for RpcServer {
    async fn dispatch_job(&self, mut job: Job) -> Result<EvalId, RpcError> {
        self.ensure_leader()?;
        job.status = JobStatus::Pending;
        job.submit_time = chrono::Utc::now();
        let eval = Evaluation::new(&job, TriggeredBy::PeriodicJob);
        let eval_id = eval.id;
        let entry = RegisterJobEntry {
            job,
            eval: Some(eval),
        };
        self.raft_apply(MessageType::RegisterJob, &entry).await?;
        Ok(eval_id)
    }

    async fn record_launch(&self, launch: PeriodicLaunch) -> Result<(), RpcError> {
        self.raft_apply(
            MessageType::UpsertPeriodicLaunch,
            &UpsertPeriodicLaunchEntry { launch },
        )
        .await?;
        Ok(())
    }

    async fn deregister_job(&self, namespace: Namespace, job_id: JobId) -> Result<(), RpcError> {
        let entry = DeregisterJobEntry {
            namespace,
            job_id,
            purge: false,
            eval: None,
        };
        self.raft_apply(MessageType::DeregisterJob, &entry).await?;
        Ok(())
    }
}
