use crate::config::ServerConfig;
use crate::leader::blocked::BlockedEvals;
use crate::leader::broker::EvalBroker;
use crate::leader::heartbeat::HeartbeatTracker;
use crate::leader::periodic::PeriodicDispatcher;
use crate::leader::plan_apply::PlanQueue;
use crate::leader::{run_leadership, LeaderComponents};
use crate::raft::{FileLogStore, LogStore, MemLogStore, RaftHandle};
use crate::rpc::auth::Authenticator;
use crate::rpc::RpcServer;
use crate::scheduler::worker::run_worker;
use crate::state::fsm::Fsm;
use crate::state::StateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A fully wired, running server core. Dropping the handle does not stop the
/// server; call [`Server::shutdown`].
pub struct Server {
    pub rpc: Arc<RpcServer>,
    shutdown: CancellationToken,
}

impl Server {
    /// Builds the component graph, restores durable state, self-elects the
    /// single-voter bootstrap, and starts the scheduler workers.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Server> {
        config
            .validate()
            .map_err(|err| anyhow::anyhow!("invalid server configuration: {err}"))?;

        let state = Arc::new(StateStore::new());
        let broker = EvalBroker::new(config.broker.clone());
        let blocked = BlockedEvals::new(broker.clone());
        let periodic = PeriodicDispatcher::new(state.clone());
        let heartbeats = HeartbeatTracker::new(config.heartbeat.clone(), state.clone());

        let fsm = Fsm::new(
            state.clone(),
            broker.clone(),
            blocked.clone(),
            periodic.clone(),
        );
        let log: Box<dyn LogStore> = match &config.data_dir {
            Some(dir) => {
                let raft_dir = dir.join("raft");
                Box::new(FileLogStore::open(&raft_dir).map_err(|err| {
                    anyhow::anyhow!("failed to open data dir {}: {err}", raft_dir.display())
                })?)
            }
            None => {
                info!("no data_dir configured, using in-memory log");
                Box::new(MemLogStore::new())
            }
        };
        let raft = RaftHandle::bootstrap(log, fsm)
            .map_err(|err| anyhow::anyhow!("failed to restore replicated log: {err}"))?;
        heartbeats.set_raft(raft.clone());

        let plan_queue = PlanQueue::new();
        let shutdown = CancellationToken::new();
        let auth = Authenticator::new(config.acl.clone(), state.clone());

        let rpc = Arc::new(RpcServer {
            config: config.clone(),
            state: state.clone(),
            raft: raft.clone(),
            broker: broker.clone(),
            blocked: blocked.clone(),
            periodic: periodic.clone(),
            heartbeats: heartbeats.clone(),
            plan_queue: plan_queue.clone(),
            auth,
            shutdown: shutdown.clone(),
        });
        periodic.set_dispatcher(rpc.clone());

        let components = Arc::new(LeaderComponents {
            config: config.clone(),
            state,
            raft: raft.clone(),
            broker,
            blocked,
            periodic,
            heartbeats,
            plan_queue,
        });
        {
            let components = components.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_leadership(components, shutdown).await });
        }

        for worker_id in 0..config.scheduler.num_schedulers {
            let rpc = rpc.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_worker(rpc, worker_id, shutdown).await });
        }

        // Single-voter bootstrap: this server is the cluster.
        raft.set_leader(true);
        info!(region = %config.region, "server started");

        Ok(Server { rpc, shutdown })
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.rpc.raft.set_leader(false);
        info!("server shut down");
    }
}
