use super::blocking::blocking_query;
use super::RpcServer;
use crate::leader::heartbeat::create_node_evals;
use crate::state::fsm::{
    DeregisterNodeEntry, UpdateAllocsFromClientEntry, UpdateNodeDrainEntry, UpdateNodeStatusEntry,
    UpsertEvalsEntry, UpsertNodeEntry,
};
use crate::state::Table;
use caravel_common::model::{
    ClientStatus, EvalId, Evaluation, GenericWriteResponse, LogIndex, NodeAllocsResponse,
    NodeDeregisterRequest, NodeListRequest, NodeListResponse, NodeListStub, NodeRegisterRequest,
    NodeSpecificRequest, NodeStatus, NodeUpdateAllocRequest, NodeUpdateDrainRequest,
    NodeUpdateResponse, NodeUpdateStatusRequest, RpcError, SingleNodeResponse, TriggeredBy,
};
use caravel_common::wire::MessageType;
use chrono::Utc;
use tracing::{debug, info};

impl RpcServer {
    /// `Node.Register`: upserts the node, arms its heartbeat, and creates
    /// evaluations when the node arrives schedulable.
    pub async fn node_register(
        &self,
        req: NodeRegisterRequest,
    ) -> Result<NodeUpdateResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;

        let mut node = req.node;
        if node.datacenter.is_empty() {
            return Err(RpcError::validation("node datacenter must not be empty"));
        }
        if node.name.is_empty() {
            return Err(RpcError::validation("node name must not be empty"));
        }
        if node.node_pool.is_empty() {
            node.node_pool = caravel_common::model::NODE_POOL_DEFAULT.to_string();
        }
        if self.state.snapshot().node_pool(&node.node_pool).is_none() {
            return Err(RpcError::validation(format!(
                "node pool '{}' does not exist",
                node.node_pool
            )));
        }

        let schedulable = node.status == NodeStatus::Ready;
        let node_id = node.id;
        let index = self
            .raft_apply(MessageType::UpsertNode, &UpsertNodeEntry { node })
            .await?;
        info!(node_id = %node_id, index, "node registered");

        let eval_ids = if schedulable {
            self.create_and_commit_node_evals(node_id, index, TriggeredBy::NodeUpdate)
                .await?
        } else {
            Vec::new()
        };

        let ttl = self.heartbeats.reset_heartbeat_timer(node_id).await;
        Ok(NodeUpdateResponse {
            eval_ids,
            heartbeat_ttl: Some(ttl),
            index: self.raft.last_index(),
        })
    }

    /// `Node.Deregister`: removes the node, clears its heartbeat, and
    /// synthesizes evals for the allocations it carried.
    pub async fn node_deregister(
        &self,
        req: NodeDeregisterRequest,
    ) -> Result<NodeUpdateResponse, RpcError> {
        self.ensure_write(&req.write)?;

        // Capture the pre-deletion view; the evals need the node's jobs.
        let before = self.state.snapshot();
        if before.node(&req.node_id).is_none() {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                req.node_id
            )));
        }

        self.heartbeats.clear_heartbeat_timer(&req.node_id);
        let index = self
            .raft_apply(
                MessageType::DeregisterNode,
                &DeregisterNodeEntry {
                    node_id: req.node_id,
                },
            )
            .await?;
        info!(node_id = %req.node_id, index, "node deregistered");

        let evals = create_node_evals(&before, &req.node_id, index, TriggeredBy::NodeUpdate);
        let eval_ids = self.commit_evals(evals).await?;
        Ok(NodeUpdateResponse {
            eval_ids,
            heartbeat_ttl: None,
            index: self.raft.last_index(),
        })
    }

    /// `Node.UpdateStatus`: drives ready/down/disconnected transitions and
    /// doubles as the heartbeat: every accepted update re-arms the TTL.
    pub async fn node_update_status(
        &self,
        req: NodeUpdateStatusRequest,
    ) -> Result<NodeUpdateResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;

        if !req.status.is_valid_transition_target() {
            return Err(RpcError::validation(format!(
                "cannot transition node to status '{}'",
                req.status
            )));
        }
        let before = self.state.snapshot();
        let Some(previous) = before.node(&req.node_id) else {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                req.node_id
            )));
        };
        let previous_status = previous.status;

        let entry = UpdateNodeStatusEntry {
            node_id: req.node_id,
            status: req.status,
            status_description: String::new(),
            node_event: req.node_event,
            timestamp: Utc::now(),
        };
        let index = self
            .raft_apply(MessageType::UpdateNodeStatus, &entry)
            .await?;
        debug!(node_id = %req.node_id, from = %previous_status, to = %req.status, "node status updated");

        // Reconnecting nodes run the reconciler under a dedicated trigger so
        // retained vs replaced allocations are decided explicitly.
        let triggered_by = match (previous_status, req.status) {
            (NodeStatus::Disconnected, NodeStatus::Ready) => Some(TriggeredBy::Reconnect),
            (from, to) if from != to => Some(TriggeredBy::NodeUpdate),
            _ => None,
        };
        let eval_ids = match triggered_by {
            Some(trigger) => {
                self.create_and_commit_node_evals(req.node_id, index, trigger)
                    .await?
            }
            None => Vec::new(),
        };

        let heartbeat_ttl = if req.status != NodeStatus::Down {
            Some(self.heartbeats.reset_heartbeat_timer(req.node_id).await)
        } else {
            self.heartbeats.clear_heartbeat_timer(&req.node_id);
            None
        };

        Ok(NodeUpdateResponse {
            eval_ids,
            heartbeat_ttl,
            index: self.raft.last_index(),
        })
    }

    /// `Node.UpdateDrain`: sets or clears the drain strategy and kicks the
    /// migration evals.
    pub async fn node_update_drain(
        &self,
        req: NodeUpdateDrainRequest,
    ) -> Result<NodeUpdateResponse, RpcError> {
        self.ensure_write(&req.write)?;

        if self.state.snapshot().node(&req.node_id).is_none() {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                req.node_id
            )));
        }
        let entry = UpdateNodeDrainEntry {
            node_id: req.node_id,
            drain: req.drain_strategy,
            mark_eligible: req.mark_eligible,
            node_event: req.node_event,
        };
        let index = self
            .raft_apply(MessageType::UpdateNodeDrain, &entry)
            .await?;
        let eval_ids = self
            .create_and_commit_node_evals(req.node_id, index, TriggeredBy::NodeDrain)
            .await?;
        Ok(NodeUpdateResponse {
            eval_ids,
            heartbeat_ttl: None,
            index: self.raft.last_index(),
        })
    }

    /// `Node.UpdateAlloc`: a client reports the observed state of exactly one
    /// allocation.
    pub async fn node_update_alloc(
        &self,
        req: NodeUpdateAllocRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;

        if req.allocs.len() != 1 {
            return Err(RpcError::validation(format!(
                "must update exactly one allocation, got {}",
                req.allocs.len()
            )));
        }
        let reported = &req.allocs[0];
        if self.auth.enabled() {
            let secret = req
                .write
                .auth_token
                .as_deref()
                .and_then(|t| uuid::Uuid::parse_str(t).ok())
                .ok_or_else(|| {
                    RpcError::PermissionDenied("node secret required".to_string())
                })?;
            self.auth.authenticate_node(&reported.node_id, &secret)?;
        }

        let snapshot = self.state.snapshot();
        let Some(existing) = snapshot.alloc(&reported.id) else {
            return Err(RpcError::not_found(format!(
                "allocation '{}' not found",
                reported.id
            )));
        };
        let job = snapshot
            .job(&existing.namespace, &existing.job_id)
            .cloned();

        let entry = UpdateAllocsFromClientEntry {
            allocs: req.allocs.clone(),
            timestamp: Utc::now(),
        };
        self.raft_apply(MessageType::UpdateAllocsFromClient, &entry)
            .await?;

        // A failure report triggers the retry path so the scheduler can
        // decide on a reschedule.
        if reported.client_status == ClientStatus::Failed {
            if let Some(job) = job.filter(|j| !j.stop) {
                let eval = Evaluation::new(&job, TriggeredBy::RetryFailed);
                self.commit_evals(vec![eval]).await?;
            }
        }
        Ok(GenericWriteResponse {
            index: self.raft.last_index(),
        })
    }

    /// `Node.GetAllocs`: blocking query for the allocations placed on a node.
    pub async fn node_get_allocs(
        &self,
        req: NodeSpecificRequest,
    ) -> Result<NodeAllocsResponse, RpcError> {
        self.ensure_read(&req.query)?;
        if self.auth.enabled() {
            if let Some(secret) = req.secret_id {
                self.auth.authenticate_node(&req.node_id, &secret)?;
            }
        }
        let node_id = req.node_id;
        let (allocs, meta) = blocking_query(self, &req.query, &[Table::Allocs], move |snapshot| {
            let allocs: Vec<_> = snapshot
                .allocs_for_node(&node_id)
                .into_iter()
                .cloned()
                .collect();
            let index = allocs
                .iter()
                .map(|a| a.modify_index)
                .max()
                .unwrap_or_else(|| snapshot.table_index(Table::Allocs));
            Ok((allocs, index))
        })
        .await?;
        Ok(NodeAllocsResponse { allocs, meta })
    }

    /// `Node.Get`: blocking single-node read.
    pub async fn node_get(&self, req: NodeSpecificRequest) -> Result<SingleNodeResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let node_id = req.node_id;
        let (node, meta) = blocking_query(self, &req.query, &[Table::Nodes], move |snapshot| {
            let node = snapshot.node(&node_id).cloned();
            let index = node
                .as_ref()
                .map(|n| n.modify_index)
                .unwrap_or_else(|| snapshot.table_index(Table::Nodes));
            Ok((node, index))
        })
        .await?;
        Ok(SingleNodeResponse { node, meta })
    }

    /// `Node.List`: blocking listing, optionally filtered by ID prefix.
    pub async fn node_list(&self, req: NodeListRequest) -> Result<NodeListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let prefix = req.prefix.clone().unwrap_or_default().to_ascii_lowercase();
        let (nodes, meta) = blocking_query(self, &req.query, &[Table::Nodes], move |snapshot| {
            let nodes: Vec<NodeListStub> = snapshot
                .nodes()
                .filter(|n| prefix.is_empty() || n.id.to_string().starts_with(&prefix))
                .map(NodeListStub::from)
                .collect();
            let index = snapshot.table_index(Table::Nodes);
            Ok((nodes, index))
        })
        .await?;
        Ok(NodeListResponse { nodes, meta })
    }

    pub(crate) async fn create_and_commit_node_evals(
        &self,
        node_id: caravel_common::model::NodeId,
        node_modify_index: LogIndex,
        triggered_by: TriggeredBy,
    ) -> Result<Vec<EvalId>, RpcError> {
        let snapshot = self.state.snapshot();
        let evals = create_node_evals(&snapshot, &node_id, node_modify_index, triggered_by);
        self.commit_evals(evals).await
    }

    pub(crate) async fn commit_evals(
        &self,
        evals: Vec<Evaluation>,
    ) -> Result<Vec<EvalId>, RpcError> {
        if evals.is_empty() {
            return Ok(Vec::new());
        }
        let ids = evals.iter().map(|e| e.id).collect();
        crate::metrics::EVALS_ENQUEUED.inc_by(evals.len() as u64);
        self.raft_apply(MessageType::UpsertEvals, &UpsertEvalsEntry { evals })
            .await?;
        Ok(ids)
    }
}
