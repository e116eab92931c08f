use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::fsm::{DeleteNodePoolsEntry, UpsertNodePoolsEntry};
use crate::state::Table;
use caravel_common::model::{
    GenericWriteResponse, NodePoolDeleteRequest, NodePoolListRequest, NodePoolListResponse,
    NodePoolSpecificRequest, NodePoolUpsertRequest, RpcError, SingleNodePoolResponse,
};
use caravel_common::wire::MessageType;

impl RpcServer {
    /// `NodePool.List`: blocking listing, optionally by name prefix.
    pub async fn node_pool_list(
        &self,
        req: NodePoolListRequest,
    ) -> Result<NodePoolListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let prefix = req.prefix.clone().unwrap_or_default();
        let (pools, meta) = blocking_query(self, &req.query, &[Table::NodePools], move |snapshot| {
            let pools: Vec<_> = snapshot
                .node_pools()
                .filter(|p| prefix.is_empty() || p.name.starts_with(&prefix))
                .cloned()
                .collect();
            let index = snapshot.table_index(Table::NodePools);
            Ok((pools, index))
        })
        .await?;
        Ok(NodePoolListResponse { pools, meta })
    }

    /// `NodePool.GetNodePool`.
    pub async fn node_pool_get(
        &self,
        req: NodePoolSpecificRequest,
    ) -> Result<SingleNodePoolResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let name = req.name.clone();
        let (pool, meta) = blocking_query(self, &req.query, &[Table::NodePools], move |snapshot| {
            let pool = snapshot.node_pool(&name).cloned();
            let index = pool
                .as_ref()
                .map(|p| p.modify_index)
                .unwrap_or_else(|| snapshot.table_index(Table::NodePools));
            Ok((pool, index))
        })
        .await?;
        Ok(SingleNodePoolResponse { pool, meta })
    }

    /// `NodePool.UpsertNodePools`: the built-in `all` and `default` pools are
    /// immutable; the FSM records the rejection deterministically.
    pub async fn node_pool_upsert(
        &self,
        req: NodePoolUpsertRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.ensure_write(&req.write)?;
        if req.pools.is_empty() {
            return Err(RpcError::validation("no node pools given"));
        }
        for pool in &req.pools {
            pool.validate().map_err(RpcError::Validation)?;
        }
        let index = self
            .raft_apply(
                MessageType::UpsertNodePools,
                &UpsertNodePoolsEntry { pools: req.pools },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }

    /// `NodePool.DeleteNodePools`.
    pub async fn node_pool_delete(
        &self,
        req: NodePoolDeleteRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.ensure_write(&req.write)?;
        if req.names.is_empty() {
            return Err(RpcError::validation("no node pool names given"));
        }
        let index = self
            .raft_apply(
                MessageType::DeleteNodePools,
                &DeleteNodePoolsEntry { names: req.names },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }
}
