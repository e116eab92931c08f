use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::Table;
use caravel_common::model::{
    AllocListRequest, AllocListResponse, AllocListStub, AllocSpecificRequest, RpcError,
    SingleAllocResponse,
};

impl RpcServer {
    /// `Alloc.GetAlloc`: blocking read by full UUID or unambiguous prefix.
    pub async fn alloc_get(
        &self,
        req: AllocSpecificRequest,
    ) -> Result<SingleAllocResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let alloc_id = req.alloc_id.clone();
        let (alloc, meta) = blocking_query(self, &req.query, &[Table::Allocs], move |snapshot| {
            let alloc = snapshot.alloc_by_prefix(&alloc_id)?.cloned();
            let index = alloc
                .as_ref()
                .map(|a| a.modify_index)
                .unwrap_or_else(|| snapshot.table_index(Table::Allocs));
            Ok((alloc, index))
        })
        .await?;
        Ok(SingleAllocResponse { alloc, meta })
    }

    /// `Alloc.List`: blocking namespace listing of allocation stubs.
    pub async fn alloc_list(&self, req: AllocListRequest) -> Result<AllocListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let prefix = req.prefix.clone().unwrap_or_default().to_ascii_lowercase();
        let (allocations, meta) =
            blocking_query(self, &req.query, &[Table::Allocs], move |snapshot| {
                let allocations: Vec<AllocListStub> = snapshot
                    .allocs()
                    .filter(|a| a.namespace == namespace)
                    .filter(|a| prefix.is_empty() || a.id.to_string().starts_with(&prefix))
                    .map(AllocListStub::from)
                    .collect();
                let index = snapshot.table_index(Table::Allocs);
                Ok((allocations, index))
            })
            .await?;
        Ok(AllocListResponse { allocations, meta })
    }
}
