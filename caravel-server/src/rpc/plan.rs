use super::RpcServer;
use caravel_common::model::{PlanSubmitRequest, PlanSubmitResponse, RpcError};

impl RpcServer {
    /// `Plan.Submit`: leader-only entry into the serialized plan-apply
    /// pipeline. The submitting worker must hold the eval's dequeue token.
    pub async fn plan_submit(&self, req: PlanSubmitRequest) -> Result<PlanSubmitResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        let result = self.plan_queue.submit(req.plan).await?;
        Ok(PlanSubmitResponse {
            result,
            index: self.raft.last_index(),
        })
    }
}
