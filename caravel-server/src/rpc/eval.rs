use super::blocking::blocking_query;
use super::RpcServer;
use crate::leader::broker::BrokerError;
use crate::state::Table;
use caravel_common::model::{
    EvalAckRequest, EvalDequeueRequest, EvalDequeueResponse, EvalListRequest, EvalListResponse,
    EvalSpecificRequest, GenericWriteResponse, RpcError, SingleEvalResponse,
};

impl From<BrokerError> for RpcError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotOutstanding => RpcError::EvalNotOutstanding,
            BrokerError::TokenMismatch => RpcError::EvalTokenMismatch,
        }
    }
}

impl RpcServer {
    /// `Eval.Dequeue`: scheduler-worker long poll. Blocks until an eval of a
    /// requested type is available or the timeout lapses.
    pub async fn eval_dequeue(
        &self,
        req: EvalDequeueRequest,
    ) -> Result<EvalDequeueResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        if req.schedulers.is_empty() {
            return Err(RpcError::validation("no scheduler types requested"));
        }
        let timeout = req
            .timeout
            .min(self.config.blocking_queries.max_query_time);

        let dequeued = self.broker.dequeue(&req.schedulers, timeout).await;
        let index = self.raft.last_index();
        match dequeued {
            Some((mut eval, token)) => {
                // The worker plans against at least this state index.
                eval.snapshot_index = Some(self.state.last_index());
                Ok(EvalDequeueResponse {
                    eval: Some(eval),
                    token: Some(token),
                    meta: self.query_meta(index),
                })
            }
            None => Ok(EvalDequeueResponse {
                eval: None,
                token: None,
                meta: self.query_meta(index),
            }),
        }
    }

    /// `Eval.Ack`: the worker finished processing the eval.
    pub async fn eval_ack(&self, req: EvalAckRequest) -> Result<GenericWriteResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        self.broker.ack(&req.eval_id, &req.token)?;
        Ok(GenericWriteResponse {
            index: self.raft.last_index(),
        })
    }

    /// `Eval.Nack`: the worker failed; the broker re-delivers with backoff.
    pub async fn eval_nack(&self, req: EvalAckRequest) -> Result<GenericWriteResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        self.broker.nack(&req.eval_id, &req.token)?;
        Ok(GenericWriteResponse {
            index: self.raft.last_index(),
        })
    }

    /// `Eval.Get`: blocking read; accepts a full UUID or unambiguous prefix.
    pub async fn eval_get(&self, req: EvalSpecificRequest) -> Result<SingleEvalResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let eval_id = req.eval_id.clone();
        let (eval, meta) = blocking_query(self, &req.query, &[Table::Evals], move |snapshot| {
            let eval = snapshot.eval_by_prefix(&eval_id)?.cloned();
            let index = eval
                .as_ref()
                .map(|e| e.modify_index)
                .unwrap_or_else(|| snapshot.table_index(Table::Evals));
            Ok((eval, index))
        })
        .await?;
        Ok(SingleEvalResponse { eval, meta })
    }

    /// `Eval.List`: blocking namespace listing, optionally by ID prefix.
    pub async fn eval_list(&self, req: EvalListRequest) -> Result<EvalListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let prefix = req.prefix.clone().unwrap_or_default().to_ascii_lowercase();
        let (evals, meta) = blocking_query(self, &req.query, &[Table::Evals], move |snapshot| {
            let evals: Vec<_> = snapshot
                .evals()
                .filter(|e| e.namespace == namespace)
                .filter(|e| prefix.is_empty() || e.id.to_string().starts_with(&prefix))
                .cloned()
                .collect();
            let index = snapshot.table_index(Table::Evals);
            Ok((evals, index))
        })
        .await?;
        Ok(EvalListResponse { evals, meta })
    }
}
