use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::fsm::{DeleteVariableEntry, UpsertVariableEntry};
use crate::state::Table;
use caravel_common::model::{
    GenericWriteResponse, RpcError, SingleVariableResponse, VariableDeleteRequest,
    VariableListRequest, VariableListResponse, VariableMetadata, VariableReadRequest,
    VariableUpsertRequest,
};
use caravel_common::wire::MessageType;

impl RpcServer {
    /// `Var.Upsert`: writes a variable, optionally guarded by compare-and-set
    /// on its modify index.
    pub async fn variable_upsert(
        &self,
        req: VariableUpsertRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.ensure_write(&req.write)?;
        let mut variable = req.variable;
        if variable.namespace.as_str().is_empty() {
            variable.namespace = req.write.namespace.clone();
        }
        variable.validate().map_err(RpcError::Validation)?;
        let index = self
            .raft_apply(
                MessageType::UpsertVariable,
                &UpsertVariableEntry {
                    variable,
                    check_index: req.check_index,
                },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }

    /// `Var.Delete`.
    pub async fn variable_delete(
        &self,
        req: VariableDeleteRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.ensure_write(&req.write)?;
        let index = self
            .raft_apply(
                MessageType::DeleteVariable,
                &DeleteVariableEntry {
                    namespace: req.write.namespace.clone(),
                    path: req.path,
                    check_index: req.check_index,
                },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }

    /// `Var.Read`: blocking single-variable read.
    pub async fn variable_read(
        &self,
        req: VariableReadRequest,
    ) -> Result<SingleVariableResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let path = req.path.clone();
        let (variable, meta) =
            blocking_query(self, &req.query, &[Table::Variables], move |snapshot| {
                let variable = snapshot.variable(&namespace, &path).cloned();
                let index = variable
                    .as_ref()
                    .map(|v| v.modify_index)
                    .unwrap_or_else(|| snapshot.table_index(Table::Variables));
                Ok((variable, index))
            })
            .await?;
        Ok(SingleVariableResponse { variable, meta })
    }

    /// `Var.List`: blocking metadata listing, optionally under a path prefix.
    /// Payloads are not returned by listings.
    pub async fn variable_list(
        &self,
        req: VariableListRequest,
    ) -> Result<VariableListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let prefix = req.path_prefix.clone().unwrap_or_default();
        let (variables, meta) =
            blocking_query(self, &req.query, &[Table::Variables], move |snapshot| {
                let variables: Vec<VariableMetadata> = snapshot
                    .variables_in_namespace(&namespace)
                    .filter(|v| prefix.is_empty() || v.path.starts_with(&prefix))
                    .map(VariableMetadata::from)
                    .collect();
                let index = snapshot.table_index(Table::Variables);
                Ok((variables, index))
            })
            .await?;
        Ok(VariableListResponse { variables, meta })
    }
}
