use crate::SafeDisplay;
use serde::{Deserialize, Serialize};

/// Error taxonomy of the RPC surface. Serializable so forwarded requests can
/// carry the originating server's error back verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("ACL token not found")]
    TokenNotFound,
    #[error("ACL token expired")]
    TokenExpired,
    #[error("ACL token invalid: {0}")]
    TokenInvalid(String),
    #[error("No cluster leader")]
    NoLeader,
    #[error("No path to region '{0}'")]
    NoRegionPath(String),
    #[error("No connection to node '{0}'")]
    NoNodeConn(String),
    #[error("Node '{0}' does not support RPC")]
    NodeLacksRpc(String),
    #[error("Evaluation is not outstanding")]
    EvalNotOutstanding,
    #[error("Evaluation token does not match outstanding token")]
    EvalTokenMismatch,
    #[error("Plan requires state refresh at index {0}")]
    PlanRefresh(u64),
    #[error("State write failed: {0}")]
    StateWrite(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Ambiguous identifier '{prefix}' matched multiple items: {matches:?}")]
    AmbiguousIdentifier {
        prefix: String,
        matches: Vec<String>,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn validation(message: impl Into<String>) -> Self {
        RpcError::Validation(message.into())
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        RpcError::Internal(message.to_string())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RpcError::NotFound(message.into())
    }

    /// Routing failures the caller should retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::NoLeader | RpcError::NoRegionPath(_) | RpcError::NoNodeConn(_)
        )
    }
}

impl SafeDisplay for RpcError {
    fn to_safe_string(&self) -> String {
        match self {
            // Internal detail may embed file system paths or raw causes.
            RpcError::Internal(_) => "Internal error".to_string(),
            RpcError::StateWrite(_) => "State write failed".to_string(),
            other => other.to_string(),
        }
    }
}
