use super::{AllocId, JobId, LogIndex, Namespace, NodeId, TokenId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ANONYMOUS_TOKEN_NAME: &str = "Anonymous Token";
pub const ANONYMOUS_POLICY: &str = "anonymous";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Client,
    Management,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AclToken {
    pub accessor_id: TokenId,
    pub secret_id: Uuid,
    pub name: String,
    pub token_type: TokenType,
    /// Policy names; resolution and compilation belong to the policy engine,
    /// which is an external collaborator.
    pub policies: Vec<String>,
    pub global: bool,
    pub expiration_time: Option<DateTime<Utc>>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl AclToken {
    /// The implicit token used when a request carries no secret.
    pub fn anonymous() -> AclToken {
        AclToken {
            accessor_id: TokenId(Uuid::nil()),
            secret_id: Uuid::nil(),
            name: ANONYMOUS_TOKEN_NAME.to_string(),
            token_type: TokenType::Client,
            policies: vec![ANONYMOUS_POLICY.to_string()],
            global: false,
            expiration_time: None,
            create_index: 1,
            modify_index: 1,
        }
    }

    pub fn is_management(&self) -> bool {
        self.token_type == TokenType::Management
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map(|t| t <= now).unwrap_or(false)
    }
}

/// Claims carried by a workload identity token, minted per allocation and
/// verified against the cluster keyring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadClaims {
    pub alloc_id: AllocId,
    pub job_id: JobId,
    pub namespace: Namespace,
    pub task: String,
    pub node_id: Option<NodeId>,
    /// Standard JWT expiry, seconds since the epoch.
    pub exp: i64,
    pub iat: i64,
    pub sub: String,
}
