use crate::config::AclConfig;
use crate::state::StateStore;
use caravel_common::model::{AclToken, NodeId, RpcError, WorkloadClaims};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Who a request is acting as, after authentication.
#[derive(Clone, Debug)]
pub enum AuthIdentity {
    /// ACL checks are off; every request is trusted.
    AclDisabled,
    Token(AclToken),
    /// The configured leader secret; implicit management rights.
    Leader,
    Claims(WorkloadClaims),
    Node(NodeId),
}

impl AuthIdentity {
    pub fn is_management(&self) -> bool {
        match self {
            AuthIdentity::AclDisabled | AuthIdentity::Leader => true,
            AuthIdentity::Token(token) => token.is_management(),
            AuthIdentity::Claims(_) | AuthIdentity::Node(_) => false,
        }
    }
}

/// Resolves request credentials against the token table, the configured
/// leader secret, and the workload-claims keyring. Compiled tokens are held
/// in a fixed-capacity LRU so hot paths skip the state lookup.
pub struct Authenticator {
    config: AclConfig,
    state: Arc<StateStore>,
    cache: Mutex<LruCache<Uuid, AclToken>>,
}

impl Authenticator {
    pub fn new(config: AclConfig, state: Arc<StateStore>) -> Authenticator {
        let capacity = NonZeroUsize::new(config.token_cache_size.max(1)).expect("non-zero");
        Authenticator {
            config,
            state,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// External-client path: ACL secret (UUID), workload claim (JWT), or
    /// nothing (anonymous).
    pub fn authenticate(&self, auth_token: Option<&str>) -> Result<AuthIdentity, RpcError> {
        if !self.config.enabled {
            return Ok(AuthIdentity::AclDisabled);
        }
        let Some(raw) = auth_token.filter(|t| !t.is_empty()) else {
            return Ok(AuthIdentity::Token(AclToken::anonymous()));
        };

        if let Ok(secret) = Uuid::parse_str(raw) {
            if self.config.leader_token == Some(secret) {
                return Ok(AuthIdentity::Leader);
            }
            return self.resolve_secret(secret).map(AuthIdentity::Token);
        }

        // Not UUID-shaped: treat as a workload identity claim.
        self.verify_claims(raw).map(AuthIdentity::Claims)
    }

    /// Node identity: the per-node secret proves the caller is that node,
    /// valid until the node is deregistered.
    pub fn authenticate_node(&self, node_id: &NodeId, secret: &Uuid) -> Result<(), RpcError> {
        if !self.config.enabled {
            return Ok(());
        }
        let snapshot = self.state.snapshot();
        let node = snapshot
            .node(node_id)
            .ok_or_else(|| RpcError::PermissionDenied(format!("unknown node '{node_id}'")))?;
        if &node.secret_id != secret {
            return Err(RpcError::PermissionDenied(
                "node secret does not match".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_secret(&self, secret: Uuid) -> Result<AclToken, RpcError> {
        let now = Utc::now();
        {
            let mut cache = self.cache.lock().expect("acl cache lock poisoned");
            if let Some(token) = cache.get(&secret) {
                if token.is_expired(now) {
                    cache.pop(&secret);
                    return Err(RpcError::TokenExpired);
                }
                return Ok(token.clone());
            }
        }
        let snapshot = self.state.snapshot();
        let token = snapshot
            .acl_token_by_secret(&secret)
            .ok_or(RpcError::TokenNotFound)?
            .clone();
        if token.is_expired(now) {
            return Err(RpcError::TokenExpired);
        }
        self.cache
            .lock()
            .expect("acl cache lock poisoned")
            .put(secret, token.clone());
        Ok(token)
    }

    fn verify_claims(&self, raw: &str) -> Result<WorkloadClaims, RpcError> {
        let Some(secret) = self.config.claims_hmac_secret.as_deref() else {
            return Err(RpcError::TokenInvalid(
                "workload claims are not configured".to_string(),
            ));
        };
        let key = DecodingKey::from_secret(secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let claims = jsonwebtoken::decode::<WorkloadClaims>(raw, &key, &validation)
            .map_err(|err| RpcError::TokenInvalid(err.to_string()))?
            .claims;

        // A claim is only as alive as its allocation.
        let snapshot = self.state.snapshot();
        let alloc = snapshot
            .alloc(&claims.alloc_id)
            .ok_or_else(|| RpcError::TokenInvalid("allocation no longer exists".to_string()))?;
        if alloc.terminal_status() {
            return Err(RpcError::TokenInvalid(
                "allocation is terminal".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Write authorization: management rights, or everything when ACLs are
    /// off. Fine-grained policy evaluation belongs to the policy engine.
    pub fn authorize_write(&self, identity: &AuthIdentity) -> Result<(), RpcError> {
        if identity.is_management() {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied(
                "write requires management privileges".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::state::StateStore;
    use caravel_common::model::{TokenId, TokenType};
    use chrono::Duration as ChronoDuration;

    fn seeded_state(token: &AclToken) -> Arc<StateStore> {
        let state = Arc::new(StateStore::new());
        let mut txn = state.begin();
        txn.upsert_acl_token(token.clone());
        state.commit(txn, 5);
        state
    }

    fn client_token() -> AclToken {
        AclToken {
            accessor_id: TokenId::new_v4(),
            secret_id: Uuid::new_v4(),
            name: "ci".to_string(),
            token_type: TokenType::Client,
            policies: vec!["readonly".to_string()],
            global: false,
            expiration_time: None,
            create_index: 5,
            modify_index: 5,
        }
    }

    #[test]
    fn disabled_acls_trust_everything() {
        let auth = Authenticator::new(AclConfig::default(), Arc::new(StateStore::new()));
        let identity = auth.authenticate(Some("anything")).unwrap();
        assert!(identity.is_management());
    }

    #[test]
    fn secret_resolves_to_token() {
        let token = client_token();
        let state = seeded_state(&token);
        let config = AclConfig {
            enabled: true,
            ..AclConfig::default()
        };
        let auth = Authenticator::new(config, state);

        let identity = auth
            .authenticate(Some(&token.secret_id.to_string()))
            .unwrap();
        match identity {
            AuthIdentity::Token(resolved) => assert_eq!(resolved.accessor_id, token.accessor_id),
            other => panic!("unexpected identity {other:?}"),
        }

        assert_eq!(
            auth.authenticate(Some(&Uuid::new_v4().to_string()))
                .unwrap_err(),
            RpcError::TokenNotFound
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mut token = client_token();
        token.expiration_time = Some(Utc::now() - ChronoDuration::seconds(10));
        let state = seeded_state(&token);
        let config = AclConfig {
            enabled: true,
            ..AclConfig::default()
        };
        let auth = Authenticator::new(config, state);
        assert_eq!(
            auth.authenticate(Some(&token.secret_id.to_string()))
                .unwrap_err(),
            RpcError::TokenExpired
        );
    }

    #[test]
    fn leader_secret_grants_management() {
        let leader = Uuid::new_v4();
        let config = AclConfig {
            enabled: true,
            leader_token: Some(leader),
            ..AclConfig::default()
        };
        let auth = Authenticator::new(config, Arc::new(StateStore::new()));
        let identity = auth.authenticate(Some(&leader.to_string())).unwrap();
        assert!(identity.is_management());
    }

    #[test]
    fn anonymous_token_is_not_management() {
        let config = AclConfig {
            enabled: true,
            ..AclConfig::default()
        };
        let auth = Authenticator::new(config, Arc::new(StateStore::new()));
        let identity = auth.authenticate(None).unwrap();
        assert!(!identity.is_management());
        assert!(auth.authorize_write(&identity).is_err());
    }
}
