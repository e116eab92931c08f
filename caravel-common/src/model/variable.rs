use super::{LogIndex, Meta, Namespace};
use serde::{Deserialize, Serialize};

/// A namespaced key/value document. Encryption-at-rest belongs to the
/// keyring collaborator; the control plane stores the structure and enforces
/// compare-and-set semantics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub namespace: Namespace,
    /// Slash-separated path, e.g. `webapp/prod/db`.
    pub path: String,
    pub items: Meta,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl Variable {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("variable path must not be empty".to_string());
        }
        if self.path.starts_with('/') || self.path.ends_with('/') {
            return Err(format!("invalid variable path '{}'", self.path));
        }
        if self
            .path
            .split('/')
            .any(|segment| segment.is_empty() || !segment.chars().all(is_path_char))
        {
            return Err(format!("invalid variable path '{}'", self.path));
        }
        Ok(())
    }
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')
}

/// Listing row without the payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub namespace: Namespace,
    pub path: String,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl From<&Variable> for VariableMetadata {
    fn from(variable: &Variable) -> Self {
        VariableMetadata {
            namespace: variable.namespace.clone(),
            path: variable.path.clone(),
            create_index: variable.create_index,
            modify_index: variable.modify_index,
        }
    }
}
