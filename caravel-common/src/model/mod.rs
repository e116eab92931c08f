use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

pub mod acl;
pub mod alloc;
pub mod error;
pub mod eval;
pub mod job;
pub mod node;
pub mod node_pool;
pub mod plan;
pub mod rpc;
pub mod service;
pub mod variable;

pub use acl::*;
pub use alloc::*;
pub use error::*;
pub use eval::*;
pub use job::*;
pub use node::*;
pub use node_pool::*;
pub use plan::*;
pub use rpc::*;
pub use service::*;
pub use variable::*;

/// Index of a committed replicated log entry. Strictly monotonic across all
/// writes; doubles as the compare-and-set epoch on every stored entity.
pub type LogIndex = u64;

/// Monotonic per-job mutation counter.
pub type JobVersion = u64;

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))?;
                Ok(Self(uuid))
            }
        }
    };
}

newtype_uuid!(NodeId);
newtype_uuid!(EvalId);
newtype_uuid!(AllocId);
newtype_uuid!(DeploymentId);
newtype_uuid!(TokenId);
newtype_uuid!(EvalToken);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(pub String);

impl Namespace {
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn or_default(name: &str) -> Self {
        if name.is_empty() {
            Self::default()
        } else {
            Self(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job identifiers are caller supplied. Periodic children derive theirs from
/// the parent's (see [`job::Job::derived_periodic_id`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Schedulable resources of a task, a task group, or a whole node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Resources {
    pub fn new(cpu_mhz: u64, memory_mb: u64) -> Self {
        Self {
            cpu_mhz,
            memory_mb,
            disk_mb: 0,
        }
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu_mhz += other.cpu_mhz;
        self.memory_mb += other.memory_mb;
        self.disk_mb += other.disk_mb;
    }

    /// Checks `self + ask <= available`, naming the first dimension that does
    /// not fit. The reason string ends up in plan rejections and blocked-eval
    /// descriptions, so it names the dimension explicitly.
    pub fn fits_with(&self, ask: &Resources, available: &Resources) -> Result<(), String> {
        if self.cpu_mhz + ask.cpu_mhz > available.cpu_mhz {
            return Err("insufficient cpu".to_string());
        }
        if self.memory_mb + ask.memory_mb > available.memory_mb {
            return Err("insufficient memory".to_string());
        }
        if self.disk_mb + ask.disk_mb > available.disk_mb {
            return Err("insufficient disk".to_string());
        }
        Ok(())
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_mhz: self.cpu_mhz.saturating_sub(other.cpu_mhz),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResource {
    pub mode: String,
    pub reserved_ports: Vec<u16>,
}

/// String key/value metadata used on jobs, node pools and node attributes.
pub type Meta = BTreeMap<String, String>;
