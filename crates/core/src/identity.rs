//! Identity partitions: the isolation boundary for retrieval.
//!
//! Every chunk in the index belongs to exactly one partition, and every
//! retrieval is scoped to exactly one partition. Partitions are opaque
//! strings prefixed by their scope (`user:`, `tenant:`, `guest:`).

use serde::{Deserialize, Serialize};

/// The scope of an identity partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionScope {
    User,
    Tenant,
    Guest,
}

impl PartitionScope {
    fn prefix(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tenant => "tenant",
            Self::Guest => "guest",
        }
    }
}

/// A user/tenant/guest partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityPartition(String);

impl IdentityPartition {
    pub fn new(scope: PartitionScope, id: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", scope.prefix(), id.as_ref()))
    }

    pub fn user(id: impl AsRef<str>) -> Self {
        Self::new(PartitionScope::User, id)
    }

    pub fn tenant(id: impl AsRef<str>) -> Self {
        Self::new(PartitionScope::Tenant, id)
    }

    pub fn guest(id: impl AsRef<str>) -> Self {
        Self::new(PartitionScope::Guest, id)
    }

    /// Parse a `scope:id` key. Keys without a known scope are treated as user ids.
    pub fn parse(key: &str) -> Self {
        match key.split_once(':') {
            Some(("user" | "tenant" | "guest", rest)) if !rest.is_empty() => Self(key.to_string()),
            _ => Self::user(key),
        }
    }

    pub fn scope(&self) -> PartitionScope {
        match self.0.split_once(':').map(|(scope, _)| scope) {
            Some("tenant") => PartitionScope::Tenant,
            Some("guest") => PartitionScope::Guest,
            _ => PartitionScope::User,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
