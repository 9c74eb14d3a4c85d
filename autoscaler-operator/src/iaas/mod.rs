//! The IaaS capability contract: create/get/delete nodes, list nodes, and
//! resolve cluster-scoped node identifiers. Internals of the authenticated
//! HTTP client (OAuth, circuit breaker tuning, audit sink) are out of
//! scope; this module only has to carry the capability contract every
//! other component is built against.

pub mod client;

use crate::util::Error;
use async_trait::async_trait;

/// A VM/node as reported by the IaaS, normalized to the shape every caller
/// needs. `id == 0` means the create was accepted but the identifier is
/// deferred (see the Discoverer).
#[derive(Debug, Clone, PartialEq)]
pub struct IaasNode {
    pub id: u64,
    pub identifier: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub status: Option<String>,
    pub cpu: Option<u32>,
    pub ram_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

impl IaasNode {
    /// Candidate filter used by the Discoverer: status running, or absent
    /// (the IaaS may omit it entirely).
    pub fn is_candidate(&self) -> bool {
        matches!(self.status.as_deref(), Some("running") | None)
    }
}

#[async_trait]
pub trait IaasClient: Send + Sync {
    async fn create_node(&self, cluster_id: &str, group_id: u64) -> Result<IaasNode, Error>;

    /// Returns `Ok(None)` for a NotFound response.
    async fn get_node(&self, id: u64) -> Result<Option<IaasNode>, Error>;

    async fn list_nodes(&self) -> Result<Vec<IaasNode>, Error>;

    /// NotFound is success (idempotent delete).
    async fn delete_node(&self, id: u64) -> Result<(), Error>;

    /// NotFound is success (idempotent delete).
    async fn delete_cluster_node(&self, cluster_id: &str, node_identifier: &str)
    -> Result<(), Error>;

    /// Returns `""` when absent; callers must treat that as "already deleted".
    async fn find_node_identifier(&self, cluster_id: &str, hostname: &str) -> Result<String, Error>;
}
