use chart_broker_k8s_api::{Secret, Selector, Service};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Service,
    Secret,
}

/// Identifies a namespaced resource created by a release.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

/// Reads and labels the cluster resources that releases create.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn services(&self, namespace: &str, selector: &Selector) -> anyhow::Result<Vec<Service>>;

    async fn secrets(&self, namespace: &str, selector: &Selector) -> anyhow::Result<Vec<Secret>>;

    async fn patch_label(&self, resource: &ResourceRef, key: &str, value: &str)
        -> anyhow::Result<()>;
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::Secret => "Secret",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.name, self.namespace)
    }
}
