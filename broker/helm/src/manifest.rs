//! Extracts resource references from a rendered release manifest.

use anyhow::Context;
use chart_broker_core::{ResourceKind, ResourceRef};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Object {
    kind: Option<String>,
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: Option<String>,
    namespace: Option<String>,
}

/// Returns the Services and Secrets in a multi-document manifest.
///
/// Objects without a namespace are created in the release namespace.
pub fn resources(manifest: &str, namespace: &str) -> anyhow::Result<Vec<ResourceRef>> {
    let mut resources = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let Some(obj) = Option::<Object>::deserialize(doc).context("invalid manifest document")?
        else {
            continue;
        };
        let kind = match obj.kind.as_deref() {
            Some("Service") => ResourceKind::Service,
            Some("Secret") => ResourceKind::Secret,
            _ => continue,
        };
        let Some(Metadata {
            name: Some(name),
            namespace: ns,
        }) = obj.metadata
        else {
            tracing::debug!(%kind, "Skipping unnamed object");
            continue;
        };
        resources.push(ResourceRef {
            kind,
            name,
            namespace: ns.unwrap_or_else(|| namespace.to_string()),
        });
    }
    Ok(resources)
}
