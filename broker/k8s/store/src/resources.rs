use crate::{bounded, k8s, FIELD_MANAGER};
use anyhow::Context;
use chart_broker_core::{ResourceKind, ResourceRef, ResourceStore};
use std::time::Duration;

/// Lists and labels release resources through the API server.
#[derive(Clone)]
pub struct KubeResources {
    client: k8s::Client,
    patch_timeout: Option<Duration>,
}

// === impl KubeResources ===

impl KubeResources {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client,
            patch_timeout: None,
        }
    }

    pub fn with_patch_timeout(mut self, timeout: Duration) -> Self {
        self.patch_timeout = Some(timeout);
        self
    }

    async fn label<T>(&self, resource: &ResourceRef, key: &str, value: &str) -> anyhow::Result<()>
    where
        T: k8s::Resource<Scope = k8s::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        T::DynamicType: Default,
    {
        let api = k8s::Api::<T>::namespaced(self.client.clone(), &resource.namespace);
        let params = k8s::PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patch = k8s::Patch::Merge(label_patch(key, value));
        bounded(self.patch_timeout, api.patch(&resource.name, &params, &patch))
            .await?
            .with_context(|| format!("failed to label {resource}"))?;
        tracing::debug!(%resource, %key, %value, "Labeled");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeResources {
    async fn services(
        &self,
        namespace: &str,
        selector: &k8s::Selector,
    ) -> anyhow::Result<Vec<k8s::Service>> {
        let api = k8s::Api::<k8s::Service>::namespaced(self.client.clone(), namespace);
        let params = k8s::ListParams::default().labels(&selector.to_string());
        let list = api
            .list(&params)
            .await
            .with_context(|| format!("failed to list Services in {namespace} ({selector})"))?;
        Ok(list.items)
    }

    async fn secrets(
        &self,
        namespace: &str,
        selector: &k8s::Selector,
    ) -> anyhow::Result<Vec<k8s::Secret>> {
        let api = k8s::Api::<k8s::Secret>::namespaced(self.client.clone(), namespace);
        let params = k8s::ListParams::default().labels(&selector.to_string());
        let list = api
            .list(&params)
            .await
            .with_context(|| format!("failed to list Secrets in {namespace} ({selector})"))?;
        Ok(list.items)
    }

    async fn patch_label(
        &self,
        resource: &ResourceRef,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        match resource.kind {
            ResourceKind::Service => self.label::<k8s::Service>(resource, key, value).await,
            ResourceKind::Secret => self.label::<k8s::Secret>(resource, key, value).await,
        }
    }
}

fn label_patch(key: &str, value: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": { key: value },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_patch_only_touches_labels() {
        assert_eq!(
            label_patch("chart-broker.io/instance", "i1"),
            serde_json::json!({
                "metadata": {
                    "labels": { "chart-broker.io/instance": "i1" },
                }
            })
        );
    }
}
