use crate::{bounded, is_status, k8s, FIELD_MANAGER};
use anyhow::Context;
use chart_broker_core::{
    record::{FieldPatch, Fields, PLAN_ID, SERVICE_ID},
    RecordStore, StoreError,
};
use std::time::Duration;

/// Stores each instance record as a ConfigMap named after the instance ID.
///
/// Record fields are the ConfigMap's data keys. The service and plan IDs are copied onto the
/// ConfigMap's labels so records can be listed by selector.
#[derive(Clone)]
pub struct ConfigMapRecords {
    api: k8s::Api<k8s::ConfigMap>,
    patch_timeout: Option<Duration>,
}

// === impl ConfigMapRecords ===

impl ConfigMapRecords {
    pub fn new(client: k8s::Client, namespace: &str) -> Self {
        Self {
            api: k8s::Api::namespaced(client, namespace),
            patch_timeout: None,
        }
    }

    pub fn with_patch_timeout(mut self, timeout: Duration) -> Self {
        self.patch_timeout = Some(timeout);
        self
    }
}

#[async_trait::async_trait]
impl RecordStore for ConfigMapRecords {
    async fn create(&self, id: &str, fields: Fields) -> Result<(), StoreError> {
        let cm = config_map(id, fields);
        let params = k8s::PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match bounded(self.patch_timeout, self.api.create(&params, &cm)).await? {
            Ok(_) => {
                tracing::debug!(instance = %id, "Created record");
                Ok(())
            }
            Err(error) if is_status(&error, 409) => Err(StoreError::AlreadyExists(id.to_string())),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("failed to create ConfigMap {id}"))
                .into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Fields>, StoreError> {
        let cm = self
            .api
            .get_opt(id)
            .await
            .with_context(|| format!("failed to get ConfigMap {id}"))?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn update(&self, id: &str, patch: FieldPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let params = k8s::PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patch = k8s::Patch::Merge(data_patch(patch));
        match bounded(self.patch_timeout, self.api.patch(id, &params, &patch)).await? {
            Ok(_) => Ok(()),
            Err(error) if is_status(&error, 404) => Err(StoreError::NotFound(id.to_string())),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("failed to patch ConfigMap {id}"))
                .into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let params = k8s::DeleteParams::default();
        match bounded(self.patch_timeout, self.api.delete(id, &params)).await? {
            Ok(_) => {
                tracing::debug!(instance = %id, "Deleted record");
                Ok(())
            }
            Err(error) if is_status(&error, 404) => Err(StoreError::NotFound(id.to_string())),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("failed to delete ConfigMap {id}"))
                .into()),
        }
    }
}

fn config_map(id: &str, fields: Fields) -> k8s::ConfigMap {
    let labels = [SERVICE_ID, PLAN_ID]
        .into_iter()
        .filter_map(|key| Some((key.to_string(), fields.get(key)?.clone())))
        .collect::<k8s::labels::Map>();
    k8s::ConfigMap {
        metadata: k8s::ObjectMeta {
            name: Some(id.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        data: Some(fields),
        ..Default::default()
    }
}

/// A JSON merge patch of the ConfigMap's data, where `null` removes a key.
fn data_patch(patch: FieldPatch) -> serde_json::Value {
    let data = patch
        .into_iter()
        .map(|(key, value)| (key, value.map_or(serde_json::Value::Null, Into::into)))
        .collect::<serde_json::Map<_, _>>();
    serde_json::json!({ "data": data })
}
