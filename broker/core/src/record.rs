//! The per-instance record and its flat, string-keyed persisted form.
//!
//! Record stores only hold string values, so the typed [`InstanceRecord`] is serialized into a
//! flat map of fields. Nested values (parameters, binding payloads, binding states) are stored as
//! JSON. Writers update records with a [`RecordPatch`] that touches only the fields it names.

use crate::params::Params;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

/// The persisted form of a record.
pub type Fields = BTreeMap<String, String>;

/// A partial update of a record. A `None` value deletes the field.
pub type FieldPatch = BTreeMap<String, Option<String>>;

pub const SERVICE_ID: &str = "service-id";
pub const PLAN_ID: &str = "plan-id";
const PROVISION_PARAMS: &str = "provision-params";
const RELEASE: &str = "release";
const RELEASE_NAMESPACE: &str = "release-namespace";
const OPERATION_NAME: &str = "last-operation-name";
const OPERATION_STATE: &str = "last-operation-state";
const OPERATION_DESCRIPTION: &str = "last-operation-description";
const BINDING_PREFIX: &str = "binding-";
const BINDING_STATE_PREFIX: &str = "binding-state-";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

/// The state of an operation as reported to OSB pollers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The most recent instance-level operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    /// The operation token, e.g. `provision-0a1b...`.
    pub name: String,
    pub state: OperationState,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReleaseRef {
    pub name: String,
    pub namespace: String,
}

/// The GetBinding response for a binding, served verbatim once written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingPayload {
    pub credentials: Params,
    #[serde(default)]
    pub parameters: Params,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingRecord {
    pub payload: Option<BindingPayload>,
    pub state: Option<LastOperation>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub provision_params: Params,
    /// Set once the chart has been deployed.
    pub release: Option<ReleaseRef>,
    pub operation: Option<Operation>,
    pub bindings: BTreeMap<String, BindingRecord>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid operation state {0:?}")]
    InvalidState(String),

    #[error("failed to decode field {field}: {source}")]
    Decode {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode field {field}: {source}")]
    Encode {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Builds a [`FieldPatch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordPatch(FieldPatch);

// === impl OperationState ===

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            s => Err(RecordError::InvalidState(s.to_string())),
        }
    }
}

// === impl LastOperation ===

impl LastOperation {
    pub fn new(state: OperationState, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            state,
            description: Some(description).filter(|d| !d.is_empty()),
        }
    }
}

impl From<&Operation> for LastOperation {
    fn from(op: &Operation) -> Self {
        Self::new(op.state, op.description.clone())
    }
}

// === impl Operation ===

impl Operation {
    pub fn new(name: impl Into<String>, state: OperationState, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state,
            description: description.into(),
        }
    }
}

// === impl InstanceRecord ===

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
        provision_params: Params,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            provision_params,
            release: None,
            operation: None,
            bindings: BTreeMap::new(),
        }
    }

    pub fn to_fields(&self) -> Result<Fields, RecordError> {
        let mut fields = Fields::new();
        fields.insert(SERVICE_ID.to_string(), self.service_id.clone());
        fields.insert(PLAN_ID.to_string(), self.plan_id.clone());
        fields.insert(
            PROVISION_PARAMS.to_string(),
            encode(PROVISION_PARAMS, &self.provision_params)?,
        );

        let mut patch = RecordPatch::default();
        if let Some(release) = &self.release {
            patch = patch.release(release);
        }
        if let Some(op) = &self.operation {
            patch = patch.operation(op);
        }
        for (id, binding) in &self.bindings {
            if let Some(payload) = &binding.payload {
                patch = patch.binding(id, payload)?;
            }
            if let Some(state) = &binding.state {
                patch = patch.binding_state(id, state)?;
            }
        }
        fields.extend(
            patch
                .into_inner()
                .into_iter()
                .filter_map(|(k, v)| Some((k, v?))),
        );
        Ok(fields)
    }

    pub fn from_fields(instance_id: impl Into<String>, fields: &Fields) -> Result<Self, RecordError> {
        let required = |key: &'static str| {
            fields
                .get(key)
                .cloned()
                .ok_or(RecordError::MissingField(key))
        };

        let mut record = Self::new(
            instance_id,
            required(SERVICE_ID)?,
            required(PLAN_ID)?,
            match fields.get(PROVISION_PARAMS) {
                Some(json) if !json.is_empty() => decode(PROVISION_PARAMS, json)?,
                _ => Params::default(),
            },
        );

        if let Some(name) = fields.get(RELEASE).filter(|n| !n.is_empty()) {
            record.release = Some(ReleaseRef {
                name: name.clone(),
                namespace: fields.get(RELEASE_NAMESPACE).cloned().unwrap_or_default(),
            });
        }

        if let Some(name) = fields.get(OPERATION_NAME) {
            record.operation = Some(Operation {
                name: name.clone(),
                state: required(OPERATION_STATE)?.parse()?,
                description: fields.get(OPERATION_DESCRIPTION).cloned().unwrap_or_default(),
            });
        }

        for (key, value) in fields {
            // The state prefix shares the payload prefix, so it must be matched first.
            if let Some(id) = key.strip_prefix(BINDING_STATE_PREFIX) {
                record.bindings.entry(id.to_string()).or_default().state =
                    Some(decode(key, value)?);
            } else if let Some(id) = key.strip_prefix(BINDING_PREFIX) {
                record.bindings.entry(id.to_string()).or_default().payload =
                    Some(decode(key, value)?);
            }
        }

        Ok(record)
    }

    pub fn binding(&self, id: &str) -> Option<&BindingRecord> {
        self.bindings.get(id)
    }
}

// === impl RecordPatch ===

impl RecordPatch {
    /// Replaces the name, state, and description of the last operation together.
    pub fn operation(mut self, op: &Operation) -> Self {
        self.set(OPERATION_NAME, op.name.clone());
        self.set(OPERATION_STATE, op.state.as_str().to_string());
        self.set(OPERATION_DESCRIPTION, op.description.clone());
        self
    }

    pub fn release(mut self, release: &ReleaseRef) -> Self {
        self.set(RELEASE, release.name.clone());
        self.set(RELEASE_NAMESPACE, release.namespace.clone());
        self
    }

    pub fn binding(mut self, id: &str, payload: &BindingPayload) -> Result<Self, RecordError> {
        let key = format!("{BINDING_PREFIX}{id}");
        let value = encode(&key, payload)?;
        self.0.insert(key, Some(value));
        Ok(self)
    }

    pub fn binding_state(mut self, id: &str, state: &LastOperation) -> Result<Self, RecordError> {
        let key = format!("{BINDING_STATE_PREFIX}{id}");
        let value = encode(&key, state)?;
        self.0.insert(key, Some(value));
        Ok(self)
    }

    pub fn remove_binding(mut self, id: &str) -> Self {
        self.0.insert(format!("{BINDING_PREFIX}{id}"), None);
        self.0.insert(format!("{BINDING_STATE_PREFIX}{id}"), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> FieldPatch {
        self.0
    }

    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), Some(value));
    }
}

fn encode<T: Serialize>(field: &str, value: &T) -> Result<String, RecordError> {
    serde_json::to_string(value).map_err(|source| RecordError::Encode {
        field: field.to_string(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(field: &str, json: &str) -> Result<T, RecordError> {
    serde_json::from_str(json).map_err(|source| RecordError::Decode {
        field: field.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        Params::try_from(value).expect("params must be an object")
    }

    #[test]
    fn persisted_layout() {
        let mut record = InstanceRecord::new("i1", "redis", "redis-5-0-7", params(json!({"a": 1})));
        record.release = Some(ReleaseRef {
            name: "redis-1a2b".to_string(),
            namespace: "ns".to_string(),
        });
        record.operation = Some(Operation::new(
            "provision-00",
            OperationState::Succeeded,
            "provisioned instance i1",
        ));
        record.bindings.insert(
            "b1".to_string(),
            BindingRecord {
                payload: Some(BindingPayload {
                    credentials: params(json!({"password": "pw"})),
                    parameters: Params::default(),
                }),
                state: Some(LastOperation::new(OperationState::Succeeded, "")),
            },
        );

        let fields = record.to_fields().expect("record must encode");
        assert_eq!(
            fields,
            btreemap! {
                "service-id".to_string() => "redis".to_string(),
                "plan-id".to_string() => "redis-5-0-7".to_string(),
                "provision-params".to_string() => r#"{"a":1}"#.to_string(),
                "release".to_string() => "redis-1a2b".to_string(),
                "release-namespace".to_string() => "ns".to_string(),
                "last-operation-name".to_string() => "provision-00".to_string(),
                "last-operation-state".to_string() => "succeeded".to_string(),
                "last-operation-description".to_string() => "provisioned instance i1".to_string(),
                "binding-b1".to_string() => r#"{"credentials":{"password":"pw"},"parameters":{}}"#.to_string(),
                "binding-state-b1".to_string() => r#"{"state":"succeeded"}"#.to_string(),
            }
        );

        let decoded = InstanceRecord::from_fields("i1", &fields).expect("record must decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn binding_ids_with_state_prefix() {
        // Not the payload of a binding named `state-x`.
        let record_fields = btreemap! {
            "service-id".to_string() => "redis".to_string(),
            "plan-id".to_string() => "p".to_string(),
            "binding-state-x".to_string() => r#"{"state":"in progress"}"#.to_string(),
        };
        let record = InstanceRecord::from_fields("i1", &record_fields).expect("must decode");
        assert_eq!(
            record.binding("x").and_then(|b| b.state.clone()),
            Some(LastOperation {
                state: OperationState::InProgress,
                description: None,
            })
        );
        assert!(record.binding("x").and_then(|b| b.payload.as_ref()).is_none());
    }

    #[test]
    fn invalid_records() {
        let fields = btreemap! { "plan-id".to_string() => "p".to_string() };
        assert!(matches!(
            InstanceRecord::from_fields("i1", &fields),
            Err(RecordError::MissingField("service-id"))
        ));

        let fields = btreemap! {
            "service-id".to_string() => "s".to_string(),
            "plan-id".to_string() => "p".to_string(),
            "last-operation-name".to_string() => "provision-00".to_string(),
            "last-operation-state".to_string() => "done".to_string(),
        };
        assert!(matches!(
            InstanceRecord::from_fields("i1", &fields),
            Err(RecordError::InvalidState(s)) if s == "done"
        ));

        let fields = btreemap! {
            "service-id".to_string() => "s".to_string(),
            "plan-id".to_string() => "p".to_string(),
            "binding-b1".to_string() => "{".to_string(),
        };
        assert!(matches!(
            InstanceRecord::from_fields("i1", &fields),
            Err(RecordError::Decode { field, .. }) if field == "binding-b1"
        ));
    }

    #[test]
    fn patches() {
        let patch = RecordPatch::default()
            .operation(&Operation::new("bind-01", OperationState::InProgress, ""))
            .remove_binding("b1")
            .into_inner();
        assert_eq!(
            patch,
            btreemap! {
                "last-operation-name".to_string() => Some("bind-01".to_string()),
                "last-operation-state".to_string() => Some("in progress".to_string()),
                "last-operation-description".to_string() => Some(String::new()),
                "binding-b1".to_string() => None,
                "binding-state-b1".to_string() => None,
            }
        );
    }

    #[test]
    fn last_operation_json() {
        let op = LastOperation::new(OperationState::Failed, "boom");
        assert_eq!(
            serde_json::to_value(&op).expect("must serialize"),
            json!({"state": "failed", "description": "boom"})
        );
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
    }
}
