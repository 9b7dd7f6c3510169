use crate::core::Params;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path};

/// Provisioning settings, keyed by service ID.
///
/// ```yaml
/// mysql:
///   overrideParams:
///     auth:
///       database: default
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, ServiceSettings>);

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSettings {
    /// Chart values used instead of whatever the provision request carries.
    #[serde(default)]
    override_params: Option<Params>,
}

// === impl Settings ===

impl Settings {
    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("invalid provisioning settings")
    }

    pub fn override_params(&self, service_id: &str) -> Option<&Params> {
        self.0.get(service_id)?.override_params.as_ref()
    }

    /// Returns the values to install a service with.
    pub fn provision_params(&self, service_id: &str, requested: Params) -> Params {
        match self.override_params(service_id) {
            Some(params) => {
                tracing::debug!(service = %service_id, "Using override parameters");
                params.clone()
            }
            None => requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SETTINGS: &str = r#"
mariadb:
  overrideParams:
    db:
      name: default
mysql:
  overrideParams:
    mysqlDatabase: default
    mysqlUser: admin
postgresql: {}
"#;

    fn params(value: serde_json::Value) -> Params {
        Params::try_from(value).expect("params must be an object")
    }

    #[test]
    fn overrides_replace_request() {
        let settings = Settings::from_yaml(SETTINGS).expect("settings must parse");
        let requested = params(serde_json::json!({"mysqlDatabase": "mine"}));
        assert_eq!(
            settings.provision_params("mysql", requested.clone()),
            params(serde_json::json!({"mysqlDatabase": "default", "mysqlUser": "admin"}))
        );
        assert_eq!(
            settings.provision_params("mariadb", Params::default()),
            params(serde_json::json!({"db": {"name": "default"}}))
        );
        assert_eq!(settings.provision_params("postgresql", requested.clone()), requested);
        assert_eq!(settings.provision_params("redis", requested.clone()), requested);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = Settings::from_yaml("mysql:\n  overrideParam:\n    a: b\n")
            .expect_err("typo must be rejected");
        assert!(format!("{error:#}").contains("overrideParam"), "{error:#}");
    }

    #[test]
    fn empty_settings() {
        assert_eq!(Settings::from_yaml("").expect("must parse"), Settings::default());
        assert_eq!(Settings::default().override_params("mysql"), None);
    }
}
