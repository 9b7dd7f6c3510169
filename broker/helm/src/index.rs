//! Parses a chart repository's `index.yaml`.

use anyhow::Context;
use chart_broker_core::{ChartIndex, ChartVersion};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    #[serde(default)]
    entries: BTreeMap<String, Vec<Entry>>,
}

/// Version fields are free-form in the wild: `appVersion: 5.0` parses as a number and
/// `version: 1` as an integer, so scalars are read loosely.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Entry {
    name: String,
    version: Value,
    app_version: Value,
    description: String,
    keywords: Vec<String>,
    urls: Vec<String>,
    deprecated: bool,
}

pub fn parse(yaml: &str) -> anyhow::Result<ChartIndex> {
    let index = serde_yaml::from_str::<IndexFile>(yaml).context("invalid repository index")?;
    Ok(index
        .entries
        .into_iter()
        .map(|(name, entries)| {
            let versions = entries
                .into_iter()
                .map(|e| ChartVersion {
                    name: if e.name.is_empty() { name.clone() } else { e.name },
                    version: scalar(e.version),
                    app_version: scalar(e.app_version),
                    description: e.description,
                    keywords: e.keywords,
                    urls: e.urls,
                    deprecated: e.deprecated,
                })
                .collect();
            (name, versions)
        })
        .collect())
}

fn scalar(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
