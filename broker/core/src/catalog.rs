//! Derives the OSB catalog from a chart repository index.
//!
//! Every chart becomes a service. Every distinct application version of a chart becomes a plan,
//! backed by the highest packaging version that ships it. Plans remember the exact chart version
//! they were built from, so provisioning never has to reverse a plan identifier.

use crate::credentials::Providers;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Chart versions, keyed by chart name.
pub type ChartIndex = BTreeMap<String, Vec<ChartVersion>>;

/// A single packaged version of a chart, as listed in a repository index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartVersion {
    pub name: String,
    /// The packaging version of the chart.
    pub version: String,
    /// The version of the application the chart deploys.
    pub app_version: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub urls: Vec<String>,
    pub deprecated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub plans: Vec<Plan>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,

    /// The chart version this plan installs.
    #[serde(skip)]
    pub chart: ChartVersion,
}

/// Builds the catalog. When `only` is set, charts without a registered provider are omitted.
pub fn build(index: &ChartIndex, only: Option<&Providers>) -> Vec<CatalogService> {
    index
        .iter()
        .filter(|(name, _)| only.map_or(true, |providers| providers.contains(name)))
        .filter_map(|(name, versions)| service(name, versions))
        .collect()
}

/// Builds the service for a single chart, or `None` if no version yields a plan.
pub fn service(name: &str, versions: &[ChartVersion]) -> Option<CatalogService> {
    let plans = plans(name, versions);
    if plans.is_empty() {
        return None;
    }

    Some(CatalogService {
        id: name.to_string(),
        name: name.to_string(),
        description: format!("Helm Chart for {name}"),
        bindable: true,
        tags: tags(versions),
        plans,
    })
}

/// Returns one plan per application version, ordered by plan ID.
pub fn plans(name: &str, versions: &[ChartVersion]) -> Vec<Plan> {
    let mut latest = BTreeMap::<&str, (semver::Version, &ChartVersion)>::new();
    for chart in versions {
        if chart.app_version.is_empty() {
            continue;
        }
        let Some(version) = parse_version(&chart.version) else {
            warn!(
                chart = %name,
                app_version = %chart.app_version,
                version = %chart.version,
                "Skipping chart version that is not a valid semantic version"
            );
            continue;
        };
        match latest.get(chart.app_version.as_str()) {
            Some((max, _)) if *max >= version => {}
            _ => {
                latest.insert(chart.app_version.as_str(), (version, chart));
            }
        }
    }

    let mut plans = latest
        .into_values()
        .map(|(_, chart)| Plan {
            id: slug(&format!("{name}@{}", chart.app_version)),
            name: slug(&chart.app_version),
            description: chart.description.clone(),
            free: true,
            chart: chart.clone(),
        })
        .collect::<Vec<_>>();
    plans.sort_by(|a, b| a.id.cmp(&b.id));
    plans
}

/// Returns the keywords shared by every version of a chart, in the order of the first version.
pub fn tags(versions: &[ChartVersion]) -> Vec<String> {
    let Some((first, rest)) = versions.split_first() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    first
        .keywords
        .iter()
        .filter(|kw| rest.iter().all(|v| v.keywords.contains(*kw)))
        .filter(|kw| seen.insert(kw.as_str()))
        .cloned()
        .collect()
}

/// Lowercases `s` and replaces every character outside `[a-z0-9]` with a hyphen.
pub fn slug(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .collect()
}

/// Parses a packaging version, tolerating a `v` prefix and missing minor or patch components.
fn parse_version(version: &str) -> Option<semver::Version> {
    let version = version.trim();
    let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
    if let Ok(v) = semver::Version::parse(version) {
        return Some(v);
    }

    let split = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(split);
    let components = core.split('.').count();
    if core.is_empty() || components >= 3 {
        return None;
    }
    let padded = format!("{core}{}{suffix}", ".0".repeat(3 - components));
    semver::Version::parse(&padded).ok()
}

// === impl CatalogService ===

impl CatalogService {
    /// Finds a plan by its ID or by its name.
    pub fn plan(&self, id_or_name: &str) -> Option<&Plan> {
        self.plans
            .iter()
            .find(|p| p.id == id_or_name)
            .or_else(|| self.plans.iter().find(|p| p.name == id_or_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chart(version: &str, app_version: &str, keywords: &[&str]) -> ChartVersion {
        ChartVersion {
            name: "redis".to_string(),
            version: version.to_string(),
            app_version: app_version.to_string(),
            description: format!("redis {version}"),
            keywords: keywords.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn highest_packaging_version_wins() {
        let versions = vec![chart("1.0.0", "1.0", &[]), chart("1.1.0", "1.0", &[])];
        let plans = plans("redis", &versions);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, "redis-1-0");
        assert_eq!(plans[0].name, "1-0");
        assert_eq!(plans[0].chart.version, "1.1.0");
        assert_eq!(plans[0].description, "redis 1.1.0");

        // Order of the index does not matter.
        let versions = vec![chart("1.1.0", "1.0", &[]), chart("1.0.0", "1.0", &[])];
        assert_eq!(plans_versions(&versions), vec!["1.1.0"]);
    }

    fn plans_versions(versions: &[ChartVersion]) -> Vec<String> {
        plans("redis", versions)
            .into_iter()
            .map(|p| p.chart.version)
            .collect()
    }

    #[test]
    fn invalid_and_unversioned_charts_are_skipped() {
        let versions = vec![
            chart("not-a-version", "2.0", &[]),
            chart("1.0.0", "", &[]),
            chart("v3.1", "3.1", &[]),
            chart("3", "3.0", &[]),
        ];
        let plans = plans("redis", &versions);
        assert_eq!(
            plans.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["redis-3-0", "redis-3-1"]
        );
    }

    #[test]
    fn tag_intersection() {
        let versions = vec![chart("1.0.0", "1", &["a", "b"]), chart("2.0.0", "2", &["b", "c"])];
        assert_eq!(tags(&versions), vec!["b"]);

        let versions = vec![chart("1.0.0", "1", &["a", "b"])];
        assert_eq!(tags(&versions), vec!["a", "b"]);

        // Versions without plans still constrain tags.
        let versions = vec![chart("1.0.0", "1", &["a", "b"]), chart("bad", "", &["a"])];
        assert_eq!(tags(&versions), vec!["a"]);

        assert!(tags(&[]).is_empty());
    }

    #[test]
    fn slugs() {
        assert_eq!(slug("Redis@5.0.7"), "redis-5-0-7");
        assert_eq!(slug("10.3.2-debian"), "10-3-2-debian");
    }

    #[test]
    fn build_catalog() {
        let mut index = ChartIndex::new();
        index.insert(
            "redis".to_string(),
            vec![chart("5.0.7", "5.0.7", &["redis"]), chart("4.0.0", "4.0.14", &["redis", "kv"])],
        );
        index.insert("wordpress".to_string(), vec![chart("1.0.0", "5.3", &[])]);
        index.insert("empty".to_string(), vec![chart("1.0.0", "", &[])]);

        let catalog = build(&index, None);
        assert_eq!(
            catalog.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["redis", "wordpress"]
        );

        let redis = &catalog[0];
        assert_eq!(redis.id, "redis");
        assert_eq!(redis.description, "Helm Chart for redis");
        assert!(redis.bindable);
        assert_eq!(redis.tags, vec!["redis"]);
        assert_eq!(
            redis.plans.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["redis-4-0-14", "redis-5-0-7"]
        );
        assert!(redis.plans.iter().all(|p| p.free));
        assert_eq!(redis.plan("5-0-7").map(|p| p.chart.version.as_str()), Some("5.0.7"));
        assert_eq!(
            redis.plan("redis-4-0-14").map(|p| p.chart.version.as_str()),
            Some("4.0.0")
        );
        assert!(redis.plan("6-0-0").is_none());

        let only = build(&index, Some(&Providers::default()));
        assert_eq!(
            only.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["redis"]
        );
    }

    #[test]
    fn plan_chart_is_not_serialized() {
        let plan = plans("redis", &[chart("5.0.7", "5.0.7", &[])]).remove(0);
        let json = serde_json::to_value(&plan).expect("plan must serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "id": "redis-5-0-7",
                "name": "5-0-7",
                "description": "redis 5.0.7",
                "free": true,
            })
        );
    }
}
