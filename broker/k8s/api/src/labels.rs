use std::{collections::BTreeMap, fmt};

pub type Map = BTreeMap<String, String>;

/// Selects resources carrying every one of a set of labels.
///
/// Renders as an equality-based label selector, e.g. `release=redis-1,heritage=Helm`, suitable for
/// list requests against the API server.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
}

// === Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self { match_labels: map }
    }

    /// Evaluates the selector locally against a resource's labels.
    pub fn matches(&self, labels: Option<&Map>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for (k, v) in self.match_labels.iter() {
            write!(f, "{sep}{k}={v}")?;
            sep = ",";
        }
        Ok(())
    }
}
