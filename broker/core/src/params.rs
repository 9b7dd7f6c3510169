use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// An untyped, nested parameter bag, as carried by provision and bind requests and by the
/// credentials of a binding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DigError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not a string")]
    NotString(String),
}

// === impl Params ===

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Looks up a value by a dot-separated path, e.g. `db.name`.
    pub fn dig(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut value = self.0.get(segments.next()?)?;
        for segment in segments {
            value = value.as_object()?.get(segment)?;
        }
        Some(value)
    }

    pub fn dig_str(&self, path: &str) -> Result<&str, DigError> {
        match self.dig(path) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(DigError::NotString(path.to_string())),
            None => Err(DigError::NotFound(path.to_string())),
        }
    }

    /// Returns the string at the first of `paths` that is present.
    ///
    /// A present but non-string value is an error; it does not fall through to the next alias.
    pub fn dig_str_any(&self, paths: &[&str]) -> Result<Option<&str>, DigError> {
        for path in paths {
            match self.dig_str(path) {
                Ok(s) => return Ok(Some(s)),
                Err(DigError::NotFound(_)) => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    /// Returns a copy of these parameters overlaid with `other`. Top-level keys of `other` win.
    pub fn merge(&self, other: &Params) -> Params {
        let mut merged = self.clone();
        merged.extend(other.clone());
        merged
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Params> for Value {
    fn from(Params(map): Params) -> Self {
        Value::Object(map)
    }
}

impl TryFrom<Value> for Params {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Value> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            value => Err(value),
        }
    }
}

impl Extend<(String, Value)> for Params {
    fn extend<T: IntoIterator<Item = (String, Value)>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl IntoIterator for Params {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::iter::FromIterator<(String, Value)> for Params {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        Params::try_from(value).expect("params must be an object")
    }

    #[test]
    fn dig() {
        for (obj, path, expected) in [
            (json!({"foo": "baz"}), "bar", None),
            (json!({"foo": {"bar": "baz"}}), "foo.foo", None),
            (json!({"foo": {"bar": "baz"}}), "foo.bar.bar", None),
            (json!({"foo": "baz"}), "foo", Some(json!("baz"))),
            (json!({"foo": {"bar": "baz"}}), "foo.bar", Some(json!("baz"))),
            (json!({"foo": {"bar": 1}}), "foo.bar", Some(json!(1))),
        ] {
            assert_eq!(params(obj).dig(path).cloned(), expected, "{path}");
        }
    }

    #[test]
    fn dig_str() {
        let p = params(json!({"foo": {"bar": "baz", "n": 3}}));
        assert_eq!(p.dig_str("foo.bar"), Ok("baz"));
        assert_eq!(p.dig_str("foo.n"), Err(DigError::NotString("foo.n".into())));
        assert_eq!(
            p.dig_str("foo.missing"),
            Err(DigError::NotFound("foo.missing".into()))
        );
    }

    #[test]
    fn dig_str_any_takes_first_present_alias() {
        let p = params(json!({"postgresDatabase": "old", "other": "x"}));
        assert_eq!(
            p.dig_str_any(&["postgresqlDatabase", "postgresDatabase"]),
            Ok(Some("old"))
        );

        let p = params(json!({"postgresqlDatabase": "new", "postgresDatabase": "old"}));
        assert_eq!(
            p.dig_str_any(&["postgresqlDatabase", "postgresDatabase"]),
            Ok(Some("new"))
        );

        assert_eq!(p.dig_str_any(&["missing"]), Ok(None));
    }

    #[test]
    fn dig_str_any_rejects_non_string() {
        let p = params(json!({"db": {"user": false}, "mariadbUser": "u"}));
        assert_eq!(
            p.dig_str_any(&["db.user", "mariadbUser"]),
            Err(DigError::NotString("db.user".into()))
        );
    }

    #[test]
    fn merge_prefers_other() {
        let provision = params(json!({"a": 1, "b": {"x": 1}}));
        let bind = params(json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(
            provision.merge(&bind),
            params(json!({"a": 1, "b": {"y": 2}, "c": 3}))
        );
    }
}
