use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A remote document: an unordered field bag, opaque to the sync core
/// beyond the two fields it relies on (`name`, `modified`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn modified(&self) -> Option<&str> {
        self.fields.get("modified").and_then(Value::as_str)
    }

    /// Frappe's own `modified` values have no timezone offset
    /// (`"2025-01-02 09:00:00.000000"`) and the spec's literal examples drop
    /// the `Z` suffix too (`"2025-01-02T09:00:00"`), so RFC3339 alone misses
    /// the common case. Falls back to naive parsing, treating the result as
    /// UTC, before giving up.
    pub fn modified_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = self.modified()?;
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&chrono::Utc));
        }
        const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc));
            }
        }
        None
    }

    /// Field bag with `excluded` names removed, used both for hashing and
    /// for stripping stale metadata before a cross-side write.
    pub fn without_fields(&self, excluded: &[String]) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(k, _)| !excluded.iter().any(|e| e == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Composite key identifying one (doctype, docname) pair across both
/// endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub doctype: String,
    pub docname: String,
}

impl DocKey {
    pub fn new(doctype: impl Into<String>, docname: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            docname: docname.into(),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.doctype, self.docname)
    }
}
