// Shared building blocks for the catalog entities: the tenant/source scope,
// per-repository counters, and the attribute projection helpers that turn a
// loosely-typed upstream page object into column values.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ModelError, Result};

/// One upstream page object, decoded with number preservation.
pub type Attrs = serde_json::Map<String, Value>;

/// The multi-tenancy scope every catalog row lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceScope {
    pub tenant_id: i64,
    pub source_id: i64,
}

/// Add/update/delete counters owned by one repository for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepoStats {
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Check that every required key is present, in declaration order, so the
/// first missing one is reported.
pub(crate) fn require_attrs(attrs: &Attrs, required: &[&str]) -> Result<()> {
    for name in required {
        if !attrs.contains_key(*name) {
            return Err(ModelError::MissingAttribute(name.to_string()));
        }
    }
    Ok(())
}

pub(crate) fn attr_str<'a>(attrs: &'a Attrs, key: &str) -> Result<&'a str> {
    match attrs.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ModelError::invalid(key, "expected a string")),
        None => Err(ModelError::MissingAttribute(key.to_string())),
    }
}

pub(crate) fn attr_bool(attrs: &Attrs, key: &str) -> Result<bool> {
    match attrs.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ModelError::invalid(key, "expected a boolean")),
        None => Err(ModelError::MissingAttribute(key.to_string())),
    }
}

pub(crate) fn attr_i64(attrs: &Attrs, key: &str) -> Result<i64> {
    match attrs.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ModelError::invalid(key, "expected an integer")),
        Some(_) => Err(ModelError::invalid(key, "expected an integer")),
        None => Err(ModelError::MissingAttribute(key.to_string())),
    }
}

/// Upstream ids are unbounded-precision numeric tokens; they are carried as
/// their exact decimal string form and never parsed into machine integers.
pub(crate) fn attr_ref(attrs: &Attrs, key: &str) -> Result<String> {
    match attrs.get(key) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ModelError::invalid(key, "expected a numeric id")),
        None => Err(ModelError::MissingAttribute(key.to_string())),
    }
}

/// Parse an upstream RFC 3339 timestamp into a UTC instant.
pub fn tower_time(attr: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ModelError::invalid(attr, e.to_string()))
}

pub(crate) fn attr_time(attrs: &Attrs, key: &str) -> Result<DateTime<Utc>> {
    tower_time(key, attr_str(attrs, key)?)
}

static INVENTORY_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"api/v2/inventories/(\w+)/").unwrap());

/// Extract the deferred inventory ref from an `inventory` attribute shaped
/// like `/api/v2/inventories/<id>/`. Non-string or non-matching values yield
/// nothing.
pub(crate) fn inventory_source_ref(attrs: &Attrs) -> Option<String> {
    match attrs.get("inventory") {
        Some(Value::String(url)) => INVENTORY_URL_RE
            .captures(url)
            .map(|c| c[1].to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attrs {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn missing_attribute_message_is_stable() {
        let a = attrs(json!({"name": "x"}));
        let err = require_attrs(&a, &["name", "id"]).unwrap_err();
        assert_eq!(err.to_string(), "Missing Required Attribute id");
    }

    #[test]
    fn first_missing_attribute_wins() {
        let a = attrs(json!({}));
        let err = require_attrs(&a, &["created", "modified", "name"]).unwrap_err();
        assert_eq!(err.to_string(), "Missing Required Attribute created");
    }

    #[test]
    fn refs_keep_arbitrary_precision() {
        let a: Attrs =
            serde_json::from_str(r#"{"id": 123456789012345678901234567890}"#).unwrap();
        assert_eq!(
            attr_ref(&a, "id").unwrap(),
            "123456789012345678901234567890"
        );
    }

    #[test]
    fn ref_rejects_booleans() {
        let a = attrs(json!({"id": true}));
        assert!(attr_ref(&a, "id").is_err());
    }

    #[test]
    fn parses_tower_timestamps_to_utc() {
        let t = tower_time("created", "2020-01-08T10:22:59.423567Z").unwrap();
        assert_eq!(t.timezone(), Utc);
        let bad = tower_time("created", "last tuesday");
        assert!(bad.is_err());
    }

    #[test]
    fn inventory_ref_comes_from_url_shape() {
        let a = attrs(json!({"inventory": "/api/v2/inventories/42/"}));
        assert_eq!(inventory_source_ref(&a).as_deref(), Some("42"));

        let a = attrs(json!({"inventory": 42}));
        assert_eq!(inventory_source_ref(&a), None);

        let a = attrs(json!({"inventory": "/api/v2/job_templates/42/"}));
        assert_eq!(inventory_source_ref(&a), None);
    }
}
