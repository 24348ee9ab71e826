//! Versioned upgrades for on-disk item records.
//!
//! The version field is read first; each gap has one pure upgrade function,
//! applied in order before any other validation.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::item::ITEM_SCHEMA_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrateError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("schema_version must be a non-negative integer")]
    BadVersion,
    #[error("schema_version {found} is newer than supported version {supported}")]
    TooNew { found: u64, supported: u64 },
    #[error("cannot upgrade v{from}: {reason}")]
    Malformed { from: u64, reason: String },
}

/// Records without a version field are version 0.
pub fn schema_version_of(value: &Value) -> Result<u64, MigrateError> {
    let obj = value.as_object().ok_or(MigrateError::NotAnObject)?;
    match obj.get("schema_version") {
        None => Ok(0),
        Some(v) => v.as_u64().ok_or(MigrateError::BadVersion),
    }
}

/// Upgrade an item record to the current version. Returns the value and the
/// version it started at.
pub fn upgrade_item(mut value: Value) -> Result<(Value, u64), MigrateError> {
    let original = schema_version_of(&value)?;
    let supported = u64::from(ITEM_SCHEMA_VERSION);
    if original > supported {
        return Err(MigrateError::TooNew {
            found: original,
            supported,
        });
    }
    let mut version = original;
    while version < supported {
        value = match version {
            0 => upgrade_v0_to_v1(value)?,
            other => {
                return Err(MigrateError::Malformed {
                    from: other,
                    reason: "no upgrade path".to_string(),
                });
            }
        };
        version += 1;
    }
    Ok((value, original))
}

/// v0 stored dependencies under `dependencies` and the review request under `pr`
/// (either a URL string or `{url, number}`).
pub fn upgrade_v0_to_v1(value: Value) -> Result<Value, MigrateError> {
    let Value::Object(mut obj) = value else {
        return Err(MigrateError::NotAnObject);
    };
    if let Some(deps) = obj.remove("dependencies")
        && !obj.contains_key("depends_on")
    {
        obj.insert("depends_on".to_string(), deps);
    }
    if let Some(pr) = obj.remove("pr") {
        move_pr_reference(&mut obj, pr)?;
    }
    obj.entry("overview")
        .or_insert_with(|| Value::String(String::new()));
    obj.insert("schema_version".to_string(), Value::from(1));
    Ok(Value::Object(obj))
}

fn move_pr_reference(obj: &mut Map<String, Value>, pr: Value) -> Result<(), MigrateError> {
    match pr {
        Value::Null => {}
        Value::String(url) => {
            obj.insert("pr_url".to_string(), Value::String(url));
        }
        Value::Object(mut pr) => {
            if let Some(url) = pr.remove("url") {
                obj.insert("pr_url".to_string(), url);
            }
            if let Some(number) = pr.remove("number") {
                obj.insert("pr_number".to_string(), number);
            }
        }
        other => {
            return Err(MigrateError::Malformed {
                from: 0,
                reason: format!("unexpected pr value {other}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v0_is_renamed_and_versioned() {
        let v0 = json!({
            "id": "001-a",
            "title": "A",
            "state": "idea",
            "dependencies": ["002-b"],
            "pr": {"url": "https://example.test/pr/3", "number": 3},
        });
        let (v1, from) = upgrade_item(v0).expect("upgrade");
        assert_eq!(from, 0);
        assert_eq!(v1["schema_version"], 1);
        assert_eq!(v1["depends_on"], json!(["002-b"]));
        assert_eq!(v1["pr_number"], 3);
        assert!(v1.get("dependencies").is_none());
        assert!(v1.get("pr").is_none());
    }

    #[test]
    fn current_version_is_untouched() {
        let v1 = json!({"schema_version": 1, "id": "001-a"});
        let (out, from) = upgrade_item(v1.clone()).expect("upgrade");
        assert_eq!(from, 1);
        assert_eq!(out, v1);
    }

    #[test]
    fn newer_version_is_rejected() {
        let err = upgrade_item(json!({"schema_version": 9})).expect_err("too new");
        assert_eq!(
            err,
            MigrateError::TooNew {
                found: 9,
                supported: 1
            }
        );
    }

    #[test]
    fn bad_pr_shape_is_not_coerced() {
        let err = upgrade_v0_to_v1(json!({"pr": 12})).expect_err("malformed");
        assert!(matches!(err, MigrateError::Malformed { from: 0, .. }));
    }
}
