//! Structural spec diffing.
//!
//! Every layer of the operator uses this module to answer one question: did
//! anything actually change between the last applied spec and the declared
//! spec? Operands are compared as canonical JSON trees, so map key order
//! never matters, while array order is significant and must match both in
//! length and position-wise content.
//!
//! `null` and an empty/absent structure are deliberately NOT equal: an
//! operator clearing a field is a real change and must trigger a patch.

use anyhow::Result;
use serde_json::Value;

use pulsar_core::AppError;

/// A single field which differs between two specs.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDiff {
    /// Dotted path of the differing field, e.g. `broker.sets.set1.replicas`.
    pub path: String,
    /// The value on the expected (last applied) side.
    pub expected: Value,
    /// The value on the actual (declared) side.
    pub actual: Value,
}

/// The result of diffing two spec trees.
#[derive(Clone, Debug, Default)]
pub struct SpecDiff {
    /// All differing fields, in traversal order.
    pub fields: Vec<FieldDiff>,
}

impl SpecDiff {
    /// Whether the two operands were structurally equal.
    pub fn is_equal(&self) -> bool {
        self.fields.is_empty()
    }
}

impl std::fmt::Display for SpecDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<&str> = self.fields.iter().map(|field| field.path.as_str()).collect();
        write!(f, "{}", paths.join(", "))
    }
}

/// Structurally diff two canonical JSON trees.
///
/// Returns an error only when two container nodes of incompatible kinds
/// (object vs array) occupy the same path, which is a programmer error and
/// is never retried.
pub fn diff(expected: &Value, actual: &Value) -> Result<SpecDiff> {
    let mut out = SpecDiff::default();
    diff_at("", expected, actual, &mut out)?;
    Ok(out)
}

fn diff_at(path: &str, expected: &Value, actual: &Value, out: &mut SpecDiff) -> Result<()> {
    match (expected, actual) {
        (Value::Object(_), Value::Array(_)) | (Value::Array(_), Value::Object(_)) => {
            return Err(AppError::IncompatibleKinds(display_path(path)).into());
        }
        (Value::Object(expected), Value::Object(actual)) => {
            // Key order is irrelevant; keys are compared as sets.
            for (key, expected_val) in expected {
                let child = join_path(path, key);
                match actual.get(key) {
                    Some(actual_val) => diff_at(&child, expected_val, actual_val, out)?,
                    None => out.fields.push(FieldDiff { path: child, expected: expected_val.clone(), actual: Value::Null }),
                }
            }
            for (key, actual_val) in actual {
                if !expected.contains_key(key) {
                    let child = join_path(path, key);
                    out.fields.push(FieldDiff { path: child, expected: Value::Null, actual: actual_val.clone() });
                }
            }
        }
        (Value::Array(expected_items), Value::Array(actual_items)) => {
            if expected_items.len() != actual_items.len() {
                out.fields.push(FieldDiff { path: display_path(path), expected: expected.clone(), actual: actual.clone() });
                return Ok(());
            }
            for (idx, (expected_item, actual_item)) in expected_items.iter().zip(actual_items.iter()).enumerate() {
                let child = join_path(path, &idx.to_string());
                diff_at(&child, expected_item, actual_item, out)?;
            }
        }
        (expected, actual) => {
            if expected != actual {
                out.fields.push(FieldDiff { path: display_path(path), expected: expected.clone(), actual: actual.clone() });
            }
        }
    }
    Ok(())
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        ".".to_string()
    } else {
        path.to_string()
    }
}
