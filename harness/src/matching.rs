//! Structural subset matching for JSON values.
//!
//! `expected` matches `actual` when every object key in `expected` is present
//! in `actual` with a matching value, every element of an `expected` array
//! matches a distinct element of the `actual` array in the same relative
//! order, and scalars are equal. Extra keys and elements in `actual` are
//! ignored.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// `$`-rooted path of the first difference, e.g. `$.items[2].label`.
    pub path: String,
    pub expected: Value,
    /// `None` when the key is missing.
    pub actual: Option<Value>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual {
            Some(actual) => write!(
                f,
                "mismatch at {}: expected {}, found {}",
                self.path, self.expected, actual
            ),
            None => write!(
                f,
                "mismatch at {}: expected {}, found nothing",
                self.path, self.expected
            ),
        }
    }
}

impl std::error::Error for Mismatch {}

pub fn json_contains(actual: &Value, expected: &Value) -> Result<(), Mismatch> {
    contains_at("$", actual, expected)
}

#[must_use]
pub fn json_matches(actual: &Value, expected: &Value) -> bool {
    json_contains(actual, expected).is_ok()
}

fn contains_at(path: &str, actual: &Value, expected: &Value) -> Result<(), Mismatch> {
    let mismatch = || Mismatch {
        path: path.to_string(),
        expected: expected.clone(),
        actual: Some(actual.clone()),
    };
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => {
            for (key, want) in want {
                let child = format!("{path}.{key}");
                match have.get(key) {
                    Some(have) => contains_at(&child, have, want)?,
                    None => {
                        return Err(Mismatch {
                            path: child,
                            expected: want.clone(),
                            actual: None,
                        });
                    }
                }
            }
            Ok(())
        }
        (Value::Array(want), Value::Array(have)) => {
            let mut rest = have.iter();
            for (i, want) in want.iter().enumerate() {
                if !rest.any(|have| contains_at(path, have, want).is_ok()) {
                    return Err(Mismatch {
                        path: format!("{path}[{i}]"),
                        expected: want.clone(),
                        actual: None,
                    });
                }
            }
            Ok(())
        }
        _ if expected == actual => Ok(()),
        _ => Err(mismatch()),
    }
}
