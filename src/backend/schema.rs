//! Strict validation of backend-service configs against provider schemas.
//!
//! Providers declare a JSON Schema subset; stored configs are validated
//! before any instance is constructed, and again on every admin write. The
//! goal is operator-actionable messages that say exactly which key is
//! wrong and what the provider expects.
//!
//! # Validation steps (in order)
//!
//! 1. **Required keys** — every name under `required:` must be present and
//!    non-null.
//! 2. **Unknown keys** — keys not listed under `properties:` are rejected
//!    when the schema sets `additionalProperties: false`.
//! 3. **Type check** — `string`, `integer`, `number`, `boolean` per the
//!    declared type.
//! 4. **Enum values** — when a property declares `enum: [...]`.
//! 5. **String/number bounds** — `minLength`, `maxLength`, `minimum`,
//!    `maximum` where declared.

use std::fmt::Write as _;

use serde_json::Value;

use crate::{Error, Result};

/// A single violation with an operator-actionable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Offending key (empty for top-level issues)
    pub key: String,
    /// What is wrong
    pub message: String,
}

impl Violation {
    fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Validate `config` against `schema`.
///
/// # Errors
///
/// [`Error::Config`] listing every violation found.
pub fn validate(schema: &Value, config: &Value) -> Result<()> {
    let violations = check(schema, config);
    if violations.is_empty() {
        return Ok(());
    }

    let mut msg = String::from("backend config rejected:");
    for v in &violations {
        if v.key.is_empty() {
            let _ = write!(msg, " {};", v.message);
        } else {
            let _ = write!(msg, " '{}': {};", v.key, v.message);
        }
    }
    Err(Error::Config(msg.trim_end_matches(';').to_string()))
}

/// Collect all violations without erroring.
#[must_use]
pub fn check(schema: &Value, config: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();

    let Some(object) = config.as_object() else {
        violations.push(Violation::new("", "config must be a JSON object"));
        return violations;
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match object.get(name) {
                None | Some(Value::Null) => {
                    violations.push(Violation::new(name, "required key is missing"));
                }
                Some(_) => {}
            }
        }
    }

    let closed = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false);
    if closed {
        for key in object.keys() {
            if !properties.contains_key(key) {
                violations.push(Violation::new(key, "unknown key"));
            }
        }
    }

    for (key, value) in object {
        let Some(prop) = properties.get(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        check_value(key, prop, value, &mut violations);
    }

    violations
}

fn check_value(key: &str, prop: &Value, value: &Value, violations: &mut Vec<Violation>) {
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => {
            let Some(s) = value.as_str() else {
                violations.push(Violation::new(key, "expected a string"));
                return;
            };
            if let Some(min) = prop.get("minLength").and_then(Value::as_u64) {
                if (s.len() as u64) < min {
                    violations.push(Violation::new(key, format!("shorter than {min} characters")));
                }
            }
            if let Some(max) = prop.get("maxLength").and_then(Value::as_u64) {
                if (s.len() as u64) > max {
                    violations.push(Violation::new(key, format!("longer than {max} characters")));
                }
            }
        }
        Some("integer") => {
            if value.as_i64().is_none() {
                violations.push(Violation::new(key, "expected an integer"));
                return;
            }
            check_bounds(key, prop, value, violations);
        }
        Some("number") => {
            if value.as_f64().is_none() {
                violations.push(Violation::new(key, "expected a number"));
                return;
            }
            check_bounds(key, prop, value, violations);
        }
        Some("boolean") => {
            if !value.is_boolean() {
                violations.push(Violation::new(key, "expected a boolean"));
            }
        }
        _ => {}
    }

    if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(ToString::to_string).collect();
            violations.push(Violation::new(
                key,
                format!("must be one of {}", options.join(", ")),
            ));
        }
    }
}

fn check_bounds(key: &str, prop: &Value, value: &Value, violations: &mut Vec<Violation>) {
    let Some(n) = value.as_f64() else { return };
    if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
        if n < min {
            violations.push(Violation::new(key, format!("below minimum {min}")));
        }
    }
    if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
        if n > max {
            violations.push(Violation::new(key, format!("above maximum {max}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "api_url": {"type": "string", "minLength": 8},
                "api_key": {"type": "string"},
                "server_id": {"type": "string"},
                "timeout": {"type": "integer", "minimum": 1, "maximum": 300},
                "mode": {"type": "string", "enum": ["live", "sandbox"]}
            },
            "required": ["api_url", "api_key"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_config_passes() {
        // GIVEN: a config satisfying all constraints
        let config = json!({
            "api_url": "https://pdns.example.net/api/v1",
            "api_key": "k",
            "timeout": 30,
            "mode": "live"
        });

        // THEN: no violations
        assert!(check(&schema(), &config).is_empty());
        assert!(validate(&schema(), &config).is_ok());
    }

    #[test]
    fn missing_required_key_is_reported() {
        let config = json!({"api_url": "https://pdns.example.net"});
        let violations = check(&schema(), &config);
        assert!(violations.iter().any(|v| v.key == "api_key"));
    }

    #[test]
    fn unknown_key_rejected_when_closed() {
        let config = json!({"api_url": "https://x.example/", "api_key": "k", "extra": 1});
        let violations = check(&schema(), &config);
        assert!(violations.iter().any(|v| v.key == "extra"));
    }

    #[test]
    fn type_and_bound_violations() {
        let config = json!({"api_url": "short", "api_key": 5, "timeout": 500});
        let violations = check(&schema(), &config);
        assert!(violations.iter().any(|v| v.key == "api_url"));
        assert!(violations.iter().any(|v| v.key == "api_key"));
        assert!(violations.iter().any(|v| v.key == "timeout"));
    }

    #[test]
    fn enum_violation_lists_options() {
        let config = json!({"api_url": "https://x.example/", "api_key": "k", "mode": "test"});
        let violations = check(&schema(), &config);
        let v = violations.iter().find(|v| v.key == "mode").unwrap();
        assert!(v.message.contains("live"));
    }

    #[test]
    fn non_object_config_is_one_violation() {
        let violations = check(&schema(), &json!([1, 2]));
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn validate_error_names_offending_keys() {
        let config = json!({"api_url": "https://x.example/"});
        let err = validate(&schema(), &config).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }
}
