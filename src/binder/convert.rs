//! Lenient conversion from a dynamic argument map into a typed struct.
//!
//! Arguments arrive as strings (query, form, path captures) or as whatever
//! the JSON body carried, while handlers want typed fields. Conversion is
//! shape-directed: serialize `T::default()` to learn which fields `T` has and
//! what kind each one is, coerce matching argument entries toward that kind,
//! and leave everything that does not convert at its default. Unknown
//! argument keys are ignored. Conversion never fails.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Convert `value` into `T`, field by field, keeping defaults for anything
/// missing or unconvertible.
pub fn lenient<T>(value: &Value) -> T
where
    T: Default + Serialize + DeserializeOwned,
{
    let shape = match serde_json::to_value(T::default()) {
        Ok(shape) => shape,
        Err(_) => return T::default(),
    };
    let patched = patch(&shape, value);
    serde_json::from_value(patched).unwrap_or_default()
}

/// Overlay `value` onto `shape`, coercing each provided entry toward the
/// kind the shape expects.
fn patch(shape: &Value, value: &Value) -> Value {
    match (shape, value) {
        (Value::Object(shape_map), Value::Object(value_map)) => {
            let mut out = shape_map.clone();
            for (key, target) in shape_map {
                if let Some(provided) = value_map.get(key) {
                    if let Some(coerced) = coerce(provided, target) {
                        out.insert(key.clone(), coerced);
                    }
                }
            }
            Value::Object(out)
        }
        _ => coerce(value, shape).unwrap_or_else(|| shape.clone()),
    }
}

/// Coerce `value` toward the kind of `target`. Returns `None` when no
/// sensible conversion exists.
fn coerce(value: &Value, target: &Value) -> Option<Value> {
    match target {
        Value::String(_) => Some(match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Null => return None,
            other => Value::String(scalar_string(other)?),
        }),
        Value::Number(n) => match value {
            Value::Number(m) => {
                if n.is_f64() || m.as_i64().is_some() || m.as_u64().is_some() {
                    Some(value.clone())
                } else {
                    // Float into an integer field: only whole values fit.
                    m.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::Number((f as i64).into()))
                }
            }
            Value::String(s) => {
                if n.is_f64() {
                    s.trim().parse::<f64>().ok().and_then(|f| {
                        serde_json::Number::from_f64(f).map(Value::Number)
                    })
                } else if let Ok(i) = s.trim().parse::<i64>() {
                    Some(Value::Number(i.into()))
                } else {
                    // "3.0" still converts into an integer field when whole.
                    s.trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::Number((f as i64).into()))
                }
            }
            Value::Bool(b) => Some(Value::Number(i64::from(*b).into())),
            _ => None,
        },
        Value::Bool(_) => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => Some(Value::Bool(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ))),
            Value::Number(n) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            _ => None,
        },
        // Arrays, objects and null-defaulted fields take the value as given;
        // the final deserialize decides whether it fits.
        _ => Some(value.clone()),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Query {
        id: u64,
        name: String,
        active: bool,
        ratio: f64,
    }

    #[test]
    fn strings_convert_to_typed_fields() {
        let value = json!({"id": "42", "name": 7, "active": "true", "ratio": "0.5"});
        let q: Query = lenient(&value);
        assert_eq!(
            q,
            Query {
                id: 42,
                name: "7".to_string(),
                active: true,
                ratio: 0.5
            }
        );
    }

    #[test]
    fn unknown_keys_and_bad_values_keep_defaults() {
        let value = json!({"id": "not-a-number", "ghost": 1, "name": "ok"});
        let q: Query = lenient(&value);
        assert_eq!(q.id, 0);
        assert_eq!(q.name, "ok");
    }

    #[test]
    fn missing_fields_keep_defaults() {
        let q: Query = lenient(&json!({}));
        assert_eq!(q, Query::default());
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct WithSeq {
        tags: Vec<String>,
    }

    #[test]
    fn sequences_pass_through() {
        let q: WithSeq = lenient(&json!({"tags": ["a", "b"]}));
        assert_eq!(q.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn whole_floats_fill_integer_fields() {
        let q: Query = lenient(&json!({"id": "3.0"}));
        assert_eq!(q.id, 3);
    }
}
