//! Log sanitizer: recursive redaction and truncation applied to every value
//! before it reaches the access-log sink.
//!
//! Works over the closed `serde_json::Value` shape set (object, array,
//! scalar, null) so bulk payloads can never leak into, or overflow, log
//! storage. Field masking preserves a short prefix/suffix so operators can
//! still correlate values without recovering them.

use serde_json::Value;
use std::collections::HashSet;

/// Mask a stringified value by length bracket.
///
/// `len > 12` keeps 3 chars each side, `8 < len <= 12` keeps 2, `4 < len <= 8`
/// keeps 1, `1 < len <= 4` keeps the first char only, anything shorter is
/// fully masked. Operates on chars, never splitting a code point.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let n = chars.len();
    let take = |r: std::ops::Range<usize>| chars[r].iter().collect::<String>();
    if n > 12 {
        format!("{}***{}", take(0..3), take(n - 3..n))
    } else if n > 8 {
        format!("{}***{}", take(0..2), take(n - 2..n))
    } else if n > 4 {
        format!("{}***{}", take(0..1), take(n - 1..n))
    } else if n > 1 {
        format!("{}*", take(0..1))
    } else {
        "**".to_string()
    }
}

/// Render a value as the string form that gets masked. Strings are used
/// verbatim, everything else falls back to its JSON encoding.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively sanitize `value` for logging.
///
/// * `allow` — at depth 1 only, object keys whose lowercased name is absent
///   from a non-`None` set are dropped entirely. Nested levels are never
///   filtered.
/// * `array_limit` — `0` replaces any sequence with a `"<type> (<len>)"`
///   placeholder; otherwise at most `array_limit` leading elements survive,
///   each sanitized independently.
/// * `encrypt` — lowercased names (hyphens stripped) whose values are
///   replaced by [`mask`] at any depth instead of being recursed into.
pub fn sanitize(
    value: &Value,
    allow: Option<&HashSet<String>>,
    array_limit: usize,
    depth: usize,
    encrypt: &HashSet<String>,
) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let lower = k.to_lowercase();
                if depth == 1 {
                    if let Some(allowed) = allow {
                        if !allowed.contains(&lower) {
                            continue;
                        }
                    }
                }
                if encrypt.contains(&lower.replace('-', "")) {
                    out.insert(k.clone(), Value::String(mask(&stringify(v))));
                } else {
                    out.insert(k.clone(), sanitize(v, None, array_limit, depth + 1, encrypt));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if array_limit == 0 {
                let ty = items.first().map(type_name).unwrap_or("value");
                return Value::String(format!("{} ({})", ty, items.len()));
            }
            let kept = items
                .iter()
                .take(array_limit)
                .map(|v| sanitize(v, None, array_limit, depth + 1, encrypt))
                .collect();
            Value::Array(kept)
        }
        // Null is the explicit marker for values that failed to unwrap.
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encrypt_set() -> HashSet<String> {
        ["password", "accesstoken"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn mask_length_brackets() {
        assert_eq!(mask("abcdefghijklmno"), "abc***mno");
        assert_eq!(mask("abcdefghij"), "ab***ij");
        assert_eq!(mask("abcdef"), "a***f");
        assert_eq!(mask("ab"), "a*");
        assert_eq!(mask("abcd"), "a*");
        assert_eq!(mask("a"), "**");
        assert_eq!(mask(""), "**");
    }

    #[test]
    fn mask_is_char_safe() {
        // 6 chars, multi-byte: must not split a code point.
        assert_eq!(mask("日本語日本語"), "日***語");
    }

    #[test]
    fn masks_encrypt_fields_at_any_depth() {
        let v = json!({"user": {"password": "hunter22"}, "accessToken": "tok"});
        let out = sanitize(&v, None, 10, 1, &encrypt_set());
        assert_eq!(out["user"]["password"], json!("h***2"));
        assert_eq!(out["accessToken"], json!("t*"));
    }

    #[test]
    fn allow_set_applies_only_at_depth_one() {
        let allow: HashSet<String> = ["kept".to_string()].into_iter().collect();
        let v = json!({"kept": {"dropped_name_ok": 1}, "dropped": 2});
        let out = sanitize(&v, Some(&allow), 10, 1, &encrypt_set());
        assert!(out.get("dropped").is_none());
        assert_eq!(out["kept"]["dropped_name_ok"], json!(1));
    }

    #[test]
    fn truncates_sequences_to_limit() {
        let v = json!([1, 2, 3, 4, 5]);
        let out = sanitize(&v, None, 2, 1, &encrypt_set());
        assert_eq!(out, json!([1, 2]));
    }

    #[test]
    fn zero_limit_collapses_sequences() {
        let v = json!(["a", "b", "c", "d", "e"]);
        let out = sanitize(&v, None, 0, 1, &encrypt_set());
        assert_eq!(out, json!("string (5)"));
        let empty = sanitize(&json!([]), None, 0, 1, &encrypt_set());
        assert_eq!(empty, json!("value (0)"));
    }

    #[test]
    fn scalars_and_null_pass_through() {
        let enc = encrypt_set();
        assert_eq!(sanitize(&json!(42), None, 1, 1, &enc), json!(42));
        assert_eq!(sanitize(&Value::Null, None, 1, 1, &enc), Value::Null);
    }
}
