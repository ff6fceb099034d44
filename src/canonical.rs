//! Canonical byte encodings.
//!
//! Two concerns live here: the deterministic JSON encoding hashed into
//! the audit tree (lexicographically sorted keys, compact separators,
//! UTF-8, integers stay integers), and the canonical form of boundary
//! strings, which closes encoding-gap bypasses of string-matching rules.

use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

/// Canonical JSON bytes of a value.
///
/// Object keys are emitted in lexicographic order regardless of how the
/// map was built, with no insignificant whitespace. Serializing the same
/// value twice always yields identical bytes.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Canonical bytes of any serializable value.
pub fn canonical_bytes<T: serde::Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let json = serde_json::to_value(value)?;
    Ok(canonical_json_bytes(&json))
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        // serde_json's Number display matches its serialization: integers
        // carry no trailing ".0".
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_escaped(out, key);
                out.push(b':');
                write_value(out, &map[key.as_str()]);
            }
            out.push(b'}');
        }
    }
}

fn write_escaped(out: &mut Vec<u8>, s: &str) {
    // serde_json never fails serializing a &str into a Vec.
    serde_json::to_writer(&mut *out, s).expect("string serialization is infallible");
}

/// Canonical form of a boundary string: NUL bytes stripped, Unicode NFC
/// normalization, surrounding whitespace trimmed.
pub fn canonicalize_str(raw: &str) -> String {
    let sanitized = raw.replace('\0', "");
    let normalized: String = sanitized.nfc().collect();
    normalized.trim().to_string()
}

/// Whether two boundary strings are semantically equivalent
pub fn strings_equivalent(a: &str, b: &str) -> bool {
    canonicalize_str(a) == canonicalize_str(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_compact() {
        let value = json!({"zebra": 1, "alpha": {"nested_b": true, "nested_a": "x"}});
        let bytes = canonical_json_bytes(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"nested_a":"x","nested_b":true},"zebra":1}"#
        );
    }

    #[test]
    fn test_integers_stay_integers() {
        let bytes = canonical_json_bytes(&json!({"n": 7, "f": 0.5}));
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"f":0.5,"n":7}"#);
    }

    #[test]
    fn test_deterministic() {
        let value = json!({"b": [1, 2, 3], "a": null});
        assert_eq!(canonical_json_bytes(&value), canonical_json_bytes(&value));
    }

    #[test]
    fn test_string_escaping() {
        let bytes = canonical_json_bytes(&json!("line\nbreak \"quoted\""));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#""line\nbreak \"quoted\"""#
        );
    }

    #[test]
    fn test_canonicalize_strips_nul_and_trims() {
        assert_eq!(canonicalize_str("  read\0 vault  "), "read vault");
    }

    #[test]
    fn test_canonicalize_unicode_nfc() {
        // e + combining accent normalizes to the composed form
        assert!(strings_equivalent("caf\u{e9}", "cafe\u{301}"));
        assert!(!strings_equivalent("read", "write"));
    }
}
