//! Dedupe key and content hash derivation.

use sha2::{Digest, Sha256};

use crate::event::Source;

/// Builds a dedupe key from a source tag and the source's natural key parts,
/// joined with `:`.
///
/// ```
/// use tip_core::dedupe::natural_key;
/// use tip_core::event::Source;
///
/// assert_eq!(
///     natural_key(Source::Wsb, &["2024-01-01", "AAPL", "post123"]),
///     "wsb:2024-01-01:AAPL:post123"
/// );
/// ```
#[must_use]
pub fn natural_key(source: Source, parts: &[&str]) -> String {
    let mut key = String::from(source.as_str());
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Fallback dedupe key for sources without a natural key: the hex SHA-256 of
/// the canonical JSON of the normalized record.
///
/// Object keys are emitted in sorted order with no insignificant whitespace,
/// so logically equal records hash equal.
#[must_use]
pub fn content_key(normalized: &serde_json::Value) -> String {
    content_hash(canonical_json(normalized).as_bytes())
}

/// Hex SHA-256 of `bytes`; used for the `hash` integrity column.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = serde_json::json!({"a": {"x": null, "y": [1, 2]}, "b": 1});

        assert_eq!(content_key(&a), content_key(&b));
    }

    #[test]
    fn test_content_key_distinguishes_values() {
        let a = serde_json::json!({"postId": "abc123"});
        let b = serde_json::json!({"postId": "abc124"});

        assert_ne!(content_key(&a), content_key(&b));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_json_is_compact() {
        let v = serde_json::json!({"k": "v", "n": [1, true]});
        assert_eq!(canonical_json(&v), r#"{"k":"v","n":[1,true]}"#);
    }
}
