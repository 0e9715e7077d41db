use crate::model::Document;

/// Fields stripped from every document before hashing or writing across,
/// regardless of configuration. Operators may add more via
/// `excluded_fields`.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &[
    "modified",
    "modified_by",
    "creation",
    "owner",
    "idx",
    "docstatus",
];

pub fn default_excluded_fields() -> Vec<String> {
    DEFAULT_EXCLUDED_FIELDS.iter().map(|s| s.to_string()).collect()
}

/// Canonical content hash: strip excluded fields, serialize the remainder
/// as JSON with lexicographically sorted keys and no whitespace, then MD5
/// it. Stable across repeated serializations of equivalent documents since
/// `serde_json::Map` iteration order follows insertion order but the
/// field set is first copied into a `BTreeMap` to force key order.
pub fn hash_document(doc: &Document, excluded: &[String]) -> String {
    let stripped = doc.without_fields(excluded);
    let sorted: std::collections::BTreeMap<String, serde_json::Value> =
        stripped.into_iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// `∅` hashes to the empty string, per the direction resolver's decision
/// table.
pub fn hash_optional(doc: Option<&Document>, excluded: &[String]) -> String {
    match doc {
        Some(d) => hash_document(d, excluded),
        None => String::new(),
    }
}

/// Lowercase hex encoding, shared by the content hash and the webhook HMAC
/// signature so both speak the same wire format.
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Parses a lowercase (or mixed-case) hex string back into bytes. Returns
/// `None` on odd length or a non-hex digit, which the webhook signature
/// check treats as an invalid signature rather than panicking.
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(fields: serde_json::Value) -> Document {
        Document::new(fields.as_object().unwrap().clone())
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let excluded = default_excluded_fields();
        let a = doc(json!({"name": "C1", "customer_name": "Acme", "modified": "t1"}));
        let b = doc(json!({"modified": "t2", "customer_name": "Acme", "name": "C1"}));
        assert_eq!(hash_document(&a, &excluded), hash_document(&b, &excluded));
    }

    #[test]
    fn hash_changes_when_content_changes() {
        let excluded = default_excluded_fields();
        let a = doc(json!({"name": "C1", "customer_name": "Acme"}));
        let b = doc(json!({"name": "C1", "customer_name": "AcmeCo"}));
        assert_ne!(hash_document(&a, &excluded), hash_document(&b, &excluded));
    }

    #[test]
    fn hash_is_32_hex_digits() {
        let excluded = default_excluded_fields();
        let d = doc(json!({"name": "C1"}));
        let h = hash_document(&d, &excluded);
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn absent_document_hashes_to_empty_string() {
        assert_eq!(hash_optional(None, &default_excluded_fields()), "");
    }

    #[test]
    fn extra_configured_excluded_fields_are_ignored_too() {
        let mut excluded = default_excluded_fields();
        excluded.push("internal_note".to_string());
        let a = doc(json!({"name": "C1", "internal_note": "foo"}));
        let b = doc(json!({"name": "C1", "internal_note": "bar"}));
        assert_eq!(hash_document(&a, &excluded), hash_document(&b, &excluded));
    }

    #[test]
    fn hex_round_trips_through_encode_and_decode() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "deadbeef0001");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_malformed_input() {
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
