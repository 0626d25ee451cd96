//! Deterministic equality inputs: partition-set normalization and canonical
//! JSON serialization.
//!
//! Two `{ partitions, event }` pairs are equal iff their canonical byte
//! strings are equal. The byte form is UTF-8 with NFC-normalized strings,
//! object keys sorted at every depth, arrays in input order, and no
//! insignificant whitespace. A blake3 digest of the bytes is the stored
//! equality oracle; `client_id` and envelope fields never participate.

use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::{EventBody, ProtocolError, MAX_PARTITIONS_PER_EVENT, MAX_PARTITION_LEN};

//─────────────────────────────
//  Partition normalization
//─────────────────────────────

/// Normalize a partition set: lexicographic sort plus dedup.
///
/// Rejects an empty set, more than [`MAX_PARTITIONS_PER_EVENT`] entries
/// after dedup, and any entry that is empty or longer than
/// [`MAX_PARTITION_LEN`] bytes. All rejections are `validation_failed`.
pub fn normalize_partitions(input: &[String]) -> Result<Vec<String>, ProtocolError> {
    if input.is_empty() {
        return Err(ProtocolError::validation_failed("partition set must not be empty"));
    }
    for p in input {
        if p.is_empty() {
            return Err(ProtocolError::validation_failed("partition label must not be empty"));
        }
        if p.len() > MAX_PARTITION_LEN {
            return Err(ProtocolError::validation_failed(format!(
                "partition label exceeds {MAX_PARTITION_LEN} bytes"
            )));
        }
    }
    let mut out = input.to_vec();
    out.sort();
    out.dedup();
    if out.len() > MAX_PARTITIONS_PER_EVENT {
        return Err(ProtocolError::validation_failed(format!(
            "partition set exceeds {MAX_PARTITIONS_PER_EVENT} entries"
        )));
    }
    Ok(out)
}

/// Set intersection test over two normalized (sorted, deduped) slices.
pub fn intersects(a: &[String], b: &[String]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

//─────────────────────────────
//  Canonical JSON
//─────────────────────────────

/// Serialize a JSON value into its canonical byte form.
///
/// Idempotent: canonicalizing the parse of a canonical form yields the same
/// bytes. Key order of the input never influences the output.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort by the NFC form of the key since that is what is emitted.
            let mut entries: Vec<(String, &Value)> =
                map.iter().map(|(k, v)| (k.nfc().collect::<String>(), v)).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.push(b'{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(val, out);
            }
            out.push(b'}');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.nfc() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

//─────────────────────────────
//  Equality oracle
//─────────────────────────────

/// Compute the canonical form digest of `{ partitions, event }`.
///
/// `partitions` must already be normalized (the caller normalizes once and
/// carries the result). Returns the blake3 hex digest of the canonical
/// bytes; equal digests mean canonically equal inputs.
pub fn canonical_form(partitions: &[String], event: &EventBody) -> Result<String, ProtocolError> {
    let event_value = serde_json::to_value(event)
        .map_err(|e| ProtocolError::server_error(format!("event not serializable: {e}")))?;
    let doc = serde_json::json!({
        "event": event_value,
        "partitions": partitions,
    });
    let bytes = canonical_json_bytes(&doc);
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn parts(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_sorts_and_dedupes() {
        let out = normalize_partitions(&parts(&["B", "a", "A", "b", "a"])).unwrap();
        assert_eq!(out, parts(&["A", "B", "a", "b"]));
    }

    #[test]
    fn normalize_rejects_empty_set_and_entries() {
        assert_eq!(
            normalize_partitions(&[]).unwrap_err().code,
            crate::ErrorCode::ValidationFailed
        );
        assert!(normalize_partitions(&parts(&["ok", ""])).is_err());
        let long = "x".repeat(MAX_PARTITION_LEN + 1);
        assert!(normalize_partitions(&[long]).is_err());
    }

    #[test]
    fn normalize_rejects_oversized_set() {
        let many: Vec<String> = (0..=MAX_PARTITIONS_PER_EVENT).map(|i| format!("p{i:03}")).collect();
        assert!(normalize_partitions(&many).is_err());
    }

    #[test]
    fn intersects_walks_sorted_sets() {
        assert!(intersects(&parts(&["a", "c"]), &parts(&["b", "c"])));
        assert!(!intersects(&parts(&["a", "b"]), &parts(&["c", "d"])));
        assert!(!intersects(&[], &parts(&["a"])));
    }

    #[test]
    fn canonical_bytes_sort_keys_at_every_depth() {
        let a = json!({"b": {"y": 1, "x": 2}, "a": [3, 1]});
        let b = json!({"a": [3, 1], "b": {"x": 2, "y": 1}});
        assert_eq!(canonical_json_bytes(&a), canonical_json_bytes(&b));
        // Arrays keep input order.
        let c = json!({"a": [1, 3], "b": {"x": 2, "y": 1}});
        assert_ne!(canonical_json_bytes(&a), canonical_json_bytes(&c));
    }

    #[test]
    fn canonical_bytes_have_no_insignificant_whitespace() {
        let v = json!({"k": [1, {"n": null}], "s": "hi"});
        let bytes = canonical_json_bytes(&v);
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"k":[1,{"n":null}],"s":"hi"}"#);
    }

    #[test]
    fn canonical_form_ignores_partition_permutation() {
        let event = EventBody::new("event", json!({"schema": "note.create", "data": {"t": "hi"}}));
        let p1 = normalize_partitions(&parts(&["B", "a", "A", "b"])).unwrap();
        let p2 = normalize_partitions(&parts(&["b", "B", "A", "a"])).unwrap();
        assert_eq!(canonical_form(&p1, &event).unwrap(), canonical_form(&p2, &event).unwrap());
    }

    #[test]
    fn canonical_form_differs_on_payload_change() {
        let p = parts(&["p1"]);
        let e1 = EventBody::new("event", json!({"data": {"t": "hi"}}));
        let e2 = EventBody::new("event", json!({"data": {"t": "bye"}}));
        assert_ne!(canonical_form(&p, &e1).unwrap(), canonical_form(&p, &e2).unwrap());
    }

    #[test]
    fn nfc_normalization_unifies_composed_and_decomposed() {
        // U+00E9 vs U+0065 U+0301 are the same character after NFC.
        let composed = json!({"t": "caf\u{e9}"});
        let decomposed = json!({"t": "cafe\u{301}"});
        assert_eq!(canonical_json_bytes(&composed), canonical_json_bytes(&decomposed));
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(s in "[a-zA-Z0-9_{}\\[\\]:, \"]{0,64}") {
            // Only inputs that parse as JSON participate.
            if let Ok(v) = serde_json::from_str::<Value>(&s) {
                let once = canonical_json_bytes(&v);
                let reparsed: Value = serde_json::from_slice(&once).unwrap();
                let twice = canonical_json_bytes(&reparsed);
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn normalize_is_idempotent(xs in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
            let once = normalize_partitions(&xs).unwrap();
            let twice = normalize_partitions(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
