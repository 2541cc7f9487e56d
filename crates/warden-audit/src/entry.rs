use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `prev_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const FIELD_SEPARATOR: u8 = 0x1f;

/// One line of the audit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub prev_hash: String,
    pub entry_hash: String,
    pub actor: String,
    pub action: String,
    pub payload: Value,
    /// RFC 3339 with microseconds, kept as text so the hashed bytes are exactly what is stored.
    pub timestamp: String,
}

impl AuditEntry {
    /// Build the next link: hashes the entry against `prev_hash`.
    pub fn seal(
        sequence_no: u64,
        prev_hash: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self {
            sequence_no,
            prev_hash: prev_hash.into(),
            entry_hash: String::new(),
            actor: actor.into(),
            action: action.into(),
            payload,
            timestamp: format_timestamp(timestamp),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    /// Recompute this entry's hash from its stored fields.
    pub fn compute_hash(&self) -> String {
        compute_hash(
            &self.prev_hash,
            self.sequence_no,
            &self.actor,
            &self.action,
            &self.payload,
            &self.timestamp,
        )
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// sha256(prev ‖ 0x1f ‖ seq ‖ 0x1f ‖ actor ‖ 0x1f ‖ action ‖ 0x1f ‖ canonical(payload) ‖ 0x1f ‖ timestamp), hex.
pub fn compute_hash(
    prev_hash: &str,
    sequence_no: u64,
    actor: &str,
    action: &str,
    payload: &Value,
    timestamp: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(sequence_no.to_string().as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(actor.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(action.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(canonical_json(payload).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted recursively.
///
/// Independent of serde_json's map ordering features, so the same payload
/// always hashes the same way.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": null, "x": true}], "c": "s"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"s","z":[3,{"x":true,"y":null}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_escapes_strings() {
        let value = json!({"q\"k": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"q\"k":"line\nbreak"}"#);
    }

    #[test]
    fn hash_ignores_key_order() {
        let ts = "2026-01-01T00:00:00.000000Z";
        let a = compute_hash(GENESIS_HASH, 0, "s", "x", &json!({"a": 1, "b": 2}), ts);
        let b = compute_hash(GENESIS_HASH, 0, "s", "x", &json!({"b": 2, "a": 1}), ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_binds_every_field() {
        let ts = "2026-01-01T00:00:00.000000Z";
        let payload = json!({"node": "a"});
        let base = compute_hash(GENESIS_HASH, 0, "s", "x", &payload, ts);
        assert_ne!(base, compute_hash(GENESIS_HASH, 1, "s", "x", &payload, ts));
        assert_ne!(base, compute_hash(GENESIS_HASH, 0, "t", "x", &payload, ts));
        assert_ne!(base, compute_hash(GENESIS_HASH, 0, "s", "y", &payload, ts));
        assert_ne!(base, compute_hash(GENESIS_HASH, 0, "s", "x", &json!({"node": "b"}), ts));
        assert_ne!(
            base,
            compute_hash(GENESIS_HASH, 0, "s", "x", &payload, "2026-01-01T00:00:00.000001Z")
        );
    }

    #[test]
    fn seal_produces_verifiable_entry() {
        let entry = AuditEntry::seal(0, GENESIS_HASH, "scheduler", "node.transition", json!({}), Utc::now());
        assert_eq!(entry.entry_hash, entry.compute_hash());
        assert!(entry.timestamp.ends_with('Z'));
        assert!(entry.parsed_timestamp().is_some());
    }
}
