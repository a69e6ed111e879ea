//! Per-key meta sidecar records.
//!
//! Every user key `k` has a companion entry at `k:meta` recording the
//! hybrid-logical timestamp of the writer that produced the current value,
//! plus a tombstone flag for deletions. The record is a small JSON object
//! so peers written against older builds (or other runtimes) can read it;
//! the parser accepts integer or floating-point numerics and ignores
//! unknown fields.
//!
//! Serialization is canonical — identical content produces identical bytes
//! on every node — because meta entries participate in Merkle hashing and
//! replicas must agree byte-for-byte once they hold the same state.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix marking internal meta keys.
pub const META_SUFFIX: &[u8] = b":meta";

/// The meta key for a user key.
pub fn meta_key_for(key: &[u8]) -> Vec<u8> {
    let mut meta_key = Vec::with_capacity(key.len() + META_SUFFIX.len());
    meta_key.extend_from_slice(key);
    meta_key.extend_from_slice(META_SUFFIX);
    meta_key
}

/// Whether a key is an internal meta key.
pub fn is_meta_key(key: &[u8]) -> bool {
    key.ends_with(META_SUFFIX)
}

/// The writer record stored against `<key>:meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Wall-clock microseconds of the writing timestamp.
    pub ts: i64,
    /// Logical counter of the writing timestamp.
    pub l: u32,
    /// Node id of the writer.
    pub n: u32,
    /// Set when the current value is a deletion.
    #[serde(default, skip_serializing_if = "is_false")]
    pub tombstone: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl MetaRecord {
    /// Record for a live value written at `ts`.
    pub fn live(ts: Timestamp) -> Self {
        Self {
            ts: ts.wall,
            l: ts.logical,
            n: ts.node_id,
            tombstone: false,
        }
    }

    /// Record for a deletion written at `ts`.
    pub fn tombstone(ts: Timestamp) -> Self {
        Self {
            tombstone: true,
            ..Self::live(ts)
        }
    }

    /// The zero record: no writer on file, ordered before every event.
    pub fn zero() -> Self {
        Self {
            ts: 0,
            l: 0,
            n: 0,
            tombstone: false,
        }
    }

    /// The writing timestamp.
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.ts, self.l, self.n)
    }

    /// Canonical byte image, identical for identical content on any node.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Struct fields serialize in declaration order; this cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Lenient parse. Numerics may be integers or floats; unknown fields
    /// are ignored; anything unparseable yields `None`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let obj = value.as_object()?;
        Some(Self {
            ts: numeric_i64(obj.get("ts"))?,
            l: numeric_i64(obj.get("l")).unwrap_or(0) as u32,
            n: numeric_i64(obj.get("n")).unwrap_or(0) as u32,
            tombstone: obj
                .get("tombstone")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Read a JSON number as i64, accepting either representation.
fn numeric_i64(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let record = MetaRecord::live(Timestamp::new(1_700_000_000_000_000, 3, 7));
        let parsed = MetaRecord::parse(&record.to_bytes()).unwrap();
        assert_eq!(parsed, record);
        assert!(!parsed.tombstone);
    }

    #[test]
    fn tombstone_flag_survives() {
        let record = MetaRecord::tombstone(Timestamp::new(100, 0, 1));
        let parsed = MetaRecord::parse(&record.to_bytes()).unwrap();
        assert!(parsed.tombstone);
        assert_eq!(parsed.timestamp(), Timestamp::new(100, 0, 1));
    }

    #[test]
    fn live_record_omits_the_tombstone_field() {
        let bytes = MetaRecord::live(Timestamp::new(5, 0, 1)).to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("tombstone"));
    }

    #[test]
    fn accepts_float_numerics() {
        let parsed = MetaRecord::parse(br#"{"ts": 100.0, "l": 2.0, "n": 3.0}"#).unwrap();
        assert_eq!(parsed.timestamp(), Timestamp::new(100, 2, 3));
    }

    #[test]
    fn ignores_unknown_fields() {
        let parsed = MetaRecord::parse(br#"{"ts": 1, "l": 0, "n": 1, "lane": "x"}"#).unwrap();
        assert_eq!(parsed.ts, 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(MetaRecord::parse(b"").is_none());
        assert!(MetaRecord::parse(b"not json").is_none());
        assert!(MetaRecord::parse(br#"{"l": 1}"#).is_none());
    }

    #[test]
    fn canonical_bytes_match_across_nodes() {
        // Two nodes that agree on content must agree on bytes.
        let a = MetaRecord::live(Timestamp::new(42, 1, 9)).to_bytes();
        let b = MetaRecord::live(Timestamp::new(42, 1, 9)).to_bytes();
        assert_eq!(a, b);
    }

    #[test]
    fn meta_key_helpers() {
        assert_eq!(meta_key_for(b"user/1"), b"user/1:meta".to_vec());
        assert!(is_meta_key(b"user/1:meta"));
        assert!(!is_meta_key(b"user/1"));
    }
}
