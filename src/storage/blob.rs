//! Schemaless value container.
//!
//! A [`Blob`] is the unit stored against every key: either a JSON document
//! whose named fields can be set in place, or an opaque byte payload. The
//! container guarantees a stable byte image — the same logical content
//! always serializes to the same bytes — because the Merkle index hashes
//! that image and two replicas holding equal state must produce equal leaf
//! hashes.
//!
//! An empty blob is the tombstone representation: a deleted key keeps its
//! slot with empty content so the deletion participates in anti-entropy.

use crate::core::error::{MeridianError, MeridianResult};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Repr {
    /// A parsed JSON value, field-addressable when it is an object.
    /// serde_json's default map is ordered, so serialization is stable.
    Json(Value),
    /// Raw bytes, including the empty tombstone payload.
    Raw(Vec<u8>),
}

/// A stored value: JSON document or opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    repr: Repr,
}

impl Blob {
    /// An empty blob (the tombstone representation).
    pub fn new() -> Self {
        Self {
            repr: Repr::Raw(Vec::new()),
        }
    }

    /// An empty JSON document, ready for field mutation.
    pub fn new_document() -> Self {
        Self {
            repr: Repr::Json(Value::Object(serde_json::Map::new())),
        }
    }

    /// Build a blob directly from a payload, as [`overwrite`](Self::overwrite)
    /// would store it.
    pub fn from_payload(data: &[u8]) -> Self {
        let mut blob = Self::new();
        blob.overwrite(data);
        blob
    }

    /// Replace the entire content.
    ///
    /// Payloads that look like JSON (leading `{` or `[`) are parsed so that
    /// later field mutations can address them; anything else — including a
    /// JSON-looking payload that fails to parse — is kept as raw bytes.
    pub fn overwrite(&mut self, data: &[u8]) {
        let looks_like_json = matches!(data.first(), Some(&b'{') | Some(&b'['));
        if looks_like_json {
            if let Ok(value) = serde_json::from_slice::<Value>(data) {
                self.repr = Repr::Json(value);
                return;
            }
        }
        self.repr = Repr::Raw(data.to_vec());
    }

    /// Set an integer field in place.
    ///
    /// Promotes an empty blob to a fresh document; fails on any other
    /// non-document content.
    pub fn set_int(&mut self, field: &str, value: i64) -> MeridianResult<()> {
        self.document_mut()?
            .insert(field.to_string(), Value::from(value));
        Ok(())
    }

    /// Set a string field in place. Same promotion rules as
    /// [`set_int`](Self::set_int).
    pub fn set_str(&mut self, field: &str, value: &str) -> MeridianResult<()> {
        self.document_mut()?
            .insert(field.to_string(), Value::from(value));
        Ok(())
    }

    /// The stable byte image of the current content.
    pub fn bytes(&self) -> Vec<u8> {
        match &self.repr {
            // Serialization of a Value cannot fail.
            Repr::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Repr::Raw(bytes) => bytes.clone(),
        }
    }

    /// Whether the blob is empty, i.e. a tombstone.
    pub fn is_empty(&self) -> bool {
        matches!(&self.repr, Repr::Raw(bytes) if bytes.is_empty())
    }

    fn document_mut(&mut self) -> MeridianResult<&mut serde_json::Map<String, Value>> {
        if self.is_empty() {
            self.repr = Repr::Json(Value::Object(serde_json::Map::new()));
        }
        match &mut self.repr {
            Repr::Json(Value::Object(map)) => Ok(map),
            _ => Err(MeridianError::NotADocument),
        }
    }
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_parses_json_objects() {
        let mut blob = Blob::new();
        blob.overwrite(br#"{"v": 1}"#);
        blob.set_int("count", 7).unwrap();
        let parsed: Value = serde_json::from_slice(&blob.bytes()).unwrap();
        assert_eq!(parsed["v"], 1);
        assert_eq!(parsed["count"], 7);
    }

    #[test]
    fn overwrite_keeps_invalid_json_as_raw() {
        let mut blob = Blob::new();
        blob.overwrite(b"{not json");
        assert_eq!(blob.bytes(), b"{not json");
        assert!(blob.set_int("x", 1).is_err());
    }

    #[test]
    fn overwrite_keeps_binary_as_raw() {
        let mut blob = Blob::new();
        blob.overwrite(&[0x00, 0xFF, 0x7E]);
        assert_eq!(blob.bytes(), vec![0x00, 0xFF, 0x7E]);
    }

    #[test]
    fn empty_blob_is_tombstone_and_promotes_on_patch() {
        let mut blob = Blob::new();
        assert!(blob.is_empty());
        blob.set_str("name", "a").unwrap();
        assert!(!blob.is_empty());
        let parsed: Value = serde_json::from_slice(&blob.bytes()).unwrap();
        assert_eq!(parsed["name"], "a");
    }

    #[test]
    fn byte_image_is_stable_across_construction_order() {
        let mut a = Blob::new_document();
        a.set_int("x", 1).unwrap();
        a.set_str("y", "z").unwrap();

        let mut b = Blob::new_document();
        b.set_str("y", "z").unwrap();
        b.set_int("x", 1).unwrap();

        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn overwrite_with_empty_restores_tombstone() {
        let mut blob = Blob::from_payload(br#"{"v": 1}"#);
        assert!(!blob.is_empty());
        blob.overwrite(b"");
        assert!(blob.is_empty());
        assert!(blob.bytes().is_empty());
    }
}
