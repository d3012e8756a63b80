use loro::{LoroDoc, LoroList, LoroMap, LoroMovableList, LoroValue, ToJson};
use serde_json::Value;
use tracing::warn;

use crate::protocol::ProtocolError;

/// Root container holding the note's block array.
pub const BLOCKS_CONTAINER: &str = "blocks";

// Prevent stack overflow on pathological nesting
const MAX_DEPTH: usize = 100;

/// Authoritative CRDT state of one note. Wraps the merge engine so the
/// rest of the relay deals in opaque payloads: encoded updates go in,
/// snapshots and a JSON view come out.
pub struct DocStore {
    doc: LoroDoc,
}

impl DocStore {
    pub fn new() -> Self {
        let doc = LoroDoc::new();
        // Materialize the root container so an untouched note still
        // exports a state the client can attach to.
        let _ = doc.get_movable_list(BLOCKS_CONTAINER);
        DocStore { doc }
    }

    /// Populate the store from a persisted JSON block array. Content
    /// that does not parse to an array is skipped, the note then starts
    /// empty rather than failing the room.
    pub fn seed_from_json(&self, note_id: i64, content: &str) {
        let parsed: Value = match serde_json::from_str(content) {
            Ok(value) => value,
            Err(e) => {
                warn!("Stored content of note {} is not valid JSON: {}", note_id, e);
                return;
            }
        };
        let blocks = match parsed {
            Value::Array(blocks) => blocks,
            _ => {
                warn!("Stored content of note {} is not a JSON array", note_id);
                return;
            }
        };

        let list = self.doc.get_movable_list(BLOCKS_CONTAINER);
        for (idx, block) in blocks.iter().enumerate() {
            if let Err(e) = insert_into_movable_list(&list, idx, block, 0) {
                warn!("Failed to seed block {} of note {}: {}", idx, note_id, e);
            }
        }
    }

    /// Export the complete document state.
    pub fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.doc
            .export(loro::ExportMode::Snapshot)
            .map_err(|e| e.to_string())
    }

    /// Merge an encoded update or snapshot into the document. Returns
    /// true when the payload contained operations this document had not
    /// seen yet, false when it was a no-op replay.
    pub fn apply(&self, payload: &[u8]) -> Result<bool, ProtocolError> {
        let before = self.doc.oplog_vv();
        if let Err(e) = self.doc.import(payload) {
            return Err(ProtocolError::InvalidPayload(e.to_string()));
        }
        Ok(self.doc.oplog_vv() != before)
    }

    /// Current block array as JSON.
    pub fn content_json(&self) -> Value {
        let deep = self.doc.get_deep_value().to_json_value();
        deep.get(BLOCKS_CONTAINER)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    /// Current block array serialized the way the backend stores it.
    pub fn content_string(&self) -> String {
        serde_json::to_string(&self.content_json()).unwrap_or_else(|_| "[]".to_string())
    }
}

impl Default for DocStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_into_movable_list(
    list: &LoroMovableList,
    idx: usize,
    value: &Value,
    depth: usize,
) -> loro::LoroResult<()> {
    match value {
        Value::Object(map) => {
            let child = list.insert_container(idx, LoroMap::new())?;
            fill_map(&child, map, depth + 1)?;
        }
        Value::Array(items) => {
            let child = list.insert_container(idx, LoroList::new())?;
            fill_list(&child, items, depth + 1)?;
        }
        _ => list.insert(idx, scalar_to_loro(value))?,
    }
    Ok(())
}

fn insert_into_list(
    list: &LoroList,
    idx: usize,
    value: &Value,
    depth: usize,
) -> loro::LoroResult<()> {
    if depth >= MAX_DEPTH {
        return list.insert(idx, json_fallback(value));
    }
    match value {
        Value::Object(map) => {
            let child = list.insert_container(idx, LoroMap::new())?;
            fill_map(&child, map, depth + 1)?;
        }
        Value::Array(items) => {
            let child = list.insert_container(idx, LoroList::new())?;
            fill_list(&child, items, depth + 1)?;
        }
        _ => list.insert(idx, scalar_to_loro(value))?,
    }
    Ok(())
}

fn fill_list(list: &LoroList, items: &[Value], depth: usize) -> loro::LoroResult<()> {
    for (idx, item) in items.iter().enumerate() {
        insert_into_list(list, idx, item, depth)?;
    }
    Ok(())
}

fn fill_map(
    map: &LoroMap,
    entries: &serde_json::Map<String, Value>,
    depth: usize,
) -> loro::LoroResult<()> {
    for (key, value) in entries {
        if depth >= MAX_DEPTH {
            map.insert(key, json_fallback(value))?;
            continue;
        }
        match value {
            Value::Object(nested) => {
                let child = map.get_or_create_container(key, LoroMap::new())?;
                fill_map(&child, nested, depth + 1)?;
            }
            Value::Array(items) => {
                let child = map.get_or_create_container(key, LoroList::new())?;
                fill_list(&child, items, depth + 1)?;
            }
            _ => map.insert(key, scalar_to_loro(value))?,
        }
    }
    Ok(())
}

fn scalar_to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                LoroValue::from(i)
            } else {
                LoroValue::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => LoroValue::from(s.as_str()),
        // Containers are handled by the callers
        _ => LoroValue::Null,
    }
}

// At the depth cutoff the remaining subtree is stored as one string.
fn json_fallback(value: &Value) -> LoroValue {
    LoroValue::from(value.to_string().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seeded_content_round_trips() {
        let blocks = json!([
            {
                "id": "block-1",
                "type": "paragraph",
                "text": "hello world",
                "order": 0,
                "pinned": true,
                "meta": { "indent": 2, "tags": ["a", "b"] }
            },
            { "id": "block-2", "type": "divider", "text": null }
        ]);
        let store = DocStore::new();
        store.seed_from_json(1, &blocks.to_string());
        assert_eq!(store.content_json(), blocks);
    }

    #[test]
    fn empty_store_exports_empty_array() {
        let store = DocStore::new();
        assert_eq!(store.content_json(), json!([]));
        assert_eq!(store.content_string(), "[]");
    }

    #[test]
    fn non_array_content_is_ignored() {
        let store = DocStore::new();
        store.seed_from_json(1, r#"{"not":"an array"}"#);
        assert_eq!(store.content_json(), json!([]));
        store.seed_from_json(1, "definitely not json");
        assert_eq!(store.content_json(), json!([]));
    }

    #[test]
    fn snapshot_of_seeded_store_restores_elsewhere() {
        let blocks = json!([{ "id": "b1", "text": "seeded" }]);
        let store = DocStore::new();
        store.seed_from_json(1, &blocks.to_string());

        let other = DocStore::new();
        assert!(other.apply(&store.snapshot().unwrap()).unwrap());
        assert_eq!(other.content_json(), blocks);
    }

    #[test]
    fn replayed_payload_is_a_noop() {
        let store = DocStore::new();
        store.seed_from_json(1, &json!([{ "id": "b1" }]).to_string());
        let snapshot = store.snapshot().unwrap();

        let other = DocStore::new();
        assert!(other.apply(&snapshot).unwrap());
        // Same payload again carries nothing new.
        assert!(!other.apply(&snapshot).unwrap());
    }

    #[test]
    fn concurrent_stores_converge() {
        let a = DocStore::new();
        a.seed_from_json(1, &json!([{ "id": "from-a" }]).to_string());
        let b = DocStore::new();
        b.seed_from_json(1, &json!([{ "id": "from-b" }]).to_string());

        let from_a = a.snapshot().unwrap();
        let from_b = b.snapshot().unwrap();
        assert!(a.apply(&from_b).unwrap());
        assert!(b.apply(&from_a).unwrap());

        assert_eq!(a.content_json(), b.content_json());
        let blocks = a.content_json();
        assert_eq!(blocks.as_array().unwrap().len(), 2);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let store = DocStore::new();
        let err = store.apply(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
        // Store is still usable afterwards.
        assert_eq!(store.content_json(), json!([]));
    }
}
