// JSON-file key-value store for content metadata.
//
// The whole store lives in memory behind one async mutex and is written
// to disk as a single JSON document by `index_done_callback`. Load
// failures are never fatal: a corrupt or missing file yields an empty
// store and a warning.


use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::storage::epoch_seconds;

/// One stored document: a flat-ish JSON object keyed by field name.
pub type KvDocument = Map<String, Value>;

/// Code points that cannot survive a write/read cycle in every JSON
/// consumer. Unpaired surrogates cannot occur in Rust strings, so the
/// noncharacters are the remaining hazard.
const SENTINEL_CHARS: [char; 2] = ['\u{FFFE}', '\u{FFFF}'];

pub struct JsonKvStore {
    namespace: String,
    file_path: PathBuf,
    data: Mutex<BTreeMap<String, KvDocument>>,
}

impl JsonKvStore {
    /// Create a store bound to `<working_dir>/kv_store_<namespace>.json`.
    /// Nothing is read from disk until `initialize` runs.
    #[inline]
    pub fn new(namespace: &str, working_dir: &Path) -> Self {
        Self {
            namespace: namespace.to_string(),
            file_path: working_dir.join(format!("kv_store_{namespace}.json")),
            data: Mutex::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Load the backing file into memory. A missing file starts empty;
    /// an unreadable or unparsable file is discarded with a warning.
    #[inline]
    pub async fn initialize(&self) {
        let mut guard = self.data.lock().await;

        if !self.file_path.exists() {
            debug!(
                namespace = %self.namespace,
                "no existing KV file, starting empty"
            );
            return;
        }

        let loaded = fs::read_to_string(&self.file_path)
            .map_err(crate::RagError::from)
            .and_then(|text| {
                serde_json::from_str::<BTreeMap<String, KvDocument>>(&text)
                    .map_err(crate::RagError::from)
            });

        match loaded {
            Ok(docs) => {
                info!(
                    namespace = %self.namespace,
                    count = docs.len(),
                    "loaded KV store"
                );
                *guard = docs;
            }
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "failed to load KV store, starting empty"
                );
                guard.clear();
            }
        }
    }

    /// Insert or replace documents. New documents get `create_time`;
    /// existing ones keep it. `update_time` and `_id` are always set.
    #[inline]
    pub async fn upsert(&self, docs: BTreeMap<String, KvDocument>) {
        if docs.is_empty() {
            return;
        }

        let now = epoch_seconds();
        let mut guard = self.data.lock().await;

        for (id, mut doc) in docs {
            let create_time = guard
                .get(&id)
                .and_then(|existing| existing.get("create_time").cloned())
                .unwrap_or_else(|| Value::from(now));
            doc.insert("create_time".to_string(), create_time);
            doc.insert("update_time".to_string(), Value::from(now));
            doc.insert("_id".to_string(), Value::from(id.as_str()));
            guard.insert(id, doc);
        }
    }

    /// Fetch a copy of one document. Timestamp fields default to 0 and
    /// `_id` is always present in the copy.
    #[inline]
    pub async fn get_by_id(&self, id: &str) -> Option<KvDocument> {
        let guard = self.data.lock().await;
        guard.get(id).map(|doc| Self::present(id, doc))
    }

    /// Fetch copies of several documents, preserving order; missing IDs
    /// yield `None`.
    #[inline]
    pub async fn get_by_ids(&self, ids: &[String]) -> Vec<Option<KvDocument>> {
        let guard = self.data.lock().await;
        ids.iter()
            .map(|id| guard.get(id).map(|doc| Self::present(id, doc)))
            .collect()
    }

    /// The subset of `keys` not yet stored.
    #[inline]
    pub async fn filter_keys(&self, keys: &HashSet<String>) -> HashSet<String> {
        let guard = self.data.lock().await;
        keys.iter()
            .filter(|k| !guard.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Remove documents from memory. Durability happens at the next
    /// `index_done_callback`.
    #[inline]
    pub async fn delete(&self, ids: &[String]) {
        let mut guard = self.data.lock().await;
        for id in ids {
            guard.remove(id);
        }
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }

    #[inline]
    pub async fn count(&self) -> usize {
        self.data.lock().await.len()
    }

    /// Clear the store and remove its backing file.
    #[inline]
    pub async fn drop_data(&self) -> Result<()> {
        let mut guard = self.data.lock().await;
        guard.clear();
        if self.file_path.exists() {
            fs::remove_file(&self.file_path)?;
        }
        info!(namespace = %self.namespace, "dropped KV store");
        Ok(())
    }

    /// Flush the in-memory map to disk.
    ///
    /// Fast path: the document encodes cleanly and is written as-is.
    /// Slow path: some string carries a sentinel code point; every
    /// string is stripped, the sanitized document is written, and the
    /// file is read back so memory matches disk exactly.
    #[inline]
    pub async fn index_done_callback(&self) -> Result<()> {
        let mut guard = self.data.lock().await;

        let dirty = guard.iter().any(|(k, doc)| {
            contains_sentinel(k)
                || doc
                    .iter()
                    .any(|(field, v)| contains_sentinel(field) || value_has_sentinel(v))
        });

        if !dirty {
            let json = serde_json::to_string_pretty(&*guard)?;
            fs::write(&self.file_path, json)?;
            debug!(
                namespace = %self.namespace,
                count = guard.len(),
                "KV store written"
            );
            return Ok(());
        }

        warn!(
            namespace = %self.namespace,
            "KV store contains non-encodable code points, sanitizing before write"
        );

        let sanitized: BTreeMap<String, KvDocument> = guard
            .iter()
            .map(|(k, doc)| {
                let clean_doc: KvDocument = doc
                    .iter()
                    .map(|(field, value)| {
                        let mut v = value.clone();
                        sanitize_value(&mut v);
                        (strip_sentinels(field), v)
                    })
                    .collect();
                (strip_sentinels(k), clean_doc)
            })
            .collect();

        let json = serde_json::to_string_pretty(&sanitized)?;
        fs::write(&self.file_path, json)?;

        // Reload rather than trusting the sanitized copy, so the
        // in-memory view is exactly what a fresh process would see.
        let text = fs::read_to_string(&self.file_path)?;
        *guard = serde_json::from_str(&text)?;

        Ok(())
    }

    fn present(id: &str, doc: &KvDocument) -> KvDocument {
        let mut copy = doc.clone();
        copy.entry("create_time".to_string())
            .or_insert_with(|| Value::from(0));
        copy.entry("update_time".to_string())
            .or_insert_with(|| Value::from(0));
        copy.insert("_id".to_string(), Value::from(id));
        copy
    }
}

fn contains_sentinel(s: &str) -> bool {
    s.chars().any(|c| SENTINEL_CHARS.contains(&c))
}

fn strip_sentinels(s: &str) -> String {
    s.chars().filter(|c| !SENTINEL_CHARS.contains(c)).collect()
}

fn value_has_sentinel(value: &Value) -> bool {
    match value {
        Value::String(s) => contains_sentinel(s),
        Value::Array(items) => items.iter().any(value_has_sentinel),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| contains_sentinel(k) || value_has_sentinel(v)),
        _ => false,
    }
}

fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if contains_sentinel(s) {
                *s = strip_sentinels(s);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        Value::Object(map) => {
            let entries: Vec<(String, Value)> = std::mem::take(map)
                .into_iter()
                .map(|(k, mut v)| {
                    sanitize_value(&mut v);
                    (strip_sentinels(&k), v)
                })
                .collect();
            map.extend(entries);
        }
        _ => {}
    }
}
