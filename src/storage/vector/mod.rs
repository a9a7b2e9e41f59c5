// Persisted ANN index over one modality.
//
// The graph assigns dense append-only slots; this layer owns the
// slot-to-metadata table, the bidirectional ID index, the similarity
// threshold, and the two on-disk artifacts: the binary graph blob and
// its JSON metadata sidecar. Deleting or replacing IDs rebuilds the
// graph from the surviving raw vectors.


use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::embeddings::{EmbedPayload, EmbeddingFunction};
use crate::storage::epoch_seconds;
use crate::storage::hnsw::{self, HnswGraph, HnswParams, INVALID_SLOT};
use crate::storage::kv::KvDocument;
use crate::{RagError, Result};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;
pub const DEFAULT_TEXT_BATCH_SIZE: usize = 128;
pub const DEFAULT_IMAGE_BATCH_SIZE: usize = 8;

/// Metadata fields whose string values also resolve to a slot, in
/// addition to the record's own ID.
const ALIAS_FIELDS: [&str; 2] = ["source_path", "source_id"];

/// One record to insert or replace.
#[derive(Debug, Clone)]
pub struct UpsertItem {
    pub id: String,
    pub payload: EmbedPayload,
    pub meta: KvDocument,
}

/// Metadata kept per occupied slot.
#[derive(Debug, Clone)]
struct SlotEntry {
    id: String,
    vector: Vec<f32>,
    created_at: i64,
    meta: KvDocument,
}

/// Metadata-only view of a stored record. Raw vectors are fetched
/// separately through `get_vectors_by_ids`.
#[derive(Debug, Clone)]
pub struct RecordView {
    pub id: String,
    pub created_at: i64,
    pub meta: KvDocument,
}

impl From<&SlotEntry> for RecordView {
    #[inline]
    fn from(entry: &SlotEntry) -> Self {
        Self {
            id: entry.id.clone(),
            created_at: entry.created_at,
            meta: entry.meta.clone(),
        }
    }
}

/// One search result after threshold filtering.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub score: f32,
    pub created_at: i64,
    pub meta: KvDocument,
}

/// What to search with. Multiple image paths are each embedded and the
/// per-vector results merged best-score-first.
#[derive(Debug, Clone)]
pub enum QueryInput {
    Text(String),
    Images(Vec<PathBuf>),
    Embedding(Vec<f32>),
}

struct IndexState {
    graph: HnswGraph,
    slots: Vec<SlotEntry>,
    id_to_slot: HashMap<String, usize>,
}

impl IndexState {
    fn empty(dim: usize, params: HnswParams) -> Self {
        Self {
            graph: HnswGraph::new(dim, params),
            slots: Vec::new(),
            id_to_slot: HashMap::new(),
        }
    }
}

pub struct VectorIndex {
    namespace: String,
    index_path: PathBuf,
    meta_path: PathBuf,
    embedding: EmbeddingFunction,
    meta_fields: BTreeSet<String>,
    similarity_threshold: f32,
    batch_size: usize,
    params: HnswParams,
    show_progress: bool,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    /// Create an index bound to `<working_dir>/<namespace>_index.bin`
    /// and its `.meta.json` sidecar. Nothing is read until
    /// `initialize`.
    #[inline]
    pub fn new(
        namespace: &str,
        working_dir: &Path,
        embedding: EmbeddingFunction,
        meta_fields: BTreeSet<String>,
        params: HnswParams,
    ) -> Self {
        let index_path = working_dir.join(format!("{namespace}_index.bin"));
        let meta_path = working_dir.join(format!("{namespace}_index.bin.meta.json"));
        let dim = embedding.dim();

        Self {
            namespace: namespace.to_string(),
            index_path,
            meta_path,
            embedding,
            meta_fields,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            batch_size: DEFAULT_TEXT_BATCH_SIZE,
            params,
            show_progress: false,
            state: Mutex::new(IndexState::empty(dim, params)),
        }
    }

    #[inline]
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    #[inline]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Show a progress bar across embedding batches during upsert.
    #[inline]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    #[inline]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Load the graph and its sidecar from disk. Any failure, including
    /// a stored dimension that disagrees with the embedding function,
    /// discards the files and starts empty with a warning. Vectors are
    /// never truncated or padded to fit.
    #[inline]
    pub async fn initialize(&self) {
        let mut guard = self.state.lock().await;

        if !self.index_path.exists() {
            debug!(namespace = %self.namespace, "no existing index, starting empty");
            return;
        }

        match self.load_from_disk() {
            Ok(state) => {
                info!(
                    namespace = %self.namespace,
                    count = state.graph.ntotal(),
                    "loaded vector index"
                );
                *guard = state;
            }
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "failed to load vector index, starting empty"
                );
                *guard = IndexState::empty(self.embedding.dim(), self.params);
            }
        }
    }

    /// Insert or replace records. Embedding runs before the index lock
    /// is taken; a length mismatch between records and returned vectors
    /// aborts the whole batch with nothing persisted. Returns the IDs
    /// actually written.
    #[inline]
    pub async fn upsert(&self, items: Vec<UpsertItem>) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embed_batched(&items).await?;
        if vectors.len() != items.len() {
            return Err(RagError::Storage(format!(
                "embedding count {} does not match record count {} in namespace {}, \
                 aborting batch",
                vectors.len(),
                items.len(),
                self.namespace
            )));
        }

        let dim = self.embedding.dim();
        for (item, vector) in items.iter().zip(vectors.iter()) {
            if vector.len() != dim {
                return Err(RagError::Storage(format!(
                    "embedding for '{}' has dimension {} (index dimension {}), \
                     aborting batch",
                    item.id,
                    vector.len(),
                    dim
                )));
            }
        }

        let mut guard = self.state.lock().await;

        // Replace semantics: drop any slot already holding one of the
        // incoming IDs, then append fresh slots at the tail.
        let stale: HashSet<usize> = items
            .iter()
            .filter_map(|item| guard.id_to_slot.get(&item.id).copied())
            .collect();
        if !stale.is_empty() {
            debug!(
                namespace = %self.namespace,
                replaced = stale.len(),
                "rebuilding index to replace existing IDs"
            );
            self.rebuild_excluding(&mut guard, &stale)?;
        }

        let now = epoch_seconds();
        let mut inserted = Vec::with_capacity(items.len());

        for (item, mut vector) in items.into_iter().zip(vectors) {
            hnsw::normalize(&mut vector);
            let slot = guard.graph.add_point(vector.clone())? as usize;

            let meta = self.filter_meta(item.meta);
            Self::index_entry_ids(&mut guard.id_to_slot, &item.id, &meta, slot);
            guard.slots.push(SlotEntry {
                id: item.id.clone(),
                vector,
                created_at: now,
                meta,
            });
            inserted.push(item.id);
        }

        self.persist(&guard)?;

        info!(
            namespace = %self.namespace,
            inserted = inserted.len(),
            total = guard.graph.ntotal(),
            "upsert complete"
        );
        Ok(inserted)
    }

    /// Search the index. Sentinel slots from padding are dropped, as is
    /// every hit below the similarity threshold (the threshold itself
    /// is kept).
    #[inline]
    pub async fn query(&self, input: QueryInput, top_k: usize) -> Result<Vec<QueryHit>> {
        let query_vectors = self.query_vectors(input).await?;
        if query_vectors.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.state.lock().await;
        let mut best: HashMap<usize, f32> = HashMap::new();

        for mut vector in query_vectors {
            hnsw::normalize(&mut vector);
            for (slot, score) in guard.graph.search(&vector, top_k) {
                if slot == INVALID_SLOT || score < self.similarity_threshold {
                    continue;
                }
                let entry = best.entry(slot as usize).or_insert(f32::NEG_INFINITY);
                if score > *entry {
                    *entry = score;
                }
            }
        }

        let mut hits: Vec<QueryHit> = best
            .into_iter()
            .filter_map(|(slot, score)| {
                guard.slots.get(slot).map(|entry| QueryHit {
                    id: entry.id.clone(),
                    score,
                    created_at: entry.created_at,
                    meta: entry.meta.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Remove records by ID or alias value. Unknown IDs are ignored.
    #[inline]
    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut guard = self.state.lock().await;

        let doomed: HashSet<usize> = ids
            .iter()
            .filter_map(|id| guard.id_to_slot.get(id).copied())
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        self.rebuild_excluding(&mut guard, &doomed)?;
        self.persist(&guard)?;

        info!(
            namespace = %self.namespace,
            removed = doomed.len(),
            total = guard.graph.ntotal(),
            "deleted records"
        );
        Ok(())
    }

    /// Rebuild the graph from the stored vectors in slot order. Slots
    /// come out dense again after accumulated replacements.
    #[inline]
    pub async fn compact(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.rebuild_excluding(&mut guard, &HashSet::new())?;
        self.persist(&guard)?;
        debug!(namespace = %self.namespace, total = guard.graph.ntotal(), "compacted");
        Ok(())
    }

    /// Metadata-only lookup; the stored vector is not exposed here.
    #[inline]
    pub async fn get_by_id(&self, id: &str) -> Option<RecordView> {
        let guard = self.state.lock().await;
        guard
            .id_to_slot
            .get(id)
            .and_then(|&slot| guard.slots.get(slot))
            .map(RecordView::from)
    }

    /// Metadata-only lookups, preserving order; missing IDs yield
    /// `None`.
    #[inline]
    pub async fn get_by_ids(&self, ids: &[String]) -> Vec<Option<RecordView>> {
        let guard = self.state.lock().await;
        ids.iter()
            .map(|id| {
                guard
                    .id_to_slot
                    .get(id)
                    .and_then(|&slot| guard.slots.get(slot))
                    .map(RecordView::from)
            })
            .collect()
    }

    /// Raw stored vectors for the given IDs; missing IDs are skipped.
    #[inline]
    pub async fn get_vectors_by_ids(&self, ids: &[String]) -> HashMap<String, Vec<f32>> {
        let guard = self.state.lock().await;
        ids.iter()
            .filter_map(|id| {
                guard
                    .id_to_slot
                    .get(id)
                    .and_then(|&slot| guard.slots.get(slot))
                    .map(|entry| (id.clone(), entry.vector.clone()))
            })
            .collect()
    }

    #[inline]
    pub async fn count(&self) -> usize {
        self.state.lock().await.graph.ntotal()
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.count().await == 0
    }

    /// Clear the index and remove both files.
    #[inline]
    pub async fn drop_data(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        *guard = IndexState::empty(self.embedding.dim(), self.params);
        for path in [&self.index_path, &self.meta_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        info!(namespace = %self.namespace, "dropped vector index");
        Ok(())
    }

    /// Flush the current state to disk.
    #[inline]
    pub async fn index_done_callback(&self) -> Result<()> {
        let guard = self.state.lock().await;
        self.persist(&guard)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn embed_batched(&self, items: &[UpsertItem]) -> Result<Vec<Vec<f32>>> {
        let payloads: Vec<EmbedPayload> = items.iter().map(|i| i.payload.clone()).collect();
        let batches: Vec<&[EmbedPayload]> = payloads.chunks(self.batch_size).collect();

        let bar = (self.show_progress && batches.len() > 1).then(|| {
            let bar = ProgressBar::new(batches.len() as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} batches")
            {
                bar.set_style(style);
            }
            bar.set_message(format!("embedding {}", self.namespace));
            bar
        });

        let mut vectors = Vec::with_capacity(items.len());
        for batch in batches {
            vectors.extend(self.embedding.embed(batch).await?);
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        Ok(vectors)
    }

    async fn query_vectors(&self, input: QueryInput) -> Result<Vec<Vec<f32>>> {
        match input {
            QueryInput::Text(text) => {
                if text.is_empty() {
                    return Ok(Vec::new());
                }
                self.embedding.embed(&[EmbedPayload::Text(text)]).await
            }
            QueryInput::Images(paths) => {
                if paths.is_empty() {
                    return Ok(Vec::new());
                }
                let payloads: Vec<EmbedPayload> =
                    paths.into_iter().map(EmbedPayload::ImagePath).collect();
                self.embedding.embed(&payloads).await
            }
            QueryInput::Embedding(vector) => {
                if vector.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![vector])
            }
        }
    }

    fn filter_meta(&self, meta: KvDocument) -> KvDocument {
        if self.meta_fields.is_empty() {
            return meta;
        }
        meta.into_iter()
            .filter(|(k, _)| self.meta_fields.contains(k))
            .collect()
    }

    fn index_entry_ids(
        id_to_slot: &mut HashMap<String, usize>,
        id: &str,
        meta: &KvDocument,
        slot: usize,
    ) {
        id_to_slot.insert(id.to_string(), slot);
        for field in ALIAS_FIELDS {
            if let Some(Value::String(alias)) = meta.get(field) {
                id_to_slot.insert(alias.clone(), slot);
            }
        }
    }

    /// Rebuild the graph and both lookup tables, skipping `excluded`
    /// slots. Survivors keep their relative order and original
    /// timestamps; slots come out dense.
    fn rebuild_excluding(&self, state: &mut IndexState, excluded: &HashSet<usize>) -> Result<()> {
        let old_slots = std::mem::take(&mut state.slots);
        let mut fresh = IndexState::empty(self.embedding.dim(), self.params);

        for (old_slot, entry) in old_slots.into_iter().enumerate() {
            if excluded.contains(&old_slot) {
                continue;
            }
            let slot = fresh.graph.add_point(entry.vector.clone())? as usize;
            Self::index_entry_ids(&mut fresh.id_to_slot, &entry.id, &entry.meta, slot);
            fresh.slots.push(entry);
        }

        *state = fresh;
        Ok(())
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        fs::write(&self.index_path, state.graph.serialize())?;

        let mut sidecar = Map::new();
        for (slot, entry) in state.slots.iter().enumerate() {
            let mut doc = Map::new();
            doc.insert("__id__".to_string(), Value::from(entry.id.as_str()));
            doc.insert(
                "__vector__".to_string(),
                Value::Array(entry.vector.iter().map(|&v| Value::from(v)).collect()),
            );
            doc.insert("created_at".to_string(), Value::from(entry.created_at));
            for (k, v) in &entry.meta {
                doc.insert(k.clone(), v.clone());
            }
            sidecar.insert(slot.to_string(), Value::Object(doc));
        }

        let json = serde_json::to_string(&Value::Object(sidecar))?;
        fs::write(&self.meta_path, json)?;
        Ok(())
    }

    fn load_from_disk(&self) -> Result<IndexState> {
        let bytes = fs::read(&self.index_path)?;
        let graph = HnswGraph::deserialize(&bytes)?;

        if graph.dim() != self.embedding.dim() {
            return Err(RagError::Index(format!(
                "stored dimension {} does not match embedding dimension {}",
                graph.dim(),
                self.embedding.dim()
            )));
        }

        let text = fs::read_to_string(&self.meta_path)?;
        let sidecar: Map<String, Value> = serde_json::from_str(&text)?;

        if sidecar.len() != graph.ntotal() {
            return Err(RagError::Index(format!(
                "sidecar has {} entries but graph has {}",
                sidecar.len(),
                graph.ntotal()
            )));
        }

        let mut slots: Vec<SlotEntry> = Vec::with_capacity(graph.ntotal());
        let mut id_to_slot = HashMap::new();

        for slot in 0..graph.ntotal() {
            let doc = sidecar
                .get(&slot.to_string())
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    RagError::Index(format!("sidecar entry for slot {slot} missing or malformed"))
                })?;

            let id = doc
                .get("__id__")
                .and_then(Value::as_str)
                .ok_or_else(|| RagError::Index(format!("slot {slot} has no __id__")))?
                .to_string();

            let vector: Vec<f32> = doc
                .get("__vector__")
                .and_then(Value::as_array)
                .ok_or_else(|| RagError::Index(format!("slot {slot} has no __vector__")))?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<_>>()
                .ok_or_else(|| RagError::Index(format!("slot {slot} has a malformed vector")))?;

            if vector.len() != graph.dim() {
                return Err(RagError::Index(format!(
                    "slot {slot} vector has dimension {} (index dimension {})",
                    vector.len(),
                    graph.dim()
                )));
            }

            let created_at = doc.get("created_at").and_then(Value::as_i64).unwrap_or(0);

            let meta: KvDocument = doc
                .iter()
                .filter(|(k, _)| {
                    k.as_str() != "__id__" && k.as_str() != "__vector__" && k.as_str() != "created_at"
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            Self::index_entry_ids(&mut id_to_slot, &id, &meta, slot);
            slots.push(SlotEntry {
                id,
                vector,
                created_at,
                meta,
            });
        }

        let mut state = IndexState::empty(graph.dim(), graph.params());
        state.graph = graph;
        state.slots = slots;
        state.id_to_slot = id_to_slot;
        Ok(state)
    }
}
