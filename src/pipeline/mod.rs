//! Ingestion and query orchestration: pulls shards and extracted PDF
//! pages from the update directory, chunks them into both stores, and
//! joins text hits with page-linked images at query time.


pub mod lifecycle;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::chunking::chunk_text;
use crate::embeddings::{EmbedPayload, EmbeddingFunction};
use crate::storage::kv::{JsonKvStore, KvDocument};
use crate::storage::vector::{QueryInput, UpsertItem, VectorIndex};
use crate::storage::{ContentRecord, SourceType};
use crate::{RagError, Result};

/// Join table extracted alongside PDF pages: which images sit on which
/// page, and which page each extracted text file came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageManifest {
    #[serde(default, rename = "image")]
    pub images: Vec<ImageEntry>,
    #[serde(default, rename = "text")]
    pub texts: Vec<TextEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub pdf: String,
    pub page: u32,
    pub image_id: u64,
    pub filename: String,
}

impl ImageEntry {
    /// Stable record ID for this image.
    #[inline]
    pub fn record_id(&self) -> String {
        format!("{}_page{}_image{}", pdf_stem(&self.pdf), self.page, self.image_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEntry {
    pub pdf: String,
    pub page: u32,
    pub filename: String,
}

fn pdf_stem(pdf: &str) -> &str {
    Path::new(pdf)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(pdf)
}

/// Everything one scan of the update directory produced.
#[derive(Debug, Default)]
pub struct CollectedSources {
    pub text_files: Vec<PathBuf>,
    pub image_files: Vec<PathBuf>,
    pub manifest: PageManifest,
}

/// Where ingestible material comes from. The filesystem implementation
/// is the production one; tests substitute their own.
pub trait DocumentSource: Send + Sync {
    fn collect(&self, update_dir: &Path) -> Result<CollectedSources>;
}

/// Reads the update directory layout: loose `*.txt` shards at the top
/// level, extracted pages under `texts/`, extracted images under
/// `images/`, and the `PDF.json` join table.
#[derive(Debug, Default)]
pub struct FsDocumentSource;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "webp"];

impl DocumentSource for FsDocumentSource {
    fn collect(&self, update_dir: &Path) -> Result<CollectedSources> {
        if !update_dir.is_dir() {
            debug!(dir = %update_dir.display(), "update directory does not exist");
            return Ok(CollectedSources::default());
        }

        let mut sources = CollectedSources {
            text_files: files_with_extensions(update_dir, &["txt"])?,
            ..CollectedSources::default()
        };

        let texts_dir = update_dir.join("texts");
        if texts_dir.is_dir() {
            sources
                .text_files
                .extend(files_with_extensions(&texts_dir, &["txt"])?);
        }

        let images_dir = update_dir.join("images");
        if images_dir.is_dir() {
            sources.image_files = files_with_extensions(&images_dir, &IMAGE_EXTENSIONS)?;
        }

        let manifest_path = update_dir.join("PDF.json");
        if manifest_path.is_file() {
            match fs::read_to_string(&manifest_path)
                .map_err(RagError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(RagError::from))
            {
                Ok(manifest) => sources.manifest = manifest,
                Err(e) => warn!(error = %e, "failed to parse PDF.json, ignoring manifest"),
            }
        }

        Ok(sources)
    }
}

fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    NoSourcesFound,
    NoChunksGenerated,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NoSourcesFound => "no sources found",
            Self::NoChunksGenerated => "no chunks generated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub files: usize,
    pub chunks_indexed: usize,
    pub images_indexed: usize,
}

/// An image attached to a text hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedImage {
    pub id: String,
    pub path: PathBuf,
    pub score: f32,
}

impl LinkedImage {
    /// Render the image file as a `data:` URL for serving boundaries
    /// that cannot reference local paths.
    #[inline]
    pub fn data_url(&self) -> Result<String> {
        let bytes = fs::read(&self.path)?;
        let mime = match self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("png") => "image/png",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("bmp") => "image/bmp",
            Some("webp") => "image/webp",
            _ => "application/octet-stream",
        };
        Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    pub content: String,
    pub source: String,
    pub score: f32,
    pub source_type: SourceType,
    pub pdf_name: Option<String>,
    pub pdf_page: Option<u32>,
    pub linked_images: Vec<LinkedImage>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreCounts {
    pub chunks: usize,
    pub images: usize,
    pub kv_docs: usize,
}

pub struct RagPipeline {
    text_index: VectorIndex,
    image_index: VectorIndex,
    kv: JsonKvStore,
    text_embedding: EmbeddingFunction,
    image_embedding: EmbeddingFunction,
    source: Box<dyn DocumentSource>,
    update_dir: PathBuf,
    chunk_token_size: usize,
    chunk_overlap: usize,
    split_by_character: Option<String>,
    top_k: usize,
    image_top_k: usize,
}

impl RagPipeline {
    #[inline]
    pub fn new(
        config: &Config,
        text_embedding: EmbeddingFunction,
        image_embedding: EmbeddingFunction,
        source: Box<dyn DocumentSource>,
    ) -> Result<Self> {
        let working_dir = config.working_dir();
        fs::create_dir_all(&working_dir)?;

        let meta_fields = ["source_path".to_string()].into_iter().collect();
        let text_index = VectorIndex::new(
            &config.namespace,
            &working_dir,
            text_embedding.clone(),
            meta_fields,
            config.index.hnsw_params(),
        )
        .with_similarity_threshold(config.retrieval.similarity_threshold)
        .with_batch_size(config.ollama.batch_size as usize);

        let meta_fields = ["source_path".to_string()].into_iter().collect();
        let image_index = VectorIndex::new(
            &config.image_namespace(),
            &working_dir,
            image_embedding.clone(),
            meta_fields,
            config.index.hnsw_params(),
        )
        .with_similarity_threshold(config.retrieval.similarity_threshold)
        .with_batch_size(config.ollama.image_batch_size as usize)
        .with_progress(true);

        let kv = JsonKvStore::new(&config.namespace, &working_dir);

        Ok(Self {
            text_index,
            image_index,
            kv,
            text_embedding,
            image_embedding,
            source,
            update_dir: config.update_dir_path(),
            chunk_token_size: config.chunking.chunk_token_size,
            chunk_overlap: config.chunking.chunk_overlap,
            split_by_character: config.chunking.split_by_character.clone(),
            top_k: config.retrieval.top_k,
            image_top_k: config.retrieval.image_top_k,
        })
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Load all three stores from disk.
    #[inline]
    pub async fn initialize(&self) {
        self.kv.initialize().await;
        self.text_index.initialize().await;
        self.image_index.initialize().await;
    }

    /// Warmup routine: load stores, probe the embedding endpoints, and
    /// optionally ingest when the text index is still empty.
    #[inline]
    pub async fn warm(&self, auto_build: bool) -> Result<()> {
        self.initialize().await;

        self.text_embedding.health_check().await?;
        self.image_embedding.health_check().await?;

        if auto_build && self.text_index.is_empty().await {
            let report = self.build_from_shards().await?;
            info!(
                status = %report.status,
                chunks = report.chunks_indexed,
                images = report.images_indexed,
                "auto-build during warmup finished"
            );
        }

        Ok(())
    }

    /// Scan the update directory and index everything new. Already-
    /// indexed IDs are skipped; both stores are committed at the end.
    #[inline]
    pub async fn build_from_shards(&self) -> Result<BuildReport> {
        let sources = self.source.collect(&self.update_dir)?;
        let files = sources.text_files.len() + sources.image_files.len();

        if files == 0 {
            warn!(dir = %self.update_dir.display(), "no sources found");
            return Ok(BuildReport {
                status: BuildStatus::NoSourcesFound,
                files: 0,
                chunks_indexed: 0,
                images_indexed: 0,
            });
        }

        let manifest = &sources.manifest;
        let text_by_filename: HashMap<&str, &TextEntry> = manifest
            .texts
            .iter()
            .map(|e| (e.filename.as_str(), e))
            .collect();
        let image_by_filename: HashMap<&str, &ImageEntry> = manifest
            .images
            .iter()
            .map(|e| (e.filename.as_str(), e))
            .collect();

        let mut images_by_page: HashMap<(String, u32), Vec<String>> = HashMap::new();
        for entry in &manifest.images {
            images_by_page
                .entry((entry.pdf.clone(), entry.page))
                .or_default()
                .push(entry.record_id());
        }

        let chunk_records = self.chunk_sources(&sources.text_files, &text_by_filename, &images_by_page);
        let image_records = Self::image_sources(&sources.image_files, &image_by_filename);

        if chunk_records.is_empty() && image_records.is_empty() {
            warn!("sources produced no chunks");
            return Ok(BuildReport {
                status: BuildStatus::NoChunksGenerated,
                files,
                chunks_indexed: 0,
                images_indexed: 0,
            });
        }

        // Skip IDs the KV store already holds.
        let candidate_ids: HashSet<String> = chunk_records
            .iter()
            .map(|r| r.id.clone())
            .chain(image_records.iter().map(|(r, _)| r.id.clone()))
            .collect();
        let new_ids = self.kv.filter_keys(&candidate_ids).await;

        let chunk_records: Vec<ContentRecord> = chunk_records
            .into_iter()
            .filter(|r| new_ids.contains(&r.id))
            .collect();
        let image_records: Vec<(ContentRecord, PathBuf)> = image_records
            .into_iter()
            .filter(|(r, _)| new_ids.contains(&r.id))
            .collect();

        let chunks_indexed = chunk_records.len();
        let images_indexed = image_records.len();

        if chunks_indexed == 0 && images_indexed == 0 {
            info!("all sources already indexed");
            return Ok(BuildReport {
                status: BuildStatus::Success,
                files,
                chunks_indexed: 0,
                images_indexed: 0,
            });
        }

        let text_items: Vec<UpsertItem> = chunk_records
            .iter()
            .map(|r| UpsertItem {
                id: r.id.clone(),
                payload: EmbedPayload::text(r.content.clone()),
                meta: source_meta(&r.source_path),
            })
            .collect();
        let image_items: Vec<UpsertItem> = image_records
            .iter()
            .map(|(r, path)| UpsertItem {
                id: r.id.clone(),
                payload: EmbedPayload::image(path.clone()),
                meta: source_meta(&r.source_path),
            })
            .collect();

        self.text_index.upsert(text_items).await?;
        self.image_index.upsert(image_items).await?;

        let mut docs: BTreeMap<String, KvDocument> = BTreeMap::new();
        for record in chunk_records
            .iter()
            .chain(image_records.iter().map(|(r, _)| r))
        {
            docs.insert(record.id.clone(), record_doc(record)?);
        }
        self.kv.upsert(docs).await;

        self.text_index.index_done_callback().await?;
        self.image_index.index_done_callback().await?;
        self.kv.index_done_callback().await?;

        info!(files, chunks_indexed, images_indexed, "build complete");
        Ok(BuildReport {
            status: BuildStatus::Success,
            files,
            chunks_indexed,
            images_indexed,
        })
    }

    /// Search text chunks and attach linked images. Hits without a KV
    /// document are dropped silently; the image index is consulted at
    /// most once per query, with the original query text.
    #[inline]
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<QueryResult>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let hits = self
            .text_index
            .query(QueryInput::Text(text.to_string()), top_k)
            .await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let docs = self.kv.get_by_ids(&ids).await;

        let mut image_hits: Option<Vec<LinkedImage>> = None;
        let mut results = Vec::with_capacity(hits.len());

        for (hit, doc) in hits.into_iter().zip(docs) {
            let Some(doc) = doc else {
                debug!(id = %hit.id, "dropping hit without KV document");
                continue;
            };

            let record: ContentRecord = match serde_json::from_value(Value::Object(doc)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = %hit.id, error = %e, "malformed KV document, dropping hit");
                    continue;
                }
            };

            let linked_images = if record.linked_image_ids.is_empty() {
                Vec::new()
            } else if let Some(cached) = &image_hits {
                cached.clone()
            } else {
                let computed = self.query_linked_images(text).await?;
                image_hits = Some(computed.clone());
                computed
            };

            results.push(QueryResult {
                id: record.id,
                content: record.content,
                source: record.source_path,
                score: hit.score,
                source_type: record.source_type,
                pdf_name: record.pdf_name,
                pdf_page: record.pdf_page,
                linked_images,
            });
        }

        Ok(results)
    }

    /// Remove all persisted data from every store.
    #[inline]
    pub async fn drop_data(&self) -> Result<()> {
        self.text_index.drop_data().await?;
        self.image_index.drop_data().await?;
        self.kv.drop_data().await?;
        Ok(())
    }

    #[inline]
    pub async fn counts(&self) -> StoreCounts {
        StoreCounts {
            chunks: self.text_index.count().await,
            images: self.image_index.count().await,
            kv_docs: self.kv.count().await,
        }
    }

    fn chunk_sources(
        &self,
        text_files: &[PathBuf],
        text_by_filename: &HashMap<&str, &TextEntry>,
        images_by_page: &HashMap<(String, u32), Vec<String>>,
    ) -> Vec<ContentRecord> {
        let mut records = Vec::new();

        for path in text_files {
            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable text file");
                    continue;
                }
            };

            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let doc_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.clone());

            let page_entry = text_by_filename.get(filename.as_str());
            let (source_type, pdf_name, pdf_page) = match page_entry {
                Some(entry) => (
                    SourceType::PdfText,
                    Some(entry.pdf.clone()),
                    Some(entry.page),
                ),
                None => (SourceType::Text, None, None),
            };

            let linked_image_ids = page_entry
                .and_then(|entry| images_by_page.get(&(entry.pdf.clone(), entry.page)))
                .cloned()
                .unwrap_or_default();

            for chunk in chunk_text(
                &content,
                self.chunk_token_size,
                self.chunk_overlap,
                self.split_by_character.as_deref(),
            ) {
                // stored content is trimmed; blank chunks are dropped
                let trimmed = chunk.content.trim();
                if trimmed.is_empty() {
                    continue;
                }
                records.push(ContentRecord {
                    id: format!("{doc_id}_chunk_{}", chunk.chunk_index),
                    content: trimmed.to_string(),
                    source_path: path.display().to_string(),
                    source_type,
                    chunk_index: chunk.chunk_index,
                    pdf_name: pdf_name.clone(),
                    pdf_page,
                    linked_image_ids: linked_image_ids.clone(),
                });
            }
        }

        records
    }

    fn image_sources(
        image_files: &[PathBuf],
        image_by_filename: &HashMap<&str, &ImageEntry>,
    ) -> Vec<(ContentRecord, PathBuf)> {
        let mut records = Vec::new();

        for path in image_files {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let record = match image_by_filename.get(filename.as_str()) {
                Some(entry) => ContentRecord {
                    id: entry.record_id(),
                    content: String::new(),
                    source_path: path.display().to_string(),
                    source_type: SourceType::PdfImage,
                    chunk_index: 0,
                    pdf_name: Some(entry.pdf.clone()),
                    pdf_page: Some(entry.page),
                    linked_image_ids: Vec::new(),
                },
                None => ContentRecord {
                    id: path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| filename.clone()),
                    content: String::new(),
                    source_path: path.display().to_string(),
                    source_type: SourceType::Image,
                    chunk_index: 0,
                    pdf_name: None,
                    pdf_page: None,
                    linked_image_ids: Vec::new(),
                },
            };

            records.push((record, path.clone()));
        }

        records
    }

    async fn query_linked_images(&self, text: &str) -> Result<Vec<LinkedImage>> {
        let hits = self
            .image_index
            .query(QueryInput::Text(text.to_string()), self.image_top_k)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                let path = hit
                    .meta
                    .get("source_path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .unwrap_or_default();
                LinkedImage {
                    id: hit.id,
                    path,
                    score: hit.score,
                }
            })
            .collect())
    }
}

fn source_meta(source_path: &str) -> KvDocument {
    let mut meta = KvDocument::new();
    meta.insert("source_path".to_string(), Value::from(source_path));
    meta
}

fn record_doc(record: &ContentRecord) -> Result<KvDocument> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Err(RagError::Storage(format!(
            "record '{}' did not serialize to an object",
            record.id
        ))),
    }
}
