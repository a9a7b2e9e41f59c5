#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_TOKEN_SIZE};
use crate::storage::hnsw::{
    DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH, DEFAULT_M, HnswParams,
};
use crate::storage::vector::{
    DEFAULT_IMAGE_BATCH_SIZE, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TEXT_BATCH_SIZE,
};

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
pub const DEFAULT_IMAGE_EMBEDDING_DIMENSION: u32 = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Subdirectory of the base directory holding the persisted stores.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Store namespace; all on-disk filenames derive from it.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Directory scanned for new shards, extracted pages, and images.
    #[serde(default = "default_update_dir")]
    pub update_dir: String,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_workspace() -> String {
    "workspace".to_string()
}

fn default_namespace() -> String {
    "rag".to_string()
}

fn default_update_dir() -> String {
    "update".to_string()
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            namespace: default_namespace(),
            update_dir: default_update_dir(),
            ollama: OllamaConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            index: IndexConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub image_model: String,
    pub batch_size: u32,
    pub image_batch_size: u32,
    pub embedding_dimension: u32,
    pub image_embedding_dimension: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            image_model: "clip-vit:latest".to_string(),
            batch_size: DEFAULT_TEXT_BATCH_SIZE as u32,
            image_batch_size: DEFAULT_IMAGE_BATCH_SIZE as u32,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            image_embedding_dimension: DEFAULT_IMAGE_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_token_size: usize,
    pub chunk_overlap: usize,
    /// When set, documents are split on this string before token
    /// windows apply.
    pub split_by_character: Option<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_token_size: DEFAULT_CHUNK_TOKEN_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            split_by_character: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub image_top_k: usize,
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            image_top_k: 3,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

impl IndexConfig {
    #[inline]
    pub fn hnsw_params(&self) -> HnswParams {
        HnswParams {
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid chunk token size: {0} (must be between 50 and 8192)")]
    InvalidChunkTokenSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk token size ({1})")]
    InvalidChunkOverlap(usize, usize),
    #[error("Invalid top_k: {0} (must be at least 1)")]
    InvalidTopK(usize),
    #[error("Invalid similarity threshold: {0} (must be between -1.0 and 1.0)")]
    InvalidSimilarityThreshold(f32),
    #[error("Invalid HNSW m: {0} (must be between 4 and 64)")]
    InvalidHnswM(usize),
    #[error("HNSW ef_construction ({0}) must be at least m ({1})")]
    InvalidEfConstruction(usize, usize),
    #[error("Invalid HNSW ef_search: {0} (must be at least 1)")]
    InvalidEfSearch(usize),
    #[error("Invalid namespace: {0} (must be non-empty and filename-safe)")]
    InvalidNamespace(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Default base directory: `<local data dir>/localrag`, created on
/// first use.
#[inline]
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::data_local_dir()
        .ok_or(ConfigError::DirectoryError)?
        .join("localrag");
    fs::create_dir_all(&dir).map_err(|_| ConfigError::DirectoryError)?;
    Ok(dir)
}

impl Config {
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Directory holding the index files and the KV store.
    #[inline]
    pub fn working_dir(&self) -> PathBuf {
        self.base_dir.join(&self.workspace)
    }

    /// Directory scanned by `build` for new material.
    #[inline]
    pub fn update_dir_path(&self) -> PathBuf {
        self.base_dir.join(&self.update_dir)
    }

    /// Namespace of the image index, derived from the text namespace.
    #[inline]
    pub fn image_namespace(&self) -> String {
        format!("{}_image", self.namespace)
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;

        if !(50..=8192).contains(&self.chunking.chunk_token_size) {
            return Err(ConfigError::InvalidChunkTokenSize(
                self.chunking.chunk_token_size,
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_token_size {
            return Err(ConfigError::InvalidChunkOverlap(
                self.chunking.chunk_overlap,
                self.chunking.chunk_token_size,
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::InvalidTopK(self.retrieval.top_k));
        }
        if self.retrieval.image_top_k == 0 {
            return Err(ConfigError::InvalidTopK(self.retrieval.image_top_k));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(ConfigError::InvalidSimilarityThreshold(
                self.retrieval.similarity_threshold,
            ));
        }

        if !(4..=64).contains(&self.index.m) {
            return Err(ConfigError::InvalidHnswM(self.index.m));
        }
        if self.index.ef_construction < self.index.m {
            return Err(ConfigError::InvalidEfConstruction(
                self.index.ef_construction,
                self.index.m,
            ));
        }
        if self.index.ef_search == 0 {
            return Err(ConfigError::InvalidEfSearch(self.index.ef_search));
        }

        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidNamespace(self.namespace.clone()));
        }

        Ok(())
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }
        if self.image_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.image_model.clone()));
        }

        for batch_size in [self.batch_size, self.image_batch_size] {
            if batch_size == 0 || batch_size > 1000 {
                return Err(ConfigError::InvalidBatchSize(batch_size));
            }
        }

        for dimension in [self.embedding_dimension, self.image_embedding_dimension] {
            if !(64..=4096).contains(&dimension) {
                return Err(ConfigError::InvalidEmbeddingDimension(dimension));
            }
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
