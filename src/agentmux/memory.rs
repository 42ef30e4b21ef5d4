//! Persistent content + embedding + metadata memory store.
//!
//! [`MemoryStore`] keeps every entry an agent chose to remember: the raw
//! content, an optional fixed-dimension embedding, and a free-form JSON
//! metadata object. Retrieval combines cosine similarity over embeddings
//! with metadata filters (type, source, agent, session, tags, date range,
//! importance).
//!
//! Entries are persisted as newline-delimited JSON — one entry per line,
//! append-only for inserts; destructive operations (update, delete, clear,
//! cleanup, import) compact the backing file in place. The similarity
//! search runs in-process over the loaded entries with semantics identical
//! to a `vec_distance_cosine` SQL ranking; a store configured with
//! dimension `0` operates in fallback mode where no similarity search is
//! supported.
//!
//! # Disk Format
//!
//! ```text
//! {"id":1,"content":"[researcher] Stage: analyze\n\n...","embedding":[0.1,...],"metadata":{"type":"task","agent_id":"researcher"},"created_at":"2026-07-01T12:00:00Z","last_accessed_at":null,"access_count":0}
//! {"id":2,"content":"...","embedding":null,"metadata":{"type":"other"},...}
//! ```
//!
//! # Example
//!
//! ```rust
//! use agentmux::memory::{MemoryStore, MemoryStoreConfig, MemoryMetadata, MemoryType};
//!
//! let store = MemoryStore::open(MemoryStoreConfig {
//!     dimension: 3,
//!     ..MemoryStoreConfig::default()
//! }).unwrap();
//!
//! let id = store.add(
//!     "The router penalizes failing providers for 30 seconds.",
//!     Some(vec![0.1, 0.2, 0.3]),
//!     MemoryMetadata::new(MemoryType::Document).with_tag("router").into_value(),
//! ).unwrap();
//!
//! assert_eq!(store.get(id).unwrap().access_count, 0);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Export format version written by [`MemoryStore::export_to_json`].
pub const EXPORT_FORMAT_VERSION: &str = "4.0.0";
/// Format versions accepted by [`MemoryStore::import_from_json`].
pub const SUPPORTED_IMPORT_VERSIONS: [&str; 2] = ["1.0", "4.0.0"];
/// Entries per batch during export/import processing.
const TRANSFER_BATCH_SIZE: usize = 100;
/// Characters of content kept on each side of the dedup fingerprint.
const DEDUP_AFFIX_LEN: usize = 32;

/// Semantic category of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Conversation transcripts.
    Conversation,
    /// Source code fragments.
    Code,
    /// Reference documents.
    Document,
    /// Task and stage outputs.
    Task,
    /// Anything else.
    Other,
}

/// Builder for the metadata JSON attached to an entry.
///
/// The store itself treats metadata as a free-form JSON object; this builder
/// covers the well-known fields the search filters understand and accepts
/// arbitrary extras.
#[derive(Debug, Clone)]
pub struct MemoryMetadata {
    value: serde_json::Map<String, Value>,
}

impl MemoryMetadata {
    /// Start a metadata object of the given type.
    pub fn new(entry_type: MemoryType) -> Self {
        let mut value = serde_json::Map::new();
        value.insert(
            "type".to_string(),
            serde_json::to_value(entry_type).unwrap_or(Value::Null),
        );
        Self { value }
    }

    /// Set the `source` field (builder pattern).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.value
            .insert("source".to_string(), Value::String(source.into()));
        self
    }

    /// Set the `agent_id` field (builder pattern).
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.value
            .insert("agent_id".to_string(), Value::String(agent_id.into()));
        self
    }

    /// Set the `session_id` field (builder pattern).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.value
            .insert("session_id".to_string(), Value::String(session_id.into()));
        self
    }

    /// Append a tag (builder pattern).
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tags = self
            .value
            .entry("tags".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = tags {
            list.push(Value::String(tag.into()));
        }
        self
    }

    /// Set the importance score (builder pattern).
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.value.insert(
            "importance".to_string(),
            serde_json::Number::from_f64(importance)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        self
    }

    /// Set the covered date range (builder pattern).
    pub fn with_date_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.value
            .insert("date_from".to_string(), Value::String(from.to_rfc3339()));
        self.value
            .insert("date_to".to_string(), Value::String(to.to_rfc3339()));
        self
    }

    /// Attach an arbitrary extra field (builder pattern).
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.value.insert(key.into(), value);
        self
    }

    /// Finish the builder, producing the metadata JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.value)
    }
}

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Monotonically assigned identifier.
    pub id: u64,
    /// The remembered content.
    pub content: String,
    /// Fixed-dimension embedding, absent in fallback mode or for
    /// text-only inserts.
    pub embedding: Option<Vec<f32>>,
    /// Free-form JSON metadata object.
    pub metadata: Value,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last time this entry was returned by a search (when access tracking
    /// is enabled).
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Number of searches that returned this entry.
    pub access_count: u64,
}

/// Errors surfaced by the memory store.
#[derive(Debug, Clone)]
pub enum MemoryError {
    /// No entry with the given id.
    NotFound(u64),
    /// An embedding's length does not match the configured dimension.
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Supplied embedding length.
        got: usize,
    },
    /// The search query is unusable (no text/vector, or similarity search in
    /// fallback mode, or text search without an embedding provider).
    QueryError(String),
    /// An entry failed validation during import.
    ValidationError(String),
    /// An unsupported export format version.
    VersionMismatch(String),
    /// Filesystem failure.
    Io(String),
    /// Serialisation failure.
    Serde(String),
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::NotFound(id) => write!(f, "Memory entry not found: {}", id),
            MemoryError::DimensionMismatch { expected, got } => {
                write!(f, "Embedding dimension mismatch: expected {}, got {}", expected, got)
            }
            MemoryError::QueryError(message) => write!(f, "QUERY_ERROR: {}", message),
            MemoryError::ValidationError(message) => write!(f, "Invalid entry: {}", message),
            MemoryError::VersionMismatch(version) => {
                write!(f, "Unsupported export format version: {}", version)
            }
            MemoryError::Io(message) => write!(f, "Memory I/O error: {}", message),
            MemoryError::Serde(message) => write!(f, "Memory serialisation error: {}", message),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<std::io::Error> for MemoryError {
    fn from(e: std::io::Error) -> Self {
        MemoryError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serde(e.to_string())
    }
}

/// Computes embeddings for text queries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embedding dimension produced by this provider.
    fn dimension(&self) -> usize;

    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Metadata filters applied inside a search.
///
/// Scalar fields accept one value; `types`, `sources`, and `tags` accept
/// several (`types`/`sources` match any listed value, `tags` requires every
/// listed tag to be present).
#[derive(Debug, Clone, Default)]
pub struct MemoryFilters {
    /// Entry types to match (any-of).
    pub types: Vec<MemoryType>,
    /// Sources to match (any-of).
    pub sources: Vec<String>,
    /// Exact agent id.
    pub agent_id: Option<String>,
    /// Exact session id.
    pub session_id: Option<String>,
    /// Tags that must all be present.
    pub tags: Vec<String>,
    /// Inclusive lower bound on the entry's covered date range.
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the entry's covered date range.
    pub date_to: Option<DateTime<Utc>>,
    /// Minimum importance score.
    pub min_importance: Option<f64>,
}

/// A similarity search request.
#[derive(Clone, Default)]
pub struct MemoryQuery {
    /// Text to embed via the configured [`EmbeddingProvider`].
    pub text: Option<String>,
    /// A pre-computed query vector; ignored when `text` is set.
    pub vector: Option<Vec<f32>>,
    /// Result cap; defaults to 10.
    pub limit: Option<usize>,
    /// Minimum similarity; defaults to 0.
    pub threshold: Option<f32>,
    /// Metadata filters.
    pub filters: Option<MemoryFilters>,
}

impl MemoryQuery {
    /// Query by text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Query by a pre-computed vector.
    pub fn vector(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            ..Self::default()
        }
    }

    /// Cap the result count (builder pattern).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Require a minimum similarity (builder pattern).
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Apply metadata filters (builder pattern).
    pub fn with_filters(mut self, filters: MemoryFilters) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// One ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matching entry.
    pub entry: MemoryEntry,
    /// Cosine similarity, `1.0` is identical direction.
    pub similarity: f32,
    /// `1 − similarity`.
    pub distance: f32,
}

/// Pagination and type filter for [`MemoryStore::get_all`].
#[derive(Debug, Clone, Default)]
pub struct GetAllOptions {
    /// Cap the number of entries returned.
    pub limit: Option<usize>,
    /// Skip this many entries (in id order) first.
    pub offset: usize,
    /// Only entries of this type.
    pub entry_type: Option<MemoryType>,
}

/// Occupancy summary reported by [`MemoryStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Live entries.
    pub total_entries: usize,
    /// Entries carrying an embedding.
    pub entries_with_embedding: usize,
    /// Sum of content lengths in bytes.
    pub content_bytes: usize,
    /// Entry counts keyed by metadata type.
    pub by_type: HashMap<String, usize>,
    /// Size of the backing file, when persistence is configured.
    pub file_size_bytes: Option<u64>,
}

/// Outcome counts of an export or import run. Per-entry failures are
/// recorded and the overall operation continues.
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    /// Entries written or inserted.
    pub transferred: usize,
    /// Entries skipped as duplicates (import only).
    pub skipped: usize,
    /// Entries that failed validation or serialisation.
    pub failed: usize,
    /// Per-entry error texts.
    pub errors: Vec<String>,
}

/// Store construction options.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Embedding dimension. `0` selects the fallback mode in which no
    /// similarity search is supported.
    pub dimension: usize,
    /// Backing JSONL file. `None` keeps the store purely in memory.
    pub persist_path: Option<PathBuf>,
    /// Whether searches update `last_accessed_at`/`access_count`.
    pub track_access: bool,
    /// Soft cap on live entries, enforced at insert.
    pub max_entries: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            persist_path: None,
            track_access: true,
            max_entries: 1_000_000,
        }
    }
}

struct MemoryInner {
    entries: BTreeMap<u64, MemoryEntry>,
    next_id: u64,
}

/// The memory store. See the module docs for semantics.
pub struct MemoryStore {
    config: MemoryStoreConfig,
    inner: Mutex<MemoryInner>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl MemoryStore {
    /// Open a store, loading any previously persisted entries.
    pub fn open(config: MemoryStoreConfig) -> Result<Self, MemoryError> {
        let entries = match &config.persist_path {
            Some(path) if path.exists() => load_entries(path)?,
            _ => BTreeMap::new(),
        };
        let next_id = entries.keys().next_back().map(|id| id + 1).unwrap_or(1);
        Ok(Self {
            config,
            inner: Mutex::new(MemoryInner { entries, next_id }),
            embedder: None,
        })
    }

    /// Attach an embedding provider used for text queries (builder pattern).
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Insert an entry, returning the assigned id.
    ///
    /// When an embedding is supplied its length must equal the configured
    /// dimension; a dimension-0 store rejects embeddings outright.
    pub fn add(
        &self,
        content: impl Into<String>,
        embedding: Option<Vec<f32>>,
        metadata: Value,
    ) -> Result<u64, MemoryError> {
        if let Some(vector) = &embedding {
            if vector.len() != self.config.dimension {
                return Err(MemoryError::DimensionMismatch {
                    expected: self.config.dimension,
                    got: vector.len(),
                });
            }
        }
        if !metadata.is_object() {
            return Err(MemoryError::ValidationError(
                "metadata must be a JSON object".to_string(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= self.config.max_entries {
            return Err(MemoryError::ValidationError(format!(
                "store is full ({} entries)",
                self.config.max_entries
            )));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let entry = MemoryEntry {
            id,
            content: content.into(),
            embedding,
            metadata,
            created_at: Utc::now(),
            last_accessed_at: None,
            access_count: 0,
        };

        if let Some(path) = &self.config.persist_path {
            append_entry(path, &entry)?;
        }
        inner.entries.insert(id, entry);
        Ok(id)
    }

    /// Similarity search with metadata filters.
    pub async fn search(&self, query: MemoryQuery) -> Result<Vec<SearchResult>, MemoryError> {
        let vector = match (&query.text, &query.vector) {
            (Some(text), _) => {
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    MemoryError::QueryError(
                        "text search requires an embedding provider".to_string(),
                    )
                })?;
                embedder.embed(text).await?
            }
            (None, Some(vector)) => vector.clone(),
            (None, None) => {
                return Err(MemoryError::QueryError(
                    "search requires either text or a vector".to_string(),
                ))
            }
        };

        if self.config.dimension == 0 {
            return Err(MemoryError::QueryError(
                "similarity search is not supported in zero-dimension mode".to_string(),
            ));
        }
        if vector.len() != self.config.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }

        let limit = query.limit.unwrap_or(10);
        let threshold = query.threshold.unwrap_or(0.0);
        let filters = query.filters.unwrap_or_default();

        let mut ranked: Vec<SearchResult> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .values()
                .filter(|entry| matches_filters(entry, &filters))
                .filter_map(|entry| {
                    let embedding = entry.embedding.as_ref()?;
                    let similarity = cosine_similarity(&vector, embedding);
                    if similarity >= threshold {
                        Some(SearchResult {
                            entry: entry.clone(),
                            similarity,
                            distance: 1.0 - similarity,
                        })
                    } else {
                        None
                    }
                })
                .collect()
        };

        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(limit);

        if self.config.track_access && !ranked.is_empty() {
            let now = Utc::now();
            let ids: Vec<u64> = ranked.iter().map(|r| r.entry.id).collect();
            let mut inner = self.inner.lock().unwrap();
            for id in ids {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.last_accessed_at = Some(now);
                    entry.access_count += 1;
                }
            }
            if let Some(path) = &self.config.persist_path {
                rewrite_entries(path, &inner.entries)?;
            }
        }

        Ok(ranked)
    }

    /// Fetch a single entry.
    pub fn get(&self, id: u64) -> Result<MemoryEntry, MemoryError> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .cloned()
            .ok_or(MemoryError::NotFound(id))
    }

    /// Merge a partial metadata object into an entry's existing metadata.
    pub fn update(&self, id: u64, partial_metadata: Value) -> Result<(), MemoryError> {
        let partial = match partial_metadata {
            Value::Object(map) => map,
            _ => {
                return Err(MemoryError::ValidationError(
                    "metadata update must be a JSON object".to_string(),
                ))
            }
        };

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(MemoryError::NotFound(id))?;
        if let Value::Object(existing) = &mut entry.metadata {
            for (key, value) in partial {
                existing.insert(key, value);
            }
        }
        if let Some(path) = &self.config.persist_path {
            rewrite_entries(path, &inner.entries)?;
        }
        Ok(())
    }

    /// Remove an entry.
    pub fn delete(&self, id: u64) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(&id).is_none() {
            return Err(MemoryError::NotFound(id));
        }
        if let Some(path) = &self.config.persist_path {
            rewrite_entries(path, &inner.entries)?;
        }
        Ok(())
    }

    /// List entries in id order with optional pagination and type filter.
    pub fn get_all(&self, options: GetAllOptions) -> Vec<MemoryEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|entry| match options.entry_type {
                Some(wanted) => entry_type_of(entry) == Some(wanted),
                None => true,
            })
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop every entry and compact the backing file.
    pub fn clear(&self) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.next_id = 1;
        if let Some(path) = &self.config.persist_path {
            rewrite_entries(path, &inner.entries)?;
        }
        Ok(())
    }

    /// Delete entries older than the given age; compacts the backing file
    /// when anything was removed. Returns the number of deleted entries.
    pub fn cleanup(&self, older_than_days: i64) -> Result<usize, MemoryError> {
        let cutoff = Utc::now() - ChronoDuration::days(older_than_days);
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            inner.entries.remove(id);
        }
        if !doomed.is_empty() {
            if let Some(path) = &self.config.persist_path {
                rewrite_entries(path, &inner.entries)?;
            }
        }
        Ok(doomed.len())
    }

    /// Occupancy summary.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock().unwrap();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut with_embedding = 0;
        let mut content_bytes = 0;
        for entry in inner.entries.values() {
            if entry.embedding.is_some() {
                with_embedding += 1;
            }
            content_bytes += entry.content.len();
            let type_name = entry
                .metadata
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("other")
                .to_string();
            *by_type.entry(type_name).or_insert(0) += 1;
        }
        MemoryStats {
            total_entries: inner.entries.len(),
            entries_with_embedding: with_embedding,
            content_bytes,
            by_type,
            file_size_bytes: self
                .config
                .persist_path
                .as_ref()
                .and_then(|p| fs::metadata(p).ok())
                .map(|m| m.len()),
        }
    }

    /// Write a consistent snapshot of every entry to `dest`.
    ///
    /// The snapshot is taken under the store lock, so it is safe to call
    /// while other tasks keep writing.
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<(), MemoryError> {
        let inner = self.inner.lock().unwrap();
        rewrite_entries(dest.as_ref(), &inner.entries)
    }

    /// Replace the store contents from a backup file.
    pub fn restore(&self, src: impl AsRef<Path>) -> Result<(), MemoryError> {
        let entries = load_entries(src.as_ref())?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id = entries.keys().next_back().map(|id| id + 1).unwrap_or(1);
        inner.entries = entries;
        if let Some(path) = &self.config.persist_path {
            rewrite_entries(path, &inner.entries)?;
        }
        Ok(())
    }

    /// Export every entry as a version-4.0.0 JSON document.
    ///
    /// Entries are processed in batches; per-entry serialisation failures are
    /// recorded in the report and the export continues.
    pub fn export_to_json(
        &self,
        dest: impl AsRef<Path>,
        include_embeddings: bool,
    ) -> Result<TransferReport, MemoryError> {
        let snapshot: Vec<MemoryEntry> = {
            let inner = self.inner.lock().unwrap();
            inner.entries.values().cloned().collect()
        };

        let mut report = TransferReport::default();
        let mut exported = Vec::with_capacity(snapshot.len());
        for batch in snapshot.chunks(TRANSFER_BATCH_SIZE) {
            for entry in batch {
                match export_entry(entry, include_embeddings) {
                    Ok(value) => {
                        exported.push(value);
                        report.transferred += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(format!("entry {}: {}", entry.id, e));
                    }
                }
            }
        }

        let document = serde_json::json!({
            "version": EXPORT_FORMAT_VERSION,
            "metadata": {
                "exportedAt": Utc::now().to_rfc3339(),
                "totalEntries": report.transferred,
                "includesEmbeddings": include_embeddings,
            },
            "entries": exported,
        });

        fs::write(dest.as_ref(), serde_json::to_string_pretty(&document)?)?;
        Ok(report)
    }

    /// Import entries from an export document.
    ///
    /// Accepts format versions `1.0` and `4.0.0`, validates entries,
    /// deduplicates by a content length + prefix + suffix fingerprint, and
    /// optionally clears the store first. Per-entry failures are recorded
    /// and the import continues.
    pub fn import_from_json(
        &self,
        src: impl AsRef<Path>,
        clear_existing: bool,
    ) -> Result<TransferReport, MemoryError> {
        let raw = fs::read_to_string(src.as_ref())?;
        let document: Value = serde_json::from_str(&raw)?;

        let version = document
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if !SUPPORTED_IMPORT_VERSIONS.contains(&version.as_str()) {
            return Err(MemoryError::VersionMismatch(version));
        }

        let entries = document
            .get("entries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| MemoryError::ValidationError("missing entries array".to_string()))?;

        if clear_existing {
            self.clear()?;
        }

        let mut seen: HashSet<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .values()
                .map(|e| dedup_fingerprint(&e.content))
                .collect()
        };

        let mut report = TransferReport::default();
        for batch in entries.chunks(TRANSFER_BATCH_SIZE) {
            for raw_entry in batch {
                match import_entry(raw_entry, self.config.dimension) {
                    Ok((content, embedding, metadata)) => {
                        let fingerprint = dedup_fingerprint(&content);
                        if seen.contains(&fingerprint) {
                            report.skipped += 1;
                            continue;
                        }
                        match self.add(content, embedding, metadata) {
                            Ok(_) => {
                                seen.insert(fingerprint);
                                report.transferred += 1;
                            }
                            Err(e) => {
                                report.failed += 1;
                                report.errors.push(e.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(e.to_string());
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Cosine similarity; zero-magnitude vectors compare as dissimilar.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn entry_type_of(entry: &MemoryEntry) -> Option<MemoryType> {
    entry
        .metadata
        .get("type")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn matches_filters(entry: &MemoryEntry, filters: &MemoryFilters) -> bool {
    let metadata = &entry.metadata;

    if !filters.types.is_empty() {
        match entry_type_of(entry) {
            Some(entry_type) if filters.types.contains(&entry_type) => {}
            _ => return false,
        }
    }

    if !filters.sources.is_empty() {
        match metadata.get("source").and_then(|v| v.as_str()) {
            Some(source) if filters.sources.iter().any(|s| s == source) => {}
            _ => return false,
        }
    }

    if let Some(wanted) = &filters.agent_id {
        if metadata.get("agent_id").and_then(|v| v.as_str()) != Some(wanted.as_str()) {
            return false;
        }
    }

    if let Some(wanted) = &filters.session_id {
        if metadata.get("session_id").and_then(|v| v.as_str()) != Some(wanted.as_str()) {
            return false;
        }
    }

    if !filters.tags.is_empty() {
        let entry_tags: Vec<&str> = metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().filter_map(|t| t.as_str()).collect())
            .unwrap_or_default();
        if !filters.tags.iter().all(|t| entry_tags.contains(&t.as_str())) {
            return false;
        }
    }

    if let Some(from) = filters.date_from {
        let entry_from = metadata
            .get("date_from")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        match entry_from {
            Some(date) if date >= from => {}
            _ => return false,
        }
    }

    if let Some(to) = filters.date_to {
        let entry_to = metadata
            .get("date_to")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        match entry_to {
            Some(date) if date <= to => {}
            _ => return false,
        }
    }

    if let Some(min) = filters.min_importance {
        match metadata.get("importance").and_then(|v| v.as_f64()) {
            Some(importance) if importance >= min => {}
            _ => return false,
        }
    }

    true
}

/// Fingerprint used for import dedup: content length plus a short prefix and
/// suffix. Deliberately not cryptographic.
fn dedup_fingerprint(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let prefix: String = chars.iter().take(DEDUP_AFFIX_LEN).collect();
    let suffix: String = chars
        .iter()
        .rev()
        .take(DEDUP_AFFIX_LEN)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}:{}:{}", chars.len(), prefix, suffix)
}

fn export_entry(entry: &MemoryEntry, include_embeddings: bool) -> Result<Value, MemoryError> {
    let mut value = serde_json::json!({
        "id": entry.id,
        "content": entry.content,
        "metadata": entry.metadata,
        "createdAt": entry.created_at.to_rfc3339(),
        "accessCount": entry.access_count,
    });
    if let Some(accessed) = entry.last_accessed_at {
        value["lastAccessedAt"] = Value::String(accessed.to_rfc3339());
    }
    if include_embeddings {
        if let Some(embedding) = &entry.embedding {
            value["embedding"] = serde_json::to_value(embedding)?;
        }
    }
    Ok(value)
}

fn import_entry(
    raw: &Value,
    dimension: usize,
) -> Result<(String, Option<Vec<f32>>, Value), MemoryError> {
    let content = raw
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MemoryError::ValidationError("entry missing content".to_string()))?
        .to_string();
    if content.is_empty() {
        return Err(MemoryError::ValidationError("entry content empty".to_string()));
    }

    let metadata = match raw.get("metadata") {
        Some(value @ Value::Object(_)) => value.clone(),
        Some(_) => {
            return Err(MemoryError::ValidationError(
                "entry metadata is not an object".to_string(),
            ))
        }
        None => serde_json::json!({ "type": "other" }),
    };

    let embedding = match raw.get("embedding") {
        Some(Value::Array(values)) => {
            let vector: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64())
                .map(|v| v as f32)
                .collect();
            if vector.len() != values.len() {
                return Err(MemoryError::ValidationError(
                    "embedding contains non-numeric values".to_string(),
                ));
            }
            if dimension > 0 && vector.len() == dimension {
                Some(vector)
            } else {
                // Dimension mismatch on import drops the vector rather than
                // the whole entry.
                None
            }
        }
        _ => None,
    };

    Ok((content, embedding, metadata))
}

fn load_entries(path: &Path) -> Result<BTreeMap<u64, MemoryEntry>, MemoryError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = BTreeMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: MemoryEntry = serde_json::from_str(&line)?;
        entries.insert(entry.id, entry);
    }
    Ok(entries)
}

fn append_entry(path: &Path, entry: &MemoryEntry) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    Ok(())
}

fn rewrite_entries(path: &Path, entries: &BTreeMap<u64, MemoryEntry>) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buffer = String::new();
    for entry in entries.values() {
        buffer.push_str(&serde_json::to_string(entry)?);
        buffer.push('\n');
    }
    fs::write(path, buffer)?;
    Ok(())
}
