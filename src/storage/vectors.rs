use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::io::Write;
use std::path::PathBuf;

/// File name of the per-domain vector snapshot
pub const VECTORS_FILE_NAME: &str = "vectors.json";

const SNAPSHOT_VERSION: u32 = 1;

/// One embedded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    dimensions: usize,
    records: Vec<&'a EmbeddingRecord>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    dimensions: usize,
    records: Vec<EmbeddingRecord>,
}

/// Vector store for managing embeddings
///
/// All records are held in memory and searched by brute force; the whole
/// set is written to a single snapshot file on [`VectorStore::save`].
#[derive(Debug, Clone)]
pub struct VectorStore {
    path: PathBuf,
    dimensions: usize,
    records: BTreeMap<String, EmbeddingRecord>,
    dirty: bool,
}

impl VectorStore {
    /// Empty store backed by `path`
    pub fn new(path: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            path: path.into(),
            dimensions,
            records: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the snapshot at `path`.
    ///
    /// A missing file gives an empty store. An unreadable snapshot, or one
    /// written for another width, is discarded: the store comes back empty
    /// and dirty, along with the reason.
    pub fn load(path: impl Into<PathBuf>, dimensions: usize) -> Result<(Self, Option<String>)> {
        let mut store = Self::new(path, dimensions);
        let raw = match std::fs::read(&store.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((store, None)),
            Err(e) => return Err(e.into()),
        };

        let discard = |store: &mut Self, reason: String| {
            tracing::warn!(path = %store.path.display(), reason = %reason, "discarding vector snapshot");
            store.dirty = true;
            reason
        };

        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let reason = discard(&mut store, format!("vector snapshot unreadable: {}", e));
                return Ok((store, Some(reason)));
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            let reason = discard(
                &mut store,
                format!("vector snapshot version {} is not supported", snapshot.version),
            );
            return Ok((store, Some(reason)));
        }

        if snapshot.dimensions != dimensions {
            let reason = discard(
                &mut store,
                format!(
                    "vector snapshot has {} dimensions, provider has {}",
                    snapshot.dimensions, dimensions
                ),
            );
            return Ok((store, Some(reason)));
        }

        let mut skipped = 0usize;
        for record in snapshot.records {
            if record.embedding.len() != dimensions {
                skipped += 1;
                continue;
            }
            store.records.insert(record.id.clone(), record);
        }
        if skipped > 0 {
            store.dirty = true;
            let reason = format!("{} vector records had the wrong width and were dropped", skipped);
            tracing::warn!(path = %store.path.display(), skipped, "dropped malformed vector records");
            return Ok((store, Some(reason)));
        }

        Ok((store, None))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&EmbeddingRecord> {
        self.records.get(id)
    }

    /// Record ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Insert or replace a record.
    pub fn add_document(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        self.records.insert(
            id.to_string(),
            EmbeddingRecord {
                id: id.to_string(),
                embedding,
                metadata,
            },
        );
        self.dirty = true;
        Ok(())
    }

    pub fn remove_document(&mut self, id: &str) -> bool {
        let removed = self.records.remove(id).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            self.records.clear();
            self.dirty = true;
        }
    }

    /// Top `k` records by cosine similarity, descending; ties by id.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        if k == 0 || query.len() != self.dimensions {
            return Vec::new();
        }

        let mut heap: BinaryHeap<SimilarityEntry> = BinaryHeap::with_capacity(k + 1);
        for record in self.records.values() {
            let similarity = cosine_similarity(query, &record.embedding);
            heap.push(SimilarityEntry(&record.id, similarity));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut results: Vec<(String, f32)> = heap
            .into_iter()
            .map(|entry| (entry.0.to_string(), entry.1))
            .collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results
    }

    /// Write the snapshot if anything changed since the last load or save.
    ///
    /// The new snapshot goes to a temporary file next to the target, is
    /// synced, then renamed over it. Returns whether a write happened.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            dimensions: self.dimensions,
            records: self.records.values().collect(),
        };
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            serde_json::to_writer(&mut file, &snapshot)?;
            file.flush()?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.dirty = false;
        tracing::debug!(path = %self.path.display(), records = self.records.len(), "vector snapshot saved");
        Ok(true)
    }
}

/// Helper struct for maintaining top-K search results using a min-heap
struct SimilarityEntry<'a>(&'a str, f32);

impl PartialEq for SimilarityEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimilarityEntry<'_> {}

impl PartialOrd for SimilarityEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimilarityEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the weakest entry: lowest similarity,
        // then the largest id.
        other
            .1
            .partial_cmp(&self.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.0.cmp(other.0))
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
