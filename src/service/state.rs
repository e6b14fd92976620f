use crate::core::domain::Domain;
use crate::indexing::document::DocumentMeta;
use crate::search::tfidf::TfidfIndex;
use crate::storage::vectors::VectorStore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle of one domain's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum IndexState {
    Uninitialized,
    Scanning,
    BuildingText,
    BuildingVectors,
    Ready,
    /// A change was seen; queries use the previous snapshot until the rebuild lands
    Stale,
    Failed(String),
}

impl IndexState {
    pub fn is_building(&self) -> bool {
        matches!(
            self,
            IndexState::Scanning | IndexState::BuildingText | IndexState::BuildingVectors
        )
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexState::Uninitialized => f.write_str("uninitialized"),
            IndexState::Scanning => f.write_str("scanning"),
            IndexState::BuildingText => f.write_str("building text index"),
            IndexState::BuildingVectors => f.write_str("building vectors"),
            IndexState::Ready => f.write_str("ready"),
            IndexState::Stale => f.write_str("stale"),
            IndexState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub domain: Domain,
    #[serde(flatten)]
    pub state: IndexState,
    pub file_count: usize,
    /// Milliseconds since the epoch of the last published build
    pub last_indexed_at: Option<u64>,
}

/// What one build did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingStats {
    pub domain: Option<Domain>,
    pub full_rebuild: bool,
    pub files_scanned: usize,
    /// Re-tokenized because new or changed
    pub files_indexed: usize,
    /// Modification time moved but content hash matched
    pub files_refreshed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    /// Unreadable, binary or timed out
    pub files_skipped: usize,
    pub embeddings_generated: usize,
    pub failed_batches: usize,
    pub rejected_vectors: usize,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl IndexingStats {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain: Some(domain),
            ..Self::default()
        }
    }

    /// True when the build finished but degraded somewhere.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Immutable view of one completed build, shared with readers by `Arc`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root: PathBuf,
    /// Finalized: IDF and magnitudes are current
    pub index: TfidfIndex,
    pub vectors: Option<VectorStore>,
    pub documents: HashMap<String, DocumentMeta>,
    pub indexed_at: u64,
}

impl Snapshot {
    pub fn file_count(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(IndexState::Failed("gone".to_string())).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "gone");
        let json = serde_json::to_value(IndexState::BuildingText).unwrap();
        assert_eq!(json["state"], "building_text");
    }

    #[test]
    fn test_stats_warnings() {
        let mut stats = IndexingStats::new(Domain::Codebase);
        assert!(!stats.has_warnings());
        stats.warn("batch 1 failed");
        assert!(stats.has_warnings());
        assert!(IndexState::Scanning.is_building());
        assert!(!IndexState::Stale.is_building());
    }
}
