use crate::core::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Table definition for file state tracking
/// Using &str for both key and value (JSON serialized)
const FILE_STATE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("file_state");

/// Free-form key/value metadata about the cache itself
const METADATA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("metadata");

pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const LAST_FULL_BUILD_KEY: &str = "last_full_build";
pub const MODEL_ID_KEY: &str = "embedding_model";

/// Bumped whenever the persisted layout changes; older caches are discarded.
pub const SCHEMA_VERSION: &str = "1";

/// What the cache knows about one file as of its last indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    /// Modification time in milliseconds since the epoch
    pub modified_at: u64,
    /// SHA256 of the file bytes
    pub content_hash: String,
    /// When the file was last indexed, milliseconds since the epoch
    pub indexed_at: u64,
}

impl CacheEntry {
    pub fn new(path: impl Into<String>, modified_at: u64, content_hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            modified_at,
            content_hash: content_hash.into(),
            indexed_at: now_millis(),
        }
    }
}

/// Outcome of reading the persisted cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLoad {
    /// Entries were read back
    Loaded(usize),
    /// The snapshot was unusable and the cache starts empty
    Recovered(String),
}

/// Per-domain record of which files were indexed and in what state.
///
/// Entries live in memory and are written back to redb in one transaction
/// by [`CacheManager::persist`].
pub struct CacheManager {
    db: Arc<Database>,
    entries: BTreeMap<String, CacheEntry>,
    metadata: BTreeMap<String, String>,
    dirty: bool,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl CacheManager {
    /// Attach to a database, creating the tables if needed. Nothing is read yet.
    pub fn open(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _state = write_txn.open_table(FILE_STATE_TABLE)?;
            let _meta = write_txn.open_table(METADATA_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            entries: BTreeMap::new(),
            metadata: BTreeMap::new(),
            dirty: false,
        })
    }

    /// Read the persisted entries.
    ///
    /// A corrupt entry or a schema mismatch empties the cache instead of
    /// failing; every file is then treated as new.
    pub fn load(&mut self) -> Result<CacheLoad> {
        match self.read_all() {
            Ok((entries, metadata)) => {
                let count = entries.len();
                self.entries = entries;
                self.metadata = metadata;
                self.dirty = false;
                Ok(CacheLoad::Loaded(count))
            }
            Err(Error::CacheCorruption(reason)) => {
                tracing::warn!(reason = %reason, "cache snapshot unusable, starting empty");
                self.entries.clear();
                self.metadata.clear();
                self.dirty = true;
                Ok(CacheLoad::Recovered(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn read_all(&self) -> Result<(BTreeMap<String, CacheEntry>, BTreeMap<String, String>)> {
        let read_txn = self.db.begin_read()?;

        let mut metadata = BTreeMap::new();
        let meta_table = read_txn.open_table(METADATA_TABLE)?;
        for item in meta_table.iter()? {
            let (key, value) = item?;
            metadata.insert(key.value().to_string(), value.value().to_string());
        }

        let state_table = read_txn.open_table(FILE_STATE_TABLE)?;
        let mut entries = BTreeMap::new();
        let has_entries = state_table.iter()?.next().is_some();

        match metadata.get(SCHEMA_VERSION_KEY) {
            Some(version) if version != SCHEMA_VERSION => {
                return Err(Error::CacheCorruption(format!(
                    "schema version {} does not match {}",
                    version, SCHEMA_VERSION
                )));
            }
            None if has_entries => {
                return Err(Error::CacheCorruption("schema version missing".to_string()));
            }
            _ => {}
        }

        for item in state_table.iter()? {
            let (key, value) = item?;
            let entry: CacheEntry = serde_json::from_str(value.value()).map_err(|e| {
                Error::CacheCorruption(format!("entry {}: {}", key.value(), e))
            })?;
            entries.insert(key.value().to_string(), entry);
        }

        Ok((entries, metadata))
    }

    /// True when the file has no entry or its modification time moved.
    pub fn needs_reindex(&self, path: &str, modified_at: u64) -> bool {
        match self.entries.get(path) {
            Some(entry) => entry.modified_at != modified_at,
            None => true,
        }
    }

    pub fn entry(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record a file that was just (re)tokenized.
    pub fn record_indexed(&mut self, path: &str, modified_at: u64, content_hash: &str) {
        self.entries
            .insert(path.to_string(), CacheEntry::new(path, modified_at, content_hash));
        self.dirty = true;
    }

    /// Accept a new modification time for a file whose content is unchanged.
    pub fn refresh(&mut self, path: &str, modified_at: u64) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.modified_at = modified_at;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Drop every entry, or only those under a path prefix. Returns how many went.
    pub fn clear(&mut self, prefix: Option<&str>) -> usize {
        let before = self.entries.len();
        match prefix {
            Some(prefix) => self.entries.retain(|path, _| !path.starts_with(prefix)),
            None => self.entries.clear(),
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if self.metadata.get(key) != Some(&value) {
            self.metadata.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    /// Write entries and metadata back in a single transaction.
    ///
    /// Returns `false` when nothing changed since the last load or persist.
    pub fn persist(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.metadata
            .insert(SCHEMA_VERSION_KEY.to_string(), SCHEMA_VERSION.to_string());

        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(FILE_STATE_TABLE)?;
        write_txn.delete_table(METADATA_TABLE)?;
        {
            let mut table = write_txn.open_table(FILE_STATE_TABLE)?;
            for (path, entry) in &self.entries {
                let json = serde_json::to_string(entry)?;
                table.insert(path.as_str(), json.as_str())?;
            }

            let mut meta = write_txn.open_table(METADATA_TABLE)?;
            for (key, value) in &self.metadata {
                meta.insert(key.as_str(), value.as_str())?;
            }
        }
        write_txn.commit()?;

        self.dirty = false;
        tracing::debug!(entries = self.entries.len(), "cache persisted");
        Ok(true)
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
