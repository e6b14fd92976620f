//! Persistence of the TF-IDF index in redb.
//!
//! Three tables:
//! - `documents`: uri → JSON [`StoredDocument`]
//! - `terms`: `"{uri}\0{term}"` → term frequency, so one document's terms
//!   form a contiguous key range
//! - `idf`: term → idf as of the last recomputation

use crate::core::config::TfidfConfig;
use crate::core::error::Result;
use crate::indexing::document::DocumentMeta;
use crate::indexing::tokenizer::TermExtractor;
use crate::search::tfidf::{TermVector, TfidfIndex};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const DOCUMENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("documents");
const TERMS_TABLE: TableDefinition<&str, u32> = TableDefinition::new("terms");
const IDF_TABLE: TableDefinition<&str, f64> = TableDefinition::new("idf");

/// Separates the uri from the term in `terms` keys.
const KEY_SEPARATOR: char = '\0';

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    ordinal: u64,
    /// Distinct terms
    term_count: usize,
    /// Terms emitted before counting, duplicates included
    raw_terms: usize,
    magnitude: f64,
    language: String,
    size_bytes: u64,
    modified_at: u64,
    content_hash: String,
}

fn term_key(uri: &str, term: &str) -> String {
    format!("{}{}{}", uri, KEY_SEPARATOR, term)
}

/// `[start, end)` covering every term key of `uri`
fn term_range(uri: &str) -> (String, String) {
    (format!("{}\0", uri), format!("{}\u{1}", uri))
}

/// What [`IndexStore::load`] hands back: the index and the metadata of
/// every document in it.
pub type LoadedIndex = (TfidfIndex, HashMap<String, DocumentMeta>);

pub struct IndexStore {
    db: Arc<Database>,
}

impl IndexStore {
    pub fn open(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _docs = write_txn.open_table(DOCUMENTS_TABLE)?;
            let _terms = write_txn.open_table(TERMS_TABLE)?;
            let _idf = write_txn.open_table(IDF_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Write the index.
    ///
    /// Term rows are only rewritten for `changed` and `removed` documents
    /// unless `full` is set; document rows and the idf table are replaced
    /// wholesale since magnitudes and weights move with every mutation.
    pub fn save(
        &self,
        index: &TfidfIndex,
        metas: &HashMap<String, DocumentMeta>,
        changed: &[String],
        removed: &[String],
        full: bool,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(DOCUMENTS_TABLE)?;
        write_txn.delete_table(IDF_TABLE)?;
        if full {
            write_txn.delete_table(TERMS_TABLE)?;
        }
        {
            let mut terms = write_txn.open_table(TERMS_TABLE)?;
            if !full {
                for uri in changed.iter().chain(removed.iter()) {
                    let (start, end) = term_range(uri);
                    let mut stale = Vec::new();
                    for item in terms.range(start.as_str()..end.as_str())? {
                        let (key, _) = item?;
                        stale.push(key.value().to_string());
                    }
                    for key in stale {
                        terms.remove(key.as_str())?;
                    }
                }
            }

            let to_write: Box<dyn Iterator<Item = &TermVector>> = if full {
                Box::new(index.documents())
            } else {
                Box::new(changed.iter().filter_map(|uri| index.document(uri)))
            };
            for vector in to_write {
                for (term, tf) in &vector.frequencies {
                    terms.insert(term_key(&vector.uri, term).as_str(), *tf)?;
                }
            }

            let mut documents = write_txn.open_table(DOCUMENTS_TABLE)?;
            for vector in index.documents() {
                let Some(meta) = metas.get(&vector.uri) else {
                    continue;
                };
                let stored = StoredDocument {
                    ordinal: vector.ordinal,
                    term_count: vector.frequencies.len(),
                    raw_terms: vector.token_count,
                    magnitude: vector.magnitude,
                    language: meta.language.clone(),
                    size_bytes: meta.size_bytes,
                    modified_at: meta.modified_at,
                    content_hash: meta.content_hash.clone(),
                };
                let json = serde_json::to_string(&stored)?;
                documents.insert(vector.uri.as_str(), json.as_str())?;
            }

            let mut idf = write_txn.open_table(IDF_TABLE)?;
            for (term, value) in index.idf_table() {
                idf.insert(term.as_str(), *value)?;
            }
        }
        write_txn.commit()?;
        tracing::debug!(documents = index.len(), full, "tf-idf index persisted");
        Ok(())
    }

    /// Rebuild the index from disk. `Ok(None)` when nothing was stored.
    ///
    /// Undecodable rows yield `Ok(None)` as well; the caller then does a
    /// full build.
    pub fn load(
        &self,
        tokenizer: Arc<dyn TermExtractor>,
        config: &TfidfConfig,
    ) -> Result<Option<LoadedIndex>> {
        let read_txn = self.db.begin_read()?;
        let documents = read_txn.open_table(DOCUMENTS_TABLE)?;
        let terms = read_txn.open_table(TERMS_TABLE)?;
        let idf_table = read_txn.open_table(IDF_TABLE)?;

        let mut stored = BTreeMap::new();
        for item in documents.iter()? {
            let (key, value) = item?;
            match serde_json::from_str::<StoredDocument>(value.value()) {
                Ok(doc) => {
                    stored.insert(key.value().to_string(), doc);
                }
                Err(e) => {
                    tracing::warn!(uri = key.value(), error = %e, "stored tf-idf document unreadable");
                    return Ok(None);
                }
            }
        }
        if stored.is_empty() {
            return Ok(None);
        }

        let mut vectors = Vec::with_capacity(stored.len());
        let mut metas = HashMap::with_capacity(stored.len());
        for (uri, doc) in stored {
            let (start, end) = term_range(&uri);
            let mut frequencies = BTreeMap::new();
            for item in terms.range(start.as_str()..end.as_str())? {
                let (key, tf) = item?;
                if let Some((_, term)) = key.value().split_once(KEY_SEPARATOR) {
                    frequencies.insert(term.to_string(), tf.value());
                }
            }
            vectors.push(TermVector {
                uri: uri.clone(),
                ordinal: doc.ordinal,
                frequencies,
                token_count: doc.raw_terms,
                magnitude: doc.magnitude,
            });
            metas.insert(
                uri.clone(),
                DocumentMeta {
                    uri,
                    language: doc.language,
                    size_bytes: doc.size_bytes,
                    modified_at: doc.modified_at,
                    content_hash: doc.content_hash,
                },
            );
        }

        let mut idf = HashMap::new();
        for item in idf_table.iter()? {
            let (term, value) = item?;
            idf.insert(term.value().to_string(), value.value());
        }

        let index = TfidfIndex::from_parts(tokenizer, config, vectors, Some(idf));
        Ok(Some((index, metas)))
    }

    /// Drop everything stored.
    pub fn clear(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(DOCUMENTS_TABLE)?;
        write_txn.delete_table(TERMS_TABLE)?;
        write_txn.delete_table(IDF_TABLE)?;
        {
            let _docs = write_txn.open_table(DOCUMENTS_TABLE)?;
            let _terms = write_txn.open_table(TERMS_TABLE)?;
            let _idf = write_txn.open_table(IDF_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::document::Document;
    use crate::indexing::tokenizer::Tokenizer;
    use crate::search::tfidf::TextQuery;
    use crate::storage::db::open_database;
    use tempfile::TempDir;

    fn doc(uri: &str, content: &str) -> Document {
        Document {
            uri: uri.to_string(),
            content: content.to_string(),
            language: "rust".to_string(),
            size_bytes: content.len() as u64,
            modified_at: 7,
            content_hash: format!("hash-{}", uri),
        }
    }

    fn metas(docs: &[Document]) -> HashMap<String, DocumentMeta> {
        docs.iter().map(|d| (d.uri.clone(), d.meta())).collect()
    }

    fn tokenizer() -> Arc<dyn TermExtractor> {
        Arc::new(Tokenizer::default())
    }

    fn store(dir: &TempDir) -> IndexStore {
        let (db, _) = open_database(&dir.path().join("index.redb")).unwrap();
        IndexStore::open(Arc::new(db)).unwrap()
    }

    #[test]
    fn test_empty_store_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        assert!(store.load(tokenizer(), &TfidfConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_full_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let docs = vec![
            doc("a.rs", "fn load_config() -> Config"),
            doc("b.rs", "struct Watcher { debounce: Duration }"),
        ];
        let index = TfidfIndex::build(tokenizer(), &TfidfConfig::default(), &docs);
        {
            let store = store(&temp_dir);
            store.save(&index, &metas(&docs), &[], &[], true).unwrap();
        }

        let store = store(&temp_dir);
        let (loaded, loaded_metas) = store.load(tokenizer(), &TfidfConfig::default()).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.idf_table(), index.idf_table());
        assert_eq!(loaded_metas["b.rs"].content_hash, "hash-b.rs");
        let query = TextQuery::default();
        assert_eq!(loaded.query("debounce", query), index.query("debounce", query));
    }

    #[test]
    fn test_incremental_save_replaces_terms() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let docs = vec![doc("a.rs", "alpha beta"), doc("b.rs", "gamma delta")];
        let mut index = TfidfIndex::build(tokenizer(), &TfidfConfig::default(), &docs);
        let mut all_metas = metas(&docs);
        store.save(&index, &all_metas, &[], &[], true).unwrap();

        let updated = doc("a.rs", "epsilon zeta");
        index.upsert_document(&updated);
        index.remove_document("b.rs");
        index.commit();
        all_metas.insert(updated.uri.clone(), updated.meta());
        all_metas.remove("b.rs");
        store
            .save(&index, &all_metas, &["a.rs".to_string()], &["b.rs".to_string()], false)
            .unwrap();

        let (loaded, loaded_metas) = store.load(tokenizer(), &TfidfConfig::default()).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded_metas.contains_key("b.rs"));
        let terms = loaded.terms_of("a.rs").unwrap();
        assert!(terms.contains("epsilon"));
        assert!(!terms.contains("alpha"));
    }
}
