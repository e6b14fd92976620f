//! TF-IDF index over whole documents.
//!
//! Each document keeps raw term frequencies; weights are `tf × idf` with
//! `idf(t) = ln(N / df(t))`, floored at [`MIN_IDF`]. Scores are the cosine
//! between the query's and the document's weight vectors.
//!
//! Single-document upserts and removals keep document frequencies exact
//! but defer the O(N) IDF and magnitude recomputation until the next
//! [`TfidfIndex::search`] or until the configured number of mutations is
//! pending. [`TfidfIndex::commit`] forces it.

use crate::core::config::TfidfConfig;
use crate::indexing::document::Document;
use crate::indexing::tokenizer::TermExtractor;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Lower bound for IDF so terms present in every document keep some weight.
pub const MIN_IDF: f64 = 0.01;

/// Per-document term frequencies plus the norm of its tf-idf weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TermVector {
    pub uri: String,
    /// Position in scan/insertion order; breaks score ties
    pub ordinal: u64,
    pub frequencies: BTreeMap<String, u32>,
    /// Number of terms the tokenizer emitted, duplicates included
    pub token_count: usize,
    pub magnitude: f64,
}

impl TermVector {
    fn from_terms(uri: String, ordinal: u64, terms: Vec<String>) -> Self {
        let token_count = terms.len();
        let mut frequencies = BTreeMap::new();
        for term in terms {
            *frequencies.entry(term).or_insert(0u32) += 1;
        }
        Self {
            uri,
            ordinal,
            frequencies,
            token_count,
            magnitude: 0.0,
        }
    }

    pub fn contains(&self, term: &str) -> bool {
        self.frequencies.contains_key(term)
    }
}

/// A ranked TF-IDF hit.
#[derive(Debug, Clone, PartialEq)]
pub struct TextHit {
    pub uri: String,
    pub ordinal: u64,
    pub score: f32,
    /// Query terms also present in the document, in query order
    pub matched_terms: Vec<String>,
}

/// Limits for a TF-IDF query.
#[derive(Debug, Clone, Copy)]
pub struct TextQuery {
    pub limit: usize,
    pub min_score: f32,
}

impl Default for TextQuery {
    fn default() -> Self {
        Self {
            limit: 5,
            min_score: 0.001,
        }
    }
}

#[derive(Clone)]
pub struct TfidfIndex {
    tokenizer: Arc<dyn TermExtractor>,
    recompute_threshold: usize,
    documents: BTreeMap<u64, TermVector>,
    ordinals: HashMap<String, u64>,
    doc_freq: HashMap<String, usize>,
    idf: HashMap<String, f64>,
    next_ordinal: u64,
    pending_mutations: usize,
    dirty: bool,
}

impl std::fmt::Debug for TfidfIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfidfIndex")
            .field("documents", &self.documents.len())
            .field("terms", &self.doc_freq.len())
            .field("pending_mutations", &self.pending_mutations)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl TfidfIndex {
    pub fn new(tokenizer: Arc<dyn TermExtractor>, config: &TfidfConfig) -> Self {
        Self {
            tokenizer,
            recompute_threshold: config.idf_recompute_threshold.max(1),
            documents: BTreeMap::new(),
            ordinals: HashMap::new(),
            doc_freq: HashMap::new(),
            idf: HashMap::new(),
            next_ordinal: 0,
            pending_mutations: 0,
            dirty: false,
        }
    }

    /// Build a finalized index over `documents`, tokenizing them in parallel.
    ///
    /// Ordinals follow the order of the input slice.
    pub fn build(tokenizer: Arc<dyn TermExtractor>, config: &TfidfConfig, documents: &[Document]) -> Self {
        let extractor = Arc::clone(&tokenizer);
        let tokenized: Vec<(String, Vec<String>)> = documents
            .par_iter()
            .map(|doc| (doc.uri.clone(), extractor.tokenize(&doc.content)))
            .collect();
        Self::from_tokenized(tokenizer, config, tokenized)
    }

    /// Build a finalized index from documents that were already tokenized
    /// with `tokenizer`.
    pub fn from_tokenized(
        tokenizer: Arc<dyn TermExtractor>,
        config: &TfidfConfig,
        tokenized: Vec<(String, Vec<String>)>,
    ) -> Self {
        let mut index = Self::new(tokenizer, config);
        for (uri, terms) in tokenized {
            index.insert_terms(&uri, terms);
        }
        index.recompute();
        index
    }

    /// Reassemble an index from persisted term vectors.
    ///
    /// With `idf` present the stored weights and magnitudes are trusted;
    /// otherwise everything is recomputed.
    pub fn from_parts(
        tokenizer: Arc<dyn TermExtractor>,
        config: &TfidfConfig,
        vectors: Vec<TermVector>,
        idf: Option<HashMap<String, f64>>,
    ) -> Self {
        let mut index = Self::new(tokenizer, config);
        for vector in vectors {
            for term in vector.frequencies.keys() {
                *index.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            index.next_ordinal = index.next_ordinal.max(vector.ordinal + 1);
            index.ordinals.insert(vector.uri.clone(), vector.ordinal);
            index.documents.insert(vector.ordinal, vector);
        }

        let consistent = idf
            .as_ref()
            .is_some_and(|idf| idf.len() == index.doc_freq.len() && index.doc_freq.keys().all(|t| idf.contains_key(t)));
        match idf {
            Some(idf) if consistent => index.idf = idf,
            _ => index.recompute(),
        }
        index
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.ordinals.contains_key(uri)
    }

    /// True while IDF or magnitudes lag behind the latest mutation.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_mutations(&self) -> usize {
        self.pending_mutations
    }

    pub fn tokenizer(&self) -> &Arc<dyn TermExtractor> {
        &self.tokenizer
    }

    pub fn document(&self, uri: &str) -> Option<&TermVector> {
        self.ordinals.get(uri).and_then(|o| self.documents.get(o))
    }

    /// Term vectors in ordinal order
    pub fn documents(&self) -> impl Iterator<Item = &TermVector> {
        self.documents.values()
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.documents.values().map(|d| d.uri.as_str())
    }

    pub fn ordinal(&self, uri: &str) -> Option<u64> {
        self.ordinals.get(uri).copied()
    }

    pub fn idf(&self, term: &str) -> Option<f64> {
        self.idf.get(term).copied()
    }

    pub fn idf_table(&self) -> &HashMap<String, f64> {
        &self.idf
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }

    pub fn terms_of(&self, uri: &str) -> Option<BTreeSet<&str>> {
        self.document(uri)
            .map(|d| d.frequencies.keys().map(String::as_str).collect())
    }

    /// Insert or replace one document. Returns `true` when it was new.
    pub fn upsert_document(&mut self, document: &Document) -> bool {
        let terms = self.tokenizer.tokenize(&document.content);
        self.upsert_terms(&document.uri, terms)
    }

    /// Like `upsert_document` with terms the caller already extracted.
    pub fn upsert_terms(&mut self, uri: &str, terms: Vec<String>) -> bool {
        let existed = self.remove_terms(uri).is_some();
        self.insert_terms(uri, terms);
        self.mark_mutated();
        !existed
    }

    /// Remove one document. Returns `false` when it was not indexed.
    pub fn remove_document(&mut self, uri: &str) -> bool {
        let removed = self.remove_terms(uri).is_some();
        if removed {
            self.ordinals.remove(uri);
            self.mark_mutated();
        }
        removed
    }

    /// Recompute IDF and magnitudes now if any mutation is pending.
    pub fn commit(&mut self) {
        if self.dirty {
            self.recompute();
        }
    }

    /// Query with lazy recomputation of stale weights.
    pub fn search(&mut self, query: &str, options: TextQuery) -> Vec<TextHit> {
        self.commit();
        self.query(query, options)
    }

    /// Query against the weights as of the last recomputation.
    ///
    /// Published snapshots are committed, so this never observes a dirty
    /// index there.
    pub fn query(&self, query: &str, options: TextQuery) -> Vec<TextHit> {
        if options.limit == 0 || self.documents.is_empty() {
            return Vec::new();
        }

        let terms = self.tokenizer.tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut query_tf: BTreeMap<&str, u32> = BTreeMap::new();
        let mut query_order: Vec<&str> = Vec::new();
        for term in &terms {
            let count = query_tf.entry(term.as_str()).or_insert(0);
            if *count == 0 {
                query_order.push(term.as_str());
            }
            *count += 1;
        }

        let query_weights: BTreeMap<&str, f64> = query_tf
            .iter()
            .filter_map(|(term, tf)| self.idf.get(*term).map(|idf| (*term, *tf as f64 * idf)))
            .collect();
        let query_magnitude = query_weights.values().map(|w| w * w).sum::<f64>().sqrt();
        if query_magnitude == 0.0 {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for doc in self.documents.values() {
            if doc.magnitude == 0.0 {
                continue;
            }
            let mut dot = 0.0;
            for (term, q_weight) in &query_weights {
                if let Some(tf) = doc.frequencies.get(*term) {
                    let idf = self.idf.get(*term).copied().unwrap_or(0.0);
                    dot += q_weight * (*tf as f64 * idf);
                }
            }
            let denominator = query_magnitude * doc.magnitude;
            let score = if denominator > 0.0 { dot / denominator } else { 0.0 } as f32;
            if score <= 0.0 || score < options.min_score {
                continue;
            }
            let matched_terms = query_order
                .iter()
                .filter(|t| doc.contains(t))
                .map(|t| t.to_string())
                .collect();
            hits.push(TextHit {
                uri: doc.uri.clone(),
                ordinal: doc.ordinal,
                score,
                matched_terms,
            });
        }

        // documents are visited in ordinal order, so a stable sort keeps ties in scan order
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(options.limit);
        hits
    }

    fn insert_terms(&mut self, uri: &str, terms: Vec<String>) {
        let ordinal = match self.ordinals.get(uri) {
            Some(&ordinal) => ordinal,
            None => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.ordinals.insert(uri.to_string(), ordinal);
                ordinal
            }
        };
        let vector = TermVector::from_terms(uri.to_string(), ordinal, terms);
        for term in vector.frequencies.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.documents.insert(ordinal, vector);
    }

    /// Detach a document's terms, keeping its ordinal reserved.
    fn remove_terms(&mut self, uri: &str) -> Option<TermVector> {
        let ordinal = *self.ordinals.get(uri)?;
        let vector = self.documents.remove(&ordinal)?;
        for term in vector.frequencies.keys() {
            if let Some(df) = self.doc_freq.get_mut(term) {
                *df -= 1;
                if *df == 0 {
                    self.doc_freq.remove(term);
                    self.idf.remove(term);
                }
            }
        }
        Some(vector)
    }

    fn mark_mutated(&mut self) {
        self.dirty = true;
        self.pending_mutations += 1;
        if self.pending_mutations >= self.recompute_threshold {
            tracing::debug!(pending = self.pending_mutations, "recomputing idf after batched mutations");
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let total = self.documents.len() as f64;
        self.idf = self
            .doc_freq
            .iter()
            .map(|(term, df)| (term.clone(), idf_value(total, *df)))
            .collect();

        let idf = &self.idf;
        for doc in self.documents.values_mut() {
            doc.magnitude = doc
                .frequencies
                .iter()
                .map(|(term, tf)| {
                    let weight = *tf as f64 * idf.get(term).copied().unwrap_or(0.0);
                    weight * weight
                })
                .sum::<f64>()
                .sqrt();
        }

        self.pending_mutations = 0;
        self.dirty = false;
    }
}

/// `ln(N / df)`, floored at [`MIN_IDF`]
pub fn idf_value(total_documents: f64, document_frequency: usize) -> f64 {
    if document_frequency == 0 || total_documents <= 0.0 {
        return MIN_IDF;
    }
    (total_documents / document_frequency as f64).ln().max(MIN_IDF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::tokenizer::Tokenizer;

    fn doc(uri: &str, content: &str) -> Document {
        Document {
            uri: uri.to_string(),
            content: content.to_string(),
            language: "text".to_string(),
            size_bytes: content.len() as u64,
            modified_at: 0,
            content_hash: String::new(),
        }
    }

    fn tokenizer() -> Arc<dyn TermExtractor> {
        Arc::new(Tokenizer::default())
    }

    fn build(docs: &[Document]) -> TfidfIndex {
        TfidfIndex::build(tokenizer(), &TfidfConfig::default(), docs)
    }

    fn all() -> TextQuery {
        TextQuery {
            limit: 100,
            min_score: 0.0,
        }
    }

    #[test]
    fn test_scenario_foo_bar() {
        let index = build(&[doc("a.js", "function foo(){}"), doc("b.js", "function bar(){}")]);
        let hits = index.query("foo", all());
        assert_eq!(hits[0].uri, "a.js");
        assert!(hits[0].score > 0.0);
        if let Some(second) = hits.iter().find(|h| h.uri == "b.js") {
            assert!(second.score < hits[0].score);
        }
        assert_eq!(hits[0].matched_terms, vec!["foo"]);
    }

    #[test]
    fn test_idf_formula_and_floor() {
        let index = build(&[
            doc("1", "alpha common"),
            doc("2", "beta common"),
            doc("3", "gamma common"),
            doc("4", "alpha common"),
        ]);
        assert!((index.idf("alpha").unwrap() - (4.0f64 / 2.0).ln()).abs() < 1e-12);
        assert!((index.idf("beta").unwrap() - 4.0f64.ln()).abs() < 1e-12);
        assert_eq!(index.idf("common").unwrap(), MIN_IDF);
        assert!(index.idf("missing").is_none());
    }

    #[test]
    fn test_magnitude_matches_weights() {
        let index = build(&[doc("1", "alpha alpha beta"), doc("2", "gamma")]);
        let vector = index.document("1").unwrap();
        let expected = ((2.0 * 2f64.ln()).powi(2) + 2f64.ln().powi(2)).sqrt();
        assert!((vector.magnitude - expected).abs() < 1e-12);
        assert_eq!(vector.token_count, 3);
    }

    #[test]
    fn test_build_is_idempotent() {
        let docs = vec![
            doc("a.rs", "fn parse_config(path: &Path) -> Config"),
            doc("b.rs", "struct Config { path: PathBuf }"),
            doc("c.md", "configuration is loaded from a path"),
        ];
        let first = build(&docs);
        let second = build(&docs);
        assert_eq!(first.idf_table(), second.idf_table());
        for (a, b) in first.documents().zip(second.documents()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_incremental_matches_full_build() {
        let docs = vec![
            doc("a", "cache manager persists entries"),
            doc("b", "vector store cosine similarity"),
            doc("c", "cache invalidation by content hash"),
        ];
        let full = build(&docs);

        let mut incremental = TfidfIndex::new(tokenizer(), &TfidfConfig::default());
        for d in &docs {
            incremental.upsert_document(d);
        }
        assert!(incremental.is_dirty());
        incremental.commit();
        assert!(!incremental.is_dirty());

        assert_eq!(full.idf_table(), incremental.idf_table());
        for (a, b) in full.documents().zip(incremental.documents()) {
            assert!((a.magnitude - b.magnitude).abs() < 1e-12);
        }
    }

    #[test]
    fn test_lazy_recompute_on_search() {
        let mut index = build(&[doc("a", "alpha beta"), doc("b", "gamma delta")]);
        index.upsert_document(&doc("c", "epsilon alpha"));
        assert!(index.is_dirty());
        assert_eq!(index.pending_mutations(), 1);

        let hits = index.search("epsilon", all());
        assert!(!index.is_dirty());
        assert_eq!(hits[0].uri, "c");
    }

    #[test]
    fn test_batched_recompute_threshold() {
        let config = TfidfConfig {
            idf_recompute_threshold: 2,
        };
        let mut index = TfidfIndex::new(tokenizer(), &config);
        index.upsert_document(&doc("a", "alpha"));
        assert!(index.is_dirty());
        index.upsert_document(&doc("b", "beta"));
        assert!(!index.is_dirty());
        assert_eq!(index.pending_mutations(), 0);
    }

    #[test]
    fn test_remove_document_drops_terms() {
        let mut index = build(&[doc("a", "unique_term shared"), doc("b", "shared other")]);
        assert!(index.remove_document("a"));
        assert!(!index.remove_document("a"));
        index.commit();
        assert_eq!(index.document_frequency("unique_term"), 0);
        assert!(index.idf("unique_term").is_none());
        assert!(index.query("unique_term", all()).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_ordinal() {
        let mut index = build(&[doc("a", "alpha"), doc("b", "beta")]);
        let before = index.ordinal("a");
        assert!(!index.upsert_document(&doc("a", "alpha gamma")));
        assert_eq!(index.ordinal("a"), before);
        assert!(index.upsert_document(&doc("c", "delta")));
        assert_eq!(index.ordinal("c"), Some(2));
    }

    #[test]
    fn test_ties_broken_by_ordinal() {
        let index = build(&[
            doc("z-last.rs", "token filler"),
            doc("a-first.rs", "token filler"),
            doc("other.rs", "nothing here"),
        ]);
        let hits = index.query("token", all());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, hits[1].score);
        assert_eq!(hits[0].uri, "z-last.rs");
        assert_eq!(hits[1].uri, "a-first.rs");
    }

    #[test]
    fn test_scores_sorted_and_matched_terms_consistent() {
        let index = build(&[
            doc("1", "the cache manager decides staleness of cached files"),
            doc("2", "cosine similarity between vectors"),
            doc("3", "cache cache cache hits"),
            doc("4", "watcher debounce window"),
        ]);
        let query = "cache staleness vectors unknownword";
        let hits = index.query(query, all());
        assert!(!hits.is_empty());
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        let query_terms: BTreeSet<String> = Tokenizer::default().tokenize(query).into_iter().collect();
        for hit in &hits {
            let doc_terms = index.terms_of(&hit.uri).unwrap();
            for term in &hit.matched_terms {
                assert!(query_terms.contains(term));
                assert!(doc_terms.contains(term.as_str()));
            }
        }
    }

    #[test]
    fn test_min_score_and_limit() {
        let index = build(&[
            doc("1", "alpha"),
            doc("2", "alpha beta gamma delta epsilon zeta"),
            doc("3", "omega"),
        ]);
        let hits = index.query("alpha", TextQuery { limit: 1, min_score: 0.0 });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri, "1");

        let strict = index.query("alpha", TextQuery { limit: 10, min_score: 0.99 });
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].uri, "1");
    }

    #[test]
    fn test_unseen_and_empty_queries() {
        let index = build(&[doc("1", "alpha")]);
        assert!(index.query("nothing matches", all()).is_empty());
        assert!(index.query("   ", all()).is_empty());
    }

    #[test]
    fn test_from_parts_restores_weights() {
        let original = build(&[doc("a", "alpha beta"), doc("b", "beta gamma")]);
        let vectors: Vec<TermVector> = original.documents().cloned().collect();

        let restored = TfidfIndex::from_parts(
            tokenizer(),
            &TfidfConfig::default(),
            vectors.clone(),
            Some(original.idf_table().clone()),
        );
        assert_eq!(restored.idf_table(), original.idf_table());
        assert_eq!(restored.query("gamma", all()), original.query("gamma", all()));

        let recomputed = TfidfIndex::from_parts(tokenizer(), &TfidfConfig::default(), vectors, None);
        assert_eq!(recomputed.idf_table(), original.idf_table());
    }
}
