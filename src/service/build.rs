//! The per-domain build pipeline: scan, diff against the cache, tokenize,
//! embed, persist, publish.

use super::engine::{read, write, DomainIndex, ServiceInner};
use super::state::{IndexState, IndexingStats, Snapshot};
use crate::core::config::Config;
use crate::core::domain::Domain;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{ScanRules, ScannedFile};
use crate::indexing::document::{content_hash, Document, DocumentMeta};
use crate::indexing::tokenizer::TermExtractor;
use crate::search::embedding::{embed_in_batches, EmbeddingProvider};
use crate::search::tfidf::TfidfIndex;
use crate::storage::cache::{now_millis, CacheLoad, CacheManager, LAST_FULL_BUILD_KEY, MODEL_ID_KEY};
use crate::storage::db::{open_database, DATABASE_FILE_NAME};
use crate::storage::index_store::IndexStore;
use crate::storage::vectors::{VectorStore, VECTORS_FILE_NAME};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Files read concurrently during a build
const READ_CONCURRENCY: usize = 16;

/// Mutable per-domain state owned by whoever holds the build lock.
pub(crate) struct DomainWriter {
    cache: CacheManager,
    store: IndexStore,
    vectors: Option<VectorStore>,
    /// Starting point of the next incremental build
    base: Option<Arc<Snapshot>>,
    /// Load-time problems, reported with the next build
    pending_warnings: Vec<String>,
    /// Persisted state was unusable; the next build must be full
    force_next: bool,
}

impl DomainWriter {
    /// Open the domain's database and vector snapshot and reconcile them.
    pub fn open(
        config: &Config,
        domain: Domain,
        root: &Path,
        tokenizer: &Arc<dyn TermExtractor>,
        embedder: Option<&Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let dir = config.domain_dir(domain);
        let (db, recovered) = open_database(&dir.join(DATABASE_FILE_NAME))?;
        let db = Arc::new(db);
        let mut warnings = Vec::new();
        let mut force_next = false;
        if let Some(reason) = recovered {
            warnings.push(Error::CacheCorruption(reason).to_string());
            force_next = true;
        }

        let mut cache = CacheManager::open(Arc::clone(&db))?;
        let store = IndexStore::open(db)?;
        match cache.load()? {
            CacheLoad::Loaded(count) => {
                tracing::debug!(domain = %domain, entries = count, "cache loaded");
            }
            CacheLoad::Recovered(reason) => {
                warnings.push(Error::CacheCorruption(reason).to_string());
                force_next = true;
            }
        }

        let mut base = None;
        if !force_next && !cache.is_empty() {
            match store.load(Arc::clone(tokenizer), &config.tfidf)? {
                Some((mut index, documents)) => {
                    reconcile(&mut cache, &mut index, &documents);
                    base = Some((index, documents));
                }
                None => {
                    store.clear()?;
                    warnings.push(format!(
                        "{} index tables are missing or unreadable; rebuilding from scratch",
                        domain
                    ));
                    force_next = true;
                }
            }
        }

        let mut vectors = None;
        if let Some(provider) = embedder {
            let (mut store, warning) = VectorStore::load(dir.join(VECTORS_FILE_NAME), provider.dimensions())?;
            if let Some(warning) = warning {
                warnings.push(warning);
            }
            if cache.metadata(MODEL_ID_KEY).is_some_and(|id| id != provider.model_id()) {
                warnings.push(format!(
                    "embedding model changed to {}; re-embedding every document",
                    provider.model_id()
                ));
                store.clear();
            }
            vectors = Some(store);
        }

        let base = base.map(|(index, documents)| {
            let indexed_at = cache
                .metadata(LAST_FULL_BUILD_KEY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            Arc::new(Snapshot {
                root: root.to_path_buf(),
                index,
                vectors: vectors.clone(),
                documents,
                indexed_at,
            })
        });

        Ok(Self {
            cache,
            store,
            vectors,
            base,
            pending_warnings: warnings,
            force_next,
        })
    }
}

/// Drop cache entries without an indexed document and vice versa, so the
/// next build re-reads anything that was only half persisted.
fn reconcile(cache: &mut CacheManager, index: &mut TfidfIndex, documents: &HashMap<String, DocumentMeta>) {
    let orphaned: Vec<String> = cache
        .paths()
        .filter(|p| !index.contains(p) || !documents.contains_key(*p))
        .map(str::to_string)
        .collect();
    for path in &orphaned {
        cache.remove(path);
    }
    let untracked: Vec<String> = index
        .uris()
        .filter(|u| !cache.contains(u))
        .map(str::to_string)
        .collect();
    for uri in &untracked {
        index.remove_document(uri);
    }
    index.commit();
    if !orphaned.is_empty() || !untracked.is_empty() {
        tracing::warn!(
            orphaned = orphaned.len(),
            untracked = untracked.len(),
            "cache and index disagreed; affected files will be re-indexed"
        );
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(format!("background task failed: {}", e)))
}

/// One build of `index`'s domain. The caller holds the domain's build lock.
///
/// A failed scan marks the domain `Failed`. Any later failure keeps the
/// previous snapshot serving when there is one.
pub(crate) async fn run_build(
    inner: &ServiceInner,
    index: &DomainIndex,
    writer: &mut DomainWriter,
    force: bool,
) -> Result<IndexingStats> {
    let result = build_domain(inner, index, writer, force).await;
    if let Err(e) = &result {
        let reason = e.to_string();
        tracing::error!(domain = %index.domain, error = %reason, "build failed");
        let serving = read(&index.snapshot).is_some();
        if serving && !matches!(e, Error::Scan { .. }) {
            index.set_state(IndexState::Ready);
        } else {
            index.set_state(IndexState::Failed(reason));
        }
    }
    result
}

async fn build_domain(
    inner: &ServiceInner,
    index: &DomainIndex,
    writer: &mut DomainWriter,
    force: bool,
) -> Result<IndexingStats> {
    let started = Instant::now();
    let domain = index.domain;
    let config = &inner.config;
    let mut stats = IndexingStats::new(domain);
    stats.warnings.append(&mut writer.pending_warnings);
    let base = writer.base.clone().filter(|_| !force && !writer.force_next);
    let full = base.is_none();
    stats.full_rebuild = full;
    tracing::info!(domain = %domain, full, "build started");

    // Scan
    index.set_state(IndexState::Scanning);
    let scanned = scan(inner, index).await?;
    stats.files_scanned = scanned.len();

    // Diff against the cache and read what changed
    index.set_state(IndexState::BuildingText);
    if full {
        writer.cache.clear(None);
    }
    let mut documents: HashMap<String, DocumentMeta> =
        base.as_ref().map(|b| b.documents.clone()).unwrap_or_default();
    let base_index = base.as_ref().map(|b| b.index.clone());

    let present: HashSet<&str> = scanned.iter().map(|f| f.relative_path.as_str()).collect();
    let mut removed: Vec<String> = documents
        .keys()
        .filter(|uri| !present.contains(uri.as_str()))
        .cloned()
        .collect();
    removed.sort();

    let in_index = |uri: &str| base_index.as_ref().is_some_and(|i| i.contains(uri));
    let mut to_read = Vec::new();
    for file in &scanned {
        if !full && in_index(&file.relative_path) && !writer.cache.needs_reindex(&file.relative_path, file.modified_at) {
            stats.files_unchanged += 1;
        } else {
            to_read.push(file.clone());
        }
    }

    let verify_hash = config.cache.verify_content_hash;
    let mut changed_docs = Vec::new();
    for (file, read) in read_files(to_read, config.timeouts.file_read()).await {
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(domain = %domain, path = %file.relative_path, error = %e, "skipping unreadable file");
                stats.files_skipped += 1;
                stats.warn(format!("{}: {}", file.relative_path, e));
                continue;
            }
        };
        let hash = content_hash(&bytes);
        let was_indexed = in_index(&file.relative_path);

        let hash_unchanged = writer
            .cache
            .entry(&file.relative_path)
            .is_some_and(|entry| entry.content_hash == hash);
        if !full && verify_hash && was_indexed && hash_unchanged {
            writer.cache.refresh(&file.relative_path, file.modified_at);
            if let Some(meta) = documents.get_mut(&file.relative_path) {
                meta.modified_at = file.modified_at;
            }
            stats.files_refreshed += 1;
            continue;
        }

        match Document::from_bytes(&file, &bytes, hash) {
            Ok(doc) => changed_docs.push(doc),
            Err(e) => {
                tracing::warn!(domain = %domain, path = %file.relative_path, error = %e, "skipping file");
                stats.files_skipped += 1;
                stats.warn(e.to_string());
                if was_indexed {
                    removed.push(file.relative_path.clone());
                }
            }
        }
    }

    // Tokenize
    let tokenizer = Arc::clone(&inner.tokenizer);
    let (read_docs, tokenized) = tokio::task::spawn_blocking(move || {
        let tokenized = tokenize_documents(&tokenizer, &changed_docs);
        (changed_docs, tokenized)
    })
    .await
    .map_err(join_error)?;

    let mut changed_docs = Vec::with_capacity(read_docs.len());
    let mut changed_terms = Vec::with_capacity(read_docs.len());
    for (doc, terms) in read_docs.into_iter().zip(tokenized) {
        match terms {
            Ok(terms) => {
                changed_terms.push((doc.uri.clone(), terms));
                changed_docs.push(doc);
            }
            Err(reason) => {
                let e = Error::Tokenize {
                    path: doc.uri.clone(),
                    reason,
                };
                tracing::warn!(domain = %domain, path = %doc.uri, error = %e, "skipping file");
                stats.files_skipped += 1;
                stats.warn(e.to_string());
                if in_index(&doc.uri) {
                    removed.push(doc.uri);
                }
            }
        }
    }

    let tfidf_config = config.tfidf.clone();
    let tokenizer = Arc::clone(&inner.tokenizer);
    let removed_for_index = removed.clone();
    let text_index = tokio::task::spawn_blocking(move || match base_index {
        Some(mut index) => {
            for uri in &removed_for_index {
                index.remove_document(uri);
            }
            for (uri, terms) in changed_terms {
                index.upsert_terms(&uri, terms);
            }
            index.commit();
            index
        }
        None => TfidfIndex::from_tokenized(tokenizer, &tfidf_config, changed_terms),
    })
    .await
    .map_err(join_error)?;

    for uri in &removed {
        writer.cache.remove(uri);
        documents.remove(uri);
    }
    for doc in &changed_docs {
        writer.cache.record_indexed(&doc.uri, doc.modified_at, &doc.content_hash);
        documents.insert(doc.uri.clone(), doc.meta());
    }
    stats.files_removed = removed.len();
    stats.files_indexed = changed_docs.len();
    let changed_uris: Vec<String> = changed_docs.iter().map(|d| d.uri.clone()).collect();

    // Embed
    if let Some(provider) = &inner.embedder {
        index.set_state(IndexState::BuildingVectors);
        let mut vectors = writer.vectors.take().unwrap_or_else(|| {
            VectorStore::new(config.domain_dir(domain).join(VECTORS_FILE_NAME), provider.dimensions())
        });
        if full {
            vectors.clear();
        }
        for uri in &removed {
            vectors.remove_document(uri);
        }
        embed_documents(inner, index, provider, &mut vectors, changed_docs, &documents, &mut stats).await;
        writer.cache.set_metadata(MODEL_ID_KEY, provider.model_id());
        writer.vectors = Some(vectors);
    }

    // Persist
    let indexed_at = now_millis();
    if full {
        writer.cache.set_metadata(LAST_FULL_BUILD_KEY, indexed_at.to_string());
    }
    if let Err(e) = writer.store.save(&text_index, &documents, &changed_uris, &removed, full) {
        tracing::error!(domain = %domain, error = %e, "failed to persist tf-idf index");
        stats.warn(format!("index not persisted: {}", e));
    }
    if let Err(e) = writer.cache.persist() {
        tracing::error!(domain = %domain, error = %e, "failed to persist cache");
        stats.warn(format!("cache not persisted: {}", e));
    }
    if let Some(vectors) = writer.vectors.as_mut() {
        if let Err(e) = vectors.save() {
            tracing::error!(domain = %domain, error = %e, "failed to persist vectors");
            stats.warn(format!("vectors not persisted: {}", e));
        }
    }

    // Publish
    let snapshot = Arc::new(Snapshot {
        root: index.root.clone(),
        index: text_index,
        vectors: writer.vectors.clone(),
        documents,
        indexed_at,
    });
    writer.base = Some(Arc::clone(&snapshot));
    writer.force_next = false;
    *write(&index.snapshot) = Some(snapshot);
    index.set_state(IndexState::Ready);

    stats.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        domain = %domain,
        full,
        scanned = stats.files_scanned,
        indexed = stats.files_indexed,
        refreshed = stats.files_refreshed,
        removed = stats.files_removed,
        skipped = stats.files_skipped,
        embeddings = stats.embeddings_generated,
        warnings = stats.warnings.len(),
        duration_ms = stats.duration_ms,
        "build finished"
    );
    Ok(stats)
}

/// Extract terms for every document in parallel. A document the extractor
/// panics on yields the panic message instead of terms.
fn tokenize_documents(
    tokenizer: &Arc<dyn TermExtractor>,
    documents: &[Document],
) -> Vec<std::result::Result<Vec<String>, String>> {
    documents
        .par_iter()
        .map(|doc| {
            std::panic::catch_unwind(AssertUnwindSafe(|| tokenizer.tokenize(&doc.content)))
                .map_err(|payload| panic_message(payload.as_ref()))
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "term extraction panicked".to_string())
}

async fn scan(inner: &ServiceInner, index: &DomainIndex) -> Result<Vec<ScannedFile>> {
    let domain = index.domain;
    let rules = ScanRules::for_domain(domain, &index.root, &index.settings)?;
    let scanner = Arc::clone(&inner.scanner);
    let root = index.root.clone();
    let timeout = inner.config.timeouts.scan();

    let task = tokio::task::spawn_blocking(move || scanner.scan(&root, &rules));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(join_error)?,
        Err(_) => Err(Error::Scan {
            domain,
            reason: format!("scan timed out after {} ms", timeout.as_millis()),
        }),
    }
}

/// Read files concurrently, each under `timeout`; results in input order.
async fn read_files(
    files: Vec<ScannedFile>,
    timeout: std::time::Duration,
) -> Vec<(ScannedFile, Result<Vec<u8>>)> {
    let semaphore = Arc::new(Semaphore::new(READ_CONCURRENCY));
    let mut tasks = JoinSet::new();
    for (position, file) in files.iter().enumerate() {
        let path = file.path.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (position, read_file(&path, timeout).await)
        });
    }

    let mut slots: Vec<Option<Result<Vec<u8>>>> = files.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, result)) => slots[position] = Some(result),
            Err(e) => tracing::error!(error = %e, "file read task failed"),
        }
    }

    files
        .into_iter()
        .zip(slots)
        .map(|(file, slot)| {
            let result = slot.unwrap_or_else(|| Err(Error::Io(std::io::Error::other("read task failed"))));
            (file, result)
        })
        .collect()
}

async fn read_file(path: &Path, timeout: std::time::Duration) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, tokio::fs::read(path)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout {
            operation: format!("reading {}", path.display()),
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Embed `changed` plus every indexed document that has no usable vector.
async fn embed_documents(
    inner: &ServiceInner,
    index: &DomainIndex,
    provider: &Arc<dyn EmbeddingProvider>,
    vectors: &mut VectorStore,
    changed: Vec<Document>,
    documents: &HashMap<String, DocumentMeta>,
    stats: &mut IndexingStats,
) {
    let domain = index.domain;
    let config = &inner.config;
    let changed_uris: HashSet<String> = changed.iter().map(|d| d.uri.clone()).collect();

    let mut missing: Vec<ScannedFile> = documents
        .values()
        .filter(|meta| !changed_uris.contains(&meta.uri))
        .filter(|meta| vectors.get(&meta.uri).map_or(true, |r| r.embedding.iter().all(|x| *x == 0.0)))
        .map(|meta| ScannedFile {
            path: index.root.join(&meta.uri),
            relative_path: meta.uri.clone(),
            modified_at: meta.modified_at,
            size_bytes: meta.size_bytes,
        })
        .collect();
    missing.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut to_embed = changed;
    if !missing.is_empty() {
        tracing::debug!(domain = %domain, count = missing.len(), "embedding documents without vectors");
        for (file, read) in read_files(missing, config.timeouts.file_read()).await {
            let loaded = read.and_then(|bytes| {
                let hash = content_hash(&bytes);
                Document::from_bytes(&file, &bytes, hash)
            });
            match loaded {
                Ok(doc) => to_embed.push(doc),
                Err(e) => stats.warn(format!("{}: not embedded: {}", file.relative_path, e)),
            }
        }
    }
    if to_embed.is_empty() {
        return;
    }

    let texts: Vec<String> = to_embed.iter().map(|d| d.content.clone()).collect();
    let outcome = embed_in_batches(
        Arc::clone(provider),
        &texts,
        &config.embedding,
        config.timeouts.embedding_batch(),
    )
    .await;

    let failed: HashSet<usize> = outcome
        .failures
        .iter()
        .flat_map(|f| f.range.clone())
        .collect();
    for failure in &outcome.failures {
        stats.failed_batches += 1;
        stats.warn(failure.to_error().to_string());
    }

    for (position, (doc, embedding)) in to_embed.iter().zip(outcome.embeddings).enumerate() {
        let metadata = BTreeMap::from([
            ("language".to_string(), doc.language.clone()),
            ("content_hash".to_string(), doc.content_hash.clone()),
        ]);
        match vectors.add_document(&doc.uri, embedding, metadata) {
            Ok(()) if !failed.contains(&position) => stats.embeddings_generated += 1,
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(domain = %domain, path = %doc.uri, error = %e, "vector rejected");
                stats.rejected_vectors += 1;
                stats.warn(format!("{}: {}", doc.uri, e));
            }
        }
    }
}
