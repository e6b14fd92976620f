//! The unified search service: one index lifecycle per domain, hybrid
//! queries over the published snapshot, and watcher-driven rebuilds.

use super::build::{run_build, DomainWriter};
use super::state::{IndexState, IndexStatus, IndexingStats, Snapshot};
use crate::core::config::{absolute_root, Config, DomainConfig};
use crate::core::domain::Domain;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{build_exclusion_set, Scanner, ScanRules, WalkScanner};
use crate::indexing::tokenizer::{TermExtractor, Tokenizer};
use crate::indexing::watch::{ChangeSet, FileWatcher, IgnorePredicate};
use crate::search::embedding::{embed_query, EmbeddingProvider};
use crate::search::options::{MatchSource, SearchOptions, SearchResult};
use crate::search::snippet::build_snippet;
use crate::search::tfidf::TextQuery;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Vector candidates fetched per query, relative to the requested limit
const VECTOR_OVERFETCH: usize = 4;
const MIN_VECTOR_CANDIDATES: usize = 20;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the service tracks for one domain.
pub(crate) struct DomainIndex {
    pub domain: Domain,
    pub root: PathBuf,
    pub settings: DomainConfig,
    pub state: RwLock<IndexState>,
    /// Last completed build; readers clone the `Arc` and drop the lock
    pub snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Requested build not yet started; `true` when any requester forced it
    pub pending: Mutex<Option<bool>>,
    /// Single writer per domain
    pub writer: tokio::sync::Mutex<DomainWriter>,
    pub last_stats: Mutex<Option<IndexingStats>>,
    pub watcher: Mutex<Option<FileWatcher>>,
}

impl DomainIndex {
    pub fn set_state(&self, state: IndexState) {
        tracing::debug!(domain = %self.domain, state = %state, "index state");
        *write(&self.state) = state;
    }

    pub fn state(&self) -> IndexState {
        read(&self.state).clone()
    }

    fn request(&self, force: bool) {
        let mut pending = lock(&self.pending);
        *pending = Some(pending.unwrap_or(false) || force);
    }

    fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        read(&self.snapshot).clone()
    }
}

pub(crate) struct ServiceInner {
    pub config: Config,
    pub tokenizer: Arc<dyn TermExtractor>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub scanner: Arc<dyn Scanner>,
    pub domains: HashMap<Domain, DomainIndex>,
}

/// Hybrid TF-IDF and vector search over the configured domains.
///
/// Cheap to clone; clones share the same indexes.
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut domains: Vec<_> = self.inner.domains.keys().collect();
        domains.sort();
        f.debug_struct("SearchService")
            .field("domains", &domains)
            .field("embeddings", &self.inner.embedder.is_some())
            .finish()
    }
}

impl SearchService {
    /// Open the service with the bundled tokenizer and directory walker.
    pub fn with_defaults(config: Config, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        let tokenizer: Arc<dyn TermExtractor> = Arc::new(Tokenizer::new(&config.tokenizer));
        Self::open(config, tokenizer, embedder, Arc::new(WalkScanner))
    }

    /// Open every configured domain and load what was persisted for it.
    ///
    /// Loaded state only seeds the first build; domains are not queryable
    /// until [`SearchService::reindex`] has completed once.
    pub fn open(
        config: Config,
        tokenizer: Arc<dyn TermExtractor>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        scanner: Arc<dyn Scanner>,
    ) -> Result<Self> {
        config.validate()?;
        let mut domains = HashMap::new();
        for domain in Domain::ALL {
            let Some(settings) = config.domain(domain) else {
                continue;
            };
            let root = absolute_root(&settings.root)?;
            let writer = DomainWriter::open(&config, domain, &root, &tokenizer, embedder.as_ref())?;
            domains.insert(
                domain,
                DomainIndex {
                    domain,
                    root,
                    settings: settings.clone(),
                    state: RwLock::new(IndexState::Uninitialized),
                    snapshot: RwLock::new(None),
                    pending: Mutex::new(None),
                    writer: tokio::sync::Mutex::new(writer),
                    last_stats: Mutex::new(None),
                    watcher: Mutex::new(None),
                },
            );
        }

        tracing::info!(
            domains = domains.len(),
            embeddings = embedder.is_some(),
            "search service opened"
        );
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                tokenizer,
                embedder,
                scanner,
                domains,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Configured domains in declaration order
    pub fn domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|d| self.inner.domains.contains_key(d))
            .collect()
    }

    fn domain(&self, domain: Domain) -> Result<&DomainIndex> {
        self.inner
            .domains
            .get(&domain)
            .ok_or(Error::DomainNotConfigured(domain))
    }

    /// Build the domain now and wait for it.
    ///
    /// With `force` every file is re-read and re-tokenized; otherwise only
    /// files the cache reports as stale. Requests that arrive while a build
    /// runs are merged into a single follow-up build.
    pub async fn reindex(&self, domain: Domain, force: bool) -> Result<IndexingStats> {
        let index = self.domain(domain)?;
        index.request(force);
        match self.drain(domain).await? {
            Some(result) => result,
            // a concurrent drain picked up this request after it was made
            None => match index.state() {
                IndexState::Failed(reason) => Err(Error::IndexFailed { domain, reason }),
                _ => Ok(lock(&index.last_stats)
                    .clone()
                    .unwrap_or_else(|| IndexingStats::new(domain))),
            },
        }
    }

    /// Schedule a background incremental build, as a watcher trigger does.
    pub fn request_rebuild(&self, domain: Domain) -> Result<()> {
        let index = self.domain(domain)?;
        {
            let mut state = write(&index.state);
            if *state == IndexState::Ready {
                *state = IndexState::Stale;
            }
        }
        index.request(false);

        let service = self.clone();
        tokio::spawn(async move {
            match service.drain(domain).await {
                Ok(Some(Err(e))) => tracing::error!(domain = %domain, error = %e, "background rebuild failed"),
                Ok(Some(Ok(stats))) if stats.has_warnings() => {
                    tracing::warn!(domain = %domain, warnings = stats.warnings.len(), "background rebuild finished with warnings")
                }
                Err(e) => tracing::error!(domain = %domain, error = %e, "background rebuild could not start"),
                _ => {}
            }
        });
        Ok(())
    }

    /// Run pending builds until none is left. `None` when another caller
    /// already took every request.
    async fn drain(&self, domain: Domain) -> Result<Option<Result<IndexingStats>>> {
        let index = self.domain(domain)?;
        let mut writer = index.writer.lock().await;
        let mut last = None;
        loop {
            let Some(force) = lock(&index.pending).take() else {
                break;
            };
            let result = run_build(&self.inner, index, &mut writer, force).await;
            if let Ok(stats) = &result {
                *lock(&index.last_stats) = Some(stats.clone());
            }
            last = Some(result);
        }
        Ok(last)
    }

    pub fn status(&self, domain: Domain) -> Result<IndexStatus> {
        let index = self.domain(domain)?;
        let snapshot = index.current_snapshot();
        Ok(IndexStatus {
            domain,
            state: index.state(),
            file_count: snapshot.as_ref().map_or(0, |s| s.file_count()),
            last_indexed_at: snapshot.map(|s| s.indexed_at),
        })
    }

    /// Bring the domain up to date with an incremental build, then report
    /// it. A failed build shows up in the returned state.
    pub async fn refresh_status(&self, domain: Domain) -> Result<IndexStatus> {
        if let Err(e) = self.reindex(domain, false).await {
            tracing::warn!(domain = %domain, error = %e, "index refresh failed");
        }
        self.status(domain)
    }

    /// Query one domain.
    ///
    /// TF-IDF and vector hits are merged per uri keeping the higher score;
    /// filters, `min_score` and `limit` apply to the merged list.
    pub async fn search(&self, domain: Domain, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let index = self.domain(domain)?;
        if let IndexState::Failed(reason) = index.state() {
            return Err(Error::IndexFailed { domain, reason });
        }
        let snapshot = index.current_snapshot().ok_or(Error::IndexNotReady(domain))?;

        let options = options.normalized();
        let exclusions = build_exclusion_set(&options.exclude_paths)?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut fused: HashMap<String, Candidate> = HashMap::new();
        let text_query = TextQuery {
            limit: snapshot.index.len(),
            min_score: 0.0,
        };
        for hit in snapshot.index.query(query, text_query) {
            fused.insert(
                hit.uri,
                Candidate {
                    score: hit.score,
                    ordinal: hit.ordinal,
                    matched_terms: hit.matched_terms,
                    source: MatchSource::Text,
                },
            );
        }

        if let Some(vector_hits) = self.vector_hits(&snapshot, query, options.limit).await {
            let query_terms = distinct_terms(self.inner.tokenizer.as_ref(), query);
            for (uri, similarity) in vector_hits {
                let score = similarity.clamp(0.0, 1.0);
                if score <= 0.0 || !snapshot.documents.contains_key(&uri) {
                    continue;
                }
                match fused.get_mut(&uri) {
                    Some(candidate) => {
                        candidate.score = candidate.score.max(score);
                        candidate.source = MatchSource::Both;
                    }
                    None => {
                        let doc_terms = snapshot.index.document(&uri);
                        let matched_terms = query_terms
                            .iter()
                            .filter(|t| doc_terms.is_some_and(|d| d.contains(t)))
                            .cloned()
                            .collect();
                        let ordinal = snapshot.index.ordinal(&uri).unwrap_or(u64::MAX);
                        fused.insert(
                            uri,
                            Candidate {
                                score,
                                ordinal,
                                matched_terms,
                                source: MatchSource::Vector,
                            },
                        );
                    }
                }
            }
        }

        let language = options.language.as_deref();
        let mut ranked: Vec<(String, Candidate)> = fused
            .into_iter()
            .filter(|(uri, candidate)| {
                let Some(meta) = snapshot.documents.get(uri) else {
                    return false;
                };
                candidate.score >= options.min_score
                    && language.map_or(true, |l| meta.language.eq_ignore_ascii_case(l))
                    && options.path_filter.as_deref().map_or(true, |p| uri.starts_with(p))
                    && !exclusions.is_match(uri.as_str())
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.ordinal.cmp(&b.1.ordinal))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(options.limit);

        let mut results = Vec::with_capacity(ranked.len());
        for (uri, candidate) in ranked {
            let snippet = self.snippet(&snapshot.root, &uri, &candidate.matched_terms).await;
            let language = snapshot
                .documents
                .get(&uri)
                .map(|m| m.language.clone())
                .unwrap_or_default();
            results.push(SearchResult {
                uri,
                score: candidate.score,
                matched_terms: candidate.matched_terms,
                snippet,
                language,
                source: candidate.source,
            });
        }

        tracing::debug!(domain = %domain, query, results = results.len(), "search");
        Ok(results)
    }

    /// Nearest neighbours of the embedded query, or `None` when the snapshot
    /// has no vectors or embedding the query fails.
    async fn vector_hits(&self, snapshot: &Snapshot, query: &str, limit: usize) -> Option<Vec<(String, f32)>> {
        let vectors = snapshot.vectors.as_ref().filter(|v| !v.is_empty())?;
        let provider = self.inner.embedder.as_ref()?;
        let config = &self.inner.config;
        match embed_query(
            Arc::clone(provider),
            query,
            config.embedding.max_chars,
            config.timeouts.query_embedding(),
        )
        .await
        {
            Ok(embedding) => Some(vectors.search(&embedding, (limit * VECTOR_OVERFETCH).max(MIN_VECTOR_CANDIDATES))),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, using text results only");
                None
            }
        }
    }

    async fn snippet(&self, root: &Path, uri: &str, terms: &[String]) -> Option<String> {
        let path = root.join(uri);
        let timeout = self.inner.config.timeouts.file_read();
        match tokio::time::timeout(timeout, tokio::fs::read_to_string(&path)).await {
            Ok(Ok(content)) => build_snippet(&content, terms),
            Ok(Err(e)) => {
                tracing::debug!(path = %path.display(), error = %e, "no snippet");
                None
            }
            Err(_) => None,
        }
    }

    /// Start watching a domain's root; changes trigger background rebuilds.
    ///
    /// Must be called inside a tokio runtime. Watching an already watched
    /// domain is a no-op.
    pub fn watch(&self, domain: Domain) -> Result<()> {
        let index = self.domain(domain)?;
        let mut slot = lock(&index.watcher);
        if slot.as_ref().is_some_and(FileWatcher::is_running) {
            return Ok(());
        }

        let rules = ScanRules::for_domain(domain, &index.root, &index.settings)?;
        let data_dir = self.inner.config.data_dir.clone();
        let root = index.root.clone();
        let is_ignored: IgnorePredicate = Arc::new(move |rel: &Path, is_dir: bool| {
            root.join(rel).starts_with(&data_dir)
                || rules.ignore.is_ignored(rel, is_dir)
                || (!is_dir && !rules.is_indexable(rel))
        });

        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let on_change = move |changes: ChangeSet| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::info!(domain = %domain, changes = changes.len(), "changes detected");
            if let Err(e) = (SearchService { inner }).request_rebuild(domain) {
                tracing::error!(domain = %domain, error = %e, "could not schedule rebuild");
            }
        };

        let watcher = FileWatcher::start(&index.root, is_ignored, index.settings.debounce(domain), on_change)?;
        *slot = Some(watcher);
        Ok(())
    }

    /// Stop watching a domain. Returns whether a watcher was running.
    pub fn unwatch(&self, domain: Domain) -> Result<bool> {
        let index = self.domain(domain)?;
        let watcher = lock(&index.watcher).take();
        Ok(match watcher {
            Some(mut watcher) => {
                watcher.stop();
                true
            }
            None => false,
        })
    }

    /// Stop every watcher.
    pub fn shutdown(&self) {
        for domain in self.domains() {
            if let Err(e) = self.unwatch(domain) {
                tracing::warn!(domain = %domain, error = %e, "failed to stop watcher");
            }
        }
    }
}

struct Candidate {
    score: f32,
    ordinal: u64,
    matched_terms: Vec<String>,
    source: MatchSource,
}

fn distinct_terms(tokenizer: &dyn TermExtractor, text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenizer
        .tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
