use super::domain::Domain;
use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the optional configuration file inside the base directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Configuration for lodestone
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for lodestone data
    pub base_dir: PathBuf,
    /// Directory holding one sub-directory of index files per domain
    pub data_dir: PathBuf,
    /// Directory for cached models
    pub models_dir: PathBuf,
    /// Source tree to index, if any
    pub codebase: Option<DomainConfig>,
    /// Knowledge corpus to index, if any
    pub knowledge: Option<DomainConfig>,
    pub tokenizer: TokenizerConfig,
    pub tfidf: TfidfConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
}

/// Per-domain scanning and watching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Root directory of the domain
    pub root: PathBuf,
    /// Quiet period before a burst of file changes triggers a rebuild.
    /// Defaults to 2s for the codebase and 5s for the knowledge corpus.
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    /// Files larger than this are not indexed
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// File extensions to index; empty means the domain's built-in list
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Extra gitignore-style patterns to exclude
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DomainConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce_ms: None,
            max_file_size: default_max_file_size(),
            extensions: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn debounce(&self, domain: Domain) -> Duration {
        let millis = self.debounce_ms.unwrap_or(match domain {
            Domain::Codebase => 2_000,
            Domain::Knowledge => 5_000,
        });
        Duration::from_millis(millis)
    }
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Terms shorter than this (in characters) are discarded
    pub min_term_length: usize,
    /// Emit camelCase, dotted-path and URL compounds next to the plain split
    pub compound_terms: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            min_term_length: 3,
            compound_terms: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TfidfConfig {
    /// Pending single-document mutations before IDF is recomputed eagerly
    pub idf_recompute_threshold: usize,
}

impl Default for TfidfConfig {
    fn default() -> Self {
        Self {
            idf_recompute_threshold: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Texts per provider call
    pub batch_size: usize,
    /// Provider calls allowed in flight at once
    pub max_concurrent_batches: usize,
    /// Texts are cut to this many characters before embedding
    pub max_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: 2,
            max_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Compare content hashes when only the modification time changed
    pub verify_content_hash: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            verify_content_hash: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub scan_ms: u64,
    pub file_read_ms: u64,
    pub embedding_batch_ms: u64,
    pub query_embedding_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_ms: 60_000,
            file_read_ms: 5_000,
            embedding_batch_ms: 60_000,
            query_embedding_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    pub fn file_read(&self) -> Duration {
        Duration::from_millis(self.file_read_ms)
    }

    pub fn embedding_batch(&self) -> Duration {
        Duration::from_millis(self.embedding_batch_ms)
    }

    pub fn query_embedding(&self) -> Duration {
        Duration::from_millis(self.query_embedding_ms)
    }
}

/// On-disk shape of `config.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    codebase: Option<DomainConfig>,
    knowledge: Option<DomainConfig>,
    tokenizer: Option<TokenizerConfig>,
    tfidf: Option<TfidfConfig>,
    embedding: Option<EmbeddingConfig>,
    cache: Option<CacheConfig>,
    timeouts: Option<TimeoutConfig>,
}

impl Config {
    /// Get the default configuration directory
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|home| home.join(".lodestone"))
    }

    /// Create a new configuration with every tunable at its default
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => Self::default_base_dir()?,
        };

        Ok(Self {
            data_dir: base_dir.join("indexes"),
            models_dir: base_dir.join("models"),
            base_dir,
            codebase: None,
            knowledge: None,
            tokenizer: TokenizerConfig::default(),
            tfidf: TfidfConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
        })
    }

    /// Create a configuration and overlay `config.json` from the base
    /// directory when it exists.
    pub fn load(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::new(base_dir)?;
        let path = config.config_path();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            config.apply_json(&raw).map_err(|e| {
                Error::Config(format!("Invalid {}: {}", path.display(), e))
            })?;
        }
        Ok(config)
    }

    /// Overlay settings from a JSON document shaped like `config.json`.
    pub fn apply_json(&mut self, raw: &str) -> Result<()> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        if file.codebase.is_some() {
            self.codebase = file.codebase;
        }
        if file.knowledge.is_some() {
            self.knowledge = file.knowledge;
        }
        if let Some(tokenizer) = file.tokenizer {
            self.tokenizer = tokenizer;
        }
        if let Some(tfidf) = file.tfidf {
            self.tfidf = tfidf;
        }
        if let Some(embedding) = file.embedding {
            self.embedding = embedding;
        }
        if let Some(cache) = file.cache {
            self.cache = cache;
        }
        if let Some(timeouts) = file.timeouts {
            self.timeouts = timeouts;
        }
        self.validate()
    }

    pub fn with_domain(mut self, domain: Domain, settings: DomainConfig) -> Self {
        match domain {
            Domain::Codebase => self.codebase = Some(settings),
            Domain::Knowledge => self.knowledge = Some(settings),
        }
        self
    }

    pub fn domain(&self, domain: Domain) -> Option<&DomainConfig> {
        match domain {
            Domain::Codebase => self.codebase.as_ref(),
            Domain::Knowledge => self.knowledge.as_ref(),
        }
    }

    /// Directory holding the cache, TF-IDF tables and vector snapshot of a domain
    pub fn domain_dir(&self, domain: Domain) -> PathBuf {
        self.data_dir.join(domain.as_str())
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokenizer.min_term_length == 0 {
            return Err(Error::Config("tokenizer.min_term_length must be at least 1".to_string()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::Config("embedding.batch_size must be at least 1".to_string()));
        }
        if self.embedding.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "embedding.max_concurrent_batches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Initialize the configuration directories
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    /// Check if the configuration is already initialized
    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.data_dir.exists()
    }

    /// Write the domain and tuning sections back to `config.json`.
    pub fn save(&self) -> Result<()> {
        let value = serde_json::json!({
            "codebase": self.codebase,
            "knowledge": self.knowledge,
            "tokenizer": self.tokenizer,
            "tfidf": self.tfidf,
            "embedding": self.embedding,
            "cache": self.cache,
            "timeouts": self.timeouts,
        });
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::write(self.config_path(), serde_json::to_string_pretty(&value)?)?;
        Ok(())
    }
}

/// Resolve a user-supplied root against the current directory.
pub fn absolute_root(root: &Path) -> Result<PathBuf> {
    if root.is_absolute() {
        Ok(root.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(root))
    }
}
