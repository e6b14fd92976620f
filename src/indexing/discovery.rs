use crate::core::config::DomainConfig;
use crate::core::domain::Domain;
use crate::core::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Directories never worth indexing, whatever the ignore files say.
const ALWAYS_IGNORED: &[&str] = &[
    ".git/",
    ".hg/",
    ".svn/",
    "node_modules/",
    "target/",
    "__pycache__/",
    ".venv/",
    ".lodestone/",
];

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "java", "kt", "kts", "c", "h",
    "cc", "cpp", "cxx", "hpp", "hh", "cs", "rb", "php", "swift", "scala", "sh", "bash", "zsh",
    "fish", "sql", "toml", "yaml", "yml", "json", "xml", "html", "htm", "css", "scss", "sass",
    "less", "lua", "ex", "exs", "erl", "hs", "ml", "mli", "clj", "dart", "vue", "svelte", "proto",
    "graphql", "gql", "tf", "nix", "zig", "r", "jl", "md", "markdown", "txt", "rst", "cfg", "ini",
    "gradle", "cmake", "mk",
];

const KNOWLEDGE_EXTENSIONS: &[&str] = &[
    "md", "markdown", "mdown", "mkd", "mkdn", "txt", "rst", "adoc", "org", "text",
];

/// Extension-less file names indexed in the codebase domain.
const CODE_FILE_NAMES: &[&str] = &["Makefile", "Dockerfile", "Justfile", "Rakefile", "Gemfile"];

/// A file found by a scan, before its content is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the domain root, always with `/` separators
    pub relative_path: String,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_at: u64,
    pub size_bytes: u64,
}

/// Gitignore-style predicate over paths relative to a domain root.
///
/// Combines the root's `.gitignore`/`.ignore` files, a built-in list of
/// VCS and build directories, and the domain's configured exclusions.
#[derive(Clone)]
pub struct IgnoreMatcher {
    gitignore: Arc<Gitignore>,
}

impl IgnoreMatcher {
    pub fn new(root: &Path, extra_patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for name in [".gitignore", ".ignore"] {
            let file = root.join(name);
            if file.is_file() {
                if let Some(err) = builder.add(&file) {
                    tracing::warn!(path = %file.display(), error = %err, "ignoring unreadable ignore file");
                }
            }
        }
        for pattern in ALWAYS_IGNORED.iter().copied().chain(extra_patterns.iter().map(String::as_str)) {
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::Config(format!("Invalid ignore pattern '{}': {}", pattern, e)))?;
        }
        let gitignore = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build ignore rules: {}", e)))?;
        Ok(Self {
            gitignore: Arc::new(gitignore),
        })
    }

    /// True when `relative_path` (or any parent directory) is excluded.
    pub fn is_ignored(&self, relative_path: &Path, is_dir: bool) -> bool {
        if relative_path.as_os_str().is_empty() {
            return false;
        }
        self.gitignore
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }
}

/// Filters applied to every scanned entry of one domain.
#[derive(Clone)]
pub struct ScanRules {
    pub domain: Domain,
    pub extensions: HashSet<String>,
    pub max_file_size: u64,
    pub ignore: IgnoreMatcher,
}

impl ScanRules {
    pub fn for_domain(domain: Domain, root: &Path, settings: &DomainConfig) -> Result<Self> {
        let extensions = if settings.extensions.is_empty() {
            default_extensions(domain)
                .iter()
                .map(|e| e.to_string())
                .collect()
        } else {
            settings
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };
        Ok(Self {
            domain,
            extensions,
            max_file_size: settings.max_file_size,
            ignore: IgnoreMatcher::new(root, &settings.exclude)?,
        })
    }

    /// Whether a file name looks like text this domain indexes
    pub fn is_indexable(&self, path: &Path) -> bool {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            return self.extensions.contains(&ext.to_ascii_lowercase());
        }
        self.domain == Domain::Codebase
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| CODE_FILE_NAMES.contains(&n))
    }
}

pub fn default_extensions(domain: Domain) -> &'static [&'static str] {
    match domain {
        Domain::Codebase => CODE_EXTENSIONS,
        Domain::Knowledge => KNOWLEDGE_EXTENSIONS,
    }
}

/// Lists the indexable files under a root.
pub trait Scanner: Send + Sync {
    fn scan(&self, root: &Path, rules: &ScanRules) -> Result<Vec<ScannedFile>>;
}

/// Scanner backed by the `ignore` crate's parallel-safe walker.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkScanner;

impl Scanner for WalkScanner {
    fn scan(&self, root: &Path, rules: &ScanRules) -> Result<Vec<ScannedFile>> {
        discover_files(root, rules)
    }
}

/// Discover all indexable files in a directory, respecting .gitignore rules
pub fn discover_files(root: &Path, rules: &ScanRules) -> Result<Vec<ScannedFile>> {
    if !root.exists() {
        return Err(Error::Scan {
            domain: rules.domain,
            reason: format!("Directory does not exist: {}", root.display()),
        });
    }

    if !root.is_dir() {
        return Err(Error::Scan {
            domain: rules.domain,
            reason: format!("Path is not a directory: {}", root.display()),
        });
    }

    std::fs::read_dir(root).map_err(|e| Error::Scan {
        domain: rules.domain,
        reason: format!("Directory is not readable: {}: {}", root.display(), e),
    })?;

    let matcher = rules.ignore.clone();
    let filter_root = root.to_path_buf();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            match entry.path().strip_prefix(&filter_root) {
                Ok(rel) => !matcher.is_ignored(rel, is_dir),
                Err(_) => true,
            }
        })
        .build();

    let mut files = Vec::new();

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                // Log but continue - some files might be inaccessible
                tracing::warn!(domain = %rules.domain, error = %err, "failed to access path during scan");
                continue;
            }
        };

        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        if !rules.is_indexable(path) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to stat file");
                continue;
            }
        };

        if metadata.len() > rules.max_file_size {
            tracing::debug!(path = %path.display(), size = metadata.len(), "skipping oversized file");
            continue;
        }

        let Some(relative_path) = relative_uri(root, path) else {
            continue;
        };

        files.push(ScannedFile {
            path: path.to_path_buf(),
            relative_path,
            modified_at: modified_millis(&metadata),
            size_bytes: metadata.len(),
        });
    }

    Ok(files)
}

/// `/`-separated path of `path` relative to `root`
pub fn relative_uri(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Get file modification time as milliseconds since the Unix epoch
pub fn modified_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Compile exclusion globs for query-time path filtering.
///
/// A pattern without glob metacharacters also matches everything below it.
pub fn build_exclusion_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let trimmed = pattern.trim().trim_start_matches("./").trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let glob = |p: &str| {
            Glob::new(p).map_err(|e| Error::Config(format!("Invalid exclude pattern '{}': {}", pattern, e)))
        };
        builder.add(glob(trimmed)?);
        if !trimmed.contains(['*', '?', '[', '{']) {
            builder.add(glob(&format!("{}/**", trimmed))?);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build exclude patterns: {}", e)))
}
