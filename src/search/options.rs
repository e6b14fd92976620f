use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: usize = 5;
pub const MAX_LIMIT: usize = 20;
pub const DEFAULT_MIN_SCORE: f32 = 0.001;

/// Caller-side knobs for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Results returned at most, clamped to `1..=20`
    pub limit: usize,
    pub min_score: f32,
    /// Only documents of this language
    pub language: Option<String>,
    /// Only documents whose uri starts with this prefix
    pub path_filter: Option<String>,
    /// Glob patterns; a plain path also excludes everything below it
    pub exclude_paths: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            min_score: DEFAULT_MIN_SCORE,
            language: None,
            path_filter: None,
            exclude_paths: Vec::new(),
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Copy with the limit clamped and empty filters dropped.
    pub fn normalized(&self) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            limit: self.limit.clamp(1, MAX_LIMIT),
            min_score: if self.min_score.is_finite() {
                self.min_score.max(0.0)
            } else {
                DEFAULT_MIN_SCORE
            },
            language: non_empty(&self.language).map(|l| l.to_lowercase()),
            path_filter: non_empty(&self.path_filter).map(|p| p.trim_start_matches("./").to_string()),
            exclude_paths: self
                .exclude_paths
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

/// Which retrieval path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Text,
    Vector,
    Both,
}

impl std::fmt::Display for MatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MatchSource::Text => "text",
            MatchSource::Vector => "vector",
            MatchSource::Both => "both",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub uri: String,
    pub score: f32,
    /// Query terms found in the document
    pub matched_terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub language: String,
    pub source: MatchSource,
}
