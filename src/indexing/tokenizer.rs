//! Term extraction shared by indexing and querying.
//!
//! The plain split lowercases the text and breaks it on every
//! non-alphanumeric character. On top of that, identifiers and paths that
//! programmers type as one unit produce extra compound terms:
//!
//! - camelCase / PascalCase parts: `parseHttpRequest` → `parse`, `http`, `request`
//! - accessor stems: `getUserName` → `username`
//! - snake_case identifiers kept whole: `max_file_size`
//! - dotted paths: `std.io.Read` → `std.io.read`
//! - URLs and their host: `https://docs.rs/redb` → the URL and `docs.rs`

use crate::core::config::TokenizerConfig;

/// Prefixes whose remainder is emitted as an extra stem.
const ACCESSOR_PREFIXES: &[&str] = &["get", "set", "is", "has"];

/// Anything that can turn text into index terms.
///
/// The index and the query path must use the same extractor.
pub trait TermExtractor: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    min_term_length: usize,
    compound_terms: bool,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(&TokenizerConfig::default())
    }
}

impl Tokenizer {
    pub fn new(config: &TokenizerConfig) -> Self {
        Self {
            min_term_length: config.min_term_length.max(1),
            compound_terms: config.compound_terms,
        }
    }

    pub fn min_term_length(&self) -> usize {
        self.min_term_length
    }

    fn keep(&self, term: &str) -> bool {
        term.chars().count() >= self.min_term_length
    }

    fn push(&self, out: &mut Vec<String>, term: String) {
        if self.keep(&term) {
            out.push(term);
        }
    }

    fn tokenize_chunk(&self, chunk: &str, out: &mut Vec<String>) {
        for word in chunk.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            self.push(out, word.to_lowercase());
            if self.compound_terms {
                self.camel_terms(word, out);
            }
        }

        if !self.compound_terms {
            return;
        }

        for ident in chunk.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
            let trimmed = ident.trim_matches('_');
            if trimmed.contains('_') && trimmed.split('_').filter(|p| !p.is_empty()).count() > 1 {
                self.push(out, trimmed.to_lowercase());
            }
        }

        for candidate in chunk.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.')) {
            let candidate = candidate.trim_matches('.');
            if is_dotted_path(candidate) {
                self.push(out, candidate.to_lowercase());
            }
        }

        if let Some((url, host)) = url_parts(chunk) {
            self.push(out, url);
            if let Some(host) = host {
                self.push(out, host);
            }
        }
    }

    fn camel_terms(&self, word: &str, out: &mut Vec<String>) {
        let parts = split_camel_case(word);
        if parts.len() < 2 {
            return;
        }
        for part in &parts {
            self.push(out, part.to_lowercase());
        }
        let head = parts[0].to_lowercase();
        if ACCESSOR_PREFIXES.contains(&head.as_str()) {
            let stem: String = parts[1..].iter().map(|p| p.to_lowercase()).collect();
            self.push(out, stem);
        }
    }
}

impl TermExtractor for Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        for chunk in text.split_whitespace() {
            self.tokenize_chunk(chunk, &mut terms);
        }
        terms
    }
}

/// Split an alphanumeric word at lower→upper and acronym→word boundaries.
///
/// `parseHTTPRequest` → `parse`, `HTTP`, `Request`. Digits stay attached
/// to the part they follow.
pub fn split_camel_case(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;

    for i in 1..chars.len() {
        let (idx, c) = chars[i];
        let prev = chars[i - 1].1;
        let next = chars.get(i + 1).map(|&(_, n)| n);

        let lower_to_upper = (prev.is_lowercase() || prev.is_ascii_digit()) && c.is_uppercase();
        let acronym_end =
            prev.is_uppercase() && c.is_uppercase() && next.is_some_and(|n| n.is_lowercase());

        if lower_to_upper || acronym_end {
            parts.push(&word[start..idx]);
            start = idx;
        }
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

/// `a.b` style paths where every segment starts like an identifier.
fn is_dotted_path(candidate: &str) -> bool {
    let segments: Vec<&str> = candidate.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|s| {
            s.chars()
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
        })
}

/// Lowercased URL (trailing punctuation removed) and its host, if the
/// chunk looks like one.
fn url_parts(chunk: &str) -> Option<(String, Option<String>)> {
    let lower = chunk.to_lowercase();
    let start = lower
        .find("://")
        .and_then(|pos| {
            let scheme_start = lower[..pos]
                .char_indices()
                .rev()
                .find(|(_, c)| !c.is_ascii_alphanumeric())
                .map(|(p, c)| p + c.len_utf8())
                .unwrap_or(0);
            (scheme_start < pos).then_some(scheme_start)
        })
        .or_else(|| lower.find("www."))?;

    let url = lower[start..]
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | ']' | '>' | '"' | '\''))
        .to_string();

    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url.as_str(),
    };
    let host = rest
        .split(|c: char| c == '/' || c == '?' || c == '#' || c == ':')
        .next()
        .filter(|h| h.contains('.'))
        .map(|h| h.trim_start_matches("www.").to_string());

    Some((url, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(text: &str) -> Vec<String> {
        Tokenizer::default().tokenize(text)
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n\t  ").is_empty());
    }

    #[test]
    fn test_basic_split_and_min_length() {
        let terms = tokenize("function foo(){} a bb");
        assert_eq!(terms, vec!["function", "foo"]);
    }

    #[test]
    fn test_lowercases() {
        assert_eq!(tokenize("HELLO World"), vec!["hello", "world"]);
    }

    #[test]
    fn test_camel_case_parts() {
        let terms = tokenize("parseHttpRequest");
        assert_eq!(terms, vec!["parsehttprequest", "parse", "http", "request"]);
    }

    #[test]
    fn test_acronym_split() {
        assert_eq!(split_camel_case("parseHTTPRequest"), vec!["parse", "HTTP", "Request"]);
        assert_eq!(split_camel_case("XMLParser"), vec!["XML", "Parser"]);
        assert_eq!(split_camel_case("lowercase"), vec!["lowercase"]);
        assert_eq!(split_camel_case("utf8Decoder"), vec!["utf8", "Decoder"]);
    }

    #[test]
    fn test_accessor_prefix() {
        let terms = tokenize("getUserName");
        assert!(terms.contains(&"getusername".to_string()));
        assert!(terms.contains(&"user".to_string()));
        assert!(terms.contains(&"name".to_string()));
        assert!(terms.contains(&"username".to_string()));

        let terms = tokenize("isReady");
        assert!(terms.contains(&"ready".to_string()));
    }

    #[test]
    fn test_snake_case_kept_whole() {
        let terms = tokenize("max_file_size");
        assert_eq!(terms, vec!["max", "file", "size", "max_file_size"]);
    }

    #[test]
    fn test_dotted_path() {
        let terms = tokenize("use std.io.Read;");
        assert!(terms.contains(&"std.io.read".to_string()));
        assert!(terms.contains(&"read".to_string()));
        // numbers are not paths
        assert!(!tokenize("version 3.14").iter().any(|t| t.contains('.')));
    }

    #[test]
    fn test_url_terms() {
        let terms = tokenize("see https://www.Example.com/docs/page.html, thanks");
        assert!(terms.contains(&"https://www.example.com/docs/page.html".to_string()));
        assert!(terms.contains(&"example.com".to_string()));
        assert!(terms.contains(&"docs".to_string()));
    }

    #[test]
    fn test_compound_terms_disabled() {
        let tokenizer = Tokenizer::new(&TokenizerConfig {
            min_term_length: 3,
            compound_terms: false,
        });
        assert_eq!(tokenizer.tokenize("getUserName std.io"), vec!["getusername", "std"]);
    }

    #[test]
    fn test_deterministic() {
        let text = "fn getValue(self) -> Option<HashMap> { self.inner.get_value() } // https://a.io/x";
        assert_eq!(tokenize(text), tokenize(text));
    }

    #[test]
    fn test_non_ascii_before_scheme() {
        let terms = tokenize("é://example.com/path");
        assert!(terms.contains(&"example".to_string()));
        assert!(!terms.iter().any(|t| t.starts_with("é:")));

        let terms = tokenize("see café://menu.example/today");
        assert!(terms.contains(&"café".to_string()));
        assert!(terms.contains(&"menu".to_string()));

        let terms = tokenize("überhttps://docs.rs/redb");
        assert!(terms.contains(&"https://docs.rs/redb".to_string()));
        assert!(terms.contains(&"docs.rs".to_string()));
    }

    #[test]
    fn test_unicode_words() {
        let terms = tokenize("Größe über café");
        assert_eq!(terms, vec!["größe", "über", "café"]);
    }
}
