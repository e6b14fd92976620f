use crate::search::embedding::truncate_chars;

/// Longest snippet returned with a result, in characters
pub const SNIPPET_MAX_CHARS: usize = 200;

/// First line mentioning one of `terms` (case-insensitive), else the first
/// non-empty line, trimmed and cut to [`SNIPPET_MAX_CHARS`].
pub fn build_snippet(content: &str, terms: &[String]) -> Option<String> {
    let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
    let matching = content.lines().find(|line| {
        let lower = line.to_lowercase();
        terms.iter().any(|t| lower.contains(t.as_str()))
    });
    let line = matching.or_else(|| content.lines().find(|l| !l.trim().is_empty()))?;
    Some(truncate_chars(line.trim(), SNIPPET_MAX_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_matching_line() {
        let content = "// header\n\nfn load_config() {}\nfn other() {}\n";
        let snippet = build_snippet(content, &["config".to_string()]);
        assert_eq!(snippet.as_deref(), Some("fn load_config() {}"));
    }

    #[test]
    fn test_falls_back_to_first_non_empty_line() {
        let snippet = build_snippet("\n\n   \n  Title line  \nbody", &["absent".to_string()]);
        assert_eq!(snippet.as_deref(), Some("Title line"));
        assert!(build_snippet("  \n\n", &[]).is_none());
    }

    #[test]
    fn test_long_lines_are_cut() {
        let line = "x".repeat(500);
        let snippet = build_snippet(&line, &[]).unwrap();
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS);
    }
}
