use super::discovery::ScannedFile;
use super::markdown;
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// One indexable unit: a file that passed the scan filters, with its text.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub uri: String,
    /// Text handed to the tokenizer and the embedding provider
    pub content: String,
    pub language: String,
    pub size_bytes: u64,
    pub modified_at: u64,
    pub content_hash: String,
}

/// Everything about an indexed document except its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub uri: String,
    pub language: String,
    pub size_bytes: u64,
    pub modified_at: u64,
    pub content_hash: String,
}

impl Document {
    /// Build a document from raw file bytes.
    ///
    /// Fails with [`Error::Tokenize`] when the bytes look binary or are not
    /// valid UTF-8. Markdown is flattened to plain text.
    pub fn from_bytes(file: &ScannedFile, bytes: &[u8], content_hash: String) -> Result<Self> {
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
        if sniff.contains(&0) {
            return Err(Error::Tokenize {
                path: file.relative_path.clone(),
                reason: "content contains NUL bytes (binary file)".to_string(),
            });
        }

        let text = std::str::from_utf8(bytes).map_err(|e| Error::Tokenize {
            path: file.relative_path.clone(),
            reason: format!("content is not valid UTF-8: {}", e),
        })?;

        let language = detect_language(Path::new(&file.relative_path));
        let content = if language == "markdown" {
            markdown::flatten(text)
        } else {
            text.to_string()
        };

        Ok(Self {
            uri: file.relative_path.clone(),
            content,
            language: language.to_string(),
            size_bytes: bytes.len() as u64,
            modified_at: file.modified_at,
            content_hash,
        })
    }

    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            uri: self.uri.clone(),
            language: self.language.clone(),
            size_bytes: self.size_bytes,
            modified_at: self.modified_at,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Calculate SHA256 hash of a byte slice as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Language name from a file's extension (or well-known file name).
pub fn detect_language(path: &Path) -> &'static str {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        match name {
            "Makefile" => return "make",
            "Dockerfile" => return "dockerfile",
            "Justfile" => return "just",
            "Rakefile" | "Gemfile" => return "ruby",
            _ => {}
        }
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" | "zsh" | "fish" => "shell",
        "sql" => "sql",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "xml" => "xml",
        "html" | "htm" => "html",
        "css" | "scss" | "sass" | "less" => "css",
        "lua" => "lua",
        "ex" | "exs" => "elixir",
        "erl" => "erlang",
        "hs" => "haskell",
        "ml" | "mli" => "ocaml",
        "clj" => "clojure",
        "dart" => "dart",
        "vue" => "vue",
        "svelte" => "svelte",
        "proto" => "protobuf",
        "graphql" | "gql" => "graphql",
        "tf" => "terraform",
        "nix" => "nix",
        "zig" => "zig",
        "r" => "r",
        "jl" => "julia",
        "md" | "markdown" | "mdown" | "mkd" | "mkdn" => "markdown",
        "rst" => "restructuredtext",
        "adoc" => "asciidoc",
        "org" => "org",
        _ => "text",
    }
}
