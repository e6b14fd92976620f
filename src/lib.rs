// Core functionality
pub mod core {
    pub mod config;
    pub mod domain;
    pub mod error;
}

// Persistent state
pub mod storage {
    pub mod cache;
    pub mod db;
    pub mod index_store;
    pub mod vectors;
}

// Indexing pipeline
pub mod indexing {
    pub mod discovery;
    pub mod document;
    pub mod markdown;
    pub mod tokenizer;
    pub mod watch;
}

// Retrieval
pub mod search {
    #[cfg(feature = "bert")]
    pub mod bert;
    pub mod embedding;
    pub mod options;
    pub mod snippet;
    pub mod tfidf;
}

// Index lifecycle and hybrid queries
pub mod service {
    mod build;
    pub mod engine;
    pub mod state;
}

// User interfaces
pub mod ui {
    pub mod cli;
}

// Re-export commonly used types
pub use core::config::{Config, DomainConfig};
pub use core::domain::Domain;
pub use core::error::{Error, Result};
pub use indexing::discovery::{Scanner, WalkScanner};
pub use indexing::tokenizer::{TermExtractor, Tokenizer};
pub use search::embedding::EmbeddingProvider;
pub use search::options::{MatchSource, SearchOptions, SearchResult};
pub use service::engine::SearchService;
pub use service::state::{IndexState, IndexStatus, IndexingStats};
pub use ui::cli::Cli;

#[cfg(feature = "bert")]
pub use search::bert::BertEmbedder;
