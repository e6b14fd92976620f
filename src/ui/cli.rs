use crate::core::domain::Domain;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// lodestone - Local hybrid search over a codebase and a knowledge corpus
#[derive(Parser, Debug)]
#[command(name = "lodestone")]
#[command(about = "A local-first hybrid TF-IDF and vector search engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Custom base directory (default: ~/.lodestone)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Root of the codebase domain, overriding config.json
    #[arg(long, global = true)]
    pub codebase: Option<PathBuf>,

    /// Root of the knowledge domain, overriding config.json
    #[arg(long, global = true)]
    pub knowledge: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directories and write config.json
    Init,
    /// Build or update a domain's index
    Index {
        domain: Domain,
        /// Re-read and re-tokenize every file
        #[arg(short, long)]
        force: bool,
    },
    /// Query a domain
    Search {
        domain: Domain,
        query: String,
        /// Maximum number of results to return (1-20)
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
        /// Only results of this language
        #[arg(long)]
        language: Option<String>,
        /// Only results whose path starts with this prefix
        #[arg(long)]
        path: Option<String>,
        /// Glob patterns to exclude; repeatable
        #[arg(long)]
        exclude: Vec<String>,
        /// Drop results scoring below this
        #[arg(long)]
        min_score: Option<f32>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index state and file counts
    Status {
        /// Only this domain
        domain: Option<Domain>,
    },
    /// Index a domain, then keep it current until interrupted
    Watch { domain: Domain },
}
