use anyhow::Context;
use clap::Parser;
use lodestone::ui::cli::{Cli, Commands};
use lodestone::{Config, Domain, DomainConfig, EmbeddingProvider, IndexingStats, SearchOptions, SearchService};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => handle_init(&config),
        Commands::Index { domain, force } => handle_index(config, domain, force).await,
        Commands::Search {
            domain,
            query,
            limit,
            language,
            path,
            exclude,
            min_score,
            json,
        } => {
            let mut options = SearchOptions::default().with_limit(limit);
            options.language = language;
            options.path_filter = path;
            options.exclude_paths = exclude;
            if let Some(min_score) = min_score {
                options.min_score = min_score;
            }
            handle_search(config, domain, &query, &options, json).await
        }
        Commands::Status { domain } => handle_status(config, domain).await,
        Commands::Watch { domain } => handle_watch(config, domain).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.base_dir.clone())?;
    if let Some(root) = &cli.codebase {
        let settings = overridden(config.codebase.as_ref(), root);
        config = config.with_domain(Domain::Codebase, settings);
    }
    if let Some(root) = &cli.knowledge {
        let settings = overridden(config.knowledge.as_ref(), root);
        config = config.with_domain(Domain::Knowledge, settings);
    }
    Ok(config)
}

/// Keep configured tuning for the domain, replace only its root.
fn overridden(existing: Option<&DomainConfig>, root: &Path) -> DomainConfig {
    let mut settings = existing.cloned().unwrap_or_else(|| DomainConfig::new(root));
    settings.root = root.to_path_buf();
    settings
}

fn embedder(config: &Config) -> anyhow::Result<Option<Arc<dyn EmbeddingProvider>>> {
    #[cfg(feature = "bert")]
    {
        let model = lodestone::BertEmbedder::init(config).context("failed to load the embedding model")?;
        Ok(Some(Arc::new(model)))
    }
    #[cfg(not(feature = "bert"))]
    {
        let _ = config;
        Ok(None)
    }
}

fn open_service(config: Config) -> anyhow::Result<SearchService> {
    if config.domain(Domain::Codebase).is_none() && config.domain(Domain::Knowledge).is_none() {
        anyhow::bail!(
            "no domain configured: pass --codebase/--knowledge or add them to {}",
            config.config_path().display()
        );
    }
    config.init()?;
    let provider = embedder(&config)?;
    Ok(SearchService::with_defaults(config, provider)?)
}

fn handle_init(config: &Config) -> anyhow::Result<()> {
    if config.is_initialized() {
        println!("Updating existing configuration at {}", config.base_dir.display());
    }
    config.init()?;
    config.save()?;
    println!("Initialized lodestone at {}", config.base_dir.display());
    println!("  config: {}", config.config_path().display());
    println!("  indexes: {}", config.data_dir.display());
    for domain in Domain::ALL {
        match config.domain(domain) {
            Some(settings) => println!("  {}: {}", domain, settings.root.display()),
            None => println!("  {}: not configured", domain),
        }
    }
    Ok(())
}

async fn handle_index(config: Config, domain: Domain, force: bool) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let stats = service
        .reindex(domain, force)
        .await
        .with_context(|| format!("indexing {} failed", domain))?;
    print_stats(&stats);
    Ok(())
}

fn print_stats(stats: &IndexingStats) {
    println!(
        "{} build: {} scanned, {} indexed, {} refreshed, {} unchanged, {} removed, {} skipped in {} ms",
        if stats.full_rebuild { "Full" } else { "Incremental" },
        stats.files_scanned,
        stats.files_indexed,
        stats.files_refreshed,
        stats.files_unchanged,
        stats.files_removed,
        stats.files_skipped,
        stats.duration_ms
    );
    if stats.embeddings_generated > 0 || stats.failed_batches > 0 {
        println!(
            "  {} embeddings, {} failed batches",
            stats.embeddings_generated, stats.failed_batches
        );
    }
    for warning in &stats.warnings {
        println!("  warning: {}", warning);
    }
}

async fn handle_search(
    config: Config,
    domain: Domain,
    query: &str,
    options: &SearchOptions,
    json: bool,
) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let stats = service.reindex(domain, false).await?;
    tracing::debug!(indexed = stats.files_indexed, "index refreshed before search");
    let results = service.search(domain, query, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results for \"{}\"", query);
        return Ok(());
    }
    for (rank, result) in results.iter().enumerate() {
        println!(
            "{}. {} ({:.3}, {:?}) [{}]",
            rank + 1,
            result.uri,
            result.score,
            result.source,
            result.language
        );
        if !result.matched_terms.is_empty() {
            println!("   terms: {}", result.matched_terms.join(", "));
        }
        if let Some(snippet) = &result.snippet {
            println!("   {}", snippet);
        }
    }
    Ok(())
}

async fn handle_status(config: Config, only: Option<Domain>) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let domains = match only {
        Some(domain) => vec![domain],
        None => service.domains(),
    };
    for domain in domains {
        let status = service.refresh_status(domain).await?;
        println!(
            "{}: {} ({} files{})",
            status.domain,
            status.state,
            status.file_count,
            status
                .last_indexed_at
                .map(|at| format!(", indexed at {} ms", at))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_watch(config: Config, domain: Domain) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let stats = service.reindex(domain, false).await?;
    print_stats(&stats);
    service.watch(domain)?;
    println!("Watching {} for changes (Ctrl-C to stop)", domain);

    tokio::signal::ctrl_c().await?;
    service.shutdown();
    println!("Stopped watching {}", domain);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_overrides_keep_domain_settings() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("base");
        let mut saved = DomainConfig::new("/old/app");
        saved.debounce_ms = Some(50);
        let config = Config::new(Some(base.clone()))
            .unwrap()
            .with_domain(Domain::Codebase, saved);
        config.init().unwrap();
        config.save().unwrap();

        let base_arg = base.to_string_lossy().to_string();
        let cli = Cli::parse_from([
            "lodestone",
            "--base-dir",
            base_arg.as_str(),
            "--codebase",
            "/src/app",
            "--knowledge",
            "/notes",
            "status",
        ]);
        let config = load_config(&cli).unwrap();

        let codebase = config.domain(Domain::Codebase).unwrap();
        assert_eq!(codebase.root, Path::new("/src/app"));
        assert_eq!(codebase.debounce_ms, Some(50));
        let knowledge = config.domain(Domain::Knowledge).unwrap();
        assert_eq!(knowledge.root, Path::new("/notes"));
        assert_eq!(knowledge.debounce_ms, None);
    }
}
