use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use census_query_resolver::{
    cache::{CacheManager, CachePolicy, SqliteCacheStore},
    census::{CensusClient, GazetteerClient},
    config::{Config, LogFormat},
    discovery::CatalogExplorer,
    llm::OllamaClient,
    pipeline::QueryPipeline,
    SessionContexts,
};

/// Answer questions about Louisiana census tracts.
#[derive(Debug, Parser)]
#[command(name = "census-query", version, about)]
struct Cli {
    /// Answer one question and exit instead of reading stdin
    #[arg(short, long)]
    query: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Census query resolver starting..."
    );

    // Initialize cache
    let store = match SqliteCacheStore::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Cache database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize cache database");
            return Err(e.into());
        }
    };
    let cache = Arc::new(CacheManager::new(
        Arc::new(store),
        CachePolicy::from_config(&config.cache),
    ));

    // Initialize collaborators
    let model = Arc::new(OllamaClient::new(&config.llm, config.request.clone())?);
    info!(endpoint = %model.endpoint(), model = %model.model(), "Ollama client initialized");
    let census = Arc::new(CensusClient::new(&config.census, config.request.clone())?);
    let gazetteer = Arc::new(GazetteerClient::new(&config.census, config.request.clone())?);

    let pipeline = QueryPipeline::new(model, census.clone(), gazetteer, cache.clone(), &config);
    let explorer = CatalogExplorer::new(
        pipeline.indicators().clone(),
        census,
        cache,
        config.census.year,
    );
    let mut session = SessionContexts::new(config.context.max_turns);

    if let Some(query) = cli.query {
        let ok = answer(&pipeline, &explorer, &mut session, &query).await;
        if !ok {
            std::process::exit(2);
        }
        return Ok(());
    }

    info!("Ready, reading questions from stdin...");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        answer(&pipeline, &explorer, &mut session, line).await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Handle one input line, printing JSON on stdout. Returns false on error.
async fn answer(
    pipeline: &QueryPipeline,
    explorer: &CatalogExplorer,
    session: &mut SessionContexts,
    line: &str,
) -> bool {
    if line == ":clear" {
        session.query.clear();
        session.discovery.clear();
        print_json(&json!({ "cleared": true }));
        return true;
    }

    let outcome = match line.strip_prefix(":explore") {
        Some(question) => explorer
            .ask(question.trim(), &mut session.discovery)
            .await
            .and_then(|answer| serde_json::to_value(answer).map_err(internal)),
        None => pipeline
            .process(line, &mut session.query)
            .await
            .and_then(|result| serde_json::to_value(result).map_err(internal)),
    };

    match outcome {
        Ok(value) => {
            print_json(&value);
            true
        }
        Err(e) => {
            print_json(&json!({ "error": e.to_string() }));
            false
        }
    }
}

fn internal(e: serde_json::Error) -> census_query_resolver::AppError {
    census_query_resolver::AppError::Internal {
        message: e.to_string(),
    }
}

fn print_json(value: &serde_json::Value) {
    let mut stdout = io::stdout().lock();
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    let _ = writeln!(stdout, "{}", rendered);
    let _ = stdout.flush();
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
