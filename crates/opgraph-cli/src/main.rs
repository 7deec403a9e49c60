//! opgraph - フェッチリクエストを GraphManager で実行する CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use opgraph_core::config::ManagerConfig;
use opgraph_core::domain::{EntityDescription, FetchRequest, Predicate, request::TIME_TO_LIVE_KEY};
use opgraph_core::impls::{InMemoryWorkspace, StaticTransport};
use opgraph_core::manager::GraphManager;

#[derive(Parser)]
#[command(name = "opgraph")]
#[command(about = "Run store requests through the operation graph")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch objects of one entity
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// Entity name
    entity: String,

    /// Predicate clause, `key=value` (repeatable)
    #[arg(short, long, value_parser = parse_clause)]
    predicate: Vec<(String, String)>,

    /// Freshness window in seconds for this entity
    #[arg(long)]
    ttl: Option<f64>,

    /// Submit the same fetch this many times
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Manager configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Answer requests from a JSON fixture (URL -> body) instead of HTTP
    #[arg(long)]
    fixture: Option<PathBuf>,
}

fn parse_clause(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{input}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{input}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

async fn fetch(args: FetchArgs) -> Result<()> {
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    let config = match &args.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    }
    .with_env_overrides();

    let root = Arc::new(InMemoryWorkspace::new());
    let mut builder = GraphManager::builder(config).workspace(root.clone());
    if let Some(path) = &args.fixture {
        let fixture = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        let transport = StaticTransport::from_json(&fixture)
            .with_context(|| format!("invalid fixture {}", path.display()))?;
        builder = builder.transport(Arc::new(transport));
    }
    let manager = builder.build()?;

    let mut entity = EntityDescription::new(&args.entity);
    if let Some(ttl) = args.ttl {
        entity = entity.with_metadata(TIME_TO_LIVE_KEY, ttl.to_string());
    }
    let predicate = args
        .predicate
        .into_iter()
        .fold(Predicate::new(), |predicate, (key, value)| predicate.and(key, value));
    let request = FetchRequest::new(entity).predicate(predicate);

    let mut failed = 0;
    for run in 1..=args.repeat {
        let errors = manager.execute(request.clone()).await;
        if errors.is_empty() {
            info!(run, "fetch finished");
        } else {
            failed += 1;
            for error in &errors {
                eprintln!("run {run}: {error}");
            }
        }
    }

    let stats = manager.stats();
    println!(
        "transactions: submitted={} finished={} failed={}",
        stats.submitted, stats.finished, stats.failed
    );
    for entry in manager.fulfillment_entries() {
        println!(
            "fulfillment: {} {:?} expires {}",
            entry.signature, entry.status, entry.expires_at
        );
    }
    let objects = root.objects();
    println!("{}", serde_json::to_string_pretty(&objects)?);

    if failed > 0 {
        bail!("{failed} of {} fetches failed", args.repeat);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch(args) => fetch(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_parse() {
        assert_eq!(parse_clause("id=1"), Ok(("id".into(), "1".into())));
        assert_eq!(parse_clause(" name = gear "), Ok(("name".into(), "gear".into())));
        assert!(parse_clause("id").is_err());
        assert!(parse_clause("=1").is_err());
    }

    #[test]
    fn cli_accepts_repeated_predicates() {
        let cli = Cli::try_parse_from([
            "opgraph", "fetch", "Widget", "-p", "id=1", "-p", "color=blue", "--repeat", "2",
        ])
        .unwrap();
        let Commands::Fetch(args) = cli.command;
        assert_eq!(args.entity, "Widget");
        assert_eq!(args.predicate.len(), 2);
        assert_eq!(args.repeat, 2);
    }
}
