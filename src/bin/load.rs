use anyhow::{Context, Result};
use clap::Parser;
use kgraph::db::{migrate, Db};
use kgraph::ingest::load_file;
use kgraph::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "load")]
#[command(about = "Bulk-load a tab-separated edge list into the kgraph store")]
struct Args {
    /// TSV file (first line is a header and is skipped)
    file: PathBuf,

    /// Number of write workers
    #[arg(long)]
    workers: Option<usize>,

    /// Records per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Attempts per batch before it is abandoned
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Print the load report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default()?;
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &config.store.log_level)).init();

    if let Some(workers) = args.workers {
        config.loader.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.loader.batch_size = batch_size;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.loader.max_attempts = max_attempts;
    }
    config.validate()?;

    let db = Db::new(config.db_path());
    log::info!("Database path: {}", db.path().display());
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await
        .context("Failed to apply migrations")?;

    let report = load_file(&db, &args.file, &config.loader)
        .await
        .with_context(|| format!("Failed to load {}", args.file.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Records:          {} ({} skipped)", report.records, report.skipped);
        println!("Unique nodes:     {}", report.nodes);
        println!("Edges:            {} ({} duplicates dropped)", report.edges, report.duplicate_edges_dropped);
        println!("Batches:          {} node, {} edge", report.node_batches, report.edge_batches);
        println!("Written:          {} batches in {} attempts", report.succeeded, report.total_attempts);
        println!("Time:             {} ms", report.elapsed_ms);
    }

    if !report.is_complete() {
        anyhow::bail!(
            "{} batches failed every attempt: {:?}",
            report.exhausted.len(),
            report.exhausted
        );
    }

    Ok(())
}
