use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgraph::db::{migrate, Db};
use kgraph::graph::analytics::{self, LabeledNode};
use kgraph::graph::rename::{rename_node, resume_rename, RenameRecord};
use kgraph::graph::{
    distant_antonyms, distant_synonyms, shortest_path, validate_distance, CachedLookup, DistantMatch,
    NeighborLookup, Reach, SqliteLookup, TraversalOptions,
};
use kgraph::Config;
use serde::Serialize;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "query")]
#[command(about = "Run graph queries against the kgraph store")]
struct Args {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Distinct successors of a node
    Successors { node: String },
    /// Distinct predecessors of a node
    Predecessors { node: String },
    /// Successors of successors, with labels
    Grandchildren { node: String },
    /// Predecessors of predecessors, with labels
    Grandparents { node: String },
    /// Count nodes without predecessors
    Roots,
    /// Nodes with the most distinct neighbours
    MostConnected,
    /// Count nodes with exactly one distinct neighbour
    SingleNeighbor,
    /// Rename a node, moving its label and edges
    Rename { old_name: String, new_name: String },
    /// Continue a failed rename
    ResumeRename { rename_id: String },
    /// Shortest path between two nodes
    ShortestPath {
        from: String,
        to: String,
        /// Follow edges in both directions
        #[arg(long)]
        undirected: bool,
    },
    /// Nodes at a distance reached through an even number of antonym hops
    DistantSynonyms {
        node: String,
        #[arg(allow_negative_numbers = true)]
        distance: i64,
    },
    /// Nodes at a distance reached through an odd number of antonym hops
    DistantAntonyms {
        node: String,
        #[arg(allow_negative_numbers = true)]
        distance: i64,
    },
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn print_names(kind: &str, node: &str, names: &[String]) {
    for name in names {
        println!("{}", name);
    }
    println!("{} {} of {}", names.len(), kind, node);
}

fn print_labeled(kind: &str, node: &str, nodes: &[LabeledNode]) {
    for n in nodes {
        match &n.label {
            Some(label) => println!("{}\t{}", n.name, label),
            None => println!("{}", n.name),
        }
    }
    println!("{} {} of {}", nodes.len(), kind, node);
}

fn print_rename(record: &RenameRecord) {
    println!(
        "{} -> {} ({}): {:?}, last step {}",
        record.old_name, record.new_name, record.rename_id, record.status, record.step
    );
}

fn print_matches(kind: &str, node: &str, distance: usize, matches: &[DistantMatch]) {
    if matches.is_empty() {
        println!("No distant {} found for {} at distance {}", kind, node, distance);
        return;
    }
    for m in matches {
        println!("{} (path: {})", m.node, m.path.join(" -> "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_or_default()?;
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &config.store.log_level)).init();

    let db = Db::new(config.db_path());
    log::debug!("Database path: {}", db.path().display());
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await
        .context("Failed to apply migrations")?;

    let options = TraversalOptions::from(&config.traversal);
    let lookup: Box<dyn NeighborLookup> = if config.traversal.cache_capacity > 0 {
        Box::new(CachedLookup::new(SqliteLookup::new(db.clone()), config.traversal.cache_capacity))
    } else {
        Box::new(SqliteLookup::new(db.clone()))
    };
    let json = args.json;

    match args.command {
        Command::Successors { node } => {
            let names = analytics::successors(&db, &node).await?;
            emit(json, &names, |names| print_names("successors", &node, names))?;
        }
        Command::Predecessors { node } => {
            let names = analytics::predecessors(&db, &node).await?;
            emit(json, &names, |names| print_names("predecessors", &node, names))?;
        }
        Command::Grandchildren { node } => {
            let nodes = analytics::grandchildren(&db, &node).await?;
            emit(json, &nodes, |nodes| print_labeled("grandchildren", &node, nodes))?;
        }
        Command::Grandparents { node } => {
            let nodes = analytics::grandparents(&db, &node).await?;
            emit(json, &nodes, |nodes| print_labeled("grandparents", &node, nodes))?;
        }
        Command::Roots => {
            let count = analytics::count_roots(&db).await?;
            emit(json, &json!({ "roots": count }), |_| {
                println!("Nodes without predecessors: {}", count)
            })?;
        }
        Command::MostConnected => {
            let most = analytics::most_connected(&db).await?;
            emit(json, &most, |most| {
                println!("Max distinct neighbours: {}", most.max_neighbors);
                for name in &most.nodes {
                    println!("{}", name);
                }
            })?;
        }
        Command::SingleNeighbor => {
            let count = analytics::single_neighbor_count(&db).await?;
            emit(json, &json!({ "single_neighbor": count }), |_| {
                println!("Nodes with a single neighbour: {}", count)
            })?;
        }
        Command::Rename { old_name, new_name } => {
            let record = rename_node(&db, &old_name, &new_name).await?;
            emit(json, &record, print_rename)?;
        }
        Command::ResumeRename { rename_id } => {
            let record = resume_rename(&db, &rename_id).await?;
            emit(json, &record, print_rename)?;
        }
        Command::ShortestPath { from, to, undirected } => {
            let reach = if undirected { Reach::Undirected } else { Reach::Directed };
            let result = shortest_path(lookup.as_ref(), &from, &to, reach, options).await?;
            emit(json, &result, |result| {
                if result.found() {
                    println!("{}", result.path.join(" -> "));
                } else {
                    println!("No path from {} to {}", from, to);
                }
                println!(
                    "Distance: {} ({} nodes visited)",
                    result.distance_or_sentinel(),
                    result.nodes_visited
                );
            })?;
        }
        Command::DistantSynonyms { node, distance } => {
            let distance = validate_distance(distance)?;
            let matches = distant_synonyms(lookup.as_ref(), &node, distance, &config.traversal, options).await?;
            emit(json, &matches, |matches| print_matches("synonyms", &node, distance, matches))?;
        }
        Command::DistantAntonyms { node, distance } => {
            let distance = validate_distance(distance)?;
            let matches = distant_antonyms(lookup.as_ref(), &node, distance, &config.traversal, options).await?;
            emit(json, &matches, |matches| print_matches("antonyms", &node, distance, matches))?;
        }
    }

    Ok(())
}
