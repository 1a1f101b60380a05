pub mod config;
pub mod error;
pub mod db;
pub mod ingest;
pub mod graph;

pub use config::Config;
pub use error::{KgraphError, Result};
pub use graph::{Edge, Node};
pub use ingest::{load_file, LoadReport};
