use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::pool::{Backoff, PoolOptions};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,
}

/// Backing store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            migrations_dir: default_migrations_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Backoff strategy between attempts of a failed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// Bulk loader configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_parser_threads")]
    pub parser_threads: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_dedup_edges")]
    pub dedup_edges: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            parser_threads: default_parser_threads(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            backoff_ms: default_backoff_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            dedup_edges: default_dedup_edges(),
        }
    }
}

impl LoaderConfig {
    /// Build the write pool options described by this section
    pub fn pool_options(&self) -> PoolOptions {
        let base = Duration::from_millis(self.backoff_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Linear => Backoff::Linear(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(self.backoff_max_ms),
            },
        };
        PoolOptions {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            max_attempts: self.max_attempts,
            backoff,
        }
    }
}

/// Traversal configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TraversalConfig {
    #[serde(default = "default_synonym_relation")]
    pub synonym_relation: String,
    #[serde(default = "default_antonym_relation")]
    pub antonym_relation: String,
    /// Per-call deadline in milliseconds, 0 disables it
    #[serde(default)]
    pub timeout_ms: u64,
    /// Neighbor lookup LRU capacity, 0 disables caching
    #[serde(default)]
    pub cache_capacity: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            synonym_relation: default_synonym_relation(),
            antonym_relation: default_antonym_relation(),
            timeout_ms: 0,
            cache_capacity: 0,
        }
    }
}

impl TraversalConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("kgraph.db")
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    8
}

fn default_parser_threads() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Linear
}

fn default_backoff_ms() -> u64 {
    3000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_dedup_edges() -> bool {
    true
}

fn default_synonym_relation() -> String {
    "synonym".to_string()
}

fn default_antonym_relation() -> String {
    "antonym".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KGRAPH_CONFIG environment variable
    /// 2. ./kgraph.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();
        Self::load_from(&config_path())
    }

    /// Like [`Config::load`], but falls back to defaults when no config file exists
    pub fn load_or_default() -> Result<Self> {
        let _ = dotenv::dotenv();
        let path = config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            log::debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let loader = &self.loader;
        if loader.batch_size == 0 {
            anyhow::bail!("loader.batch_size must be greater than 0");
        }
        if loader.workers == 0 {
            anyhow::bail!("loader.workers must be greater than 0");
        }
        if loader.parser_threads == 0 {
            anyhow::bail!("loader.parser_threads must be greater than 0");
        }
        if loader.queue_capacity == 0 {
            anyhow::bail!("loader.queue_capacity must be greater than 0");
        }
        if loader.max_attempts == 0 {
            anyhow::bail!("loader.max_attempts must be at least 1");
        }
        if loader.backoff == BackoffKind::Exponential && loader.backoff_max_ms < loader.backoff_ms {
            anyhow::bail!("loader.backoff_max_ms must not be less than loader.backoff_ms");
        }

        let traversal = &self.traversal;
        if traversal.synonym_relation.trim().is_empty() || traversal.antonym_relation.trim().is_empty() {
            anyhow::bail!("traversal relation labels must not be empty");
        }
        if traversal.synonym_relation == traversal.antonym_relation {
            anyhow::bail!(
                "traversal.synonym_relation and traversal.antonym_relation must differ (both are {:?})",
                traversal.synonym_relation
            );
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.store.db_path
    }

    /// Get the migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.store.migrations_dir
    }
}

fn config_path() -> PathBuf {
    std::env::var("KGRAPH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("kgraph.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn write_config(temp_dir: &TempDir, body: &str) -> PathBuf {
        let path = temp_dir.path().join("kgraph.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_config_load_full_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[store]
db_path = "./graph.db"
log_level = "debug"

[loader]
batch_size = 250
workers = 3
max_attempts = 7
backoff = "exponential"
backoff_ms = 100
backoff_max_ms = 1000

[traversal]
synonym_relation = "/r/Synonym"
antonym_relation = "/r/Antonym"
timeout_ms = 1500
cache_capacity = 512
"#,
        );

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.store.log_level, "debug");
        assert_eq!(config.db_path(), Path::new("./graph.db"));
        assert_eq!(config.migrations_dir(), Path::new("migrations"));
        assert_eq!(config.loader.batch_size, 250);
        assert_eq!(config.loader.workers, 3);
        assert_eq!(config.loader.parser_threads, 4);
        assert_eq!(config.loader.backoff, BackoffKind::Exponential);
        assert_eq!(config.traversal.synonym_relation, "/r/Synonym");
        assert_eq!(config.traversal.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_config_empty_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.loader.batch_size, 100);
        assert_eq!(config.loader.max_attempts, 5);
        assert_eq!(config.loader.backoff, BackoffKind::Linear);
        assert_eq!(config.traversal.antonym_relation, "antonym");
        assert_eq!(config.traversal.timeout(), None);
    }

    #[test]
    fn test_config_rejects_zero_batch_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[loader]\nbatch_size = 0\n");
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_config_rejects_identical_relations() {
        let mut config = Config::default();
        config.traversal.antonym_relation = "synonym".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_inverted_backoff_bounds() {
        let mut config = Config::default();
        config.loader.backoff = BackoffKind::Exponential;
        config.loader.backoff_ms = 500;
        config.loader.backoff_max_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_options_from_loader() {
        let mut loader = LoaderConfig::default();
        loader.backoff = BackoffKind::Exponential;
        loader.backoff_ms = 10;
        loader.backoff_max_ms = 40;
        let options = loader.pool_options();
        assert_eq!(options.workers, 8);
        assert_eq!(options.max_attempts, 5);
        assert_eq!(
            options.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(10),
                max: Duration::from_millis(40),
            }
        );
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("KGRAPH_CONFIG").ok();
        std::env::set_var("KGRAPH_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        let fallback = Config::load_or_default();
        assert!(fallback.is_ok());
        std::env::remove_var("KGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("KGRAPH_CONFIG", v);
        }
    }
}
