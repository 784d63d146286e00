//! Configuration parsing and validation.
//!
//! Ficus is configured through a TOML file (default: `config/ficus.toml`):
//!
//! ```toml
//! [db]
//! path = "data/ficus.sqlite"        # coordination database (cache, claims)
//!
//! [logging]
//! dir = "logs"                      # per-execution task logs; console when absent
//!
//! [execution]
//! distributed = true
//! insert_retries = 5
//!
//! [cache]
//! backend = "sqlite"                # or "memory"
//!
//! [sources.warehouse]
//! path = "data/warehouse.sqlite"
//!
//! [datasources.products]
//! source = "warehouse"
//! table = "products"
//! primary_key = "sku"
//!
//! [[crawls]]
//! site = "shop"
//! project_code = "catalog"
//! code = "products"
//! type = "BATCH"
//! script = "crawlers/products.lua"
//! output_fd_codes = ["products"]
//!
//! [services.catalog]
//! instances = ["http://10.0.0.5:8080"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::models::{CrawlDefinition, FactDatasource};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
    #[serde(default)]
    pub crawls: Vec<CrawlDefinition>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for per-execution task log files.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub distributed: bool,
    #[serde(default = "default_insert_retries")]
    pub insert_retries: u32,
    /// Upper bound on pages a batch crawl may request in one run.
    #[serde(default = "default_max_pages")]
    pub max_pages: u64,
    /// Seconds a crawl or page claim stays valid without renewal. A crawl
    /// whose worker died is retried once its lease has run out.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            distributed: false,
            insert_retries: default_insert_retries(),
            max_pages: default_max_pages(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

fn default_insert_retries() -> u32 {
    5
}
fn default_max_pages() -> u64 {
    10_000
}

fn default_lock_lease_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
        }
    }
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

/// A physical SQLite database that fact datasources live in.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasourceConfig {
    pub source: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_dialect")]
    pub dialect: String,
}

fn default_primary_key() -> String {
    "id".to_string()
}
fn default_dialect() -> String {
    "sqlite".to_string()
}

impl DatasourceConfig {
    pub fn to_fact_datasource(&self, code: &str) -> FactDatasource {
        FactDatasource {
            code: code.to_string(),
            source_name: self.source.clone(),
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            dialect: self.dialect.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

fn default_service_timeout() -> u64 {
    30
}

impl Config {
    /// A config with no sources, datasources or crawls. Used by commands
    /// that can run without a config file (`ficus script test`).
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("data/ficus.sqlite"),
            },
            logging: LoggingConfig::default(),
            execution: ExecutionConfig::default(),
            cache: CacheConfig::default(),
            sources: BTreeMap::new(),
            datasources: BTreeMap::new(),
            crawls: Vec::new(),
            services: BTreeMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-references between sections.
pub fn validate(config: &Config) -> Result<()> {
    match config.cache.backend.as_str() {
        "memory" | "sqlite" => {}
        other => bail!(
            "Unknown cache backend: '{}'. Must be memory or sqlite.",
            other
        ),
    }

    if config.execution.insert_retries > 20 {
        bail!("execution.insert_retries must be <= 20");
    }
    if config.execution.max_pages == 0 {
        bail!("execution.max_pages must be > 0");
    }
    if config.execution.lock_lease_secs == 0 {
        bail!("execution.lock_lease_secs must be > 0");
    }

    for (code, ds) in &config.datasources {
        if !config.sources.contains_key(&ds.source) {
            bail!(
                "datasources.{}: unknown source '{}'",
                code,
                ds.source
            );
        }
        if ds.table.trim().is_empty() {
            bail!("datasources.{}: table must not be empty", code);
        }
        // Configured sources are SQLite databases. Other dialects need a
        // Dao registered through `DataSourceRegistry::register_source`.
        let dialect = crate::sql::SqlDialect::by_name(&ds.dialect);
        if dialect.as_ref().map(|d| d.name.as_str()) != Some("sqlite") {
            bail!(
                "datasources.{}: dialect '{}' is not supported by sqlite source '{}'",
                code,
                ds.dialect,
                ds.source
            );
        }
    }

    let mut seen = HashSet::new();
    for crawl in &config.crawls {
        let key = crawl.key();
        if !seen.insert(key.clone()) {
            bail!("duplicate crawl definition: {}", key);
        }
        for fd in &crawl.output_fd_codes {
            if !config.datasources.contains_key(fd) {
                bail!("crawl {}: unknown output datasource '{}'", key, fd);
            }
        }
    }

    for (name, svc) in &config.services {
        if svc.timeout_secs == 0 {
            bail!("services.{}: timeout_secs must be > 0", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CrawlType;

    const SAMPLE: &str = r#"
[db]
path = "data/ficus.sqlite"

[execution]
distributed = true

[sources.warehouse]
path = "data/warehouse.sqlite"

[datasources.products]
source = "warehouse"
table = "main.products"
primary_key = "sku"

[[crawls]]
site = "shop"
project_code = "catalog"
code = "products"
type = "BATCH"
script = "crawlers/products.lua"
output_fd_codes = ["products"]

[crawls.params]
category = "books"
"#;

    #[test]
    fn parse_and_validate_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        validate(&config).unwrap();

        assert!(config.execution.distributed);
        assert_eq!(config.execution.insert_retries, 5);
        assert_eq!(config.execution.lock_lease_secs, 600);
        assert_eq!(config.cache.backend, "memory");

        let ds = config.datasources["products"].to_fact_datasource("products");
        assert_eq!(ds.primary_key, "sku");
        assert_eq!(ds.table, "main.products");

        let crawl = &config.crawls[0];
        assert_eq!(crawl.crawl_type, CrawlType::Batch);
        assert_eq!(crawl.params["category"], "books");
        assert_eq!(crawl.timeout, 600);
    }

    #[test]
    fn unknown_output_datasource_is_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.crawls[0].output_fd_codes.push("missing".into());
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("missing"), "{}", err);
    }

    #[test]
    fn non_sqlite_dialect_is_rejected() {
        for dialect in ["postgres", "mysql", "oracle"] {
            let mut config: Config = toml::from_str(SAMPLE).unwrap();
            config.datasources.get_mut("products").unwrap().dialect = dialect.into();
            let err = validate(&config).unwrap_err().to_string();
            assert!(err.contains(dialect), "{}", err);
            assert!(err.contains("warehouse"), "{}", err);
        }
    }

    #[test]
    fn unknown_cache_backend_is_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.cache.backend = "redis".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn duplicate_crawls_are_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let dup = config.crawls[0].clone();
        config.crawls.push(dup);
        assert!(validate(&config).is_err());
    }
}
