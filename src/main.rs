//! # Ficus CLI (`ficus`)
//!
//! The `ficus` binary runs crawls, inspects fact datasources and manages
//! Lua crawl scripts.
//!
//! ## Usage
//!
//! ```bash
//! ficus --config ./config/ficus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ficus init` | Create the coordination database and run schema migrations |
//! | `ficus crawls` | List configured crawl definitions |
//! | `ficus run <site> <project> <code>` | Execute one crawl |
//! | `ficus run-all` | Execute every configured crawl concurrently |
//! | `ficus query <fd> "<sql>"` | Run a query template against a fact datasource |
//! | `ficus script init <name>` | Scaffold a Lua crawl script |
//! | `ficus script test <path>` | Run a Lua crawl script without forwarding output |
//!
//! ## Examples
//!
//! ```bash
//! # Run a batch crawl, capped at 3 pages
//! ficus run shop catalog products --param maxPages_=3
//!
//! # Second page of a query, with the total count
//! ficus query products "SELECT * FROM products WHERE price > #{min}" \
//!     --param min=10 --param pageNum_=2 --param needCount_=true
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ficus::config::{self, Config};
use ficus::crawl_script;
use ficus::datasource::DataSourceRegistry;
use ficus::migrate;
use ficus::models::{CrawlKey, ExecutionParams, QueryResult};
use ficus::registry::CrawlRegistry;
use ficus::runner::Runner;

/// Ficus CLI: distributed crawl execution with SQL fact datasources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ficus.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ficus",
    about = "Ficus: run crawl jobs and write their records to SQL fact datasources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ficus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the coordination database.
    ///
    /// Creates the SQLite file named by `[db].path` and the cache table.
    /// Safe to run more than once.
    Init,

    /// List configured crawl definitions.
    Crawls,

    /// Execute one crawl.
    ///
    /// Prints the result code and message. Exits non-zero when the crawl
    /// fails.
    Run {
        site: String,
        project_code: String,
        code: String,
        /// Extra parameters as `key=value` pairs. Values that parse as JSON
        /// (numbers, booleans) keep their type.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Execute every configured crawl concurrently.
    RunAll,

    /// Run a query template against a fact datasource.
    ///
    /// `${key}` is substituted as text and `#{key}` is bound as a
    /// parameter. Pass `pageNum_`, `pageSize_` and `needCount_` to page.
    Query {
        /// Fact datasource code.
        fd_code: String,
        sql: String,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Manage Lua crawl scripts.
    Script {
        #[command(subcommand)]
        action: ScriptAction,
    },
}

#[derive(Subcommand)]
enum ScriptAction {
    /// Scaffold a new crawl script from a template.
    ///
    /// Creates `crawlers/<name>.lua`.
    Init {
        name: String,
        /// Generate a paged (`BATCH`) crawl.
        #[arg(long)]
        batch: bool,
    },
    /// Run a crawl script once and print the returned records.
    ///
    /// Nothing is written to any datasource.
    Test {
        path: PathBuf,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Call `crawler.crawl_page` for this page instead of `crawler.crawl`.
        #[arg(long)]
        page: Option<u64>,
    },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn params_map(pairs: Vec<(String, String)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = match serde_json::from_str::<Value>(&v) {
                Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => parsed,
                _ => Value::String(v),
            };
            (k, value)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Script commands work without a config file.
    let command = match cli.command {
        Commands::Script { action } => {
            match action {
                ScriptAction::Init { name, batch } => {
                    let path = crawl_script::scaffold_crawler(&name, batch)?;
                    println!("Created crawl script: {}", path.display());
                }
                ScriptAction::Test { path, params, page } => {
                    let params = ExecutionParams::from(params_map(params));
                    crawl_script::test_script(&path, &params, page).await?;
                }
            }
            return Ok(());
        }
        other => other,
    };

    let cfg = config::load_config(&cli.config)?;

    match command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawls => list_crawls(&cfg),
        Commands::Run {
            site,
            project_code,
            code,
            params,
        } => {
            let runner = Runner::from_config(&cfg).await?;
            let key = CrawlKey::new(site, project_code, code);
            let result = runner.dispatch(&key, params_map(params)).await?;
            println!("{:?}: {}", result.code, result.message);
            if !result.is_success() {
                bail!("crawl {} failed", key);
            }
        }
        Commands::RunAll => {
            let runner = Arc::new(Runner::from_config(&cfg).await?);
            let keys: Vec<CrawlKey> = cfg.crawls.iter().map(|d| d.key()).collect();
            let results = runner.dispatch_all(keys.clone()).await;
            let mut failed = 0;
            for (key, result) in keys.iter().zip(&results) {
                if !result.is_success() {
                    failed += 1;
                }
                println!("{:<40} {:?}: {}", key.to_string(), result.code, result.message);
            }
            if failed > 0 {
                bail!("{} of {} crawls failed", failed, results.len());
            }
        }
        Commands::Query {
            fd_code,
            sql,
            params,
        } => {
            let registry = DataSourceRegistry::from_config(&cfg).await?;
            let context = registry.context(&fd_code)?;
            let params = ExecutionParams::from(params_map(params));
            let result = context.query(&sql, &params).await?;
            for row in result.rows() {
                println!("{}", Value::Object(row.clone()));
            }
            if let QueryResult::Page(page) = &result {
                eprintln!(
                    "page {} (size {}): {} rows{}",
                    page.page_num,
                    page.page_size,
                    page.rows.len(),
                    page.total
                        .map(|t| format!(", {} total", t))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Script { .. } => unreachable!(),
    }

    Ok(())
}

fn list_crawls(cfg: &Config) {
    let registry = CrawlRegistry::from_config(cfg);
    if registry.is_empty() {
        println!("No crawls configured.");
        return;
    }

    println!(
        "{:<12} {:<16} {:<20} {:<8} SOURCE",
        "SITE", "PROJECT", "CODE", "TYPE"
    );
    for definition in registry.list() {
        let source = definition
            .script
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(registered)".to_string());
        println!(
            "{:<12} {:<16} {:<20} {:<8} {}",
            definition.site,
            definition.project_code,
            definition.code,
            definition.crawl_type.to_string(),
            source
        );
    }
}
