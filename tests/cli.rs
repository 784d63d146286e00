//! End-to-end tests for the `ficus` binary.
//!
//! Each test builds a throwaway workspace (config, coordination database,
//! warehouse database, Lua crawl script) under a temp dir and drives the
//! CLI as a subprocess.

use ficus::config::SourceConfig;
use ficus::db;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn ficus_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ficus"))
}

const PRODUCTS_SCRIPT: &str = r#"
crawler = { name = "products" }

function crawler.crawl(params)
    crawl.message("catalog " .. params.catalog)
    return {
        { sku = "A1", name = "anchor", price = 0.5 },
        { sku = "B2", name = "bucket", price = 1.5 },
        { sku = "C3", name = "chain",  price = 2.5 },
    }
end
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("crawlers")).unwrap();
    fs::write(root.join("crawlers/products.lua"), PRODUCTS_SCRIPT).unwrap();

    let config = format!(
        r#"[db]
path = "{root}/data/ficus.sqlite"

[cache]
backend = "sqlite"

[sources.warehouse]
path = "{root}/data/warehouse.sqlite"

[datasources.products]
source = "warehouse"
table = "products"
primary_key = "sku"

[[crawls]]
site = "shop"
project_code = "catalog"
code = "products"
type = "SIMPLE"
script = "{root}/crawlers/products.lua"
output_fd_codes = ["products"]

[crawls.params]
catalog = "${{FICUS_CLI_TEST_CATALOG}}"
"#,
        root = root.display()
    );
    let config_path = root.join("config/ficus.toml");
    fs::write(&config_path, config).unwrap();

    (tmp, config_path)
}

async fn create_products_table(root: &Path) {
    let pool = db::connect_source(&SourceConfig {
        path: root.join("data/warehouse.sqlite"),
        max_connections: 1,
    })
    .await
    .unwrap();
    sqlx::query("CREATE TABLE products (sku TEXT PRIMARY KEY, name TEXT, price REAL)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

fn run_ficus(config: &Path, args: &[&str]) -> Output {
    Command::new(ficus_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env("FICUS_CLI_TEST_CATALOG", "spring")
        .output()
        .expect("failed to run ficus")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config) = setup_test_env();

    let first = run_ficus(&config, &["init"]);
    assert!(first.status.success(), "{:?}", first);
    assert!(stdout(&first).contains("Database initialized successfully."));
    assert!(tmp.path().join("data/ficus.sqlite").exists());

    let second = run_ficus(&config, &["init"]);
    assert!(second.status.success());
}

#[test]
fn test_crawls_lists_definitions() {
    let (_tmp, config) = setup_test_env();

    let output = run_ficus(&config, &["crawls"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("products"));
    assert!(text.contains("SIMPLE"));
    assert!(text.contains("products.lua"));
}

#[tokio::test]
async fn test_run_upserts_and_query_reads_back() {
    let (tmp, config) = setup_test_env();
    assert!(run_ficus(&config, &["init"]).status.success());
    create_products_table(tmp.path()).await;

    let first = run_ficus(&config, &["run", "shop", "catalog", "products"]);
    assert!(first.status.success(), "{:?}", first);
    let text = stdout(&first);
    assert!(text.contains("inserted 3, updated 0, failed 0"), "{}", text);
    assert!(text.contains("catalog spring"), "{}", text);

    let second = run_ficus(&config, &["run", "shop", "catalog", "products"]);
    assert!(stdout(&second).contains("inserted 0, updated 3, failed 0"));

    let query = run_ficus(
        &config,
        &[
            "query",
            "products",
            "SELECT sku FROM products WHERE price > #{min} ORDER BY sku",
            "--param",
            "min=1",
        ],
    );
    assert!(query.status.success(), "{:?}", query);
    let lines: Vec<String> = stdout(&query).lines().map(str::to_string).collect();
    assert_eq!(lines, vec![r#"{"sku":"B2"}"#, r#"{"sku":"C3"}"#]);
}

#[test]
fn test_run_unknown_crawl_fails() {
    let (_tmp, config) = setup_test_env();

    let output = run_ficus(&config, &["run", "shop", "catalog", "missing"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown crawl"), "{}", stderr);
}

#[test]
fn test_script_test_prints_records() {
    let (tmp, config) = setup_test_env();
    let script = tmp.path().join("crawlers/products.lua");

    let output = run_ficus(
        &config,
        &[
            "script",
            "test",
            script.to_str().unwrap(),
            "--param",
            "catalog=autumn",
        ],
    );
    assert!(output.status.success(), "{:?}", output);
    let text = stdout(&output);
    assert!(text.contains("Returned 3 records"), "{}", text);
    assert!(text.contains("message: catalog autumn"), "{}", text);
}

#[test]
fn test_script_init_scaffolds_template() {
    let tmp = TempDir::new().unwrap();

    let output = Command::new(ficus_binary())
        .current_dir(tmp.path())
        .args(["script", "init", "listings", "--batch"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{:?}", output);

    let body = fs::read_to_string(tmp.path().join("crawlers/listings.lua")).unwrap();
    assert!(body.contains("function crawler.crawl_page(params, page)"));
    assert!(body.contains(r#"type = "BATCH""#));

    let again = Command::new(ficus_binary())
        .current_dir(tmp.path())
        .args(["script", "init", "listings"])
        .output()
        .unwrap();
    assert!(!again.status.success());
}
