//! Lua scripted crawls.
//!
//! A crawl definition with a `script` path runs a `.lua` file in a
//! sandboxed Lua 5.4 VM. The script defines a global `crawler` table whose
//! entry point depends on the crawl type:
//!
//! | Type | Entry point | Returns |
//! |------|-------------|---------|
//! | `CUSTOM` | `crawler.do_crawl(params)` | list of records, or nil |
//! | `SIMPLE` | `crawler.crawl(params)` | list of records, or nil |
//! | `BATCH` | `crawler.crawl_page(params, page)` | records of page `page`; empty or nil ends the run |
//!
//! `crawl` and `do_crawl` stand in for each other, so one script can serve
//! both `CUSTOM` and `SIMPLE` definitions.
//!
//! # Architecture
//!
//! The Lua VM runs on a blocking thread via [`tokio::task::spawn_blocking`]
//! to avoid blocking the async runtime. A fresh VM is created per call.
//! Host APIs are provided by [`crate::lua_runtime`].
//!
//! # Configuration
//!
//! ```toml
//! [[crawls]]
//! site = "shop"
//! project_code = "catalog"
//! code = "products"
//! type = "BATCH"
//! script = "crawlers/products.lua"
//! timeout = 600
//! output_fd_codes = ["products"]
//!
//! [crawls.params]
//! base_url = "https://api.example.com"
//! api_token = "${SHOP_API_TOKEN}"
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use crate::context;
use crate::handler::{BatchCrawl, CacheState, Crawl, DoCrawl};
use crate::lua_runtime::{json_value_to_lua, lua_value_to_json, register_all_host_apis, HostBindings};
use crate::models::{CrawlDefinition, ExecutionParams, Record};
use crate::service::ServiceCaller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    DoCrawl,
    Crawl,
    CrawlPage(u64),
}

impl Entry {
    /// Global function names to try, in order.
    fn functions(self) -> &'static [&'static str] {
        match self {
            Entry::DoCrawl => &["do_crawl", "crawl"],
            Entry::Crawl => &["crawl", "do_crawl"],
            Entry::CrawlPage(_) => &["crawl_page"],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Crawl trait implementations
// ═══════════════════════════════════════════════════════════════════════

/// A crawl implemented by a Lua script.
///
/// Implements [`DoCrawl`], [`Crawl`] and [`BatchCrawl`], so the same type
/// backs every handler variant.
pub struct LuaCrawl {
    path: PathBuf,
    name: String,
    timeout: u64,
    services: Option<Arc<dyn ServiceCaller>>,
}

impl LuaCrawl {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, timeout: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            timeout,
            services: None,
        }
    }

    /// The script crawl for `definition`, when it names a script.
    pub fn from_definition(definition: &CrawlDefinition) -> Option<Self> {
        let path = definition.script.as_ref()?;
        Some(Self::new(
            path.clone(),
            definition.key().local_code(),
            definition.timeout,
        ))
    }

    pub fn with_services(mut self, services: Option<Arc<dyn ServiceCaller>>) -> Self {
        self.services = services;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run(
        &self,
        entry: Entry,
        params: &ExecutionParams,
        state: Option<&dyn CacheState>,
    ) -> Result<Option<Vec<Record>>> {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let host = HostBindings {
            script_name: format!("crawl:{}", self.name),
            logger: state.map(|s| s.task_logger()),
            cache: state.map(|s| s.cache_scope()),
            services: self.services.clone(),
            runtime: Handle::current(),
            messages: messages.clone(),
        };
        let path = self.path.clone();
        let name = self.name.clone();
        let params = params.clone();
        let timeout = self.timeout;

        let result = tokio::task::spawn_blocking(move || {
            run_lua_crawl(&path, &name, entry, &params, timeout, &host)
        })
        .await
        .context("Lua crawl task panicked")?;

        if let Ok(mut collected) = messages.lock() {
            for message in collected.drain(..) {
                context::append_message(message);
            }
        }
        result
    }
}

#[async_trait]
impl DoCrawl for LuaCrawl {
    async fn do_crawl(&self, params: &ExecutionParams) -> Result<Option<Vec<Record>>> {
        self.run(Entry::DoCrawl, params, None).await
    }

    fn script_name(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl Crawl for LuaCrawl {
    async fn crawl(
        &self,
        params: &ExecutionParams,
        state: &dyn CacheState,
    ) -> Result<Option<Vec<Record>>> {
        self.run(Entry::Crawl, params, Some(state)).await
    }
}

#[async_trait]
impl BatchCrawl for LuaCrawl {
    async fn crawl_page(
        &self,
        params: &ExecutionParams,
        page: u64,
        state: &dyn CacheState,
    ) -> Result<Option<Vec<Record>>> {
        self.run(Entry::CrawlPage(page), params, Some(state)).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scaffolding and testing
// ═══════════════════════════════════════════════════════════════════════

/// Scaffold a new crawl script from a template.
///
/// Creates `crawlers/<name>.lua` with the entry point for a simple crawl,
/// or for a paged crawl when `batch` is set.
pub fn scaffold_crawler(name: &str, batch: bool) -> Result<PathBuf> {
    let dir = Path::new("crawlers");
    std::fs::create_dir_all(dir)?;

    let path = dir.join(format!("{}.lua", name));
    if path.exists() {
        bail!("Crawl script already exists: {}", path.display());
    }

    let entry = if batch {
        r#"--- Crawl one page. Return an empty table (or nil) when there are no more pages.
--- @param params table Execution parameters (definition params + runtime keys)
--- @param page integer 1-based page number
--- @return table Array of records
function crawler.crawl_page(params, page)
    local records = {}

    -- local resp = http.get(params.base_url .. "/items", {
    --     params = { page = tostring(page), per_page = "100" },
    -- })
    -- if not resp.ok then
    --     error("API error: " .. resp.status)
    -- end
    -- for _, item in ipairs(resp.json.items) do
    --     table.insert(records, { id = item.id, name = item.name })
    -- end

    log.info("page " .. page .. ": " .. #records .. " records")
    return records
end"#
    } else {
        r#"--- Run the crawl once.
--- @param params table Execution parameters (definition params + runtime keys)
--- @return table Array of records
function crawler.crawl(params)
    local records = {}

    -- local resp = http.get(params.base_url .. "/items")
    -- for _, item in ipairs(resp.json) do
    --     table.insert(records, { id = item.id, name = item.name })
    -- end

    crawl.message("fetched " .. #records .. " records")
    return records
end"#
    };

    let crawl_type = if batch { "BATCH" } else { "SIMPLE" };
    let template = format!(
        r#"--[[
  Ficus crawl: {name}

  Definition (add to ficus.toml):

    [[crawls]]
    site = "my-site"
    project_code = "my-project"
    code = "{name}"
    type = "{crawl_type}"
    script = "crawlers/{name}.lua"
    output_fd_codes = []

  Test:
    ficus script test crawlers/{name}.lua{batch_flag}
]]

crawler = {{
    name = "{name}",
    version = "0.1.0",
}}

{entry}
"#,
        name = name,
        crawl_type = crawl_type,
        batch_flag = if batch { " --batch" } else { "" },
        entry = entry,
    );

    std::fs::write(&path, template)?;
    Ok(path)
}

/// Run a crawl script once without forwarding anything.
///
/// Prints the returned records. Used by `ficus script test`.
pub async fn test_script(path: &Path, params: &ExecutionParams, page: Option<u64>) -> Result<()> {
    let crawl = LuaCrawl::new(path, "test", 300);
    let entry = match page {
        Some(page) => Entry::CrawlPage(page),
        None => Entry::Crawl,
    };

    println!("Testing crawl script: {}", path.display());
    let records = context::scope(async {
        context::reset_messages();
        let records = crawl.run(entry, params, None).await;
        for message in context::drain_messages() {
            println!("  message: {}", message);
        }
        records
    })
    .await?;

    let records = records.unwrap_or_default();
    println!("  ✓ Script loaded and executed");
    println!("  ✓ Returned {} records", records.len());

    if records.is_empty() {
        return Ok(());
    }

    println!();
    let show = records.len().min(5);
    println!("Records (first {}):", show);
    for (i, record) in records.iter().take(show).enumerate() {
        println!("  [{}] {}", i, Value::Object(record.clone()));
    }
    if records.len() > show {
        println!("  ... and {} more", records.len() - show);
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Lua VM Execution (blocking)
// ═══════════════════════════════════════════════════════════════════════

/// Load the script in a fresh VM, call its entry point and convert the
/// result. Runs on a blocking thread.
fn run_lua_crawl(
    script_path: &Path,
    name: &str,
    entry: Entry,
    params: &ExecutionParams,
    timeout_secs: u64,
    host: &HostBindings,
) -> Result<Option<Vec<Record>>> {
    let script_src = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read crawl script: {}", script_path.display()))?;

    let lua = Lua::new();

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {} seconds",
                    timeout_secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    register_all_host_apis(&lua, host)?;

    lua.load(&script_src)
        .set_name(script_path.to_string_lossy())
        .exec()
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to execute crawl script {}: {}",
                script_path.display(),
                e
            )
        })?;

    let crawler: LuaTable = lua
        .globals()
        .get::<LuaTable>("crawler")
        .map_err(|e| anyhow::anyhow!("Script must define a global 'crawler' table: {}", e))?;

    let function_name = entry
        .functions()
        .iter()
        .copied()
        .find(|f| matches!(crawler.get::<LuaValue>(*f), Ok(LuaValue::Function(_))))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "crawler.{} function not defined in '{}'",
                entry.functions()[0],
                script_path.display()
            )
        })?;
    let function: LuaFunction = crawler.get::<LuaFunction>(function_name)?;

    let params_table = json_value_to_lua(&lua, &Value::Object(params.as_map().clone()))?;
    let result = match entry {
        Entry::CrawlPage(page) => function.call::<LuaValue>((params_table, page)),
        Entry::DoCrawl | Entry::Crawl => function.call::<LuaValue>(params_table),
    }
    .map_err(|e| {
        anyhow::anyhow!(
            "crawler.{}() failed in '{}': {}",
            function_name,
            script_path.display(),
            e
        )
    })?;

    lua_result_to_records(result, name)
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: Lua → Record
// ═══════════════════════════════════════════════════════════════════════

/// Convert a script's return value into records.
///
/// `nil` means no output. Entries that are not tables with named fields are
/// skipped with a warning.
fn lua_result_to_records(value: LuaValue, crawl_name: &str) -> Result<Option<Vec<Record>>> {
    match lua_value_to_json(value)? {
        Value::Null => Ok(None),
        // An empty Lua table converts to an empty object.
        Value::Object(map) if map.is_empty() => Ok(Some(Vec::new())),
        Value::Object(map) => Ok(Some(vec![map])),
        Value::Array(items) => {
            let mut records = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(record) => records.push(record),
                    other => tracing::warn!(
                        crawl = crawl_name,
                        index = idx + 1,
                        "skipping non-record entry in crawl result: {}",
                        other
                    ),
                }
            }
            Ok(Some(records))
        }
        other => bail!(
            "crawl script must return a list of records, got {}",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(tmp: &TempDir, body: &str) -> PathBuf {
        let path = tmp.path().join("crawl.lua");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn do_crawl_returns_records() {
        let tmp = TempDir::new().unwrap();
        let path = script(
            &tmp,
            r#"
crawler = {}
function crawler.do_crawl(params)
    crawl.message("hello from " .. params.code_)
    return { { id = 1, name = params.code_ }, "junk", { id = 2 } }
end
"#,
        );
        let crawl = LuaCrawl::new(&path, "t", 30);
        let params = ExecutionParams::new().with("code_", "items");

        let (records, messages) = context::scope(async {
            context::reset_messages();
            let records = crawl.do_crawl(&params).await.unwrap().unwrap();
            (records, context::drain_messages())
        })
        .await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "items");
        assert_eq!(messages, vec!["hello from items".to_string()]);
    }

    #[tokio::test]
    async fn nil_and_empty_results() {
        let tmp = TempDir::new().unwrap();
        let path = script(
            &tmp,
            r#"
crawler = {}
function crawler.do_crawl(params)
    if params.empty then return {} end
    return nil
end
"#,
        );
        let crawl = LuaCrawl::new(&path, "t", 30);
        assert!(crawl
            .do_crawl(&ExecutionParams::new())
            .await
            .unwrap()
            .is_none());
        let empty = crawl
            .do_crawl(&ExecutionParams::new().with("empty", true))
            .await
            .unwrap();
        assert_eq!(empty, Some(Vec::new()));
    }

    #[tokio::test]
    async fn script_errors_surface() {
        let tmp = TempDir::new().unwrap();
        let path = script(
            &tmp,
            r#"
crawler = {}
function crawler.do_crawl(params)
    error("upstream down")
end
"#,
        );
        let err = LuaCrawl::new(&path, "t", 30)
            .do_crawl(&ExecutionParams::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upstream down"), "{}", err);
    }

    #[tokio::test]
    async fn missing_entry_point_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = script(&tmp, "crawler = {}\n");
        let err = LuaCrawl::new(&path, "t", 30)
            .do_crawl(&ExecutionParams::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("do_crawl"), "{}", err);
    }
}
