//! Crawl handlers and their shared lifecycle.
//!
//! A handler turns one parameter map into one [`CrawlResult`]. The three
//! variants differ only in how they call user code:
//!
//! | Handler | Type | User code |
//! |---------|------|-----------|
//! | [`ScriptHandler`] | `CUSTOM` | [`DoCrawl::do_crawl`], e.g. a Lua script or a closure |
//! | [`SimpleHandler`] | `SIMPLE` | [`Crawl::crawl`] once |
//! | [`BatchHandler`] | `BATCH` | [`BatchCrawl::crawl_page`] page after page |
//!
//! # Lifecycle
//!
//! ```text
//! identity? ──no──▶ FAIL "missing crawl identity"
//!     │
//! definition of this type? ──no──▶ FAIL "crawl not found or wrong type"
//!     │
//! task logger (no-op on factory failure)
//!     │
//! enter execution context ─────────────────────────────┐
//!     │                                                │
//! distributed? claim lock:{local_code}                 │
//!     │  held ──▶ SUCCESS "skipped: ..."               │
//!     │  won: seed caches                              │
//!     │                                                │
//! user code ──error/panic──▶ FAIL "execution failed"   │
//!     │                                                │
//! forward records ──error──▶ FAIL "failed to send ..." │
//!     │                                                │
//! release claim, clear context ◀───────────────────────┘
//! ```
//!
//! The lock carries a lease (`HandlerEnv::lock_lease`). If a worker dies
//! or its execution is dropped before cleanup, another worker takes the
//! lock over once the lease has run out. Batch crawls renew it per page.

pub mod batch;
pub mod script;
pub mod simple;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{CacheClient, Claim};
use crate::context::{self, ContextGuard};
use crate::models::{
    CrawlDefinition, CrawlKey, CrawlResult, CrawlType, ExecutionParams, ImportStats, Record,
    PARAM_LOG_ID, PARAM_PROCESS_CACHE, PARAM_PROCESS_ID, PARAM_TASK_CACHE,
};
use crate::output::OutputSink;
use crate::registry::CrawlDefinitionSource;
use crate::task_logger::{NoopTaskLogger, TaskLogger, TaskLoggerFactory};

pub use batch::{BatchCrawl, BatchHandler};
pub use script::{crawl_fn, DoCrawl, FnCrawl, ScriptHandler};
pub use simple::{Crawl, SimpleHandler};

pub const MISSING_IDENTITY: &str = "missing crawl identity";
pub const NOT_FOUND: &str = "crawl not found or wrong type";
pub const SKIPPED_ELSEWHERE: &str = "skipped: crawl already running elsewhere";

/// Default lease on crawl and page claims.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(600);

/// Executes crawls of one [`CrawlType`].
///
/// Handlers never return errors: every failure, including a panic in user
/// code, ends up as a [`CrawlResult`] with code `FAIL`.
#[async_trait]
pub trait CrawlHandler: Send + Sync {
    fn crawl_type(&self) -> CrawlType;

    async fn execute(&self, params: ExecutionParams) -> CrawlResult;
}

/// Cache and logging capabilities offered to user crawl code.
///
/// Task values are scoped to the crawl (`{local_code}:{key}`), process
/// values to the process id (`{process_id}:{key}`). Lookups check the task
/// scope first.
#[async_trait]
pub trait CacheState: Send + Sync {
    async fn set_cache_value(&self, key: &str, value: Value) -> Result<()>;

    async fn set_cache_value_from_process(&self, key: &str, value: Value) -> Result<()>;

    async fn get_cache_value(&self, key: &str) -> Result<Option<Value>>;

    fn task_logger(&self) -> Arc<dyn TaskLogger>;

    /// An owned handle on the same cache scopes, for code that must outlive
    /// the borrow (blocking script threads).
    fn cache_scope(&self) -> CacheScope;
}

/// Key scoping for the task and process cache namespaces.
#[derive(Clone)]
pub struct CacheScope {
    cache: Arc<dyn CacheClient>,
    local_code: String,
    process_id: String,
}

impl CacheScope {
    pub fn new(
        cache: Arc<dyn CacheClient>,
        local_code: impl Into<String>,
        process_id: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            local_code: local_code.into(),
            process_id: process_id.into(),
        }
    }

    fn task_key(&self, key: &str) -> String {
        format!("{}:{}", self.local_code, key)
    }

    fn process_key(&self, key: &str) -> String {
        format!("{}:{}", self.process_id, key)
    }

    pub async fn set_task(&self, key: &str, value: Value) -> Result<()> {
        self.cache.set_value(&self.task_key(key), value).await
    }

    pub async fn set_process(&self, key: &str, value: Value) -> Result<()> {
        self.cache.set_value(&self.process_key(key), value).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.cache.get(&self.task_key(key)).await? {
            return Ok(Some(value));
        }
        self.cache.get(&self.process_key(key)).await
    }
}

/// Collaborators shared by every handler.
pub struct HandlerEnv {
    pub definitions: Arc<dyn CrawlDefinitionSource>,
    pub cache: Arc<dyn CacheClient>,
    pub loggers: Arc<dyn TaskLoggerFactory>,
    pub output: Arc<dyn OutputSink>,
    /// Coordinate through the cache so a crawl runs on one node at a time.
    pub distributed: bool,
    /// Page cap for batch crawls that do not pass `maxPages_`.
    pub max_pages: u64,
    /// How long a claim stays valid without renewal.
    pub lock_lease: Duration,
}

impl HandlerEnv {
    pub fn new(
        definitions: Arc<dyn CrawlDefinitionSource>,
        cache: Arc<dyn CacheClient>,
        loggers: Arc<dyn TaskLoggerFactory>,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            definitions,
            cache,
            loggers,
            output,
            distributed: false,
            max_pages: 10_000,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-execution session
// ═══════════════════════════════════════════════════════════════════════

/// State owned by one execution: its identity, cache scopes and logger.
/// Dropped when the execution ends.
pub struct CrawlSession {
    scope: CacheScope,
    key: CrawlKey,
    log_id: String,
    logger: Arc<dyn TaskLogger>,
}

impl CrawlSession {
    pub fn key(&self) -> &CrawlKey {
        &self.key
    }

    pub fn local_code(&self) -> &str {
        &self.scope.local_code
    }

    pub fn process_id(&self) -> &str {
        &self.scope.process_id
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn cache(&self) -> &Arc<dyn CacheClient> {
        &self.scope.cache
    }

    /// Apply the `__processCache__` and `__taskCache__` objects.
    async fn seed(&self, params: &ExecutionParams) -> Result<()> {
        if let Some(Value::Object(values)) = params.get(PARAM_PROCESS_CACHE) {
            for (k, v) in values {
                self.set_cache_value_from_process(k, v.clone()).await?;
            }
        }
        if let Some(Value::Object(values)) = params.get(PARAM_TASK_CACHE) {
            for (k, v) in values {
                self.set_cache_value(k, v.clone()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheState for CrawlSession {
    async fn set_cache_value(&self, key: &str, value: Value) -> Result<()> {
        self.scope.set_task(key, value).await
    }

    async fn set_cache_value_from_process(&self, key: &str, value: Value) -> Result<()> {
        self.scope.set_process(key, value).await
    }

    async fn get_cache_value(&self, key: &str) -> Result<Option<Value>> {
        self.scope.get(key).await
    }

    fn task_logger(&self) -> Arc<dyn TaskLogger> {
        self.logger.clone()
    }

    fn cache_scope(&self) -> CacheScope {
        self.scope.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════

/// Everything the handler-specific body needs.
pub(crate) struct Execution {
    pub session: Arc<CrawlSession>,
    pub params: ExecutionParams,
    pub definition: CrawlDefinition,
    /// The crawl lock, held in distributed mode.
    pub lock: Option<Arc<Claim>>,
}

#[derive(Debug)]
pub(crate) enum CrawlFailure {
    /// User code returned an error or panicked.
    Execution(String),
    /// Records could not be forwarded.
    Output(String),
}

/// Run `body` inside the shared lifecycle, in a fresh execution-context
/// scope unless the caller already opened one.
pub(crate) async fn run_lifecycle<B, Fut>(
    env: &HandlerEnv,
    crawl_type: CrawlType,
    params: ExecutionParams,
    body: B,
) -> CrawlResult
where
    B: FnOnce(Execution) -> Fut + Send,
    Fut: Future<Output = Result<ImportStats, CrawlFailure>> + Send,
{
    let run = lifecycle(env, crawl_type, params, body);
    if context::is_active() {
        run.await
    } else {
        context::scope(run).await
    }
}

async fn lifecycle<B, Fut>(
    env: &HandlerEnv,
    crawl_type: CrawlType,
    params: ExecutionParams,
    body: B,
) -> CrawlResult
where
    B: FnOnce(Execution) -> Fut + Send,
    Fut: Future<Output = Result<ImportStats, CrawlFailure>> + Send,
{
    let Some(key) = params.identity() else {
        tracing::warn!(%crawl_type, "{}", MISSING_IDENTITY);
        return CrawlResult::fail(MISSING_IDENTITY);
    };

    let Some(definition) = env
        .definitions
        .find(&key)
        .filter(|d| d.crawl_type == crawl_type)
    else {
        tracing::warn!(crawl = %key, %crawl_type, "{}", NOT_FOUND);
        return CrawlResult::fail(NOT_FOUND);
    };

    let log_id = params
        .get_str(PARAM_LOG_ID)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let logger: Arc<dyn TaskLogger> = match env.loggers.create(&key, &log_id) {
        Ok(logger) => logger,
        Err(e) => {
            tracing::warn!(crawl = %key, error = %format!("{:#}", e), "task logger unavailable, logging disabled for this run");
            Arc::new(NoopTaskLogger)
        }
    };

    let local_code = key.local_code();
    let process_id = params
        .get_str(PARAM_PROCESS_ID)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let _guard = ContextGuard::enter(local_code.clone(), process_id.clone());

    let session = Arc::new(CrawlSession {
        scope: CacheScope::new(env.cache.clone(), local_code.clone(), process_id),
        key: key.clone(),
        log_id,
        logger: logger.clone(),
    });
    logger.info(&format!("{} crawl {} started", crawl_type, key));

    let mut lock = None;
    if env.distributed && crawl_type != CrawlType::Custom {
        let owner = Uuid::new_v4().to_string();
        match Claim::acquire(
            env.cache.clone(),
            format!("lock:{}", local_code),
            &owner,
            env.lock_lease,
        )
        .await
        {
            Ok(c) if c.is_won() => lock = Some(Arc::new(c)),
            Ok(_) => {
                logger.info(SKIPPED_ELSEWHERE);
                tracing::info!(crawl = %key, "{}", SKIPPED_ELSEWHERE);
                return CrawlResult::success_with(SKIPPED_ELSEWHERE);
            }
            Err(e) => {
                logger.error("claiming crawl lock failed", Some(&e));
                return CrawlResult::fail(format!("execution failed: {:#}", e));
            }
        }
    }

    // Seed only under the lock so a losing node leaves the holder's state alone.
    let seeded = match &lock {
        Some(_) => session.seed(&params).await.map_err(|e| {
            logger.error("seeding cache values failed", Some(&e));
            CrawlFailure::Execution(format!("{:#}", e))
        }),
        None => Ok(()),
    };

    let outcome = match seeded {
        Ok(()) => {
            body(Execution {
                session: session.clone(),
                params,
                definition,
                lock: lock.clone(),
            })
            .await
        }
        Err(failure) => Err(failure),
    };

    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            tracing::warn!(crawl = %key, error = %format!("{:#}", e), "failed to release crawl lock");
        }
    }

    let messages = context::drain_messages();
    for message in &messages {
        logger.info(&format!("message: {}", message));
    }

    match outcome {
        Ok(stats) => {
            logger.info(&format!("crawl finished: {}", stats));
            tracing::info!(crawl = %key, %stats, "crawl finished");
            let mut text = stats.to_string();
            for message in messages {
                text.push('\n');
                text.push_str(&message);
            }
            CrawlResult::success_with(text)
        }
        Err(CrawlFailure::Execution(message)) => {
            logger.error(&format!("execution failed: {}", message), None);
            tracing::warn!(crawl = %key, error = %message, "crawl execution failed");
            CrawlResult::fail(format!("execution failed: {}", message))
        }
        Err(CrawlFailure::Output(message)) => {
            logger.error(&format!("failed to send results: {}", message), None);
            tracing::warn!(crawl = %key, error = %message, "forwarding crawl output failed");
            CrawlResult::fail(format!("failed to send results: {}", message))
        }
    }
}

/// Await user code, turning both errors and panics into
/// [`CrawlFailure::Execution`].
pub(crate) async fn invoke_user<T, Fut>(fut: Fut) -> Result<T, CrawlFailure>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CrawlFailure::Execution(format!("{:#}", e))),
        Err(panic) => Err(CrawlFailure::Execution(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

/// Forward non-empty output through the environment's sink.
pub(crate) async fn forward_records(
    output: &dyn OutputSink,
    session: &CrawlSession,
    records: Option<Vec<Record>>,
    fd_codes: &[String],
) -> Result<ImportStats, CrawlFailure> {
    let records = match records {
        Some(records) if !records.is_empty() => records,
        _ => {
            session.logger.info("no records produced");
            return Ok(ImportStats::default());
        }
    };
    output
        .forward(&records, fd_codes)
        .await
        .map_err(|e| CrawlFailure::Output(e.to_string()))
}
