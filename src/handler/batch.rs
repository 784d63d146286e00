//! `BATCH` crawls: paged user logic with resumable progress.
//!
//! Pages are numbered from 1. The crawl stops at the first page that
//! returns no record, or after `maxPages_` pages. Each page is forwarded as
//! soon as it is crawled.
//!
//! In distributed mode two cache keys track a run, both scoped by the
//! `__processLogId__` the runner assigns:
//!
//! | Key | Value |
//! |-----|-------|
//! | `{local_code}:{processLogId}:cursor` | last page forwarded |
//! | `{local_code}:{processLogId}:page:{n}` | claim on page `n` |
//!
//! A retry of the same run on another node starts after the cursor and
//! skips pages someone else holds. Both kinds of key are removed when the
//! run completes; after a failure the cursor is kept so the retry resumes.
//!
//! Page claims carry the same lease as the crawl lock, and the crawl lock
//! is renewed right after each page claim. Once the crawl lock of a dead
//! run has expired, its page claims have expired too.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{
    forward_records, invoke_user, run_lifecycle, CacheState, CrawlFailure, CrawlHandler,
    CrawlSession, Execution, HandlerEnv,
};
use crate::cache::Claim;
use crate::models::{
    CrawlResult, CrawlType, ExecutionParams, ImportStats, Record, PARAM_MAX_PAGES,
    PARAM_PROCESS_LOG_ID,
};

/// User logic of a `BATCH` crawl.
#[async_trait]
pub trait BatchCrawl: Send + Sync {
    /// Crawl page `page` (1-based). `None` or an empty list ends the run.
    async fn crawl_page(
        &self,
        params: &ExecutionParams,
        page: u64,
        state: &dyn CacheState,
    ) -> Result<Option<Vec<Record>>>;
}

/// Handler for `BATCH` crawls.
pub struct BatchHandler {
    env: Arc<HandlerEnv>,
    crawl: Arc<dyn BatchCrawl>,
}

impl BatchHandler {
    pub fn new(env: Arc<HandlerEnv>, crawl: Arc<dyn BatchCrawl>) -> Self {
        Self { env, crawl }
    }
}

#[async_trait]
impl CrawlHandler for BatchHandler {
    fn crawl_type(&self) -> CrawlType {
        CrawlType::Batch
    }

    async fn execute(&self, params: ExecutionParams) -> CrawlResult {
        let env = self.env.clone();
        let crawl = self.crawl.clone();
        run_lifecycle(&self.env, CrawlType::Batch, params, |exec| async move {
            crawl_pages(&env, crawl.as_ref(), exec).await
        })
        .await
    }
}

struct Progress<'a> {
    session: &'a CrawlSession,
    cursor_key: String,
    page_prefix: String,
}

impl Progress<'_> {
    fn page_key(&self, page: u64) -> String {
        format!("{}{}", self.page_prefix, page)
    }

    async fn last_page(&self) -> Result<u64> {
        let value = self.session.cache().get(&self.cursor_key).await?;
        Ok(value.as_ref().and_then(Value::as_u64).unwrap_or(0))
    }

    async fn advance(&self, page: u64) -> Result<()> {
        self.session
            .cache()
            .set_value(&self.cursor_key, Value::from(page))
            .await
    }

    async fn finish(&self, claims: Vec<Claim>, resumed_at: u64) -> Result<()> {
        // Pages before the resume point were claimed by an earlier attempt.
        for page in 1..resumed_at {
            self.session.cache().delete(&self.page_key(page)).await?;
        }
        for claim in claims {
            claim.release().await?;
        }
        self.session.cache().delete(&self.cursor_key).await
    }
}

fn coordination(e: anyhow::Error) -> CrawlFailure {
    CrawlFailure::Execution(format!("batch coordination failed: {:#}", e))
}

async fn crawl_pages(
    env: &HandlerEnv,
    crawl: &dyn BatchCrawl,
    exec: Execution,
) -> Result<ImportStats, CrawlFailure> {
    let session = exec.session.as_ref();
    let logger = session.task_logger();
    let max_pages = exec
        .params
        .get_u64(PARAM_MAX_PAGES)
        .filter(|n| *n > 0)
        .unwrap_or(env.max_pages);

    let run_id = exec
        .params
        .get_str(PARAM_PROCESS_LOG_ID)
        .unwrap_or_else(|| session.log_id().to_string());
    let progress = Progress {
        session,
        cursor_key: format!("{}:{}:cursor", session.local_code(), run_id),
        page_prefix: format!("{}:{}:page:", session.local_code(), run_id),
    };

    let first_page = if env.distributed {
        progress.last_page().await.map_err(coordination)? + 1
    } else {
        1
    };
    if first_page > 1 {
        logger.info(&format!("resuming at page {}", first_page));
    }

    let mut stats = ImportStats::default();
    let mut claims = Vec::new();
    let mut pages = 0u64;

    for page in first_page..=max_pages {
        let claim = if env.distributed {
            let claim = Claim::acquire(
                session.cache().clone(),
                progress.page_key(page),
                session.process_id(),
                env.lock_lease,
            )
            .await
            .map_err(coordination)?;
            if !claim.is_won() {
                logger.info(&format!("page {} is claimed elsewhere, skipping", page));
                continue;
            }
            if let Some(lock) = &exec.lock {
                if !lock.renew().await.map_err(coordination)? {
                    if let Err(e) = claim.release().await {
                        tracing::warn!(error = %format!("{:#}", e), "failed to release page claim");
                    }
                    return Err(CrawlFailure::Execution(
                        "crawl lock expired and was taken over by another node".to_string(),
                    ));
                }
            }
            Some(claim)
        } else {
            None
        };

        let outcome = match invoke_user(crawl.crawl_page(&exec.params, page, session)).await {
            Ok(Some(records)) if !records.is_empty() => {
                let page_stats = forward_records(
                    env.output.as_ref(),
                    session,
                    Some(records),
                    &exec.definition.output_fd_codes,
                )
                .await;
                page_stats.map(Some)
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(page_stats)) => {
                logger.info(&format!("page {}: {}", page, page_stats));
                stats.merge(page_stats);
                pages += 1;
                if env.distributed {
                    progress.advance(page).await.map_err(coordination)?;
                }
                claims.extend(claim);
            }
            Ok(None) => {
                logger.info(&format!("page {} returned no records, stopping", page));
                claims.extend(claim);
                break;
            }
            Err(failure) => {
                // Let a retry pick this page up again.
                if let Some(claim) = claim {
                    if let Err(e) = claim.release().await {
                        tracing::warn!(error = %format!("{:#}", e), "failed to release page claim");
                    }
                }
                return Err(failure);
            }
        }
    }

    if env.distributed {
        progress.finish(claims, first_page).await.map_err(coordination)?;
    }
    logger.info(&format!("crawled {} pages", pages));
    Ok(stats)
}
