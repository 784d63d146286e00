//! `SIMPLE` crawls: one call, one result list.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::{
    forward_records, invoke_user, run_lifecycle, CacheState, CrawlHandler, HandlerEnv,
};
use crate::models::{CrawlResult, CrawlType, ExecutionParams, Record};

/// User logic of a `SIMPLE` crawl.
///
/// `state` gives access to the crawl-scoped cache and the task logger of
/// the current execution.
#[async_trait]
pub trait Crawl: Send + Sync {
    async fn crawl(
        &self,
        params: &ExecutionParams,
        state: &dyn CacheState,
    ) -> Result<Option<Vec<Record>>>;
}

/// Handler for `SIMPLE` crawls. Long-lived; safe to execute concurrently.
pub struct SimpleHandler {
    env: Arc<HandlerEnv>,
    crawl: Arc<dyn Crawl>,
}

impl SimpleHandler {
    pub fn new(env: Arc<HandlerEnv>, crawl: Arc<dyn Crawl>) -> Self {
        Self { env, crawl }
    }
}

#[async_trait]
impl CrawlHandler for SimpleHandler {
    fn crawl_type(&self) -> CrawlType {
        CrawlType::Simple
    }

    async fn execute(&self, params: ExecutionParams) -> CrawlResult {
        let crawl = self.crawl.clone();
        let output = self.env.output.clone();
        run_lifecycle(&self.env, CrawlType::Simple, params, |exec| async move {
            let records = invoke_user(crawl.crawl(&exec.params, exec.session.as_ref())).await?;
            forward_records(
                output.as_ref(),
                &exec.session,
                records,
                &exec.definition.output_fd_codes,
            )
            .await
        })
        .await
    }
}
