//! `CUSTOM` crawls backed by an external script.

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::{forward_records, invoke_user, run_lifecycle, CrawlHandler, HandlerEnv};
use crate::context;
use crate::error::FdError;
use crate::models::{CrawlResult, CrawlType, ExecutionParams, ImportStats, Record};

/// The capability a `CUSTOM` crawl provides.
///
/// Returning `Ok(None)` or an empty list means there is nothing to forward.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use ficus::handler::DoCrawl;
/// use ficus::models::{ExecutionParams, Record};
///
/// struct Heartbeat;
///
/// #[async_trait]
/// impl DoCrawl for Heartbeat {
///     async fn do_crawl(&self, params: &ExecutionParams) -> Result<Option<Vec<Record>>> {
///         let mut row = Record::new();
///         row.insert("id".into(), params.get_str("code_").unwrap_or_default().into());
///         Ok(Some(vec![row]))
///     }
/// }
/// ```
#[async_trait]
pub trait DoCrawl: Send + Sync {
    async fn do_crawl(&self, params: &ExecutionParams) -> Result<Option<Vec<Record>>>;

    /// Name recorded as the execution's script reference.
    fn script_name(&self) -> String {
        "inline".to_string()
    }
}

/// Adapts an async closure into a [`DoCrawl`].
pub struct FnCrawl<F> {
    name: String,
    f: F,
}

/// Wrap `f` as a named [`DoCrawl`].
pub fn crawl_fn<F, Fut>(name: impl Into<String>, f: F) -> FnCrawl<F>
where
    F: Fn(ExecutionParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Vec<Record>>>> + Send,
{
    FnCrawl {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> DoCrawl for FnCrawl<F>
where
    F: Fn(ExecutionParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Vec<Record>>>> + Send,
{
    async fn do_crawl(&self, params: &ExecutionParams) -> Result<Option<Vec<Record>>> {
        (self.f)(params.clone()).await
    }

    fn script_name(&self) -> String {
        self.name.clone()
    }
}

/// Handler for `CUSTOM` crawls.
pub struct ScriptHandler {
    env: Arc<HandlerEnv>,
    script: Arc<dyn DoCrawl>,
}

impl ScriptHandler {
    pub fn new(env: Arc<HandlerEnv>, script: Arc<dyn DoCrawl>) -> Self {
        Self { env, script }
    }

    /// Forward records to the given datasources.
    pub async fn send_output(
        &self,
        records: &[Record],
        fd_codes: &[String],
    ) -> Result<ImportStats, FdError> {
        self.env.output.forward(records, fd_codes).await
    }
}

#[async_trait]
impl CrawlHandler for ScriptHandler {
    fn crawl_type(&self) -> CrawlType {
        CrawlType::Custom
    }

    async fn execute(&self, params: ExecutionParams) -> CrawlResult {
        let script = self.script.clone();
        let output = self.env.output.clone();
        run_lifecycle(&self.env, CrawlType::Custom, params, |exec| async move {
            context::set_script(script.script_name());
            let records = invoke_user(script.do_crawl(&exec.params)).await?;
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
