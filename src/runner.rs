//! Crawl dispatch.
//!
//! The [`Runner`] resolves a [`CrawlKey`] to its definition and a handler,
//! assembles the parameter map and executes the crawl in its own execution
//! context. Crawl code comes from two places:
//!
//! 1. Rust implementations registered with [`Runner::register_script`],
//!    [`Runner::register_simple`] or [`Runner::register_batch`].
//! 2. Lua scripts named by the definition's `script` field.
//!
//! A registered implementation wins over a script for the same key.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache;
use crate::config::Config;
use crate::context;
use crate::crawl_script::LuaCrawl;
use crate::datasource::DataSourceRegistry;
use crate::error::FdError;
use crate::handler::{
    BatchCrawl, BatchHandler, Crawl, CrawlHandler, DoCrawl, HandlerEnv, ScriptHandler,
    SimpleHandler,
};
use crate::lua_runtime::expand_env_in_value;
use crate::models::{
    now_millis, CrawlDefinition, CrawlKey, CrawlResult, CrawlType, ExecutionParams,
    PARAM_CODE, PARAM_LOG_ID, PARAM_PROCESS_LOG_ID, PARAM_PROJECT_CODE, PARAM_SITE,
    PARAM_TRIGGER_TIME,
};
use crate::output::OutputDispatcher;
use crate::registry::CrawlRegistry;
use crate::service::{HttpServiceCaller, ServiceCaller};
use crate::task_logger;

enum Registered {
    Script(Arc<dyn DoCrawl>),
    Simple(Arc<dyn Crawl>),
    Batch(Arc<dyn BatchCrawl>),
}

pub struct Runner {
    env: Arc<HandlerEnv>,
    crawls: HashMap<CrawlKey, Registered>,
    services: Option<Arc<dyn ServiceCaller>>,
}

impl Runner {
    pub fn new(env: HandlerEnv) -> Self {
        Self {
            env: Arc::new(env),
            crawls: HashMap::new(),
            services: None,
        }
    }

    /// Wire every collaborator from the config file.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let definitions = Arc::new(CrawlRegistry::from_config(config));
        let cache = cache::from_config(config).await?;
        let loggers = task_logger::factory_from_config(config);
        let datasources = Arc::new(DataSourceRegistry::from_config(config).await?);
        let output = Arc::new(OutputDispatcher::new(datasources));

        let env = HandlerEnv::new(definitions, cache, loggers, output)
            .distributed(config.execution.distributed)
            .max_pages(config.execution.max_pages)
            .lock_lease(Duration::from_secs(config.execution.lock_lease_secs));

        let services: Option<Arc<dyn ServiceCaller>> = if config.services.is_empty() {
            None
        } else {
            Some(Arc::new(HttpServiceCaller::new(&config.services)))
        };

        Ok(Self::new(env).with_services(services))
    }

    /// Service caller handed to Lua scripts as `service.call`.
    pub fn with_services(mut self, services: Option<Arc<dyn ServiceCaller>>) -> Self {
        self.services = services;
        self
    }

    pub fn env(&self) -> &Arc<HandlerEnv> {
        &self.env
    }

    pub fn register_script(&mut self, key: CrawlKey, crawl: Arc<dyn DoCrawl>) {
        self.crawls.insert(key, Registered::Script(crawl));
    }

    pub fn register_simple(&mut self, key: CrawlKey, crawl: Arc<dyn Crawl>) {
        self.crawls.insert(key, Registered::Simple(crawl));
    }

    pub fn register_batch(&mut self, key: CrawlKey, crawl: Arc<dyn BatchCrawl>) {
        self.crawls.insert(key, Registered::Batch(crawl));
    }

    /// Run `handler` in a fresh execution context.
    pub async fn execute(&self, handler: &dyn CrawlHandler, params: ExecutionParams) -> CrawlResult {
        context::scope(handler.execute(params)).await
    }

    /// The handler that runs `definition`.
    ///
    /// A registered implementation's handler is returned as is; when its
    /// kind differs from the definition's type the handler itself rejects
    /// the run.
    pub fn handler_for(&self, definition: &CrawlDefinition) -> Result<Box<dyn CrawlHandler>, FdError> {
        let env = self.env.clone();
        let key = definition.key();

        if let Some(registered) = self.crawls.get(&key) {
            let handler: Box<dyn CrawlHandler> = match registered {
                Registered::Script(c) => Box::new(ScriptHandler::new(env, c.clone())),
                Registered::Simple(c) => Box::new(SimpleHandler::new(env, c.clone())),
                Registered::Batch(c) => Box::new(BatchHandler::new(env, c.clone())),
            };
            return Ok(handler);
        }

        let Some(script) = LuaCrawl::from_definition(definition) else {
            return Err(FdError::illegal(format!(
                "no implementation registered and no script configured for crawl {}",
                key
            )));
        };
        let script = Arc::new(script.with_services(self.services.clone()));
        let handler: Box<dyn CrawlHandler> = match definition.crawl_type {
            CrawlType::Custom => Box::new(ScriptHandler::new(env, script)),
            CrawlType::Simple => Box::new(SimpleHandler::new(env, script)),
            CrawlType::Batch => Box::new(BatchHandler::new(env, script)),
        };
        Ok(handler)
    }

    /// Run the crawl identified by `key`.
    ///
    /// `extra` entries override the definition's params. Fails only when
    /// the crawl cannot be resolved; execution failures are reported in the
    /// returned [`CrawlResult`].
    pub async fn dispatch(
        &self,
        key: &CrawlKey,
        extra: Map<String, Value>,
    ) -> Result<CrawlResult, FdError> {
        let definition = self
            .env
            .definitions
            .find(key)
            .ok_or_else(|| FdError::illegal(format!("unknown crawl: {}", key)))?;
        let handler = self.handler_for(&definition)?;
        let params = build_params(&definition, extra);

        tracing::info!(crawl = %key, crawl_type = %definition.crawl_type, "dispatching crawl");
        Ok(self.execute(handler.as_ref(), params).await)
    }

    /// Run several crawls concurrently, one task each. Results keep the
    /// order of `keys`.
    pub async fn dispatch_all(self: &Arc<Self>, keys: Vec<CrawlKey>) -> Vec<CrawlResult> {
        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let runner = self.clone();
                tokio::spawn(async move { runner.dispatch(&key, Map::new()).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => CrawlResult::fail(e.to_string()),
                Err(e) => CrawlResult::fail(format!("crawl task aborted: {}", e)),
            };
            results.push(result);
        }
        results
    }
}

/// Definition params (with `${VAR}` expanded), then `extra`, then the
/// crawl identity. Simple and batch runs also get fresh run ids unless
/// `extra` supplies them.
fn build_params(definition: &CrawlDefinition, extra: Map<String, Value>) -> ExecutionParams {
    let mut params: ExecutionParams = definition
        .params
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_in_value(v)))
        .collect();
    for (k, v) in extra {
        params.insert(k, v);
    }
    params.insert(PARAM_SITE, definition.site.clone());
    params.insert(PARAM_PROJECT_CODE, definition.project_code.clone());
    params.insert(PARAM_CODE, definition.code.clone());

    if definition.crawl_type != CrawlType::Custom {
        let log_id = params
            .get_str(PARAM_LOG_ID)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !params.contains_key(PARAM_TRIGGER_TIME) {
            params.insert(PARAM_TRIGGER_TIME, now_millis());
        }
        if !params.contains_key(PARAM_PROCESS_LOG_ID) {
            params.insert(PARAM_PROCESS_LOG_ID, log_id.clone());
        }
        params.insert(PARAM_LOG_ID, log_id);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(crawl_type: CrawlType) -> CrawlDefinition {
        let mut params = Map::new();
        params.insert("base_url".into(), "${FICUS_RUNNER_TEST_URL}/v1".into());
        params.insert("limit".into(), 10.into());
        CrawlDefinition {
            site: "shop".into(),
            project_code: "catalog".into(),
            code: "items".into(),
            crawl_type,
            params,
            output_fd_codes: Vec::new(),
            script: None,
            timeout: 600,
        }
    }

    #[test]
    fn params_carry_identity_and_overrides() {
        std::env::set_var("FICUS_RUNNER_TEST_URL", "https://api.test");
        let mut extra = Map::new();
        extra.insert("limit".into(), 50.into());
        let params = build_params(&definition(CrawlType::Custom), extra);

        assert_eq!(params.get_str("base_url").unwrap(), "https://api.test/v1");
        assert_eq!(params.get_u64("limit"), Some(50));
        assert_eq!(
            params.identity(),
            Some(CrawlKey::new("shop", "catalog", "items"))
        );
        assert!(!params.contains_key(PARAM_LOG_ID));
    }

    #[test]
    fn batch_params_get_run_ids() {
        let params = build_params(&definition(CrawlType::Batch), Map::new());
        let log_id = params.get_str(PARAM_LOG_ID).unwrap();
        assert_eq!(params.get_str(PARAM_PROCESS_LOG_ID).unwrap(), log_id);
        assert!(params.get(PARAM_TRIGGER_TIME).and_then(Value::as_i64).is_some());

        let mut extra = Map::new();
        extra.insert(PARAM_PROCESS_LOG_ID.into(), "run-7".into());
        let params = build_params(&definition(CrawlType::Batch), extra);
        assert_eq!(params.get_str(PARAM_PROCESS_LOG_ID).unwrap(), "run-7");
    }
}
