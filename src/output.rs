//! Forwarding crawl output to fact datasources.

use async_trait::async_trait;
use std::sync::Arc;

use crate::datasource::DataSourceRegistry;
use crate::error::FdError;
use crate::models::{ImportStats, Record};

/// Destination for the records a crawl produces.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Write `records` to every datasource in `fd_codes`.
    async fn forward(&self, records: &[Record], fd_codes: &[String]) -> Result<ImportStats, FdError>;
}

/// Upserts records into each target datasource in turn.
///
/// All codes are resolved before anything is written, so an unknown code
/// fails the forward without touching any table. A failing target aborts
/// the remaining ones; earlier targets keep what was written.
pub struct OutputDispatcher {
    registry: Arc<DataSourceRegistry>,
}

impl OutputDispatcher {
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl OutputSink for OutputDispatcher {
    async fn forward(&self, records: &[Record], fd_codes: &[String]) -> Result<ImportStats, FdError> {
        if records.is_empty() {
            return Ok(ImportStats::default());
        }

        let targets = fd_codes
            .iter()
            .map(|code| self.registry.context(code))
            .collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            tracing::debug!(records = records.len(), "no output datasources configured");
        }

        let mut stats = ImportStats::default();
        for target in &targets {
            let outcomes = target.upsert_batch(records).await?;
            let target_stats = ImportStats::from_outcomes(&outcomes);
            tracing::info!(fd = %target.datasource().code, %target_stats, "forwarded records");
            stats.merge(target_stats);
        }
        Ok(stats)
    }
}
