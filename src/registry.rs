//! Crawl definition lookup.
//!
//! Definitions come from the `[[crawls]]` entries of the config file and are
//! looked up by exact `{site, project_code, code}` match. The execution core
//! only reads them, through [`CrawlDefinitionSource`], so a different store
//! can be injected in its place.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::models::{CrawlDefinition, CrawlKey};

/// Read-only access to crawl definitions.
pub trait CrawlDefinitionSource: Send + Sync {
    fn find(&self, key: &CrawlKey) -> Option<CrawlDefinition>;
}

/// In-memory definition store, ordered by key.
#[derive(Debug, Default, Clone)]
pub struct CrawlRegistry {
    definitions: BTreeMap<String, CrawlDefinition>,
}

fn sort_key(key: &CrawlKey) -> String {
    format!("{}\u{0}{}\u{0}{}", key.site, key.project_code, key.code)
}

impl CrawlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for definition in &config.crawls {
            registry.register(definition.clone());
        }
        registry
    }

    /// Add or replace a definition.
    pub fn register(&mut self, definition: CrawlDefinition) {
        self.definitions
            .insert(sort_key(&definition.key()), definition);
    }

    pub fn list(&self) -> impl Iterator<Item = &CrawlDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl CrawlDefinitionSource for CrawlRegistry {
    fn find(&self, key: &CrawlKey) -> Option<CrawlDefinition> {
        self.definitions.get(&sort_key(key)).cloned()
    }
}
