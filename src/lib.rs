//! # Ficus
//!
//! A distributed crawl execution framework.
//!
//! Ficus runs crawl jobs identified by `{site, project_code, code}`. A job's
//! user logic (a Lua script or a registered Rust implementation) produces
//! records, and Ficus upserts them into configured SQL fact datasources.
//! When several nodes share a cache, a crawl runs on one node at a time and
//! paged crawls resume where a failed run stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Runner  │──▶│  Handlers   │──▶│ Output       │──▶│ Fact         │
//! │ dispatch │   │ CUSTOM/     │   │ dispatcher   │   │ datasources  │
//! └──────────┘   │ SIMPLE/BATCH│   └──────────────┘   │ SQL + DAO    │
//!                └──────┬──────┘                      └──────────────┘
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!     ┌─────────┐  ┌─────────┐  ┌──────────┐
//!     │  Cache  │  │ Context │  │ Task log │
//!     └─────────┘  └─────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ficus init                                 # create the coordination database
//! ficus script init products --batch         # scaffold crawlers/products.lua
//! ficus run shop catalog products            # execute one crawl
//! ficus query products "SELECT * FROM products WHERE sku = #{sku}" --param sku=A1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and parameter keys |
//! | [`context`] | Per-execution context slots |
//! | [`cache`] | Coordination cache and claims |
//! | [`handler`] | Crawl handlers and their lifecycle |
//! | [`runner`] | Definition lookup and dispatch |
//! | [`crawl_script`] | Lua crawl scripts |
//! | [`sql`] | Dialects, placeholders and SQL generation |
//! | [`dao`] | Driver access |
//! | [`datasource`] | Fact datasource operations |
//! | [`output`] | Forwarding records to datasources |
//! | [`service`] | Calls to peer services |
//! | [`task_logger`] | Per-execution task logs |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod context;
pub mod crawl_script;
pub mod dao;
pub mod datasource;
pub mod db;
pub mod error;
pub mod handler;
mod lua_runtime;
pub mod migrate;
pub mod models;
pub mod output;
pub mod registry;
pub mod runner;
pub mod service;
pub mod sql;
pub mod task_logger;
