//! Distributed coordination cache.
//!
//! [`CacheClient`] is the only resource shared across worker processes.
//! Handlers use it to store resumable crawl state and to claim work so that
//! at most one worker in a cluster proceeds past a claim point for a key.
//! The atomicity of [`CacheClient::set_if_absent`] and
//! [`CacheClient::compare_and_swap`] is the only consistency relied upon.
//!
//! | Backend | Type | Scope |
//! |---------|------|-------|
//! | `memory` | [`MemoryCache`] | one process (tests, single-node runs) |
//! | `sqlite` | [`SqliteCache`] | every process sharing the coordination database |

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Key/value cache used for cross-node coordination.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set_value(&self, key: &str, value: Value) -> Result<()>;

    /// Store `value` only if `key` is absent. Returns `true` when this call
    /// created the entry.
    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool>;

    /// Replace the value of `key` only if it currently equals `expected`.
    /// Returns `true` when this call replaced it.
    async fn compare_and_swap(&self, key: &str, expected: &Value, value: Value) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════

/// Process-local cache backed by a [`DashMap`].
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Value>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        // The entry API holds the shard lock between the check and the insert.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(&self, key: &str, expected: &Value, value: Value) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) if slot.get() == expected => {
                slot.insert(value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite backend
// ═══════════════════════════════════════════════════════════════════════

/// Cache stored in the `cache_entries` table of the coordination database.
///
/// Every worker pointing at the same database file shares the entries.
/// Values are stored as JSON text.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the coordination database named in `[db]`, creating the
    /// schema if needed.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl CacheClient for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("cache get '{}' failed", key))?;

        raw.map(|s| serde_json::from_str(&s).context("cache entry is not valid JSON"))
            .transpose()
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("cache set '{}' failed", key))?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO cache_entries (key, value, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(value.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("cache claim '{}' failed", key))?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: &Value, value: Value) -> Result<bool> {
        // Entries are written with `Value::to_string`, so the stored text of
        // an equal value is the same string.
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE cache_entries SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
        )
        .bind(value.to_string())
        .bind(now)
        .bind(key)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("cache swap '{}' failed", key))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("cache delete '{}' failed", key))?;
        Ok(())
    }
}

/// Build the cache backend selected by `[cache].backend`.
pub async fn from_config(config: &Config) -> Result<Arc<dyn CacheClient>> {
    match config.cache.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteCache::connect(config).await?)),
        _ => Ok(Arc::new(MemoryCache::new())),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Claims
// ═══════════════════════════════════════════════════════════════════════

/// The outcome of a claim on a coordination key.
///
/// A claim is stored as `{"owner": .., "expires_at": <unix millis>}`. A
/// claim whose lease has run out may be taken over, so a worker that dies
/// while holding one blocks the key for at most one lease. Entries without
/// `expires_at` never expire. Only the current owner may renew or release.
pub struct Claim {
    cache: Arc<dyn CacheClient>,
    key: String,
    owner: String,
    lease: Duration,
    won: bool,
}

impl Claim {
    /// Attempt to claim `key` on behalf of `owner` for `lease`.
    pub async fn acquire(
        cache: Arc<dyn CacheClient>,
        key: String,
        owner: &str,
        lease: Duration,
    ) -> Result<Self> {
        let now = Utc::now().timestamp_millis();
        let value = lease_value(owner, now, lease);
        let mut won = cache.set_if_absent(&key, value.clone()).await?;
        if !won {
            match cache.get(&key).await? {
                Some(current) if lease_expired(&current, now) => {
                    won = cache.compare_and_swap(&key, &current, value).await?;
                    if won {
                        tracing::warn!(
                            key = %key,
                            owner,
                            previous = %current,
                            "took over expired claim"
                        );
                    }
                }
                // Released between the two calls.
                None => won = cache.set_if_absent(&key, value).await?,
                Some(_) => {}
            }
        }
        tracing::debug!(key = %key, owner, won, "claim attempted");
        Ok(Self {
            cache,
            key,
            owner: owner.to_string(),
            lease,
            won,
        })
    }

    pub fn is_won(&self) -> bool {
        self.won
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Push the expiry one lease into the future. Returns `false` when the
    /// claim is no longer held by this owner.
    pub async fn renew(&self) -> Result<bool> {
        if !self.won {
            return Ok(false);
        }
        let Some(current) = self.cache.get(&self.key).await? else {
            return Ok(false);
        };
        if claim_owner(&current) != Some(self.owner.as_str()) {
            return Ok(false);
        }
        let renewed = lease_value(&self.owner, Utc::now().timestamp_millis(), self.lease);
        self.cache
            .compare_and_swap(&self.key, &current, renewed)
            .await
    }

    /// Delete the claim if this caller won it and still owns it.
    pub async fn release(&self) -> Result<()> {
        if !self.won {
            return Ok(());
        }
        let current = self.cache.get(&self.key).await?;
        if current.as_ref().and_then(claim_owner) == Some(self.owner.as_str()) {
            self.cache.delete(&self.key).await?;
        }
        Ok(())
    }
}

fn lease_value(owner: &str, now_millis: i64, lease: Duration) -> Value {
    let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    json!({
        "owner": owner,
        "expires_at": now_millis.saturating_add(lease_millis),
    })
}

fn lease_expired(value: &Value, now_millis: i64) -> bool {
    value
        .get("expires_at")
        .and_then(Value::as_i64)
        .is_some_and(|expires_at| expires_at <= now_millis)
}

/// Owner of a claim value. Plain strings are bare owners.
pub fn claim_owner(value: &Value) -> Option<&str> {
    match value {
        Value::String(owner) => Some(owner),
        other => other.get("owner").and_then(Value::as_str),
    }
}
