//! In-memory caches
//!
//! These caches are volatile and cleared on restart.
//! Uses Moka for high-performance concurrent caching.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::database::SourceStorage;
use super::models::{Filter, Order, Source};
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

const CACHE_NAME: &str = "sources";

// =============================================================================
// Source Cache
// =============================================================================

/// LRU + TTL cache in front of a [`SourceStorage`]
///
/// `read`, `create` and `update` populate the cache by actor id; every
/// other mutation invalidates it.
pub struct CachedSourceStorage {
    inner: Arc<dyn SourceStorage>,
    sources: Cache<String, Arc<Source>>,
}

impl CachedSourceStorage {
    /// Create new source cache
    ///
    /// # Arguments
    /// * `inner` - Backing storage
    /// * `max_items` - Maximum number of sources to cache
    /// * `ttl` - Entry lifetime
    pub fn new(inner: Arc<dyn SourceStorage>, max_items: usize, ttl: Duration) -> Self {
        let sources = Cache::builder()
            .max_capacity(max_items as u64)
            .time_to_live(ttl)
            .build();

        Self { inner, sources }
    }

    async fn put(&self, source: &Source) {
        self.sources
            .insert(source.actor_id.clone(), Arc::new(source.clone()))
            .await;
        CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(self.sources.entry_count() as i64);
    }

    async fn forget(&self, actor_id: &str) {
        self.sources.invalidate(actor_id).await;
    }
}

#[async_trait]
impl SourceStorage for CachedSourceStorage {
    async fn create(&self, source: &Source) -> Result<(), AppError> {
        self.inner.create(source).await?;
        self.put(source).await;
        Ok(())
    }

    async fn read(&self, actor_id: &str) -> Result<Source, AppError> {
        if let Some(hit) = self.sources.get(actor_id).await {
            CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
            return Ok((*hit).clone());
        }
        CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();

        let source = self.inner.read(actor_id).await?;
        self.put(&source).await;
        Ok(source)
    }

    async fn update(&self, source: &Source) -> Result<(), AppError> {
        match self.inner.update(source).await {
            Ok(()) => {
                self.put(source).await;
                Ok(())
            }
            Err(e) => {
                self.forget(&source.actor_id).await;
                Err(e)
            }
        }
    }

    async fn set_last(
        &self,
        actor_id: &str,
        last: DateTime<Utc>,
        err: &str,
    ) -> Result<(), AppError> {
        let result = self.inner.set_last(actor_id, last, err).await;
        self.forget(actor_id).await;
        result
    }

    async fn set_follow_outcome(&self, actor_id: &str, accepted: bool) -> Result<(), AppError> {
        let result = self.inner.set_follow_outcome(actor_id, accepted).await;
        self.forget(actor_id).await;
        result
    }

    async fn set_profile(
        &self,
        actor_id: &str,
        kind: &str,
        name: &str,
        summary: &str,
    ) -> Result<(), AppError> {
        let result = self.inner.set_profile(actor_id, kind, name, summary).await;
        self.forget(actor_id).await;
        result
    }

    async fn delete(&self, actor_id: &str, group_id: &str, user_id: &str) -> Result<(), AppError> {
        let result = self.inner.delete(actor_id, group_id, user_id).await;
        self.forget(actor_id).await;
        result
    }

    async fn list(
        &self,
        filter: &Filter,
        limit: u32,
        cursor: &str,
        order: Order,
    ) -> Result<Vec<String>, AppError> {
        self.inner.list(filter, limit, cursor, order).await
    }

    async fn count(&self) -> Result<i64, AppError> {
        self.inner.count().await
    }

    async fn count_by_owner(&self, group_id: &str, user_id: &str) -> Result<i64, AppError> {
        self.inner.count_by_owner(group_id, user_id).await
    }
}
