//! Per-tenant writer pool
//!
//! Keeps one open bus writer per `(group_id, user_id)` so events of the
//! same tenant go through the same stream and keep their order.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bus::{BusError, EventWriter, WriterClient};
use super::CloudEvent;
use crate::cancel;
use crate::error::AppError;
use crate::metrics::{EVENTS_WRITTEN_TOTAL, WRITER_POOL_SIZE};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

type TenantKey = (String, String);

#[derive(Clone)]
struct CachedWriter {
    writer: Arc<dyn EventWriter>,
    opened_at: Instant,
}

/// LRU of open writers with TTL and retrying writes
pub struct WriterPool {
    client: Arc<dyn WriterClient>,
    writers: Mutex<LruCache<TenantKey, CachedWriter>>,
    ttl: Duration,
    backoff: Duration,
}

impl WriterPool {
    /// Create new writer pool
    ///
    /// # Arguments
    /// * `client` - Opens writers on the bus
    /// * `capacity` - Maximum number of open writers
    /// * `ttl` - Lifetime of an open writer
    /// * `backoff` - Total time budget for retrying one write
    pub fn new(
        client: Arc<dyn WriterClient>,
        capacity: usize,
        ttl: Duration,
        backoff: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            client,
            writers: Mutex::new(LruCache::new(capacity)),
            ttl,
            backoff,
        }
    }

    fn writers(&self) -> MutexGuard<'_, LruCache<TenantKey, CachedWriter>> {
        self.writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of open writers
    pub fn len(&self) -> usize {
        self.writers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish one event on behalf of a tenant
    ///
    /// Retries with exponential backoff starting at 100 ms until the
    /// configured budget is spent. Errors that leave the stream unusable
    /// evict and close the writer first, so the next attempt reopens it.
    ///
    /// # Errors
    /// * `AppError::NoAccept` - the bus rejected the event
    /// * `AppError::Writer` - the retry budget is exhausted
    /// * `AppError::Canceled` - `cancel` fired
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        event: &CloudEvent,
        group_id: &str,
        user_id: &str,
    ) -> Result<(), AppError> {
        let started = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.try_write(cancel, event, group_id, user_id).await {
                Ok(()) => {
                    EVENTS_WRITTEN_TOTAL.with_label_values(&["ok"]).inc();
                    return Ok(());
                }
                Err(e) => e,
            };

            match err {
                BusError::Canceled => return Err(AppError::Canceled),
                BusError::Rejected(msg) => {
                    EVENTS_WRITTEN_TOTAL.with_label_values(&["rejected"]).inc();
                    return Err(AppError::NoAccept(msg));
                }
                _ => {}
            }

            if started.elapsed() + delay > self.backoff {
                EVENTS_WRITTEN_TOTAL.with_label_values(&["failed"]).inc();
                return Err(AppError::Writer(format!(
                    "failed to write event {}: {}",
                    event.id, err
                )));
            }

            tracing::warn!(
                event_id = %event.id,
                group_id = %group_id,
                user_id = %user_id,
                attempt,
                error = %err,
                "Event write failed, retrying"
            );
            cancel::sleep(cancel, delay).await?;
            delay *= 2;
        }
    }

    async fn try_write(
        &self,
        cancel: &CancellationToken,
        event: &CloudEvent,
        group_id: &str,
        user_id: &str,
    ) -> Result<(), BusError> {
        let writer = self.acquire(cancel, group_id, user_id).await?;
        let result = match writer.write_batch(cancel, std::slice::from_ref(event)).await {
            Ok(0) => Err(BusError::Transient("event was not acknowledged".to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.requires_reopen() {
                self.evict(group_id, user_id, &writer).await;
            }
        }
        result
    }

    /// Cached writer of the tenant, opening a new one on a miss
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        group_id: &str,
        user_id: &str,
    ) -> Result<Arc<dyn EventWriter>, BusError> {
        let key = (group_id.to_string(), user_id.to_string());

        let expired = {
            let mut writers = self.writers();
            let cached = writers
                .get(&key)
                .map(|c| (c.writer.clone(), c.opened_at.elapsed() < self.ttl));
            match cached {
                Some((writer, true)) => return Ok(writer),
                Some((_, false)) => writers.pop(&key),
                None => None,
            }
        };
        if let Some(expired) = expired {
            expired.writer.close().await;
        }

        let opened = self.client.open_writer(cancel, group_id, user_id).await?;

        let (writer, displaced) = {
            let mut writers = self.writers();
            match writers.get(&key).map(|c| c.writer.clone()) {
                // Another task opened one meanwhile; keep theirs.
                Some(current) => (current, Some(opened.clone())),
                None => {
                    let cached = CachedWriter {
                        writer: opened.clone(),
                        opened_at: Instant::now(),
                    };
                    let evicted = writers.push(key, cached).map(|(_, old)| old.writer);
                    WRITER_POOL_SIZE.set(writers.len() as i64);
                    (opened, evicted)
                }
            }
        };
        if let Some(displaced) = displaced {
            displaced.close().await;
        }
        Ok(writer)
    }

    /// Drop `writer` from the pool, unless it was already replaced
    async fn evict(&self, group_id: &str, user_id: &str, writer: &Arc<dyn EventWriter>) {
        let key = (group_id.to_string(), user_id.to_string());
        {
            let mut writers = self.writers();
            if writers
                .peek(&key)
                .is_some_and(|cached| Arc::ptr_eq(&cached.writer, writer))
            {
                writers.pop(&key);
                WRITER_POOL_SIZE.set(writers.len() as i64);
            }
        }
        tracing::debug!(group_id = %group_id, user_id = %user_id, "Evicted bus writer");
        writer.close().await;
    }

    /// Close all open writers
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut writers = self.writers();
            let mut drained = Vec::with_capacity(writers.len());
            while let Some((_, cached)) = writers.pop_lru() {
                drained.push(cached.writer);
            }
            WRITER_POOL_SIZE.set(0);
            drained
        };
        for writer in drained {
            writer.close().await;
        }
    }
}
