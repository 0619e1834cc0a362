//! Write batching.
//!
//! Writes that share the exact same SQL text form a batch group. Items are
//! appended under a short-held map lock; when a group reaches the size
//! threshold its items are swapped out and executed on a spawned task. A
//! periodic caller (the host's flush loop) drains whatever is left so
//! low-volume statements do not wait forever.
//!
//! A drained batch runs as one prepared statement inside one transaction on
//! one connection, in append order. Batches drained from the same group
//! commit in the order they were drained: each waits for its predecessor to
//! finish before taking a connection. Outcomes are delivered to each item's
//! callback; a failed batch is reported to every callback and never retried.

use crate::error::DbError;
use crate::guard::{Access, AccessGuard};
use crate::pool::{ConnectionPool, DbPool};
use crate::rows::to_sql;
use crate::sync;
use rusqlite::params_from_iter;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tabula_types::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Default number of pending items that triggers an automatic flush.
pub const DEFAULT_BATCH_THRESHOLD: usize = 100;

/// Why a batched write did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batched write failed: {message}")]
pub struct BatchFailure {
    pub message: String,
}

/// Per-item result: rows affected by that item's statement, or the failure
/// shared by the whole batch.
pub type BatchOutcome = std::result::Result<usize, BatchFailure>;

/// Invoked exactly once with the item's outcome.
pub type BatchCallback = Box<dyn FnOnce(BatchOutcome) + Send + 'static>;

struct PendingWrite {
    params: Vec<Value>,
    callback: BatchCallback,
}

struct Group {
    table: String,
    items: Vec<PendingWrite>,
}

#[derive(Default)]
struct Queue {
    groups: HashMap<String, Group>,
    /// Completion of the most recently drained batch per key. The sender
    /// side is dropped once that batch has committed or failed.
    tails: HashMap<String, oneshot::Receiver<()>>,
}

impl Queue {
    fn drain(&mut self, sql: &str) -> Option<DrainedBatch> {
        let group = self.groups.remove(sql)?;
        let (done, tail) = oneshot::channel();
        let after = self.tails.insert(sql.to_string(), tail);
        Some(DrainedBatch {
            sql: sql.to_string(),
            table: group.table,
            items: group.items,
            after,
            done,
        })
    }

    fn prune_finished(&mut self) {
        self.tails.retain(|_, tail| {
            matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Empty))
        });
    }
}

struct DrainedBatch {
    sql: String,
    table: String,
    items: Vec<PendingWrite>,
    after: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

/// Coalesces writes keyed by SQL text.
pub struct BatchProcessor {
    pool: Arc<ConnectionPool>,
    threshold: usize,
    queue: Mutex<Queue>,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("threshold", &self.threshold)
            .field("groups", &self.group_count())
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    /// Creates a processor flushing a group once it holds `threshold` items.
    pub fn new(pool: Arc<ConnectionPool>, threshold: usize) -> Self {
        Self {
            pool,
            threshold: threshold.max(1),
            queue: Mutex::new(Queue::default()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Queues one write to `table`. When the group reaches the threshold,
    /// exactly the queued items are drained and executed on a background
    /// task; items added afterwards start a fresh group under the same key.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add_batch(&self, table: &str, sql: &str, params: Vec<Value>, callback: BatchCallback) {
        let drained = {
            let mut queue = sync::lock(&self.queue, "batch groups");
            let group = queue.groups.entry(sql.to_string()).or_insert_with(|| Group {
                table: table.to_string(),
                items: Vec::new(),
            });
            group.items.push(PendingWrite { params, callback });
            if group.items.len() >= self.threshold {
                queue.drain(sql)
            } else {
                None
            }
        };

        if let Some(batch) = drained {
            tracing::debug!(count = batch.items.len(), "batch threshold reached, flushing group");
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                execute_group(&pool, batch).await;
            });
        }
    }

    /// Flushes one group, or every group when `key` is `None`.
    ///
    /// Returns the number of items that were drained. Execution failures are
    /// delivered to the item callbacks, never returned here. Returns once the
    /// drained items, and any earlier batch of the same group, have run.
    pub async fn flush(&self, key: Option<&str>) -> usize {
        let drained: Vec<DrainedBatch> = {
            let mut queue = sync::lock(&self.queue, "batch groups");
            match key {
                Some(key) => queue.drain(key).into_iter().collect(),
                None => {
                    queue.prune_finished();
                    let keys: Vec<String> = queue.groups.keys().cloned().collect();
                    keys.iter().filter_map(|key| queue.drain(key)).collect()
                }
            }
        };

        let mut total = 0;
        for batch in drained {
            total += batch.items.len();
            execute_group(&self.pool, batch).await;
        }
        if total > 0 {
            tracing::debug!(count = total, "flushed batched writes");
        }
        total
    }

    /// Items waiting under `key`.
    pub fn pending(&self, key: &str) -> usize {
        sync::lock(&self.queue, "batch groups")
            .groups
            .get(key)
            .map_or(0, |group| group.items.len())
    }

    /// Number of groups with pending items.
    pub fn group_count(&self) -> usize {
        sync::lock(&self.queue, "batch groups").groups.len()
    }
}

async fn execute_group(pool: &ConnectionPool, batch: DrainedBatch) {
    let DrainedBatch {
        sql,
        table,
        items,
        after,
        done,
    } = batch;
    if let Some(previous) = after {
        // Errs once the predecessor drops its sender, which is all we wait for.
        previous.await.ok();
    }

    let (params, callbacks): (Vec<Vec<Value>>, Vec<BatchCallback>) = items
        .into_iter()
        .map(|item| (item.params, item.callback))
        .unzip();

    let result = match pool.ensure_connection().await {
        Ok(db) => tokio::task::spawn_blocking(move || run_batch(&db, &table, &sql, &params))
            .await
            .unwrap_or_else(|e| Err(DbError::Query(format!("batch worker task failed: {e}")))),
        Err(e) => Err(e),
    };

    match result {
        Ok(counts) => {
            for (callback, count) in callbacks.into_iter().zip(counts) {
                deliver(callback, Ok(count));
            }
        }
        Err(e) => {
            tracing::warn!(count = callbacks.len(), error = %e, "batched writes failed");
            let failure = BatchFailure {
                message: e.to_string(),
            };
            for callback in callbacks {
                deliver(callback, Err(failure.clone()));
            }
        }
    }
    drop(done);
}

fn run_batch(pool: &DbPool, table: &str, sql: &str, params: &[Vec<Value>]) -> Result<Vec<usize>, DbError> {
    let mut conn = pool.get()?;
    let tx = conn
        .transaction()
        .map_err(|e| DbError::query("begin batch", table, &e))?;
    let mut counts = Vec::with_capacity(params.len());
    {
        let guard = AccessGuard::install(&tx, Access::Write(table));
        let mut stmt = guard.prepare(sql)?;
        for item in params {
            let count = stmt
                .execute(params_from_iter(item.iter().map(to_sql)))
                .map_err(|e| guard.failed("execute batch", &e))?;
            counts.push(count);
        }
    }
    tx.commit()
        .map_err(|e| DbError::query("commit batch", table, &e))?;
    Ok(counts)
}

fn deliver(callback: BatchCallback, outcome: BatchOutcome) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        tracing::error!("batch result callback panicked");
    }
}
