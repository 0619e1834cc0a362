//! Periodic background loops for a running data service.
//!
//! Includes:
//! - Flushing batch groups that never reach their size threshold.
//! - Forcing a pool health check.
//! - Logging pool and registry statistics.
//!
//! Each loop sleeps for its period, runs one tick, and logs failures without
//! stopping. A zero period disables the loop.

use crate::config::TaskConfig;
use std::time::Duration;
use tabula_db::DataService;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Periods of the three loops. [`Duration::ZERO`] disables a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPeriods {
    pub batch_flush: Duration,
    pub health_check: Duration,
    pub maintenance: Duration,
}

impl From<&TaskConfig> for SchedulerPeriods {
    fn from(config: &TaskConfig) -> Self {
        Self {
            batch_flush: Duration::from_secs(config.batch_flush_secs),
            health_check: Duration::from_secs(config.health_check_secs),
            maintenance: Duration::from_secs(config.maintenance_secs),
        }
    }
}

/// Owns the spawned loops; dropping it without [`TaskScheduler::shutdown`]
/// leaves them running until the runtime stops.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskScheduler {
    /// Spawns every enabled loop on the current runtime.
    pub fn start(service: DataService, periods: SchedulerPeriods) -> Self {
        let mut scheduler = Self::default();

        if periods.batch_flush.is_zero() {
            tracing::warn!("batch flush task disabled (period=0)");
        } else {
            let service = service.clone();
            scheduler.spawn("batch-flush", periods.batch_flush, async move {
                run_batch_flush_loop(service, periods.batch_flush).await;
            });
        }

        if periods.health_check.is_zero() {
            tracing::warn!("health check task disabled (period=0)");
        } else {
            let service = service.clone();
            scheduler.spawn("health-check", periods.health_check, async move {
                run_health_check_loop(service, periods.health_check).await;
            });
        }

        if periods.maintenance.is_zero() {
            tracing::warn!("maintenance task disabled (period=0)");
        } else {
            scheduler.spawn("maintenance", periods.maintenance, async move {
                run_maintenance_loop(service, periods.maintenance).await;
            });
        }

        scheduler
    }

    fn spawn<F>(&mut self, name: &'static str, period: Duration, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::info!(task = name, period_ms = period.as_millis() as u64, "starting background task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Names of the loops that were started and have not stopped.
    pub fn running(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Cancels every loop. Safe to call repeatedly or when no loop was started.
    pub fn shutdown(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            handle.abort();
            tracing::debug!(task = name, "background task stopped");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_batch_flush_loop(service: DataService, period: Duration) {
    loop {
        sleep(period).await;
        let flushed = service.flush_batches().await;
        if flushed > 0 {
            tracing::debug!(count = flushed, "periodic batch flush");
        }
    }
}

async fn run_health_check_loop(service: DataService, period: Duration) {
    loop {
        sleep(period).await;
        match service.pool().check_health().await {
            Ok(()) => tracing::debug!("database health check passed"),
            Err(e) => tracing::error!(error = %e, "database health check failed"),
        }
    }
}

async fn run_maintenance_loop(service: DataService, period: Duration) {
    loop {
        sleep(period).await;
        let pool = service.pool();
        match pool.stats() {
            Some(stats) => tracing::info!(
                status = %pool.status(),
                connections = stats.connections,
                idle = stats.idle_connections,
                max_size = stats.max_size,
                batch_groups = service.batches().group_count(),
                "connection pool statistics"
            ),
            None => tracing::info!(status = %pool.status(), "connection pool not established"),
        }
    }
}
