//! Host integration for the Tabula data-access layer.
//!
//! A host loads a [`Config`], installs logging with [`init_tracing`], and
//! starts a [`DataHost`]. The host owns the [`DataService`] and its
//! background loops, and is the boundary where caller identities are
//! resolved into [`TenantHandle`]s.

pub mod config;
pub mod scheduler;

pub use config::{load_config, Config, ConfigError, LoggingConfig};
pub use scheduler::{SchedulerPeriods, TaskScheduler};

use tabula_db::{DataService, DbError, TenantHandle};
use tabula_types::TenantId;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors that can occur while starting or running a host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    /// A global tracing subscriber was already installed.
    #[error("failed to initialize tracing: {0}")]
    Tracing(String),
}

/// Installs the global `tracing` subscriber.
///
/// An unparseable level falls back to `info`.
///
/// # Errors
///
/// Returns [`HostError::Tracing`] if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), HostError> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|e| HostError::Tracing(e.to_string()))
}

/// A running data service together with its background loops.
#[derive(Debug)]
pub struct DataHost {
    service: DataService,
    scheduler: TaskScheduler,
}

impl DataHost {
    /// Builds the service, creates the migration ledger, establishes the pool
    /// and starts the background loops.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Config`] for invalid settings and
    /// [`HostError::Database`] if the database cannot be initialised.
    pub async fn start(config: &Config) -> Result<Self, HostError> {
        config.validate()?;
        let service = DataService::new(config.service_settings());

        if let Err(e) = Self::initialize(&service).await {
            service.shutdown().await;
            return Err(e.into());
        }

        let scheduler = TaskScheduler::start(service.clone(), SchedulerPeriods::from(&config.tasks));
        tracing::info!(path = %config.database.path, "data host started");
        Ok(Self { service, scheduler })
    }

    async fn initialize(service: &DataService) -> Result<(), DbError> {
        service.pool().ensure_connection().await?;
        service.migrations().initialize().await
    }

    pub fn service(&self) -> &DataService {
        &self.service
    }

    /// Handle for a caller whose identity the host has already resolved.
    pub fn tenant(&self, tenant: TenantId) -> TenantHandle {
        self.service.for_tenant(tenant)
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Stops the background loops, flushes pending batches and closes the
    /// pool.
    pub async fn stop(mut self) {
        self.scheduler.shutdown();
        self.service.shutdown().await;
        tracing::info!("data host stopped");
    }
}
