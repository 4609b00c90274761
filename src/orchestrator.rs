//! Scheduler-facing entry points: one ingestion, one rotation, and the tick that
//! runs both under the retry wrapper.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::error::{IngestError, RotateError};
use crate::ingest::{FileCatalogSource, IngestSummary, IngestionRunner, ProviderIngestor};
use crate::retry::execute_with_retry;
use crate::rotate::{connect_role, DatabaseRotator, RotationReport};
use crate::store::{MemoryStore, Store, StoreRole};
use crate::track::RegionTrackMarker;
use crate::transfer::TableTransferEngine;

/// Handles to the three stores, each tagged with its role.
#[derive(Clone)]
pub struct Stores {
    pub main: Arc<dyn Store>,
    pub staging: Arc<dyn Store>,
    pub backup: Arc<dyn Store>,
}

impl Stores {
    pub async fn connect(config: &PipelineConfig) -> Result<Self, RotateError> {
        Ok(Self {
            main: connect_role(&config.databases, StoreRole::Main).await?,
            staging: connect_role(&config.databases, StoreRole::Staging).await?,
            backup: connect_role(&config.databases, StoreRole::Backup).await?,
        })
    }

    /// Three independent in-process stores, for dry runs.
    pub fn in_memory() -> Self {
        Self {
            main: Arc::new(MemoryStore::new(StoreRole::Main)),
            staging: Arc::new(MemoryStore::new(StoreRole::Staging)),
            backup: Arc::new(MemoryStore::new(StoreRole::Backup)),
        }
    }

    pub fn get(&self, role: StoreRole) -> &Arc<dyn Store> {
        match role {
            StoreRole::Main => &self.main,
            StoreRole::Staging => &self.staging,
            StoreRole::Backup => &self.backup,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    /// None when ingestion gave up after all retries.
    pub ingestion: Option<Vec<IngestSummary>>,
    /// None when rotation gave up or was not attempted.
    pub rotation: Option<RotationReport>,
    pub rotation_skipped: bool,
}

impl TickReport {
    pub fn succeeded(&self) -> bool {
        self.ingestion.is_some() && self.rotation.is_some()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    stores: Stores,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, stores: Stores) -> Self {
        Self { config, stores }
    }

    pub async fn connect(config: PipelineConfig) -> Result<Self, RotateError> {
        let stores = Stores::connect(&config).await?;
        Ok(Self::new(config, stores))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn marker(&self, provider: &str) -> RegionTrackMarker {
        RegionTrackMarker::for_provider(&self.config.track_dir, provider)
    }

    /// Ingest every configured provider into staging, concurrently.
    pub async fn run_ingestion(&self) -> Result<Vec<IngestSummary>, IngestError> {
        let runner = IngestionRunner::new(
            self.config
                .providers
                .iter()
                .map(|key| {
                    ProviderIngestor::new(
                        self.stores.staging.clone(),
                        Arc::new(FileCatalogSource::for_provider(&self.config.catalog_dir, key)),
                        self.marker(key),
                    )
                })
                .collect(),
        );
        runner.run_all().await
    }

    /// Promote staging into main, keeping the previous main in backup.
    pub async fn run_rotation(&self) -> Result<RotationReport, RotateError> {
        DatabaseRotator::new(
            self.stores.main.clone(),
            self.stores.staging.clone(),
            self.stores.backup.clone(),
        )?
        .with_engine(TableTransferEngine::new(self.config.batch_size))
        .rotate()
        .await
    }

    /// Ingestion then rotation, each retried as a whole. Failures are logged and
    /// reported, never raised: the next tick tries again.
    pub async fn run_tick(&self) -> TickReport {
        let policy = &self.config.retry;
        let mut report = TickReport::default();

        match execute_with_retry("ingestion", policy, || async move {
            self.run_ingestion().await.map_err(anyhow::Error::from)
        })
        .await
        {
            Ok(summaries) => report.ingestion = Some(summaries),
            Err(e) => error!(error = %format!("{e:#}"), "ingestion failed"),
        }
        if report.ingestion.is_none() && !self.config.rotate_on_ingest_failure {
            warn!("skipping rotation after failed ingestion");
            report.rotation_skipped = true;
            return report;
        }

        match execute_with_retry("rotation", policy, || async move {
            self.run_rotation().await.map_err(anyhow::Error::from)
        })
        .await
        {
            Ok(rotation) => report.rotation = Some(rotation),
            Err(e) => error!(error = %format!("{e:#}"), "rotation failed"),
        }
        report
    }

    /// Run a tick every `schedule_interval` until ctrl-c. Ticks never overlap.
    pub async fn run_schedule(&self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    runs += 1;
                    let t0 = std::time::Instant::now();
                    let report = self.run_tick().instrument(info_span!("pipeline.tick", run = runs)).await;
                    info!(
                        run = runs,
                        elapsed_ms = t0.elapsed().as_millis() as u64,
                        succeeded = report.succeeded(),
                        "tick complete"
                    );
                }
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!(runs, "shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}
