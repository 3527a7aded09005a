//! Sync orchestration: periodic full passes and incremental directory events.

mod config;
mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tagsync_adapters::{DirectoryClient, DirectoryError, ExtractionError, FieldExtractor, HttpDirectoryClient};
use tagsync_core::ValidationError;
use tagsync_storage::{ReconcileReport, ReconciliationStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{
    ConfigView, DirectorySettings, ScheduleSettings, Secret, SecretsPresent, SyncConfig, WebSettings,
    DEFAULT_CONFIG_FILE,
};
pub use events::{EventOutcome, EventProcessor};

pub const CRATE_NAME: &str = "tagsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a full sync pass is already running")]
    AlreadyRunning,
    #[error("full sync pass exceeded {0:?}")]
    Timeout(Duration),
    #[error("directory returned no members with an assigned tag ({fetched} fetched, {skipped} skipped)")]
    EmptyBatch { fetched: usize, skipped: usize },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Extracting,
    Reconciling,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub lapsed_in_listing: usize,
    pub reconcile: ReconcileReport,
}

/// Drives full reconciliation passes; at most one runs at a time.
pub struct FullSyncOrchestrator {
    directory: Arc<dyn DirectoryClient>,
    extractor: FieldExtractor,
    store: ReconciliationStore,
    contact_filter: String,
    pass_timeout: Duration,
    running: AtomicBool,
    phase: watch::Sender<SyncPhase>,
}

struct RunGuard<'a> {
    orchestrator: &'a FullSyncOrchestrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.phase.send_replace(SyncPhase::Idle);
        self.orchestrator.running.store(false, Ordering::Release);
    }
}

impl FullSyncOrchestrator {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        extractor: FieldExtractor,
        store: ReconciliationStore,
        contact_filter: impl Into<String>,
        pass_timeout: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            directory,
            extractor,
            store,
            contact_filter: contact_filter.into(),
            pass_timeout,
            running: AtomicBool::new(false),
            phase,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { orchestrator: self })
    }

    /// One full pass. Returns [`SyncError::AlreadyRunning`] instead of queueing.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.try_begin().ok_or(SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("full_sync", %run_id);

        match tokio::time::timeout(self.pass_timeout, self.run_pass(run_id))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.pass_timeout)),
        }
    }

    async fn run_pass(&self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();

        self.phase.send_replace(SyncPhase::Fetching);
        let records = self.directory.list_active_members(&self.contact_filter).await?;
        info!(fetched = records.len(), "directory listing fetched");

        self.phase.send_replace(SyncPhase::Extracting);
        let mut members = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        let mut lapsed_in_listing = 0usize;
        for record in &records {
            if record.is_lapsed() {
                lapsed_in_listing += 1;
                continue;
            }
            match self.extractor.extract(record) {
                Ok(member) => members.push(member),
                Err(err) => {
                    skipped += 1;
                    warn!(member_id = err.member_id, field = %err.field, error = %err.kind, "skipping directory record");
                }
            }
        }

        if !members.iter().any(|m| m.has_tag()) {
            return Err(SyncError::EmptyBatch {
                fetched: records.len(),
                skipped,
            });
        }

        self.phase.send_replace(SyncPhase::Reconciling);
        let reconcile = self.store.full_reconcile(&members).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: records.len(),
            extracted: members.len(),
            skipped,
            lapsed_in_listing,
            reconcile,
        })
    }

    /// Scheduler entry point: never fails, only logs.
    pub async fn tick(&self) {
        match self.run_once().await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                fetched = summary.fetched,
                skipped = summary.skipped,
                upserted = summary.reconcile.members_upserted,
                pruned = summary.reconcile.members_pruned,
                "full sync pass completed"
            ),
            Err(SyncError::AlreadyRunning) => info!("full sync already in flight; skipping tick"),
            Err(err) => error!(error = %err, "full sync pass failed; retrying on next tick"),
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>, schedule: &ScheduleSettings) -> Result<Option<JobScheduler>> {
        if !schedule.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let orchestrator = Arc::clone(self);
        let job = match schedule.cron.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(cron) => Job::new_async(cron, move |_uuid, _l| {
                let orchestrator = Arc::clone(&orchestrator);
                Box::pin(async move { orchestrator.tick().await })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?,
            None => {
                let every = Duration::from_secs(schedule.interval_secs.max(1));
                Job::new_repeated_async(every, move |_uuid, _l| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move { orchestrator.tick().await })
                })
                .with_context(|| format!("creating scheduler job every {every:?}"))?
            }
        };
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Kick off the startup pass, then the periodic schedule when enabled.
    pub async fn start(self: &Arc<Self>, schedule: &ScheduleSettings) -> Result<Option<JobScheduler>> {
        let sched = self.maybe_build_scheduler(schedule).await?;
        let startup = Arc::clone(self);
        tokio::spawn(async move { startup.tick().await });
        let Some(sched) = sched else {
            info!("scheduler disabled; only the startup pass runs");
            return Ok(None);
        };
        sched.start().await.context("starting scheduler")?;
        Ok(Some(sched))
    }
}

/// Everything built once at process start and shared by reference.
#[derive(Clone)]
pub struct SyncServices {
    pub store: ReconciliationStore,
    pub orchestrator: Arc<FullSyncOrchestrator>,
    pub events: Arc<EventProcessor>,
}

impl SyncServices {
    pub fn new(config: &SyncConfig, store: ReconciliationStore, directory: Arc<dyn DirectoryClient>) -> Self {
        let extractor = FieldExtractor::new(config.field_mapping());
        let orchestrator = Arc::new(FullSyncOrchestrator::new(
            Arc::clone(&directory),
            extractor.clone(),
            store.clone(),
            config.directory.contact_filter.clone(),
            config.pass_timeout(),
        ));
        let events = Arc::new(EventProcessor::new(directory, extractor, store.clone()));
        Self {
            store,
            orchestrator,
            events,
        }
    }

    pub async fn connect(config: &SyncConfig, directory: Arc<dyn DirectoryClient>) -> Result<Self> {
        let store = open_store(config).await?;
        Ok(Self::new(config, store, directory))
    }
}

pub async fn open_store(config: &SyncConfig) -> Result<ReconciliationStore> {
    let store = ReconciliationStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    store.migrate().await.context("migrating store")?;
    Ok(store)
}

pub fn http_directory(config: &SyncConfig) -> Result<Arc<dyn DirectoryClient>> {
    let client = HttpDirectoryClient::new(config.directory_client_config()?)?;
    Ok(Arc::new(client))
}
