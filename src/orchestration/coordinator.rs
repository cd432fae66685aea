//! # Batch Coordinator
//!
//! Wires the initiator, completion tracker, consolidator, notification service and
//! recovery sweep over one set of stores.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_batch::config::CoordinatorConfig;
//! use tasker_batch::events::BroadcastNotifier;
//! use tasker_batch::models::WorkUnitSpec;
//! use tasker_batch::orchestration::{BatchCoordinator, CoordinatorStores};
//!
//! # async fn example() -> tasker_batch::Result<()> {
//! let coordinator = BatchCoordinator::new(
//!     &CoordinatorConfig::default(),
//!     CoordinatorStores::in_memory(),
//!     Arc::new(BroadcastNotifier::new(16)),
//! )?;
//!
//! let batch_id = coordinator
//!     .start_batch(&[WorkUnitSpec::bare("u1"), WorkUnitSpec::bare("u2")])
//!     .await?;
//! coordinator.report_completion(&batch_id, "u1", 5).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use super::batch_initiator::{BatchInitiator, WorkDispatcher};
use super::completion_tracker::{CompletionTracker, ConsolidationTrigger};
use super::consolidator::Consolidator;
use super::notification::NotificationService;
use super::recovery::RecoverySweep;
use super::types::{CompletionOutcome, ConsolidationResult};
use crate::config::{ConsolidationMode, CoordinatorConfig};
use crate::database::{DatabaseConnection, DatabaseMigrations};
use crate::error::{BatchError, Result};
use crate::events::{BatchNotifier, EventPublisher, PgNotifyNotifier, PublishedEvent};
use crate::logging::log_error;
use crate::models::{BatchRecord, WorkUnitSpec};
use crate::resilience::RetryPolicy;
use crate::store::{
    BatchStateStore, CanonicalStore, InMemoryBatchStateStore, InMemoryCanonicalStore,
    InMemoryStagingStore, PgBatchStateStore, PgCanonicalStore, PgStagingStore, StagingStore,
};

/// The three stores a coordinator runs against
#[derive(Clone)]
pub struct CoordinatorStores {
    pub state: Arc<dyn BatchStateStore>,
    pub staging: Arc<dyn StagingStore>,
    pub canonical: Arc<dyn CanonicalStore>,
}

impl CoordinatorStores {
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(InMemoryBatchStateStore::new()),
            staging: Arc::new(InMemoryStagingStore::new()),
            canonical: Arc::new(InMemoryCanonicalStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            state: Arc::new(PgBatchStateStore::new(pool.clone())),
            staging: Arc::new(PgStagingStore::new(pool.clone())),
            canonical: Arc::new(PgCanonicalStore::new(pool)),
        }
    }
}

/// Consolidation followed by the consolidated notification
pub struct ConsolidationPipeline {
    consolidator: Consolidator,
    notifications: NotificationService,
}

impl ConsolidationPipeline {
    pub fn new(consolidator: Consolidator, notifications: NotificationService) -> Self {
        Self {
            consolidator,
            notifications,
        }
    }

    /// Consolidate, then notify if the batch has no recorded notification.
    ///
    /// A notification failure is returned after consolidation has committed; the
    /// recovery sweep re-sends it.
    pub async fn run(&self, batch_id: &str) -> Result<ConsolidationResult> {
        let result = self.consolidator.consolidate(batch_id).await?;
        self.notifications.notify_if_pending(batch_id).await?;
        Ok(result)
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }
}

/// Hands claimed batches to the pipeline, inline or on a spawned task
pub struct PipelineTrigger {
    pipeline: Arc<ConsolidationPipeline>,
    mode: ConsolidationMode,
}

impl PipelineTrigger {
    pub fn new(pipeline: Arc<ConsolidationPipeline>, mode: ConsolidationMode) -> Self {
        Self { pipeline, mode }
    }
}

#[async_trait]
impl ConsolidationTrigger for PipelineTrigger {
    async fn trigger(&self, batch_id: &str) -> Result<()> {
        match self.mode {
            ConsolidationMode::Inline => self.pipeline.run(batch_id).await.map(|_| ()),
            ConsolidationMode::Background => {
                let pipeline = self.pipeline.clone();
                let batch_id = batch_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.run(&batch_id).await {
                        log_error(
                            "consolidation_pipeline",
                            "background_consolidate",
                            &e.to_string(),
                            Some(&batch_id),
                        );
                    }
                });
                Ok(())
            }
        }
    }
}

pub struct BatchCoordinator {
    state: Arc<dyn BatchStateStore>,
    retry: RetryPolicy,
    publisher: EventPublisher,
    initiator: BatchInitiator,
    tracker: CompletionTracker,
    pipeline: Arc<ConsolidationPipeline>,
    recovery: Arc<RecoverySweep>,
    dispatcher: Option<Arc<dyn WorkDispatcher>>,
}

impl BatchCoordinator {
    pub fn new(
        config: &CoordinatorConfig,
        stores: CoordinatorStores,
        notifier: Arc<dyn BatchNotifier>,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.backoff);
        let publisher = EventPublisher::new(config.events.channel_capacity);

        let consolidator = Consolidator::new(
            stores.state.clone(),
            stores.staging.clone(),
            stores.canonical.clone(),
            retry.clone(),
            &config.consolidation,
            publisher.clone(),
        );
        let notifications = NotificationService::new(stores.state.clone(), notifier, retry.clone());
        let pipeline = Arc::new(ConsolidationPipeline::new(consolidator, notifications));

        let trigger = Arc::new(PipelineTrigger::new(
            pipeline.clone(),
            config.consolidation.mode,
        ));
        let tracker = CompletionTracker::new(
            stores.state.clone(),
            retry.clone(),
            publisher.clone(),
            trigger,
        );
        let recovery = Arc::new(RecoverySweep::new(
            stores.state.clone(),
            pipeline.clone(),
            config.recovery.clone(),
        ));

        Ok(Self {
            initiator: BatchInitiator::new(stores.state.clone(), publisher.clone()),
            state: stores.state,
            retry,
            publisher,
            tracker,
            pipeline,
            recovery,
            dispatcher: None,
        })
    }

    /// Connect to PostgreSQL, apply migrations if configured, and use `pg_notify`
    pub async fn connect_postgres(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let db = DatabaseConnection::connect(&config.database).await?;
        if config.database.run_migrations {
            let applied = DatabaseMigrations::run_all(db.pool()).await?;
            info!(applied = applied.len(), "Schema migrations checked");
        }

        let pool = db.pool().clone();
        let notifier = PgNotifyNotifier::new(pool.clone(), &config.events.notification_channel)?;
        Self::new(config, CoordinatorStores::postgres(pool), Arc::new(notifier))
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn WorkDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the hand-off the completion tracker uses after winning consolidation
    pub fn with_consolidation_trigger(mut self, trigger: Arc<dyn ConsolidationTrigger>) -> Self {
        self.tracker = CompletionTracker::new(
            self.state.clone(),
            self.retry.clone(),
            self.publisher.clone(),
            trigger,
        );
        self
    }

    pub async fn start_batch(&self, work_units: &[WorkUnitSpec]) -> Result<String> {
        self.initiator.start_batch(work_units).await
    }

    pub async fn start_batch_with_id(
        &self,
        batch_id: &str,
        work_units: &[WorkUnitSpec],
    ) -> Result<BatchRecord> {
        self.initiator.start_batch_with_id(batch_id, work_units).await
    }

    /// Persist a new batch, then dispatch its units through the configured dispatcher
    pub async fn start_and_dispatch(&self, work_units: &[WorkUnitSpec]) -> Result<String> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| BatchError::Dispatch("no work dispatcher configured".to_string()))?;
        self.initiator
            .start_and_dispatch(work_units, dispatcher.as_ref())
            .await
    }

    /// Apply a completion report; returns whether the batch is complete
    pub async fn report_completion(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<bool> {
        Ok(self
            .tracker
            .report_completion(batch_id, unit_id, output_count)
            .await?
            .batch_is_complete)
    }

    pub async fn report_completion_detailed(
        &self,
        batch_id: &str,
        unit_id: &str,
        output_count: u64,
    ) -> Result<CompletionOutcome> {
        self.tracker
            .report_completion(batch_id, unit_id, output_count)
            .await
    }

    /// Run consolidation and notification for a batch already claimed as `CONSOLIDATING`
    #[instrument(skip(self))]
    pub async fn consolidate(&self, batch_id: &str) -> Result<ConsolidationResult> {
        self.pipeline.run(batch_id).await
    }

    pub async fn batch(&self, batch_id: &str) -> Result<BatchRecord> {
        self.retry
            .run("fetch_batch", || self.state.fetch_batch(batch_id))
            .await?
            .ok_or_else(|| BatchError::unknown_batch(batch_id))
    }

    pub fn recovery(&self) -> Arc<RecoverySweep> {
        self.recovery.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.publisher.subscribe()
    }
}
