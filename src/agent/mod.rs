//! The transformer agent
//!
//! Owns the transform-centric control loop: periodic discovery sweeps claim
//! candidate rows and publish events, the dispatcher fans events out to
//! handler workers under an admission ceiling, and every handler outcome is
//! committed through the deadlock-aware facade.

mod collections;
mod contents;
mod messages;
mod new_transform;
mod update_transform;

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};
use crate::store::schema::{
    Collection, NewProcessing, Processing, ProcessingMetadata, ProcessingStatus, Transform,
    TransformLocking, TransformParameters, TransformStatus,
};
use crate::store::{Repository, RepositoryFacade, StoreError, StoreResult, TransformOutputs};
use crate::work::{Work, WorkError, WorkRegistry};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Statuses handled by the new-transform pathway.
pub(crate) const NEW_TRANSFORM_STATUSES: &[TransformStatus] = &[
    TransformStatus::New,
    TransformStatus::Ready,
    TransformStatus::Extend,
];

/// Statuses handled by the update-transform pathway.
pub(crate) const RUNNING_TRANSFORM_STATUSES: &[TransformStatus] = &[
    TransformStatus::Transforming,
    TransformStatus::ToCancel,
    TransformStatus::Cancelling,
    TransformStatus::ToSuspend,
    TransformStatus::Suspending,
    TransformStatus::ToExpire,
    TransformStatus::Expiring,
    TransformStatus::ToResume,
    TransformStatus::Resuming,
    TransformStatus::ToFinish,
    TransformStatus::ToForceFinish,
];

const SWEEP_PERIOD: Duration = Duration::from_secs(60);
const CLEAN_LOCKS_PERIOD: Duration = Duration::from_secs(1800);
/// Delay before re-publishing an event rejected by admission control.
const REDISPATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Work(#[from] WorkError),
}

/// Keeps the worker gauge balanced on every exit path.
struct WorkerGuard {
    workers: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Transformer {
    id: uuid::Uuid,
    config: Config,
    store: Arc<dyn Repository>,
    facade: RepositoryFacade,
    works: Arc<WorkRegistry>,
    bus: EventBus,
    number_workers: Arc<AtomicUsize>,
}

impl Transformer {
    pub fn new(
        config: Config,
        store: Arc<dyn Repository>,
        works: Arc<WorkRegistry>,
        bus: EventBus,
    ) -> Self {
        let facade = RepositoryFacade::new(Arc::clone(&store), config.message_bulk_size);
        Self {
            id: uuid::Uuid::new_v4(),
            config,
            store,
            facade,
            works,
            bus,
            number_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_ok_to_run_more_requests(&self) -> bool {
        self.number_workers.load(Ordering::SeqCst) < self.config.max_number_workers
    }

    #[cfg(test)]
    pub fn active_workers(&self) -> usize {
        self.number_workers.load(Ordering::SeqCst)
    }

    /// Reserve a worker slot; `None` when the ceiling is reached.
    fn try_acquire_worker(&self) -> Option<WorkerGuard> {
        let mut current = self.number_workers.load(Ordering::SeqCst);
        loop {
            if current >= self.config.max_number_workers {
                return None;
            }
            match self.number_workers.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(WorkerGuard {
                        workers: Arc::clone(&self.number_workers),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn poll_at(&self, period: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(period.as_secs() as i64)
    }

    /// Downgraded parameter write after a handler failure: back off
    /// progressively, fail past the retry budget, always release the lock.
    fn failure_parameters(&self, transform: &Transform) -> TransformParameters {
        let status = if transform.retries > self.config.retries {
            TransformStatus::Failed
        } else {
            TransformStatus::Transforming
        };
        let wait_times = u32::max(4, transform.retries);
        TransformParameters {
            status: Some(status),
            next_poll_at: Some(self.poll_at(self.config.poll_time_period * wait_times)),
            retries: Some(transform.retries + 1),
            locking: Some(TransformLocking::Idle),
            ..TransformParameters::default()
        }
    }

    fn build_new_processing(
        &self,
        transform: &Transform,
        work: &dyn Work,
        status: Option<ProcessingStatus>,
    ) -> Result<NewProcessing, WorkError> {
        let cleaned = work.clone_clean();
        Ok(NewProcessing {
            transform_id: transform.transform_id,
            request_id: transform.request_id,
            workload_id: transform.workload_id,
            status: status.unwrap_or(ProcessingStatus::New),
            expired_at: transform.expired_at,
            processing_metadata: ProcessingMetadata {
                work: cleaned.descriptor()?,
                errors: None,
            },
        })
    }

    async fn load_collections(&self, coll_ids: &[i64]) -> StoreResult<Vec<Collection>> {
        let mut collections = Vec::with_capacity(coll_ids.len());
        for coll_id in coll_ids {
            collections.push(self.store.get_collection(*coll_id).await?);
        }
        Ok(collections)
    }

    async fn load_processing(&self, processing_id: i64) -> StoreResult<Processing> {
        self.store.get_processing(processing_id).await
    }

    /// Commit a handler outcome; on persistent failure fall back to a
    /// parameter-only write so the row lock is released either way.
    async fn persist_outcome(
        &self,
        transform: &Transform,
        outputs: TransformOutputs,
    ) -> (Vec<i64>, Vec<i64>) {
        match self.facade.commit(&outputs).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(
                    transform_id = transform.transform_id,
                    %error,
                    "failed to commit transform outputs, writing parameters only"
                );
                let parameters = TransformParameters {
                    status: Some(TransformStatus::Transforming),
                    next_poll_at: Some(self.poll_at(self.config.poll_time_period)),
                    retries: Some(transform.retries + 1),
                    locking: Some(TransformLocking::Idle),
                    ..TransformParameters::default()
                };
                let fallback =
                    TransformOutputs::parameters_only(transform.transform_id, parameters);
                if let Err(error) = self
                    .store
                    .add_transform_outputs(&fallback, self.config.message_bulk_size)
                    .await
                {
                    tracing::error!(
                        transform_id = transform.transform_id,
                        %error,
                        "failed to release transform lock"
                    );
                }
                (Vec::new(), Vec::new())
            }
        }
    }

    fn publish_processing_events(&self, new_ids: &[i64], updated_ids: &[i64]) {
        for processing_id in new_ids {
            self.bus.publish(Event::NewProcessing {
                processing_id: *processing_id,
            });
        }
        for processing_id in updated_ids {
            self.bus.publish(Event::UpdateProcessing {
                processing_id: *processing_id,
            });
        }
    }

    /// Claim transforms awaiting initial materialisation and publish one
    /// event per row.
    pub(crate) async fn sweep_new_transforms(&self) {
        if !self.is_ok_to_run_more_requests() {
            return;
        }
        tracing::debug!(
            workers = self.number_workers.load(Ordering::SeqCst),
            max_workers = self.config.max_number_workers,
            "sweeping for new transforms"
        );
        let next_poll_at = self.poll_at(self.config.poll_time_period);
        match self
            .store
            .get_transforms_by_status(
                NEW_TRANSFORM_STATUSES,
                next_poll_at,
                self.config.retrieve_bulk_size,
            )
            .await
        {
            Ok(transforms) => {
                if !transforms.is_empty() {
                    tracing::info!(count = transforms.len(), "claimed new transforms");
                }
                for transform in transforms {
                    self.bus.publish(Event::NewTransform {
                        transform_id: transform.transform_id,
                    });
                }
            }
            Err(StoreError::Deadlock) => {
                tracing::warn!("deadlock detected during new-transform sweep");
            }
            Err(error) => {
                tracing::error!(%error, "new-transform sweep failed");
            }
        }
    }

    /// Claim transforms in progress and publish one update event per row.
    pub(crate) async fn sweep_running_transforms(&self) {
        if !self.is_ok_to_run_more_requests() {
            return;
        }
        let next_poll_at = self.poll_at(self.config.poll_time_period);
        match self
            .store
            .get_transforms_by_status(
                RUNNING_TRANSFORM_STATUSES,
                next_poll_at,
                self.config.retrieve_bulk_size,
            )
            .await
        {
            Ok(transforms) => {
                if !transforms.is_empty() {
                    tracing::info!(count = transforms.len(), "claimed running transforms");
                }
                for transform in transforms {
                    self.bus.publish(Event::UpdateTransform {
                        transform_id: transform.transform_id,
                    });
                }
            }
            Err(StoreError::Deadlock) => {
                tracing::warn!("deadlock detected during running-transform sweep");
            }
            Err(error) => {
                tracing::error!(%error, "running-transform sweep failed");
            }
        }
    }

    pub(crate) async fn clean_locks(&self) {
        tracing::info!("clearing stale transform locks");
        if let Err(error) = self.store.clean_locking(self.config.stale_lock_period).await {
            tracing::error!(%error, "stale-lock sweep failed");
        }
    }

    /// Route one event to its handler under admission control. Events this
    /// agent does not subscribe to are left for their owners.
    fn dispatch(self: &Arc<Self>, event: Event) {
        match event.kind() {
            EventKind::NewTransform
            | EventKind::UpdateTransform
            | EventKind::AbortTransform
            | EventKind::ResumeTransform => {
                let Some(guard) = self.try_acquire_worker() else {
                    tracing::debug!(?event, "worker ceiling reached, re-queueing event");
                    let bus = self.bus.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(REDISPATCH_DELAY).await;
                        bus.publish(event);
                    });
                    return;
                };
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    let _guard = guard;
                    agent.handle_event(event).await;
                });
            }
            _ => {}
        }
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::NewTransform { transform_id } => {
                self.process_new_transform(transform_id).await;
            }
            Event::UpdateTransform { transform_id } => {
                self.process_update_transform(transform_id).await;
            }
            Event::AbortTransform { transform_id } => {
                self.process_abort_transform(transform_id).await;
            }
            Event::ResumeTransform { transform_id } => {
                self.process_resume_transform(transform_id).await;
            }
            _ => {}
        }
    }

    /// Main loop: discovery sweeps, the stale-lock sweep, and event
    /// dispatch, until ctrl-c.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(agent_id = %self.id, "starting transformer agent");

        let mut events = self.bus.subscribe();
        let mut new_sweep = tokio::time::interval(SWEEP_PERIOD);
        let mut running_sweep = tokio::time::interval(SWEEP_PERIOD);
        let mut lock_sweep = tokio::time::interval(CLEAN_LOCKS_PERIOD);
        new_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        running_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        lock_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, stopping transformer agent");
                    break;
                }
                _ = new_sweep.tick() => self.sweep_new_transforms().await,
                _ = running_sweep.tick() => self.sweep_running_transforms().await,
                _ = lock_sweep.tick() => self.clean_locks().await,
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::info!(agent_id = %self.id, "transformer agent stopped");
    }
}
