//! Persistence port and the transactional facade
//!
//! The relational store itself lives outside this crate; everything the
//! agent needs from it is expressed as the [`Repository`] trait. The
//! [`RepositoryFacade`] wraps the one write entry point with deadlock-aware
//! retry so handlers never see transient lock contention.

pub mod memory;
pub mod schema;

use crate::work::WorkNameToCollMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schema::{
    Collection, CommandMessage, Content, ContentUpdate, InputOutputMaps, MessageUpdate,
    NewContent, NewMessage, NewProcessing, Processing, ProcessingUpdate, Transform,
    TransformParameters, TransformStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store detected a deadlock; the operation may be retried.
    #[error("database deadlock detected")]
    Deadlock,
    #[error("transform {0} not found")]
    TransformNotFound(i64),
    #[error("collection {0} not found")]
    CollectionNotFound(i64),
    #[error("processing {0} not found")]
    ProcessingNotFound(i64),
    #[error("database error: {0}")]
    Database(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result bundle of one handler run, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct TransformOutputs {
    pub transform_id: i64,
    pub parameters: TransformParameters,
    pub update_input_collections: Vec<Collection>,
    pub update_output_collections: Vec<Collection>,
    pub update_log_collections: Vec<Collection>,
    pub new_contents: Vec<NewContent>,
    pub update_contents: Vec<ContentUpdate>,
    pub messages: Vec<NewMessage>,
    pub update_messages: Vec<MessageUpdate>,
    pub new_processing: Option<NewProcessing>,
    pub update_processing: Option<ProcessingUpdate>,
}

impl TransformOutputs {
    /// A bundle that writes only the parameter row. Used to release the row
    /// lock after a handler failure without touching anything else.
    pub fn parameters_only(transform_id: i64, parameters: TransformParameters) -> Self {
        Self {
            transform_id,
            parameters,
            ..Self::default()
        }
    }
}

/// Operations the agent consumes from the relational store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Claim up to `bulk_size` transforms in the given statuses whose poll
    /// time has come. Claimed rows atomically get `locking = Locking` and
    /// `next_poll_at` set to the supplied value; rows locked by peers are
    /// skipped, never awaited.
    async fn get_transforms_by_status(
        &self,
        status: &[TransformStatus],
        next_poll_at: DateTime<Utc>,
        bulk_size: usize,
    ) -> StoreResult<Vec<Transform>>;

    /// Fetch a single transform, optionally filtered by status. With
    /// `locking`, the row is claimed on the way out; an already-locked row
    /// yields `None`.
    async fn get_transform_by_id_status(
        &self,
        transform_id: i64,
        status: Option<&[TransformStatus]>,
        locking: bool,
    ) -> StoreResult<Option<Transform>>;

    /// Registered content maps of a transform over the given collections.
    async fn get_transform_input_output_maps(
        &self,
        transform_id: i64,
        input_coll_ids: &[i64],
        output_coll_ids: &[i64],
        log_coll_ids: &[i64],
    ) -> StoreResult<InputOutputMaps>;

    /// Request-scoped `work name → collection ids` resolution.
    async fn get_work_name_to_coll_map(&self, request_id: i64) -> StoreResult<WorkNameToCollMap>;

    async fn get_collection(&self, coll_id: i64) -> StoreResult<Collection>;

    async fn get_processing(&self, processing_id: i64) -> StoreResult<Processing>;

    /// Promote downstream inputs whose dependencies are satisfied by the
    /// given outputs, grouped by collection. Returns the mutations applied.
    async fn release_inputs_by_collection(
        &self,
        to_release: &HashMap<i64, Vec<Content>>,
        final_release: bool,
    ) -> StoreResult<Vec<ContentUpdate>>;

    /// Re-read unfinished dependencies, grouped by collection, returning any
    /// that have terminated since registration.
    async fn poll_inputs_dependency_by_collection(
        &self,
        unfinished: &HashMap<i64, Vec<Content>>,
    ) -> StoreResult<Vec<ContentUpdate>>;

    /// Pending operator command messages for a transform.
    async fn get_transform_message(
        &self,
        transform_id: i64,
        bulk_size: usize,
    ) -> StoreResult<Vec<CommandMessage>>;

    /// Commit one handler's result bundle atomically. Returns the ids of the
    /// processing rows created and updated.
    async fn add_transform_outputs(
        &self,
        outputs: &TransformOutputs,
        message_bulk_size: usize,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)>;

    /// Clear `Locking` flags older than `stale_after`.
    async fn clean_locking(&self, stale_after: Duration) -> StoreResult<()>;
}

/// Deadlock-aware wrapper around [`Repository::add_transform_outputs`].
#[derive(Clone)]
pub struct RepositoryFacade {
    store: Arc<dyn Repository>,
    message_bulk_size: usize,
}

impl RepositoryFacade {
    const MAX_DEADLOCK_ATTEMPTS: u32 = 5;

    pub fn new(store: Arc<dyn Repository>, message_bulk_size: usize) -> Self {
        Self {
            store,
            message_bulk_size,
        }
    }

    fn deadlock_backoff(attempt: u32) -> Duration {
        Duration::from_secs(60 * u64::from(attempt) * 2)
    }

    /// Commit a result bundle, retrying deadlocks with backoff. Surfaces the
    /// deadlock unchanged once the attempt budget is exhausted.
    pub async fn commit(&self, outputs: &TransformOutputs) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .add_transform_outputs(outputs, self.message_bulk_size)
                .await
            {
                Err(StoreError::Deadlock) => {
                    attempt += 1;
                    if attempt >= Self::MAX_DEADLOCK_ATTEMPTS {
                        return Err(StoreError::Deadlock);
                    }
                    let backoff = Self::deadlock_backoff(attempt);
                    tracing::warn!(
                        transform_id = outputs.transform_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "deadlock detected while committing transform outputs, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}
