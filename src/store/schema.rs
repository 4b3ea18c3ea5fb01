//! Persisted models and status vocabularies
//!
//! Everything the agent reads from or writes back to the relational store
//! lives here. Row updates are expressed as partial-parameter structs so the
//! store can write only what changed.

use crate::work::WorkDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one input→output group inside a transform.
pub type MapId = i64;

/// Transform lifecycle states.
///
/// `To*` states are operator requests; each advances to its progressive
/// partner (`Cancelling`, `Suspending`, ...) on the next update tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    New,
    Ready,
    Extend,
    Transforming,
    Finished,
    SubFinished,
    Failed,
    Expired,
    Cancelled,
    Suspended,
    ToCancel,
    Cancelling,
    ToSuspend,
    Suspending,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    ToFinish,
    ToForceFinish,
}

impl TransformStatus {
    /// Status name as carried in outbound message payloads.
    pub fn name(self) -> &'static str {
        match self {
            TransformStatus::New => "New",
            TransformStatus::Ready => "Ready",
            TransformStatus::Extend => "Extend",
            TransformStatus::Transforming => "Transforming",
            TransformStatus::Finished => "Finished",
            TransformStatus::SubFinished => "SubFinished",
            TransformStatus::Failed => "Failed",
            TransformStatus::Expired => "Expired",
            TransformStatus::Cancelled => "Cancelled",
            TransformStatus::Suspended => "Suspended",
            TransformStatus::ToCancel => "ToCancel",
            TransformStatus::Cancelling => "Cancelling",
            TransformStatus::ToSuspend => "ToSuspend",
            TransformStatus::Suspending => "Suspending",
            TransformStatus::ToResume => "ToResume",
            TransformStatus::Resuming => "Resuming",
            TransformStatus::ToExpire => "ToExpire",
            TransformStatus::Expiring => "Expiring",
            TransformStatus::ToFinish => "ToFinish",
            TransformStatus::ToForceFinish => "ToForceFinish",
        }
    }

    /// Terminal states never leave the agent's control loop again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransformStatus::Finished
                | TransformStatus::SubFinished
                | TransformStatus::Failed
                | TransformStatus::Expired
                | TransformStatus::Cancelled
                | TransformStatus::Suspended
        )
    }
}

impl fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of work a transform drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    StageIn,
    ActiveLearning,
    HyperParameterOpt,
    Processing,
}

/// Row-level mutual exclusion token against concurrent workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformLocking {
    #[default]
    Idle,
    Locking,
}

/// Operator-facing error bag on a transform row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformErrors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_msg: Option<String>,
}

/// Opaque metadata blob on a transform row; the work descriptor is the part
/// this agent deserialises, mutates, and reserialises on write-back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformMetadata {
    pub work: WorkDescriptor,
}

/// A transform row: the unit driven by this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_type: TransformKind,
    pub status: TransformStatus,
    pub locking: TransformLocking,
    pub retries: u32,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<TransformErrors>,
    pub transform_metadata: TransformMetadata,
}

/// Partial update of a transform row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TransformStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locking: Option<TransformLocking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_poll_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<TransformErrors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_metadata: Option<TransformMetadata>,
}

/// Content lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    New,
    Processing,
    Available,
    FakeAvailable,
    FinalFailed,
    Missing,
    Mapped,
}

impl ContentStatus {
    /// Status name as used for output statistics keys and file payloads.
    pub fn name(self) -> &'static str {
        match self {
            ContentStatus::New => "New",
            ContentStatus::Processing => "Processing",
            ContentStatus::Available => "Available",
            ContentStatus::FakeAvailable => "FakeAvailable",
            ContentStatus::FinalFailed => "FinalFailed",
            ContentStatus::Missing => "Missing",
            ContentStatus::Mapped => "Mapped",
        }
    }

    /// Satisfied from a dependency's point of view.
    pub fn is_available(self) -> bool {
        matches!(self, ContentStatus::Available | ContentStatus::FakeAvailable)
    }

    /// Reached a final state, successfully or not.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            ContentStatus::Available
                | ContentStatus::FakeAvailable
                | ContentStatus::FinalFailed
                | ContentStatus::Missing
        )
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relation of a content to its transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRelationType {
    Input,
    InputDependency,
    Output,
    Log,
}

/// Granularity of a tracked content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    File,
    Event,
    Pseudo,
}

/// A registered content row: one tracked file or file-range, uniquely keyed
/// by `(transform_id, coll_id, map_id, scope, name, min_id, max_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub content_id: i64,
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub map_id: MapId,
    pub scope: String,
    pub name: String,
    pub min_id: i64,
    pub max_id: i64,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub path: Option<String>,
    pub content_type: ContentType,
    pub content_relation_type: ContentRelationType,
    pub bytes: i64,
    pub adler32: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_metadata: Option<serde_json::Value>,
}

/// A content staged for insertion; identical to [`Content`] minus the
/// store-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContent {
    pub transform_id: i64,
    pub coll_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub map_id: MapId,
    pub scope: String,
    pub name: String,
    pub min_id: i64,
    pub max_id: i64,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub path: Option<String>,
    pub content_type: ContentType,
    pub content_relation_type: ContentRelationType,
    pub bytes: i64,
    pub adler32: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_metadata: Option<serde_json::Value>,
}

/// Status mutation of a registered content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUpdate {
    pub content_id: i64,
    pub status: ContentStatus,
    /// `None` leaves the substatus column untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substatus: Option<ContentStatus>,
}

/// One input→output group of a transform, as registered in the store.
#[derive(Debug, Clone, Default)]
pub struct MapEntry {
    pub inputs: Vec<Content>,
    pub inputs_dependency: Vec<Content>,
    pub outputs: Vec<Content>,
    pub logs: Vec<Content>,
}

/// All registered maps of a transform, keyed by map id.
pub type InputOutputMaps = BTreeMap<MapId, MapEntry>;

/// Collection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Open,
    Closed,
    SubClosed,
    Failed,
    Cancelled,
    Suspended,
}

impl CollectionStatus {
    pub fn name(self) -> &'static str {
        match self {
            CollectionStatus::Open => "Open",
            CollectionStatus::Closed => "Closed",
            CollectionStatus::SubClosed => "SubClosed",
            CollectionStatus::Failed => "Failed",
            CollectionStatus::Cancelled => "Cancelled",
            CollectionStatus::Suspended => "Suspended",
        }
    }
}

/// A collection row: a logical grouping of contents with aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub status: CollectionStatus,
    pub total_files: i64,
    pub processed_files: i64,
    pub processing_files: i64,
    pub bytes: i64,
}

/// Processing lifecycle states, mirroring the transform vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Finished,
    SubFinished,
    Failed,
    Expired,
    Cancelled,
    Suspended,
    ToCancel,
    Cancelling,
    ToSuspend,
    Suspending,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    ToFinish,
    ToForceFinish,
}

/// Metadata embedded in a processing row. The work copy inside is cleaned of
/// back-references so the persisted form is a tree, not a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub work: WorkDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

/// A persisted processing row, lifecycle-managed by the downstream agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    pub processing_id: i64,
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: ProcessingStatus,
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_metadata: Option<serde_json::Value>,
    pub processing_metadata: ProcessingMetadata,
}

/// A processing row staged for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProcessing {
    pub transform_id: i64,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub status: ProcessingStatus,
    pub expired_at: Option<DateTime<Utc>>,
    pub processing_metadata: ProcessingMetadata,
}

/// Partial update of a processing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingUpdate {
    pub processing_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessingStatus>,
}

/// Outbound message kinds: transform kind × payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    StageInWork,
    StageInCollection,
    StageInFile,
    ActiveLearningWork,
    ActiveLearningCollection,
    ActiveLearningFile,
    HyperParameterOptWork,
    HyperParameterOptCollection,
    HyperParameterOptFile,
    ProcessingWork,
    ProcessingCollection,
    ProcessingFile,
}

impl MessageType {
    /// Wire name carried inside `msg_content`.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::StageInWork => "stage_in_work",
            MessageType::StageInCollection => "stage_in_collection",
            MessageType::StageInFile => "stage_in_file",
            MessageType::ActiveLearningWork => "active_learning_work",
            MessageType::ActiveLearningCollection => "active_learning_collection",
            MessageType::ActiveLearningFile => "active_learning_file",
            MessageType::HyperParameterOptWork => "hyper_parameter_opt_work",
            MessageType::HyperParameterOptCollection => "hyper_parameter_opt_collection",
            MessageType::HyperParameterOptFile => "hyper_parameter_opt_file",
            MessageType::ProcessingWork => "processing_work",
            MessageType::ProcessingCollection => "processing_collection",
            MessageType::ProcessingFile => "processing_file",
        }
    }
}

/// Delivery state of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    New,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Transformer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDestination {
    Outside,
}

/// An outbound notification staged for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub source: MessageSource,
    pub destination: MessageDestination,
    pub request_id: i64,
    pub workload_id: Option<i64>,
    pub transform_id: i64,
    pub num_contents: i64,
    pub msg_content: serde_json::Value,
}

/// An inbound operator command pulled from the message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub msg_id: i64,
    pub status: MessageStatus,
    pub msg_content: serde_json::Value,
}

/// Delivery-state mutation of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub msg_id: i64,
    pub status: MessageStatus,
}
