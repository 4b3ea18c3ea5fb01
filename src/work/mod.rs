//! Work descriptor plumbing
//!
//! A *work* is the pluggable unit of logic carried inside
//! `transform_metadata`: it computes derived content maps, owns the
//! processing handle, and answers the terminal predicates the state machine
//! consults. Descriptors persist as an opaque `{kind, payload}` pair and are
//! resolved back into concrete implementations through a kind registry.

mod preset;

#[cfg(test)]
pub mod testing;

pub use preset::PresetWork;

use crate::store::schema::{
    ContentStatus, ContentType, ContentUpdate, InputOutputMaps, MapId, Processing,
    ProcessingStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Request-scoped resolution of work names to the collections they own.
pub type WorkNameToCollMap = HashMap<String, Vec<i64>>;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("unknown work kind: {0}")]
    UnknownKind(String),
    #[error("work descriptor payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("work plugin error: {0}")]
    Plugin(String),
}

/// Operator intents recorded on a work descriptor. The downstream processing
/// agent reads them from the cleaned copy embedded in its processing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Cancel,
    Suspend,
    Resume,
    Expire,
    Finish,
    ForceFinish,
}

/// The processing handle a work carries: created on demand by this agent,
/// synchronised from the persisted row on every update tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkProcessing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
}

/// A content spec produced by a work plugin before registration defaults are
/// applied. Absent ids and statuses are filled in during flattening.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentSeed {
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substatus: Option<ContentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adler32: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_metadata: Option<serde_json::Value>,
}

/// One not-yet-registered input→output group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMapEntry {
    #[serde(default)]
    pub inputs: Vec<ContentSeed>,
    #[serde(default)]
    pub inputs_dependency: Vec<ContentSeed>,
    #[serde(default)]
    pub outputs: Vec<ContentSeed>,
    #[serde(default)]
    pub logs: Vec<ContentSeed>,
}

/// Maps a work plugin wants registered, keyed by map id.
pub type NewInputOutputMaps = BTreeMap<MapId, NewMapEntry>;

/// Capability interface every work kind implements.
///
/// Implementations are mutated in place by the handlers and reserialised
/// into `transform_metadata` on write-back, so every mutation must be
/// reflected in [`Work::descriptor`].
pub trait Work: fmt::Debug + Send {
    /// Registry key of this work kind.
    fn kind(&self) -> &'static str;

    /// Serialise the current state back into a persistable descriptor.
    fn descriptor(&self) -> Result<WorkDescriptor, WorkError>;

    fn set_work_id(&mut self, transform_id: i64);

    fn set_agent_attributes(&mut self, attributes: &serde_json::Value);

    fn set_work_name_to_coll_map(&mut self, map: &WorkNameToCollMap);

    fn input_collection_ids(&self) -> Vec<i64>;

    fn output_collection_ids(&self) -> Vec<i64>;

    fn log_collection_ids(&self) -> Vec<i64>;

    /// Maps not yet present in `registered` that should be registered now.
    fn new_input_output_maps(
        &mut self,
        registered: &InputOutputMaps,
    ) -> Result<NewInputOutputMaps, WorkError>;

    /// The processing handle, if one has been created.
    fn processing(&self) -> Option<&WorkProcessing>;

    /// The processing handle, creating one on demand when the work is ready
    /// to launch. `None` means this work never launches a processing.
    fn get_or_create_processing(
        &mut self,
        maps: &NewInputOutputMaps,
    ) -> Result<Option<&WorkProcessing>, WorkError>;

    /// Merge status and output data from the persisted processing row.
    fn sync_processing(&mut self, persisted: &Processing);

    fn set_terminated_msg(&mut self, errors: serde_json::Value);

    fn terminated_msg(&self) -> Option<serde_json::Value>;

    fn set_output_data(&mut self, output: Option<serde_json::Value>);

    fn output_data(&self) -> Option<serde_json::Value>;

    /// Whether downstream job release is gated on dependency resolution.
    fn use_dependency_to_release_jobs(&self) -> bool;

    /// Whether the dependency pass should run this tick.
    fn should_release_inputs(
        &self,
        processing: Option<&Processing>,
        poll_operation_time_period: Duration,
    ) -> bool;

    /// Hand the work the registered maps plus this tick's aggregates so it
    /// can update its internal status.
    fn sync_work_status(
        &mut self,
        registered: &InputOutputMaps,
        all_updates_flushed: bool,
        output_statistics: &BTreeMap<String, i64>,
        released: &[ContentUpdate],
    );

    /// Notify the work that this tick produced content changes.
    fn has_new_updates(&mut self);

    /// Record an operator intent on the descriptor.
    fn request_operation(&mut self, op: OperatorAction);

    fn is_finished(&self) -> bool;
    fn is_subfinished(&self) -> bool;
    fn is_failed(&self) -> bool;
    fn is_expired(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn is_suspended(&self) -> bool;

    fn is_terminated(&self) -> bool {
        self.is_finished()
            || self.is_subfinished()
            || self.is_failed()
            || self.is_expired()
            || self.is_cancelled()
            || self.is_suspended()
    }

    /// Deep copy with back-references (processing handle, agent attributes)
    /// nulled, for embedding into a processing row.
    fn clone_clean(&self) -> Box<dyn Work>;
}

/// Persisted form of a work: a kind tag plus an opaque payload the concrete
/// implementation round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub kind: String,
    pub payload: serde_json::Value,
}

type WorkBuilder = fn(serde_json::Value) -> Result<Box<dyn Work>, WorkError>;

/// Registry mapping descriptor kinds to constructors.
#[derive(Default)]
pub struct WorkRegistry {
    builders: HashMap<String, WorkBuilder>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the crate's built-in kinds.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register(preset::KIND, preset::build);
        registry
    }

    pub fn register(&mut self, kind: &str, builder: WorkBuilder) {
        self.builders.insert(kind.to_string(), builder);
    }

    /// Resolve a persisted descriptor into a live work implementation.
    pub fn resolve(&self, descriptor: &WorkDescriptor) -> Result<Box<dyn Work>, WorkError> {
        let builder = self
            .builders
            .get(&descriptor.kind)
            .ok_or_else(|| WorkError::UnknownKind(descriptor.kind.clone()))?;
        builder(descriptor.payload.clone())
    }
}

impl fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("kinds", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}
