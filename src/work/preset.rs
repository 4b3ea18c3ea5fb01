//! Built-in declarative work kind
//!
//! `PresetWork` carries its content maps verbatim in the descriptor payload:
//! the submitter enumerates inputs, dependencies, and outputs up front, one
//! processing is launched to produce the outputs, and the terminal
//! predicates are answered from the statistics the agent feeds back each
//! tick. This is the reference plugin for the registry and the
//! production-grade fixture used by the handler tests.

use super::{
    NewInputOutputMaps, NewMapEntry, OperatorAction, Work, WorkDescriptor, WorkError,
    WorkNameToCollMap, WorkProcessing,
};
use crate::store::schema::{
    ContentUpdate, InputOutputMaps, MapId, Processing, ProcessingStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub(crate) const KIND: &str = "preset";

pub(crate) fn build(payload: serde_json::Value) -> Result<Box<dyn Work>, WorkError> {
    Ok(Box::new(serde_json::from_value::<PresetWork>(payload)?))
}

/// Output aggregates from the most recent status sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct OutputStats {
    total: i64,
    available: i64,
    terminated: i64,
    all_flushed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetWork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    work_id: Option<i64>,
    input_collections: Vec<i64>,
    output_collections: Vec<i64>,
    #[serde(default)]
    log_collections: Vec<i64>,
    /// Declared content maps, registered verbatim.
    maps: BTreeMap<MapId, NewMapEntry>,
    #[serde(default)]
    use_dependency: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processing: Option<WorkProcessing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_operation: Option<OperatorAction>,
    #[serde(default)]
    stats: OutputStats,
    #[serde(default)]
    new_updates: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    terminated_msg: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_attributes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    work_name_to_coll_map: Option<WorkNameToCollMap>,
}

impl PresetWork {
    #[allow(dead_code)] // Constructed by submitters and tests; resolved from payloads here
    pub fn new(
        input_collections: Vec<i64>,
        output_collections: Vec<i64>,
        log_collections: Vec<i64>,
    ) -> Self {
        Self {
            work_id: None,
            input_collections,
            output_collections,
            log_collections,
            maps: BTreeMap::new(),
            use_dependency: false,
            processing: None,
            pending_operation: None,
            stats: OutputStats::default(),
            new_updates: false,
            output_data: None,
            terminated_msg: None,
            agent_attributes: None,
            work_name_to_coll_map: None,
        }
    }

    /// Declare one content map.
    #[allow(dead_code)] // Builder method
    pub fn with_map(mut self, map_id: MapId, entry: NewMapEntry) -> Self {
        self.maps.insert(map_id, entry);
        self
    }

    /// Gate downstream job release on dependency resolution.
    #[allow(dead_code)] // Builder method
    pub fn with_dependency_release(mut self) -> Self {
        self.use_dependency = true;
        self
    }

    fn processing_status(&self) -> Option<ProcessingStatus> {
        self.processing.as_ref().and_then(|p| p.status)
    }
}

impl Work for PresetWork {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn descriptor(&self) -> Result<WorkDescriptor, WorkError> {
        Ok(WorkDescriptor {
            kind: KIND.to_string(),
            payload: serde_json::to_value(self)?,
        })
    }

    fn set_work_id(&mut self, transform_id: i64) {
        self.work_id = Some(transform_id);
    }

    fn set_agent_attributes(&mut self, attributes: &serde_json::Value) {
        if !attributes.is_null() {
            self.agent_attributes = Some(attributes.clone());
        }
    }

    fn set_work_name_to_coll_map(&mut self, map: &WorkNameToCollMap) {
        self.work_name_to_coll_map = Some(map.clone());
    }

    fn input_collection_ids(&self) -> Vec<i64> {
        self.input_collections.clone()
    }

    fn output_collection_ids(&self) -> Vec<i64> {
        self.output_collections.clone()
    }

    fn log_collection_ids(&self) -> Vec<i64> {
        self.log_collections.clone()
    }

    fn new_input_output_maps(
        &mut self,
        registered: &InputOutputMaps,
    ) -> Result<NewInputOutputMaps, WorkError> {
        Ok(self
            .maps
            .iter()
            .filter(|(map_id, _)| !registered.contains_key(map_id))
            .map(|(map_id, entry)| (*map_id, entry.clone()))
            .collect())
    }

    fn processing(&self) -> Option<&WorkProcessing> {
        self.processing.as_ref()
    }

    fn get_or_create_processing(
        &mut self,
        _maps: &NewInputOutputMaps,
    ) -> Result<Option<&WorkProcessing>, WorkError> {
        if self.processing.is_none() {
            self.processing = Some(WorkProcessing {
                processing_id: None,
                status: Some(ProcessingStatus::New),
                output_data: None,
            });
        }
        Ok(self.processing.as_ref())
    }

    fn sync_processing(&mut self, persisted: &Processing) {
        let handle = self.processing.get_or_insert_with(WorkProcessing::default);
        handle.processing_id = Some(persisted.processing_id);
        handle.status = Some(persisted.status);
        handle.output_data = persisted.output_metadata.clone();
    }

    fn set_terminated_msg(&mut self, errors: serde_json::Value) {
        self.terminated_msg = Some(errors);
    }

    fn terminated_msg(&self) -> Option<serde_json::Value> {
        self.terminated_msg.clone()
    }

    fn set_output_data(&mut self, output: Option<serde_json::Value>) {
        self.output_data = output;
    }

    fn output_data(&self) -> Option<serde_json::Value> {
        self.output_data.clone()
    }

    fn use_dependency_to_release_jobs(&self) -> bool {
        self.use_dependency
    }

    fn should_release_inputs(
        &self,
        _processing: Option<&Processing>,
        _poll_operation_time_period: Duration,
    ) -> bool {
        true
    }

    fn sync_work_status(
        &mut self,
        registered: &InputOutputMaps,
        all_updates_flushed: bool,
        _output_statistics: &BTreeMap<String, i64>,
        _released: &[ContentUpdate],
    ) {
        let mut stats = OutputStats {
            all_flushed: all_updates_flushed,
            ..OutputStats::default()
        };
        for entry in registered.values() {
            for content in &entry.outputs {
                stats.total += 1;
                if content.status.is_available() {
                    stats.available += 1;
                }
                if content.status.is_terminated() {
                    stats.terminated += 1;
                }
            }
        }
        self.stats = stats;
    }

    fn has_new_updates(&mut self) {
        self.new_updates = true;
    }

    fn request_operation(&mut self, op: OperatorAction) {
        self.pending_operation = Some(op);
    }

    fn is_finished(&self) -> bool {
        match self.pending_operation {
            Some(OperatorAction::ForceFinish) => return true,
            Some(OperatorAction::Finish) => return self.stats.all_flushed,
            _ => {}
        }
        self.stats.all_flushed && self.stats.total > 0 && self.stats.available == self.stats.total
    }

    fn is_subfinished(&self) -> bool {
        self.stats.all_flushed
            && self.stats.total > 0
            && self.stats.available > 0
            && self.stats.available < self.stats.total
            && self.stats.terminated == self.stats.total
    }

    fn is_failed(&self) -> bool {
        if matches!(self.processing_status(), Some(ProcessingStatus::Failed)) {
            return true;
        }
        self.stats.all_flushed
            && self.stats.total > 0
            && self.stats.available == 0
            && self.stats.terminated == self.stats.total
    }

    fn is_expired(&self) -> bool {
        matches!(self.processing_status(), Some(ProcessingStatus::Expired))
            || (matches!(self.pending_operation, Some(OperatorAction::Expire))
                && self.processing.is_none())
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.processing_status(), Some(ProcessingStatus::Cancelled))
            || (matches!(self.pending_operation, Some(OperatorAction::Cancel))
                && self.processing.is_none())
    }

    fn is_suspended(&self) -> bool {
        matches!(self.processing_status(), Some(ProcessingStatus::Suspended))
            || (matches!(self.pending_operation, Some(OperatorAction::Suspend))
                && self.processing.is_none())
    }

    fn clone_clean(&self) -> Box<dyn Work> {
        let mut cleaned = self.clone();
        cleaned.processing = None;
        cleaned.agent_attributes = None;
        Box::new(cleaned)
    }
}
