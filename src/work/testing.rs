//! Scriptable work implementation for handler tests
//!
//! `StubWork` answers every capability from plain fields so tests can force
//! any predicate combination and inspect what the handlers fed back.

use super::{
    NewInputOutputMaps, OperatorAction, Work, WorkDescriptor, WorkError, WorkNameToCollMap,
    WorkProcessing,
};
use crate::store::schema::{ContentUpdate, InputOutputMaps, Processing, ProcessingStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const KIND: &str = "stub";

pub fn build(payload: serde_json::Value) -> Result<Box<dyn Work>, WorkError> {
    Ok(Box::new(serde_json::from_value::<StubWork>(payload)?))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StubWork {
    pub work_id: Option<i64>,
    pub input_collections: Vec<i64>,
    pub output_collections: Vec<i64>,
    pub log_collections: Vec<i64>,
    /// Maps handed out for ids not yet registered.
    pub seed_maps: NewInputOutputMaps,
    pub processing: Option<WorkProcessing>,
    /// Whether `get_or_create_processing` may create a handle.
    pub create_processing: bool,
    pub finished: bool,
    pub subfinished: bool,
    pub failed: bool,
    pub expired: bool,
    pub cancelled: bool,
    pub suspended: bool,
    pub use_dependency: bool,
    pub should_release: bool,
    pub output_data: Option<serde_json::Value>,
    pub terminated_msg: Option<serde_json::Value>,
    // Recorded interactions.
    pub requested_operations: Vec<OperatorAction>,
    pub new_updates_calls: u32,
    pub sync_status_calls: u32,
    pub last_released_count: Option<usize>,
    pub last_all_updates_flushed: Option<bool>,
    pub last_output_statistics: Option<BTreeMap<String, i64>>,
    pub agent_attributes: Option<serde_json::Value>,
    pub work_name_to_coll_map: Option<WorkNameToCollMap>,
}

impl StubWork {
    pub fn new(input_collections: Vec<i64>, output_collections: Vec<i64>) -> Self {
        Self {
            input_collections,
            output_collections,
            create_processing: true,
            should_release: true,
            ..Self::default()
        }
    }

    pub fn with_seed_maps(mut self, maps: NewInputOutputMaps) -> Self {
        self.seed_maps = maps;
        self
    }

    pub fn with_processing_id(mut self, processing_id: i64) -> Self {
        self.processing = Some(WorkProcessing {
            processing_id: Some(processing_id),
            status: Some(ProcessingStatus::Running),
            output_data: None,
        });
        self
    }
}

impl Work for StubWork {
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
        self.agent_attributes = Some(attributes.clone());
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
            .seed_maps
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
        if self.processing.is_none() && self.create_processing {
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
        self.should_release
    }

    fn sync_work_status(
        &mut self,
        _registered: &InputOutputMaps,
        all_updates_flushed: bool,
        output_statistics: &BTreeMap<String, i64>,
        released: &[ContentUpdate],
    ) {
        self.sync_status_calls += 1;
        self.last_all_updates_flushed = Some(all_updates_flushed);
        self.last_output_statistics = Some(output_statistics.clone());
        self.last_released_count = Some(released.len());
    }

    fn has_new_updates(&mut self) {
        self.new_updates_calls += 1;
    }

    fn request_operation(&mut self, op: OperatorAction) {
        self.requested_operations.push(op);
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_subfinished(&self) -> bool {
        self.subfinished
    }

    fn is_failed(&self) -> bool {
        self.failed
    }

    fn is_expired(&self) -> bool {
        self.expired
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn clone_clean(&self) -> Box<dyn Work> {
        let mut cleaned = self.clone();
        cleaned.processing = None;
        cleaned.agent_attributes = None;
        Box::new(cleaned)
    }
}
