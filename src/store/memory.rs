//! In-memory reference implementation of the repository contract
//!
//! Backs the binary's standalone mode and the handler tests. Claim
//! semantics match the production contract: claiming sets `Locking` and
//! bumps `next_poll_at` atomically, rows locked by peers are skipped, and
//! the stale-lock sweep recovers rows abandoned by a crashed worker.

use super::{Repository, StoreError, StoreResult, TransformOutputs};
use crate::store::schema::{
    Collection, CommandMessage, Content, ContentRelationType, ContentStatus, ContentUpdate,
    InputOutputMaps, MessageStatus, NewMessage, Processing, Transform, TransformLocking,
    TransformParameters, TransformStatus,
};
use crate::work::WorkNameToCollMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    transforms: HashMap<i64, Transform>,
    locked_at: HashMap<i64, DateTime<Utc>>,
    contents: BTreeMap<i64, Content>,
    collections: HashMap<i64, Collection>,
    processings: HashMap<i64, Processing>,
    commands: HashMap<i64, Vec<CommandMessage>>,
    outbound: Vec<(i64, NewMessage)>,
    work_name_maps: HashMap<i64, WorkNameToCollMap>,
    injected_failures: VecDeque<StoreError>,
    release_calls: Vec<(Vec<i64>, bool)>,
    commit_count: u32,
    next_content_id: i64,
    next_processing_id: i64,
    next_msg_id: i64,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed a transform row. Standalone deployments submit through the
    /// request layer; tests seed directly.
    #[allow(dead_code)]
    pub fn insert_transform(&self, transform: Transform) {
        let mut state = self.state.lock().unwrap();
        state.transforms.insert(transform.transform_id, transform);
    }

    #[allow(dead_code)] // Test seeding
    pub fn insert_collection(&self, collection: Collection) {
        let mut state = self.state.lock().unwrap();
        state.collections.insert(collection.coll_id, collection);
    }

    /// Insert a content row, assigning its id.
    #[allow(dead_code)] // Test seeding
    pub fn insert_content(&self, mut content: Content) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_content_id += 1;
        content.content_id = state.next_content_id;
        let id = content.content_id;
        state.contents.insert(id, content);
        id
    }

    #[allow(dead_code)] // Test seeding
    pub fn insert_processing(&self, mut processing: Processing) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_processing_id += 1;
        processing.processing_id = state.next_processing_id;
        let id = processing.processing_id;
        state.processings.insert(id, processing);
        id
    }

    #[allow(dead_code)] // Test seeding
    pub fn push_command(&self, transform_id: i64, msg_content: serde_json::Value) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_msg_id += 1;
        let msg_id = state.next_msg_id;
        state.commands.entry(transform_id).or_default().push(CommandMessage {
            msg_id,
            status: MessageStatus::New,
            msg_content,
        });
        msg_id
    }

    #[allow(dead_code)] // Test seeding
    pub fn set_work_name_map(&self, request_id: i64, map: WorkNameToCollMap) {
        let mut state = self.state.lock().unwrap();
        state.work_name_maps.insert(request_id, map);
    }

    /// Queue deadlock errors to be surfaced by upcoming commits.
    #[allow(dead_code)] // Test failure injection
    pub fn inject_deadlocks(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.injected_failures.push_back(StoreError::Deadlock);
        }
    }

    #[allow(dead_code)] // Test inspection
    pub fn commit_count(&self) -> u32 {
        self.state.lock().unwrap().commit_count
    }

    #[allow(dead_code)] // Test inspection
    pub fn transform(&self, transform_id: i64) -> Option<Transform> {
        self.state.lock().unwrap().transforms.get(&transform_id).cloned()
    }

    #[allow(dead_code)] // Test inspection
    pub fn collection(&self, coll_id: i64) -> Option<Collection> {
        self.state.lock().unwrap().collections.get(&coll_id).cloned()
    }

    #[allow(dead_code)] // Test inspection
    pub fn content(&self, content_id: i64) -> Option<Content> {
        self.state.lock().unwrap().contents.get(&content_id).cloned()
    }

    #[allow(dead_code)] // Test inspection
    pub fn contents_of(&self, transform_id: i64) -> Vec<Content> {
        let state = self.state.lock().unwrap();
        state
            .contents
            .values()
            .filter(|c| c.transform_id == transform_id)
            .cloned()
            .collect()
    }

    #[allow(dead_code)] // Test inspection
    pub fn processing_row(&self, processing_id: i64) -> Option<Processing> {
        self.state.lock().unwrap().processings.get(&processing_id).cloned()
    }

    #[allow(dead_code)] // Test inspection
    pub fn outbound_messages(&self) -> Vec<NewMessage> {
        let state = self.state.lock().unwrap();
        state.outbound.iter().map(|(_, m)| m.clone()).collect()
    }

    #[allow(dead_code)] // Test inspection
    pub fn command_status(&self, msg_id: i64) -> Option<MessageStatus> {
        let state = self.state.lock().unwrap();
        state
            .commands
            .values()
            .flatten()
            .find(|m| m.msg_id == msg_id)
            .map(|m| m.status)
    }

    #[allow(dead_code)] // Test inspection
    pub fn release_calls(&self) -> Vec<(Vec<i64>, bool)> {
        self.state.lock().unwrap().release_calls.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_parameters(
    transform: &mut Transform,
    parameters: &TransformParameters,
    locked_at: &mut HashMap<i64, DateTime<Utc>>,
) {
    if let Some(status) = parameters.status {
        transform.status = status;
    }
    if let Some(locking) = parameters.locking {
        transform.locking = locking;
        if locking == TransformLocking::Idle {
            locked_at.remove(&transform.transform_id);
        }
    }
    if let Some(workload_id) = parameters.workload_id {
        transform.workload_id = Some(workload_id);
    }
    if let Some(next_poll_at) = parameters.next_poll_at {
        transform.next_poll_at = next_poll_at;
    }
    if let Some(retries) = parameters.retries {
        transform.retries = retries;
    }
    if let Some(errors) = &parameters.errors {
        transform.errors = Some(errors.clone());
    }
    if let Some(metadata) = &parameters.transform_metadata {
        transform.transform_metadata = metadata.clone();
    }
}

/// Effective terminal status an output contributes to its dependents.
fn effective_status(output: &Content) -> ContentStatus {
    if output.substatus.is_terminated() {
        output.substatus
    } else {
        output.status
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_transforms_by_status(
        &self,
        status: &[TransformStatus],
        next_poll_at: DateTime<Utc>,
        bulk_size: usize,
    ) -> StoreResult<Vec<Transform>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut candidates: Vec<i64> = state
            .transforms
            .values()
            .filter(|t| {
                status.contains(&t.status)
                    && t.locking == TransformLocking::Idle
                    && t.next_poll_at <= now
            })
            .map(|t| t.transform_id)
            .collect();
        candidates.sort_unstable();
        candidates.truncate(bulk_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for transform_id in candidates {
            if let Some(t) = state.transforms.get_mut(&transform_id) {
                t.locking = TransformLocking::Locking;
                t.next_poll_at = next_poll_at;
                claimed.push(t.clone());
            }
            state.locked_at.insert(transform_id, now);
        }
        Ok(claimed)
    }

    async fn get_transform_by_id_status(
        &self,
        transform_id: i64,
        status: Option<&[TransformStatus]>,
        locking: bool,
    ) -> StoreResult<Option<Transform>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let Some(t) = state.transforms.get_mut(&transform_id) else {
            return Err(StoreError::TransformNotFound(transform_id));
        };
        if let Some(status) = status {
            if !status.contains(&t.status) {
                return Ok(None);
            }
        }
        if locking {
            if t.locking == TransformLocking::Locking {
                return Ok(None);
            }
            t.locking = TransformLocking::Locking;
            let claimed = t.clone();
            state.locked_at.insert(transform_id, now);
            return Ok(Some(claimed));
        }
        Ok(Some(t.clone()))
    }

    async fn get_transform_input_output_maps(
        &self,
        transform_id: i64,
        input_coll_ids: &[i64],
        output_coll_ids: &[i64],
        log_coll_ids: &[i64],
    ) -> StoreResult<InputOutputMaps> {
        let state = self.state.lock().unwrap();
        let mut maps = InputOutputMaps::new();
        for content in state.contents.values() {
            if content.transform_id != transform_id {
                continue;
            }
            let entry = maps.entry(content.map_id).or_default();
            match content.content_relation_type {
                ContentRelationType::Input if input_coll_ids.contains(&content.coll_id) => {
                    entry.inputs.push(content.clone());
                }
                ContentRelationType::InputDependency => {
                    entry.inputs_dependency.push(content.clone());
                }
                ContentRelationType::Output if output_coll_ids.contains(&content.coll_id) => {
                    entry.outputs.push(content.clone());
                }
                ContentRelationType::Log if log_coll_ids.contains(&content.coll_id) => {
                    entry.logs.push(content.clone());
                }
                _ => {}
            }
        }
        maps.retain(|_, entry| {
            !(entry.inputs.is_empty()
                && entry.inputs_dependency.is_empty()
                && entry.outputs.is_empty()
                && entry.logs.is_empty())
        });
        Ok(maps)
    }

    async fn get_work_name_to_coll_map(&self, request_id: i64) -> StoreResult<WorkNameToCollMap> {
        let state = self.state.lock().unwrap();
        Ok(state.work_name_maps.get(&request_id).cloned().unwrap_or_default())
    }

    async fn get_collection(&self, coll_id: i64) -> StoreResult<Collection> {
        let state = self.state.lock().unwrap();
        state
            .collections
            .get(&coll_id)
            .cloned()
            .ok_or(StoreError::CollectionNotFound(coll_id))
    }

    async fn get_processing(&self, processing_id: i64) -> StoreResult<Processing> {
        let state = self.state.lock().unwrap();
        state
            .processings
            .get(&processing_id)
            .cloned()
            .ok_or(StoreError::ProcessingNotFound(processing_id))
    }

    async fn release_inputs_by_collection(
        &self,
        to_release: &HashMap<i64, Vec<Content>>,
        final_release: bool,
    ) -> StoreResult<Vec<ContentUpdate>> {
        let mut state = self.state.lock().unwrap();
        let mut coll_ids: Vec<i64> = to_release.keys().copied().collect();
        coll_ids.sort_unstable();
        state.release_calls.push((coll_ids, final_release));

        let mut updates = Vec::new();
        for (coll_id, outputs) in to_release {
            for output in outputs {
                let effective = effective_status(output);
                if !effective.is_terminated() {
                    continue;
                }
                let dependents: Vec<i64> = state
                    .contents
                    .values()
                    .filter(|c| {
                        c.content_relation_type == ContentRelationType::InputDependency
                            && c.coll_id == *coll_id
                            && c.scope == output.scope
                            && c.name == output.name
                            && c.min_id == output.min_id
                            && c.max_id == output.max_id
                            && c.substatus != effective
                    })
                    .map(|c| c.content_id)
                    .collect();
                for content_id in dependents {
                    if let Some(c) = state.contents.get_mut(&content_id) {
                        c.substatus = effective;
                        if final_release {
                            c.status = effective;
                        }
                        updates.push(ContentUpdate {
                            content_id,
                            status: effective,
                            substatus: Some(effective),
                        });
                    }
                }
            }
        }
        Ok(updates)
    }

    async fn poll_inputs_dependency_by_collection(
        &self,
        unfinished: &HashMap<i64, Vec<Content>>,
    ) -> StoreResult<Vec<ContentUpdate>> {
        let state = self.state.lock().unwrap();
        let mut updates = Vec::new();
        for dependencies in unfinished.values() {
            for dependency in dependencies {
                let Some(stored) = state.contents.get(&dependency.content_id) else {
                    continue;
                };
                if stored.substatus.is_terminated() {
                    updates.push(ContentUpdate {
                        content_id: stored.content_id,
                        status: stored.substatus,
                        substatus: Some(stored.substatus),
                    });
                }
            }
        }
        Ok(updates)
    }

    async fn get_transform_message(
        &self,
        transform_id: i64,
        bulk_size: usize,
    ) -> StoreResult<Vec<CommandMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .commands
            .get(&transform_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.status == MessageStatus::New)
                    .take(bulk_size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_transform_outputs(
        &self,
        outputs: &TransformOutputs,
        _message_bulk_size: usize,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }

        let mut transform = match state.transforms.get(&outputs.transform_id) {
            Some(t) => t.clone(),
            None => return Err(StoreError::TransformNotFound(outputs.transform_id)),
        };
        apply_parameters(&mut transform, &outputs.parameters, &mut state.locked_at);
        state.transforms.insert(outputs.transform_id, transform);

        for collection in outputs
            .update_input_collections
            .iter()
            .chain(&outputs.update_output_collections)
            .chain(&outputs.update_log_collections)
        {
            state.collections.insert(collection.coll_id, collection.clone());
        }

        for new_content in &outputs.new_contents {
            state.next_content_id += 1;
            let content_id = state.next_content_id;
            state.contents.insert(
                content_id,
                Content {
                    content_id,
                    transform_id: new_content.transform_id,
                    coll_id: new_content.coll_id,
                    request_id: new_content.request_id,
                    workload_id: new_content.workload_id,
                    map_id: new_content.map_id,
                    scope: new_content.scope.clone(),
                    name: new_content.name.clone(),
                    min_id: new_content.min_id,
                    max_id: new_content.max_id,
                    status: new_content.status,
                    substatus: new_content.substatus,
                    path: new_content.path.clone(),
                    content_type: new_content.content_type,
                    content_relation_type: new_content.content_relation_type,
                    bytes: new_content.bytes,
                    adler32: new_content.adler32.clone(),
                    content_metadata: new_content.content_metadata.clone(),
                },
            );
        }

        for update in &outputs.update_contents {
            if let Some(content) = state.contents.get_mut(&update.content_id) {
                content.status = update.status;
                if let Some(substatus) = update.substatus {
                    content.substatus = substatus;
                }
            }
        }

        for message in &outputs.messages {
            state.next_msg_id += 1;
            let msg_id = state.next_msg_id;
            state.outbound.push((msg_id, message.clone()));
        }

        for update in &outputs.update_messages {
            for msgs in state.commands.values_mut() {
                if let Some(msg) = msgs.iter_mut().find(|m| m.msg_id == update.msg_id) {
                    msg.status = update.status;
                }
            }
        }

        let mut new_processing_ids = Vec::new();
        if let Some(new_processing) = &outputs.new_processing {
            state.next_processing_id += 1;
            let processing_id = state.next_processing_id;
            state.processings.insert(
                processing_id,
                Processing {
                    processing_id,
                    transform_id: new_processing.transform_id,
                    request_id: new_processing.request_id,
                    workload_id: new_processing.workload_id,
                    status: new_processing.status,
                    expired_at: new_processing.expired_at,
                    output_metadata: None,
                    processing_metadata: new_processing.processing_metadata.clone(),
                },
            );
            new_processing_ids.push(processing_id);
        }

        let mut updated_processing_ids = Vec::new();
        if let Some(update) = &outputs.update_processing {
            if let Some(processing) = state.processings.get_mut(&update.processing_id) {
                if let Some(status) = update.status {
                    processing.status = status;
                }
                updated_processing_ids.push(update.processing_id);
            }
        }

        state.commit_count += 1;
        Ok((new_processing_ids, updated_processing_ids))
    }

    async fn clean_locking(&self, stale_after: Duration) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        let stale: Vec<i64> = state
            .locked_at
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for transform_id in stale {
            if let Some(t) = state.transforms.get_mut(&transform_id) {
                t.locking = TransformLocking::Idle;
            }
            state.locked_at.remove(&transform_id);
        }
        Ok(())
    }
}
