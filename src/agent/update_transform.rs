//! Per-tick reconciliation of a running transform
//!
//! One update tick: hydrate the work and its collections, sync the
//! processing, discover new contents, evaluate dependencies, synchronise
//! counters, let the work refresh its status, and apply the state machine.
//! Operator command messages bypass all of it and apply row parameters
//! directly. Abort and resume events run their own reduced handlers.

use super::collections::sync_collection_status;
use super::contents::{
    collect_release_groups, collect_unfinished_dependencies, evaluate_dependencies,
    flatten_new_contents, reactivate_contents, DependencyUpdates,
};
use super::messages::{collection_message, file_message, work_message, FileRecord, RelationLabel};
use super::{AgentError, Transformer, RUNNING_TRANSFORM_STATUSES};
use crate::events::Event;
use crate::state_machine::{evaluate, operator_action, processing_status_for, Disposition};
use crate::store::schema::{
    CollectionStatus, CommandMessage, ContentUpdate, MessageStatus, MessageUpdate, Transform,
    TransformErrors, TransformLocking, TransformMetadata, TransformParameters, TransformStatus,
};
use crate::store::TransformOutputs;
use crate::work::OperatorAction;

impl Transformer {
    pub(crate) async fn process_update_transform(&self, transform_id: i64) {
        let claimed = self
            .store
            .get_transform_by_id_status(transform_id, Some(RUNNING_TRANSFORM_STATUSES), true)
            .await;
        match claimed {
            Ok(Some(transform)) => {
                let outputs = self.handle_update_transform(&transform).await;
                self.bus.publish(Event::UpdateRequest {
                    request_id: transform.request_id,
                });
                let (new_ids, updated_ids) = self.persist_outcome(&transform, outputs).await;
                self.publish_processing_events(&new_ids, &updated_ids);
            }
            Ok(None) => {
                tracing::debug!(transform_id, "transform not claimable for update handling");
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "failed to claim running transform");
            }
        }
    }

    /// Run one update tick, containing any failure into a downgraded
    /// parameter write. A pending operator command message short-circuits
    /// the normal tick.
    pub(crate) async fn handle_update_transform(&self, transform: &Transform) -> TransformOutputs {
        match self
            .store
            .get_transform_message(transform.transform_id, 1)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                tracing::info!(
                    transform_id = transform.transform_id,
                    "applying operator command message"
                );
                return self.apply_command_message(transform, &messages[0]);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(
                    transform_id = transform.transform_id,
                    %error,
                    "failed to read operator command messages"
                );
                return TransformOutputs::parameters_only(
                    transform.transform_id,
                    self.failure_parameters(transform),
                );
            }
        }

        tracing::info!(transform_id = transform.transform_id, "handling running transform");
        match self.handle_update_transform_inner(transform).await {
            Ok(outputs) => outputs,
            Err(error) => {
                tracing::error!(
                    transform_id = transform.transform_id,
                    %error,
                    "update transform handling failed"
                );
                TransformOutputs::parameters_only(
                    transform.transform_id,
                    self.failure_parameters(transform),
                )
            }
        }
    }

    /// The operator's escape hatch: apply row parameters verbatim, outside
    /// the state machine.
    fn apply_command_message(
        &self,
        transform: &Transform,
        message: &CommandMessage,
    ) -> TransformOutputs {
        let command = message.msg_content.get("command").and_then(|v| v.as_str());
        if command == Some("update_transform") {
            let raw = message
                .msg_content
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            if let Ok(mut parameters) = serde_json::from_value::<TransformParameters>(raw) {
                parameters.locking = Some(TransformLocking::Idle);
                return TransformOutputs {
                    transform_id: transform.transform_id,
                    parameters,
                    update_messages: vec![MessageUpdate {
                        msg_id: message.msg_id,
                        status: MessageStatus::Delivered,
                    }],
                    ..TransformOutputs::default()
                };
            }
        }

        tracing::error!(
            transform_id = transform.transform_id,
            msg_id = message.msg_id,
            ?command,
            "unknown operator command"
        );
        TransformOutputs {
            transform_id: transform.transform_id,
            parameters: TransformParameters {
                locking: Some(TransformLocking::Idle),
                ..TransformParameters::default()
            },
            update_messages: vec![MessageUpdate {
                msg_id: message.msg_id,
                status: MessageStatus::Failed,
            }],
            ..TransformOutputs::default()
        }
    }

    async fn handle_update_transform_inner(
        &self,
        transform: &Transform,
    ) -> Result<TransformOutputs, AgentError> {
        let mut tf = transform.clone();
        let is_operation = operator_action(tf.status).is_some();

        let mut work = self.works.resolve(&tf.transform_metadata.work)?;
        work.set_work_id(tf.transform_id);
        work.set_agent_attributes(&self.config.agent_attributes);

        let input_coll_ids = work.input_collection_ids();
        let output_coll_ids = work.output_collection_ids();
        let log_coll_ids = work.log_collection_ids();
        let mut input_collections = self.load_collections(&input_coll_ids).await?;
        let mut output_collections = self.load_collections(&output_coll_ids).await?;
        let mut log_collections = self.load_collections(&log_coll_ids).await?;

        let mut registered = self
            .store
            .get_transform_input_output_maps(
                tf.transform_id,
                &input_coll_ids,
                &output_coll_ids,
                &log_coll_ids,
            )
            .await?;

        let name_map = self.store.get_work_name_to_coll_map(tf.request_id).await?;
        work.set_work_name_to_coll_map(&name_map);

        // Sync the processing the work already knows about and propagate its
        // workload handle back onto the row.
        let mut processing_row = None;
        if let Some(processing_id) = work.processing().and_then(|p| p.processing_id) {
            let persisted = self.load_processing(processing_id).await?;
            work.sync_processing(&persisted);
            if let Some(errors) = persisted.processing_metadata.errors.clone() {
                work.set_terminated_msg(errors);
            }
            let output_data = work.processing().and_then(|p| p.output_data.clone());
            work.set_output_data(output_data);
            tf.workload_id = persisted.workload_id;
            processing_row = Some(persisted);
        }

        let new_maps = work.new_input_output_maps(&registered)?;
        let new_contents = flatten_new_contents(&tf, &new_maps);

        // Create the processing if the work wants one and none is persisted
        // yet. A pending operator request stamps the new row.
        if work.processing().is_none() {
            let _ = work.get_or_create_processing(&new_maps)?;
        }
        let mut new_processing = None;
        if let Some(handle) = work.processing() {
            if handle.processing_id.is_none() {
                let stamped = operator_action(tf.status).map(processing_status_for);
                new_processing =
                    Some(self.build_new_processing(&tf, work.as_ref(), stamped)?);
            }
        }

        // Dependency evaluation and input release.
        let mut updated = DependencyUpdates::default();
        let mut released: Vec<ContentUpdate> = Vec::new();
        if work.should_release_inputs(
            processing_row.as_ref(),
            self.config.poll_operation_time_period,
        ) {
            updated = evaluate_dependencies(&mut registered);
            if work.use_dependency_to_release_jobs() {
                let groups = collect_release_groups(&registered);
                released = self
                    .store
                    .release_inputs_by_collection(&groups, false)
                    .await?;
                if released.is_empty() {
                    let unfinished = collect_unfinished_dependencies(&registered);
                    released = self
                        .store
                        .poll_inputs_dependency_by_collection(&unfinished)
                        .await?;
                }
            }
        }

        let mut messages = Vec::new();
        if !new_contents.inputs.is_empty() {
            let records: Vec<FileRecord> = new_contents.inputs.iter().map(FileRecord::from).collect();
            messages.push(file_message(&tf, &records, RelationLabel::Input));
        }
        if !new_contents.outputs.is_empty() {
            let records: Vec<FileRecord> =
                new_contents.outputs.iter().map(FileRecord::from).collect();
            messages.push(file_message(&tf, &records, RelationLabel::Output));
        }
        if !updated.inputs_full.is_empty() {
            let records: Vec<FileRecord> = updated.inputs_full.iter().map(FileRecord::from).collect();
            messages.push(file_message(&tf, &records, RelationLabel::Input));
        }
        if !updated.outputs_full.is_empty() {
            let records: Vec<FileRecord> =
                updated.outputs_full.iter().map(FileRecord::from).collect();
            messages.push(file_message(&tf, &records, RelationLabel::Output));
        }

        let sync = sync_collection_status(
            &mut input_collections,
            &mut output_collections,
            &mut log_collections,
            &registered,
        );

        work.sync_work_status(
            &registered,
            sync.all_updates_flushed,
            &sync.output_statistics,
            &released,
        );

        // A terminated work releases every final-status file downstream.
        if work.is_terminated() && work.use_dependency_to_release_jobs() {
            tracing::info!(
                transform_id = tf.transform_id,
                "work terminated, triggering final input release"
            );
            let groups = collect_release_groups(&registered);
            let more = self.store.release_inputs_by_collection(&groups, true).await?;
            released.extend(more);
        }

        let mut reactivated = Vec::new();
        let mut resuming = false;
        match evaluate(tf.status, work.as_ref()) {
            Disposition::Operator { action, next_status } => {
                work.request_operation(action);
                tf.status = next_status;
                if action == OperatorAction::Resume {
                    resuming = true;
                    tf.retries = 0;
                    reactivated = reactivate_contents(&registered);
                    for coll in input_collections
                        .iter_mut()
                        .chain(&mut output_collections)
                        .chain(&mut log_collections)
                    {
                        coll.status = CollectionStatus::Open;
                    }
                }
            }
            Disposition::Terminal {
                next_status,
                collection_status,
            } => {
                tf.status = next_status;
                messages.push(work_message(&tf, work.as_ref()));
                for coll in &mut input_collections {
                    coll.status = collection_status;
                    messages.push(collection_message(&tf, work.as_ref(), coll, RelationLabel::Input));
                }
                for coll in &mut output_collections {
                    coll.status = collection_status;
                    messages.push(collection_message(&tf, work.as_ref(), coll, RelationLabel::Output));
                }
                for coll in &mut log_collections {
                    coll.status = collection_status;
                    messages.push(collection_message(&tf, work.as_ref(), coll, RelationLabel::Log));
                }
            }
            Disposition::Continue => {
                tf.status = TransformStatus::Transforming;
            }
        }

        // Operator ticks re-poll quickly; a resume waits out the downstream
        // restart before the next look.
        let next_poll_at = if resuming {
            self.poll_at(self.config.poll_operation_time_period * 5)
        } else if is_operation {
            self.poll_at(self.config.poll_operation_time_period)
        } else {
            self.poll_at(self.config.poll_time_period)
        };

        if !new_contents.is_empty() || !updated.updates.is_empty() || !released.is_empty() {
            work.has_new_updates();
        }

        let parameters = TransformParameters {
            status: Some(tf.status),
            locking: Some(TransformLocking::Idle),
            workload_id: tf.workload_id,
            next_poll_at: Some(next_poll_at),
            retries: Some(0),
            transform_metadata: Some(TransformMetadata {
                work: work.descriptor()?,
            }),
            ..TransformParameters::default()
        };

        let mut update_contents = updated.updates;
        update_contents.extend(released);
        update_contents.extend(reactivated);

        Ok(TransformOutputs {
            transform_id: tf.transform_id,
            parameters,
            update_input_collections: input_collections,
            update_output_collections: output_collections,
            update_log_collections: log_collections,
            new_contents: new_contents.into_all(),
            update_contents,
            messages,
            update_messages: Vec::new(),
            new_processing,
            update_processing: None,
        })
    }

    pub(crate) async fn process_abort_transform(&self, transform_id: i64) {
        let transform = match self
            .store
            .get_transform_by_id_status(transform_id, None, true)
            .await
        {
            Ok(Some(transform)) => transform,
            Ok(None) => {
                tracing::debug!(transform_id, "transform not claimable for abort");
                return;
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "failed to claim transform for abort");
                return;
            }
        };

        if transform.status.is_terminal() {
            let parameters = TransformParameters {
                locking: Some(TransformLocking::Idle),
                errors: Some(TransformErrors {
                    msg: transform.errors.as_ref().and_then(|e| e.msg.clone()),
                    extra_msg: Some(
                        "transform is already terminated and cannot be aborted".to_string(),
                    ),
                }),
                ..TransformParameters::default()
            };
            self.persist_outcome(
                &transform,
                TransformOutputs::parameters_only(transform_id, parameters),
            )
            .await;
            return;
        }

        match self.handle_abort_transform(&transform) {
            Ok(outputs) => {
                self.persist_outcome(&transform, outputs).await;
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "abort transform handling failed");
            }
        }
        self.publish_processing_followup(&transform, Event::AbortProcessing { processing_id: 0 });
    }

    pub(crate) async fn process_resume_transform(&self, transform_id: i64) {
        let transform = match self
            .store
            .get_transform_by_id_status(transform_id, None, true)
            .await
        {
            Ok(Some(transform)) => transform,
            Ok(None) => {
                tracing::debug!(transform_id, "transform not claimable for resume");
                return;
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "failed to claim transform for resume");
                return;
            }
        };

        if transform.status == TransformStatus::Finished {
            let parameters = TransformParameters {
                locking: Some(TransformLocking::Idle),
                errors: Some(TransformErrors {
                    msg: transform.errors.as_ref().and_then(|e| e.msg.clone()),
                    extra_msg: Some(
                        "transform is already finished and cannot be resumed".to_string(),
                    ),
                }),
                ..TransformParameters::default()
            };
            self.persist_outcome(
                &transform,
                TransformOutputs::parameters_only(transform_id, parameters),
            )
            .await;
            return;
        }

        match self.handle_resume_transform(&transform).await {
            Ok(outputs) => {
                self.persist_outcome(&transform, outputs).await;
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "resume transform handling failed");
            }
        }
        self.publish_processing_followup(&transform, Event::ResumeProcessing { processing_id: 0 });
    }

    /// Record the cancel intent on the work and move the row into
    /// `Cancelling`.
    fn handle_abort_transform(&self, transform: &Transform) -> Result<TransformOutputs, AgentError> {
        let mut work = self.works.resolve(&transform.transform_metadata.work)?;
        work.set_work_id(transform.transform_id);
        work.set_agent_attributes(&self.config.agent_attributes);
        work.request_operation(OperatorAction::Cancel);

        let parameters = TransformParameters {
            status: Some(TransformStatus::Cancelling),
            locking: Some(TransformLocking::Idle),
            next_poll_at: Some(self.poll_at(self.config.poll_operation_time_period)),
            transform_metadata: Some(TransformMetadata {
                work: work.descriptor()?,
            }),
            ..TransformParameters::default()
        };
        Ok(TransformOutputs::parameters_only(
            transform.transform_id,
            parameters,
        ))
    }

    /// Resume outside the normal tick: reactivate incomplete maps, reopen
    /// the collections, and reset the retry budget.
    async fn handle_resume_transform(
        &self,
        transform: &Transform,
    ) -> Result<TransformOutputs, AgentError> {
        let mut work = self.works.resolve(&transform.transform_metadata.work)?;
        work.set_work_id(transform.transform_id);
        work.set_agent_attributes(&self.config.agent_attributes);

        let input_coll_ids = work.input_collection_ids();
        let output_coll_ids = work.output_collection_ids();
        let log_coll_ids = work.log_collection_ids();
        let mut input_collections = self.load_collections(&input_coll_ids).await?;
        let mut output_collections = self.load_collections(&output_coll_ids).await?;
        let mut log_collections = self.load_collections(&log_coll_ids).await?;

        let registered = self
            .store
            .get_transform_input_output_maps(
                transform.transform_id,
                &input_coll_ids,
                &output_coll_ids,
                &log_coll_ids,
            )
            .await?;

        work.request_operation(OperatorAction::Resume);
        let reactivated = reactivate_contents(&registered);
        for coll in input_collections
            .iter_mut()
            .chain(&mut output_collections)
            .chain(&mut log_collections)
        {
            coll.status = CollectionStatus::Open;
        }

        let parameters = TransformParameters {
            status: Some(TransformStatus::Resuming),
            retries: Some(0),
            locking: Some(TransformLocking::Idle),
            next_poll_at: Some(self.poll_at(self.config.poll_operation_time_period)),
            transform_metadata: Some(TransformMetadata {
                work: work.descriptor()?,
            }),
            ..TransformParameters::default()
        };

        Ok(TransformOutputs {
            transform_id: transform.transform_id,
            parameters,
            update_input_collections: input_collections,
            update_output_collections: output_collections,
            update_log_collections: log_collections,
            update_contents: reactivated,
            ..TransformOutputs::default()
        })
    }

    /// Route the operator request downstream: to the processing agent when a
    /// processing exists, back to this agent's update path otherwise.
    fn publish_processing_followup(&self, transform: &Transform, template: Event) {
        match self.works.resolve(&transform.transform_metadata.work) {
            Ok(work) => {
                if let Some(processing_id) = work.processing().and_then(|p| p.processing_id) {
                    let event = match template {
                        Event::AbortProcessing { .. } => Event::AbortProcessing { processing_id },
                        _ => Event::ResumeProcessing { processing_id },
                    };
                    self.bus.publish(event);
                } else {
                    self.bus.publish(Event::UpdateTransform {
                        transform_id: transform.transform_id,
                    });
                }
            }
            Err(error) => {
                tracing::warn!(
                    transform_id = transform.transform_id,
                    %error,
                    "cannot resolve work for processing follow-up"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_agent;
    use super::*;
    use crate::store::memory::testing::{
        sample_collection, sample_content, transform_with_work,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::schema::{
        ContentRelationType, ContentStatus, ProcessingMetadata, ProcessingStatus,
    };
    use crate::work::testing::StubWork;
    use crate::work::{Work, WorkProcessing};
    use std::sync::Arc;

    /// Transform in `Transforming` over collections 1 (input) and 2
    /// (output), with one registered map: input i1, outputs per `outputs`,
    /// dependencies per `deps`.
    fn seed_running_transform(
        store: &MemoryStore,
        work: &dyn Work,
        deps: &[ContentStatus],
        outputs: &[ContentStatus],
    ) -> (i64, Vec<i64>, Vec<i64>) {
        let mut transform = transform_with_work(1, work);
        transform.status = TransformStatus::Transforming;
        store.insert_transform(transform);
        store.insert_collection(sample_collection(1, "input.raw"));
        store.insert_collection(sample_collection(2, "output.derived"));

        let input_id = store.insert_content(sample_content(
            1,
            1,
            1,
            "i1",
            ContentRelationType::Input,
            ContentStatus::New,
        ));
        let dep_ids: Vec<i64> = deps
            .iter()
            .enumerate()
            .map(|(i, status)| {
                store.insert_content(sample_content(
                    1,
                    1,
                    1,
                    &format!("d{i}"),
                    ContentRelationType::InputDependency,
                    *status,
                ))
            })
            .collect();
        let output_ids: Vec<i64> = outputs
            .iter()
            .enumerate()
            .map(|(i, status)| {
                store.insert_content(sample_content(
                    1,
                    2,
                    1,
                    &format!("o{i}"),
                    ContentRelationType::Output,
                    *status,
                ))
            })
            .collect();
        (input_id, dep_ids, output_ids)
    }

    #[tokio::test]
    async fn satisfied_dependencies_release_the_input() {
        let store = Arc::new(MemoryStore::new());
        let mut work = StubWork::new(vec![1], vec![2]);
        work.use_dependency = true;
        let (input_id, _, _) = seed_running_transform(
            &store,
            &work,
            &[ContentStatus::Available, ContentStatus::FakeAvailable],
            &[ContentStatus::New],
        );
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        assert_eq!(store.content(input_id).unwrap().status, ContentStatus::Available);
        // A non-final release pass ran.
        assert_eq!(store.release_calls(), vec![(vec![], false)]);
        // The released input surfaced in an outbound input file message.
        let messages = store.outbound_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_content["relation_type"], "input");
        assert_eq!(messages[0].msg_content["files"][0]["name"], "i1");
        assert_eq!(messages[0].msg_content["files"][0]["status"], "Available");

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Transforming);
        assert_eq!(row.retries, 0);
        assert_eq!(row.locking, TransformLocking::Idle);
    }

    #[tokio::test]
    async fn fatal_dependencies_sink_inputs_and_outputs() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        let (input_id, _, output_ids) = seed_running_transform(
            &store,
            &work,
            &[ContentStatus::FinalFailed, ContentStatus::Missing],
            &[ContentStatus::New, ContentStatus::New],
        );
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        assert_eq!(store.content(input_id).unwrap().status, ContentStatus::Missing);
        for output_id in output_ids {
            assert_eq!(store.content(output_id).unwrap().status, ContentStatus::Missing);
        }
        // Both full lists surfaced as update messages.
        let messages = store.outbound_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_content["relation_type"], "input");
        assert_eq!(messages[1].msg_content["relation_type"], "output");
        assert_eq!(messages[1].msg_content["files"][0]["status"], "Missing");
    }

    #[tokio::test]
    async fn operator_cancel_enters_cancelling_and_stamps_new_processing() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        seed_running_transform(&store, &work, &[], &[ContentStatus::New]);
        let mut transform = store.transform(1).unwrap();
        transform.status = TransformStatus::ToCancel;
        store.insert_transform(transform);
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Cancelling);
        // The cancel intent was recorded on the persisted work.
        let payload = &row.transform_metadata.work.payload;
        assert_eq!(payload["requested_operations"][0], "cancel");
        // The processing created during the same tick carries the To* stamp.
        let processing = store.processing_row(1).unwrap();
        assert_eq!(processing.status, ProcessingStatus::ToCancel);
    }

    #[tokio::test]
    async fn resume_reactivates_incomplete_maps_and_reopens_collections() {
        let store = Arc::new(MemoryStore::new());
        let mut work = StubWork::new(vec![1], vec![2]);
        work.should_release = false;
        let mut transform = transform_with_work(1, &work);
        transform.status = TransformStatus::ToResume;
        transform.retries = 7;
        store.insert_transform(transform);
        let mut input_coll = sample_collection(1, "input.raw");
        input_coll.status = CollectionStatus::SubClosed;
        store.insert_collection(input_coll);
        let mut output_coll = sample_collection(2, "output.derived");
        output_coll.status = CollectionStatus::SubClosed;
        store.insert_collection(output_coll);

        // Map A: fully available, must be kept.
        let a_in = store.insert_content(sample_content(
            1, 1, 1, "a-in", ContentRelationType::Input, ContentStatus::Available,
        ));
        let a_out = store.insert_content(sample_content(
            1, 2, 1, "a-out", ContentRelationType::Output, ContentStatus::Available,
        ));
        // Map B: mixed outputs.
        let b_in = store.insert_content(sample_content(
            1, 1, 2, "b-in", ContentRelationType::Input, ContentStatus::Available,
        ));
        let b_out1 = store.insert_content(sample_content(
            1, 2, 2, "b-out1", ContentRelationType::Output, ContentStatus::Available,
        ));
        let b_out2 = store.insert_content(sample_content(
            1, 2, 2, "b-out2", ContentRelationType::Output, ContentStatus::Missing,
        ));
        // Map C: nothing available.
        let c_in = store.insert_content(sample_content(
            1, 1, 3, "c-in", ContentRelationType::Input, ContentStatus::Missing,
        ));
        let c_out = store.insert_content(sample_content(
            1, 2, 3, "c-out", ContentRelationType::Output, ContentStatus::FinalFailed,
        ));

        let agent = test_agent(Arc::clone(&store));
        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Resuming);
        assert_eq!(row.retries, 0);

        // Map A untouched.
        assert_eq!(store.content(a_in).unwrap().status, ContentStatus::Available);
        assert_eq!(store.content(a_out).unwrap().status, ContentStatus::Available);
        // Maps B and C fully reset.
        for id in [b_in, b_out1, b_out2, c_in, c_out] {
            assert_eq!(store.content(id).unwrap().status, ContentStatus::New);
            assert_eq!(store.content(id).unwrap().substatus, ContentStatus::New);
        }
        // Collections reopened.
        assert_eq!(store.collection(1).unwrap().status, CollectionStatus::Open);
        assert_eq!(store.collection(2).unwrap().status, CollectionStatus::Open);
    }

    #[tokio::test]
    async fn terminal_work_emits_work_and_collection_messages() {
        let store = Arc::new(MemoryStore::new());
        let mut work = StubWork::new(vec![1], vec![2]);
        work.finished = true;
        seed_running_transform(&store, &work, &[], &[ContentStatus::Available]);
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Finished);
        assert_eq!(store.collection(1).unwrap().status, CollectionStatus::Closed);
        assert_eq!(store.collection(2).unwrap().status, CollectionStatus::Closed);

        // Exactly one work message plus one collection message per
        // collection.
        let messages = store.outbound_messages();
        let work_msgs: Vec<_> = messages
            .iter()
            .filter(|m| m.msg_content["status"] == "Finished")
            .collect();
        assert_eq!(work_msgs.len(), 1);
        let coll_msgs: Vec<_> = messages
            .iter()
            .filter(|m| m.msg_content.get("collections").is_some())
            .collect();
        assert_eq!(coll_msgs.len(), 2);
    }

    #[tokio::test]
    async fn second_tick_on_unchanged_row_mutates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        let (input_id, _, _) = seed_running_transform(
            &store,
            &work,
            &[ContentStatus::Available],
            &[ContentStatus::New],
        );
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;
        let after_first = store.contents_of(1);
        let messages_after_first = store.outbound_messages().len();
        assert_eq!(store.content(input_id).unwrap().status, ContentStatus::Available);

        agent.process_update_transform(1).await;

        assert_eq!(store.contents_of(1), after_first);
        assert_eq!(store.outbound_messages().len(), messages_after_first);
    }

    #[tokio::test]
    async fn processing_sync_propagates_workload_and_errors() {
        let store = Arc::new(MemoryStore::new());
        let mut stub = StubWork::new(vec![1], vec![2]);
        stub.processing = Some(WorkProcessing {
            processing_id: Some(1),
            status: Some(ProcessingStatus::Running),
            output_data: None,
        });
        seed_running_transform(&store, &stub, &[], &[ContentStatus::New]);
        let processing_work = stub.clone_clean();
        store.insert_processing(crate::store::schema::Processing {
            processing_id: 0,
            transform_id: 1,
            request_id: 101,
            workload_id: Some(777),
            status: ProcessingStatus::Running,
            expired_at: None,
            output_metadata: Some(serde_json::json!({"loss": 0.03})),
            processing_metadata: ProcessingMetadata {
                work: processing_work.descriptor().unwrap(),
                errors: Some(serde_json::json!({"msg": "downstream hiccup"})),
            },
        });
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.workload_id, Some(777));
        let payload = &row.transform_metadata.work.payload;
        assert_eq!(payload["terminated_msg"]["msg"], "downstream hiccup");
        assert_eq!(payload["output_data"]["loss"], serde_json::json!(0.03));
        assert_eq!(payload["processing"]["status"], "running");
    }

    #[tokio::test]
    async fn command_message_bypasses_the_state_machine() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        seed_running_transform(&store, &work, &[ContentStatus::Available], &[ContentStatus::New]);
        let msg_id = store.push_command(
            1,
            serde_json::json!({
                "command": "update_transform",
                "parameters": {"status": "suspended"}
            }),
        );
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Suspended);
        assert_eq!(row.locking, TransformLocking::Idle);
        assert_eq!(store.command_status(msg_id), Some(MessageStatus::Delivered));
        // The normal tick did not run: no release pass, no content change.
        assert!(store.release_calls().is_empty());
        assert!(store.outbound_messages().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_failed_and_transform_untouched() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        seed_running_transform(&store, &work, &[], &[ContentStatus::New]);
        let msg_id = store.push_command(1, serde_json::json!({"command": "reboot_everything"}));
        let agent = test_agent(Arc::clone(&store));

        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Transforming);
        assert_eq!(row.locking, TransformLocking::Idle);
        assert_eq!(store.command_status(msg_id), Some(MessageStatus::Failed));
    }

    #[tokio::test]
    async fn abort_event_publishes_processing_abort_when_processing_exists() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubWork::new(vec![1], vec![2]).with_processing_id(55);
        let mut transform = transform_with_work(1, &stub);
        transform.status = TransformStatus::Transforming;
        store.insert_transform(transform);
        let agent = test_agent(Arc::clone(&store));
        let mut events = agent.bus.subscribe();

        agent.process_abort_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Cancelling);
        assert_eq!(row.locking, TransformLocking::Idle);
        let payload = &row.transform_metadata.work.payload;
        assert_eq!(payload["requested_operations"][0], "cancel");
        assert_eq!(
            events.recv().await.unwrap(),
            Event::AbortProcessing { processing_id: 55 }
        );
    }

    #[tokio::test]
    async fn abort_event_without_processing_reschedules_update() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubWork::new(vec![1], vec![2]);
        let mut transform = transform_with_work(1, &stub);
        transform.status = TransformStatus::Transforming;
        store.insert_transform(transform);
        let agent = test_agent(Arc::clone(&store));
        let mut events = agent.bus.subscribe();

        agent.process_abort_transform(1).await;

        assert_eq!(
            events.recv().await.unwrap(),
            Event::UpdateTransform { transform_id: 1 }
        );
    }

    #[tokio::test]
    async fn abort_of_terminal_transform_informs_the_operator() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubWork::new(vec![1], vec![2]);
        let mut transform = transform_with_work(1, &stub);
        transform.status = TransformStatus::Finished;
        store.insert_transform(transform);
        let agent = test_agent(Arc::clone(&store));

        agent.process_abort_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Finished);
        assert_eq!(row.locking, TransformLocking::Idle);
        let errors = row.errors.unwrap();
        assert!(errors.extra_msg.unwrap().contains("cannot be aborted"));
    }

    #[tokio::test]
    async fn resume_event_reactivates_and_notifies_downstream() {
        let store = Arc::new(MemoryStore::new());
        let stub = StubWork::new(vec![1], vec![2]).with_processing_id(9);
        let mut transform = transform_with_work(1, &stub);
        transform.status = TransformStatus::SubFinished;
        store.insert_transform(transform);
        let mut coll = sample_collection(1, "input.raw");
        coll.status = CollectionStatus::SubClosed;
        store.insert_collection(coll);
        store.insert_collection(sample_collection(2, "output.derived"));
        let stale = store.insert_content(sample_content(
            1, 2, 1, "o1", ContentRelationType::Output, ContentStatus::Missing,
        ));
        let agent = test_agent(Arc::clone(&store));
        let mut events = agent.bus.subscribe();

        agent.process_resume_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Resuming);
        assert_eq!(row.retries, 0);
        assert_eq!(store.collection(1).unwrap().status, CollectionStatus::Open);
        assert_eq!(store.content(stale).unwrap().status, ContentStatus::New);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::ResumeProcessing { processing_id: 9 }
        );
    }

    #[tokio::test]
    async fn persistent_deadlock_degrades_to_parameter_only_write() {
        let store = Arc::new(MemoryStore::new());
        let work = StubWork::new(vec![1], vec![2]);
        let (input_id, _, _) = seed_running_transform(
            &store,
            &work,
            &[ContentStatus::Available],
            &[ContentStatus::New],
        );
        store.inject_deadlocks(5);
        let agent = test_agent(Arc::clone(&store));

        tokio::time::pause();
        agent.process_update_transform(1).await;

        let row = store.transform(1).unwrap();
        assert_eq!(row.status, TransformStatus::Transforming);
        assert_eq!(row.retries, 1);
        assert_eq!(row.locking, TransformLocking::Idle);
        // The content mutation was lost with the failed bundle; only the
        // parameter row went through.
        assert_eq!(store.content(input_id).unwrap().status, ContentStatus::New);
        assert_eq!(store.commit_count(), 1);
    }
}
