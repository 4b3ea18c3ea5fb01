//! Initial materialisation of a transform
//!
//! Resolves the work descriptor, registers the first wave of contents,
//! launches the processing, and moves the row to `Transforming`.

use super::contents::flatten_new_contents;
use super::messages::{file_message, FileRecord, RelationLabel};
use super::{AgentError, Transformer, NEW_TRANSFORM_STATUSES};
use crate::store::schema::{
    InputOutputMaps, Transform, TransformLocking, TransformMetadata, TransformParameters,
    TransformStatus,
};
use crate::store::TransformOutputs;

impl Transformer {
    pub(crate) async fn process_new_transform(&self, transform_id: i64) {
        let claimed = self
            .store
            .get_transform_by_id_status(transform_id, Some(NEW_TRANSFORM_STATUSES), true)
            .await;
        match claimed {
            Ok(Some(transform)) => {
                let outputs = self.handle_new_transform(&transform).await;
                let (new_ids, updated_ids) = self.persist_outcome(&transform, outputs).await;
                self.publish_processing_events(&new_ids, &updated_ids);
            }
            Ok(None) => {
                tracing::debug!(transform_id, "transform not claimable for initial handling");
            }
            Err(error) => {
                tracing::error!(transform_id, %error, "failed to claim new transform");
            }
        }
    }

    /// Run the initial materialisation, containing any failure into a
    /// downgraded parameter write.
    pub(crate) async fn handle_new_transform(&self, transform: &Transform) -> TransformOutputs {
        tracing::info!(transform_id = transform.transform_id, "handling new transform");
        match self.handle_new_transform_inner(transform).await {
            Ok(outputs) => outputs,
            Err(error) => {
                tracing::error!(
                    transform_id = transform.transform_id,
                    %error,
                    "initial transform handling failed"
                );
                TransformOutputs::parameters_only(
                    transform.transform_id,
                    self.failure_parameters(transform),
                )
            }
        }
    }

    async fn handle_new_transform_inner(
        &self,
        transform: &Transform,
    ) -> Result<TransformOutputs, AgentError> {
        let mut work = self.works.resolve(&transform.transform_metadata.work)?;
        work.set_work_id(transform.transform_id);
        work.set_agent_attributes(&self.config.agent_attributes);

        let name_map = self
            .store
            .get_work_name_to_coll_map(transform.request_id)
            .await?;
        work.set_work_name_to_coll_map(&name_map);

        let new_maps = work.new_input_output_maps(&InputOutputMaps::new())?;
        let contents = flatten_new_contents(transform, &new_maps);

        let mut new_processing = None;
        if let Some(handle) = work.get_or_create_processing(&new_maps)? {
            if handle.processing_id.is_none() {
                new_processing = Some(self.build_new_processing(transform, work.as_ref(), None)?);
            }
        }

        let mut messages = Vec::new();
        if !contents.inputs.is_empty() {
            let records: Vec<FileRecord> = contents.inputs.iter().map(FileRecord::from).collect();
            messages.push(file_message(transform, &records, RelationLabel::Input));
        }
        if !contents.outputs.is_empty() {
            let records: Vec<FileRecord> = contents.outputs.iter().map(FileRecord::from).collect();
            messages.push(file_message(transform, &records, RelationLabel::Output));
        }

        if !contents.is_empty() {
            work.has_new_updates();
        }

        let parameters = TransformParameters {
            status: Some(TransformStatus::Transforming),
            locking: Some(TransformLocking::Idle),
            workload_id: transform.workload_id,
            next_poll_at: Some(self.poll_at(self.config.poll_time_period)),
            transform_metadata: Some(TransformMetadata {
                work: work.descriptor()?,
            }),
            ..TransformParameters::default()
        };

        Ok(TransformOutputs {
            transform_id: transform.transform_id,
            parameters,
            new_contents: contents.into_all(),
            messages,
            new_processing,
            ..TransformOutputs::default()
        })
    }
}
