//! Outbound message builder
//!
//! Shapes the work / collection / file notifications emitted to the outside
//! world. The message type is the product of the transform kind and the
//! payload shape.

use crate::store::schema::{
    Collection, Content, ContentStatus, MessageDestination, MessageSource, MessageStatus,
    MessageType, NewContent, NewMessage, Transform, TransformKind,
};
use crate::work::Work;
use serde_json::json;

/// Legacy staging suffix still present on old collection names; stripped
/// from collection message payloads.
const LEGACY_STAGE_IN_SUFFIX: &str = ".idds.stagein";

/// Which side of the transform a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationLabel {
    Input,
    Output,
    Log,
}

impl RelationLabel {
    fn as_str(self) -> &'static str {
        match self {
            RelationLabel::Input => "input",
            RelationLabel::Output => "output",
            RelationLabel::Log => "log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    Work,
    Collection,
    File,
}

fn message_type(kind: TransformKind, shape: PayloadShape) -> MessageType {
    match (kind, shape) {
        (TransformKind::StageIn, PayloadShape::Work) => MessageType::StageInWork,
        (TransformKind::StageIn, PayloadShape::Collection) => MessageType::StageInCollection,
        (TransformKind::StageIn, PayloadShape::File) => MessageType::StageInFile,
        (TransformKind::ActiveLearning, PayloadShape::Work) => MessageType::ActiveLearningWork,
        (TransformKind::ActiveLearning, PayloadShape::Collection) => {
            MessageType::ActiveLearningCollection
        }
        (TransformKind::ActiveLearning, PayloadShape::File) => MessageType::ActiveLearningFile,
        (TransformKind::HyperParameterOpt, PayloadShape::Work) => {
            MessageType::HyperParameterOptWork
        }
        (TransformKind::HyperParameterOpt, PayloadShape::Collection) => {
            MessageType::HyperParameterOptCollection
        }
        (TransformKind::HyperParameterOpt, PayloadShape::File) => {
            MessageType::HyperParameterOptFile
        }
        (TransformKind::Processing, PayloadShape::Work) => MessageType::ProcessingWork,
        (TransformKind::Processing, PayloadShape::Collection) => MessageType::ProcessingCollection,
        (TransformKind::Processing, PayloadShape::File) => MessageType::ProcessingFile,
    }
}

fn envelope(transform: &Transform, msg_type: MessageType, num_contents: i64, msg_content: serde_json::Value) -> NewMessage {
    NewMessage {
        msg_type,
        status: MessageStatus::New,
        source: MessageSource::Transformer,
        destination: MessageDestination::Outside,
        request_id: transform.request_id,
        workload_id: transform.workload_id,
        transform_id: transform.transform_id,
        num_contents,
        msg_content,
    }
}

/// Work-level notification, emitted on terminal transitions.
pub fn work_message(transform: &Transform, work: &dyn Work) -> NewMessage {
    let msg_type = message_type(transform.transform_type, PayloadShape::Work);
    let msg_content = json!({
        "msg_type": msg_type.as_str(),
        "request_id": transform.request_id,
        "workload_id": transform.workload_id,
        "status": transform.status.name(),
        "output": work.output_data(),
        "error": work.terminated_msg(),
    });
    envelope(transform, msg_type, 1, msg_content)
}

/// Collection-level notification, one per collection on terminal
/// transitions.
pub fn collection_message(
    transform: &Transform,
    work: &dyn Work,
    collection: &Collection,
    relation: RelationLabel,
) -> NewMessage {
    let name = collection
        .name
        .strip_suffix(LEGACY_STAGE_IN_SUFFIX)
        .unwrap_or(&collection.name);
    let msg_type = message_type(transform.transform_type, PayloadShape::Collection);
    let msg_content = json!({
        "msg_type": msg_type.as_str(),
        "request_id": transform.request_id,
        "workload_id": transform.workload_id,
        "relation_type": relation.as_str(),
        "collections": [{
            "scope": collection.scope,
            "name": name,
            "status": collection.status.name(),
        }],
        "output": work.output_data(),
        "error": work.terminated_msg(),
    });
    envelope(transform, msg_type, 1, msg_content)
}

/// One file entry of a file message payload.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub scope: String,
    pub name: String,
    pub path: Option<String>,
    pub status: ContentStatus,
}

impl From<&Content> for FileRecord {
    fn from(content: &Content) -> Self {
        Self {
            scope: content.scope.clone(),
            name: content.name.clone(),
            path: content.path.clone(),
            status: content.status,
        }
    }
}

impl From<&NewContent> for FileRecord {
    fn from(content: &NewContent) -> Self {
        Self {
            scope: content.scope.clone(),
            name: content.name.clone(),
            path: content.path.clone(),
            status: content.status,
        }
    }
}

/// File-level notification over a non-empty list of contents.
pub fn file_message(
    transform: &Transform,
    files: &[FileRecord],
    relation: RelationLabel,
) -> NewMessage {
    let msg_type = message_type(transform.transform_type, PayloadShape::File);
    let files_payload: Vec<serde_json::Value> = files
        .iter()
        .map(|file| {
            // Consumers never see the fake flavour.
            let status = if file.status == ContentStatus::FakeAvailable {
                ContentStatus::Available
            } else {
                file.status
            };
            json!({
                "scope": file.scope,
                "name": file.name,
                "path": file.path,
                "status": status.name(),
            })
        })
        .collect();
    let msg_content = json!({
        "msg_type": msg_type.as_str(),
        "request_id": transform.request_id,
        "workload_id": transform.workload_id,
        "relation_type": relation.as_str(),
        "files": files_payload,
    });
    envelope(transform, msg_type, files.len() as i64, msg_content)
}
