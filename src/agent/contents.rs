//! Content engine
//!
//! Pure functions over the registered map table: flattening plugin-supplied
//! maps into content rows, evaluating per-map dependency state, collecting
//! release and poll groups, and reactivating maps on resume.

use crate::store::schema::{
    Content, ContentRelationType, ContentStatus, ContentUpdate, InputOutputMaps, MapId,
    NewContent, Transform,
};
use crate::work::{ContentSeed, NewInputOutputMaps};
use std::collections::HashMap;

/// Flattened content lists of one discovery pass, one list per relation.
#[derive(Debug, Clone, Default)]
pub struct NewContentSet {
    pub inputs: Vec<NewContent>,
    pub inputs_dependency: Vec<NewContent>,
    pub outputs: Vec<NewContent>,
    pub logs: Vec<NewContent>,
}

impl NewContentSet {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.inputs_dependency.is_empty()
            && self.outputs.is_empty()
            && self.logs.is_empty()
    }

    /// All lists concatenated in registration order.
    pub fn into_all(self) -> Vec<NewContent> {
        let mut all = self.inputs;
        all.extend(self.outputs);
        all.extend(self.logs);
        all.extend(self.inputs_dependency);
        all
    }
}

fn seed_to_content(
    transform: &Transform,
    map_id: MapId,
    seed: &ContentSeed,
    relation: ContentRelationType,
) -> NewContent {
    // Outputs and logs always start from scratch; inputs and dependencies
    // may arrive pre-statused from the plugin.
    let carries_status = matches!(
        relation,
        ContentRelationType::Input | ContentRelationType::InputDependency
    );
    let status = if carries_status {
        seed.status.unwrap_or(ContentStatus::New)
    } else {
        ContentStatus::New
    };
    let substatus = if carries_status {
        seed.substatus.unwrap_or(ContentStatus::New)
    } else {
        ContentStatus::New
    };
    NewContent {
        transform_id: transform.transform_id,
        coll_id: seed.coll_id,
        request_id: transform.request_id,
        workload_id: transform.workload_id,
        map_id,
        scope: seed.scope.clone(),
        name: seed.name.clone(),
        min_id: seed.min_id.unwrap_or(0),
        max_id: seed.max_id.unwrap_or(0),
        status,
        substatus,
        path: seed.path.clone(),
        content_type: seed.content_type.unwrap_or_default(),
        content_relation_type: relation,
        bytes: seed.bytes,
        adler32: seed.adler32.clone(),
        content_metadata: seed.content_metadata.clone(),
    }
}

/// Flatten plugin-supplied maps into content rows with registration
/// defaults applied.
pub fn flatten_new_contents(transform: &Transform, maps: &NewInputOutputMaps) -> NewContentSet {
    let mut set = NewContentSet::default();
    for (map_id, entry) in maps {
        for seed in &entry.inputs {
            set.inputs
                .push(seed_to_content(transform, *map_id, seed, ContentRelationType::Input));
        }
        for seed in &entry.inputs_dependency {
            set.inputs_dependency.push(seed_to_content(
                transform,
                *map_id,
                seed,
                ContentRelationType::InputDependency,
            ));
        }
        for seed in &entry.outputs {
            set.outputs
                .push(seed_to_content(transform, *map_id, seed, ContentRelationType::Output));
        }
        for seed in &entry.logs {
            set.logs
                .push(seed_to_content(transform, *map_id, seed, ContentRelationType::Log));
        }
    }
    set
}

pub fn all_dependencies_available(dependencies: &[Content]) -> bool {
    dependencies.iter().all(|d| d.status.is_available())
}

pub fn all_dependencies_terminated(dependencies: &[Content]) -> bool {
    dependencies.iter().all(|d| d.status.is_terminated())
}

/// Status mutations produced by one dependency pass.
#[derive(Debug, Clone, Default)]
pub struct DependencyUpdates {
    pub updates: Vec<ContentUpdate>,
    /// Full rows of the inputs that changed, for file messages.
    pub inputs_full: Vec<Content>,
    /// Full rows of the outputs that changed, for file messages.
    pub outputs_full: Vec<Content>,
}

/// Evaluate every registered map against its dependencies, flushing
/// `status ← substatus` where they diverge.
///
/// With every dependency available, sibling inputs become `Available`. With
/// every dependency merely terminated, sibling inputs and outputs become
/// `Missing`. Output substatus changes written by the downstream agent are
/// flushed independently of the dependency state.
pub fn evaluate_dependencies(maps: &mut InputOutputMaps) -> DependencyUpdates {
    let mut result = DependencyUpdates::default();

    for entry in maps.values_mut() {
        if all_dependencies_available(&entry.inputs_dependency) {
            for content in &mut entry.inputs {
                content.substatus = ContentStatus::Available;
                if content.status != content.substatus {
                    content.status = content.substatus;
                    result.updates.push(ContentUpdate {
                        content_id: content.content_id,
                        status: content.substatus,
                        substatus: Some(content.substatus),
                    });
                    result.inputs_full.push(content.clone());
                }
            }
        } else if all_dependencies_terminated(&entry.inputs_dependency) {
            for content in &mut entry.inputs {
                content.substatus = ContentStatus::Missing;
                if content.status != content.substatus {
                    content.status = content.substatus;
                    result.updates.push(ContentUpdate {
                        content_id: content.content_id,
                        status: content.substatus,
                        substatus: Some(content.substatus),
                    });
                    result.inputs_full.push(content.clone());
                }
            }
            for content in &mut entry.outputs {
                content.substatus = ContentStatus::Missing;
                if content.status != content.substatus {
                    content.status = content.substatus;
                    result.updates.push(ContentUpdate {
                        content_id: content.content_id,
                        status: content.substatus,
                        substatus: Some(content.substatus),
                    });
                    result.outputs_full.push(content.clone());
                }
            }
        }

        for content in &mut entry.outputs {
            if content.status != content.substatus {
                content.status = content.substatus;
                result.updates.push(ContentUpdate {
                    content_id: content.content_id,
                    status: content.substatus,
                    substatus: None,
                });
                result.outputs_full.push(content.clone());
            }
        }
    }

    result
}

/// Outputs ready to satisfy downstream dependencies, grouped by collection.
pub fn collect_release_groups(maps: &InputOutputMaps) -> HashMap<i64, Vec<Content>> {
    let mut groups: HashMap<i64, Vec<Content>> = HashMap::new();
    for entry in maps.values() {
        for content in &entry.outputs {
            if content.status.is_terminated() || content.substatus.is_terminated() {
                groups.entry(content.coll_id).or_default().push(content.clone());
            }
        }
    }
    groups
}

/// Dependencies with neither status nor substatus terminated, grouped by
/// collection, for the fallback poll.
pub fn collect_unfinished_dependencies(maps: &InputOutputMaps) -> HashMap<i64, Vec<Content>> {
    let mut groups: HashMap<i64, Vec<Content>> = HashMap::new();
    for entry in maps.values() {
        for content in &entry.inputs_dependency {
            if !content.status.is_terminated() && !content.substatus.is_terminated() {
                groups.entry(content.coll_id).or_default().push(content.clone());
            }
        }
    }
    groups
}

/// Reset maps for a resumed transform.
///
/// Maps whose outputs are all `Available` keep their results. Everything
/// else goes back to `New`: inputs, outputs, and any dependency that is not
/// itself `Available`.
pub fn reactivate_contents(maps: &InputOutputMaps) -> Vec<ContentUpdate> {
    let mut updates = Vec::new();
    for entry in maps.values() {
        let all_outputs_available = entry
            .outputs
            .iter()
            .all(|c| c.status == ContentStatus::Available);
        if all_outputs_available {
            continue;
        }
        for content in entry.inputs.iter().chain(&entry.outputs) {
            updates.push(ContentUpdate {
                content_id: content.content_id,
                status: ContentStatus::New,
                substatus: Some(ContentStatus::New),
            });
        }
        for content in &entry.inputs_dependency {
            if content.status != ContentStatus::Available {
                updates.push(ContentUpdate {
                    content_id: content.content_id,
                    status: ContentStatus::New,
                    substatus: Some(ContentStatus::New),
                });
            }
        }
    }
    updates
}
