//! Collection synchroniser
//!
//! Folds per-content state into the aggregate counters on collection rows
//! and derives the output statistics the work consumes during status sync.

use crate::store::schema::{Collection, Content, ContentStatus, InputOutputMaps};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total_files: i64,
    processed_files: i64,
    processing_files: i64,
    bytes: i64,
}

impl Counters {
    fn record(&mut self, content: &Content, processed: bool) {
        self.total_files += 1;
        if processed {
            self.processed_files += 1;
            self.bytes += content.bytes;
        } else {
            self.processing_files += 1;
        }
    }
}

/// Aggregates of one synchronisation pass.
#[derive(Debug, Clone, Default)]
pub struct CollectionSync {
    /// True when every output's status equals its substatus.
    pub all_updates_flushed: bool,
    /// Output count per status name.
    pub output_statistics: BTreeMap<String, i64>,
}

fn input_processed(status: ContentStatus) -> bool {
    matches!(
        status,
        ContentStatus::Available | ContentStatus::Mapped | ContentStatus::FakeAvailable
    )
}

fn output_processed(status: ContentStatus) -> bool {
    matches!(status, ContentStatus::Available | ContentStatus::FakeAvailable)
}

fn write_counters(collections: &mut [Collection], counters: &HashMap<i64, Counters>) {
    for collection in collections {
        if let Some(c) = counters.get(&collection.coll_id) {
            collection.total_files = c.total_files;
            collection.processed_files = c.processed_files;
            collection.processing_files = c.processing_files;
            collection.bytes = c.bytes;
        }
    }
}

/// Fold the registered maps into the collection counters.
pub fn sync_collection_status(
    input_collections: &mut [Collection],
    output_collections: &mut [Collection],
    log_collections: &mut [Collection],
    maps: &InputOutputMaps,
) -> CollectionSync {
    let mut input_counters: HashMap<i64, Counters> = HashMap::new();
    let mut output_counters: HashMap<i64, Counters> = HashMap::new();
    let mut log_counters: HashMap<i64, Counters> = HashMap::new();
    let mut sync = CollectionSync {
        all_updates_flushed: true,
        output_statistics: BTreeMap::new(),
    };

    for entry in maps.values() {
        for content in &entry.inputs {
            input_counters
                .entry(content.coll_id)
                .or_default()
                .record(content, input_processed(content.status));
        }
        for content in &entry.outputs {
            output_counters
                .entry(content.coll_id)
                .or_default()
                .record(content, output_processed(content.status));

            *sync
                .output_statistics
                .entry(content.status.name().to_string())
                .or_insert(0) += 1;

            if content.status != content.substatus {
                sync.all_updates_flushed = false;
            }
        }
        for content in &entry.logs {
            log_counters
                .entry(content.coll_id)
                .or_default()
                .record(content, output_processed(content.status));
        }
    }

    write_counters(input_collections, &input_counters);
    write_counters(output_collections, &output_counters);
    write_counters(log_collections, &log_counters);

    sync
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::testing::{sample_collection, sample_content};
    use crate::store::schema::{ContentRelationType, MapEntry};
    use proptest::prelude::*;

    fn registered(inputs: Vec<Content>, outputs: Vec<Content>) -> InputOutputMaps {
        let entry = MapEntry {
            inputs,
            inputs_dependency: vec![],
            outputs,
            logs: vec![],
        };
        [(1, entry)].into_iter().collect()
    }

    #[test]
    fn counters_partition_into_processed_and_processing() {
        let maps = registered(
            vec![
                sample_content(1, 1, 1, "a", ContentRelationType::Input, ContentStatus::Available),
                sample_content(1, 1, 1, "b", ContentRelationType::Input, ContentStatus::Mapped),
                sample_content(1, 1, 1, "c", ContentRelationType::Input, ContentStatus::New),
            ],
            vec![
                sample_content(1, 2, 1, "o1", ContentRelationType::Output, ContentStatus::Available),
                sample_content(1, 2, 1, "o2", ContentRelationType::Output, ContentStatus::Missing),
            ],
        );
        let mut inputs = [sample_collection(1, "in")];
        let mut outputs = [sample_collection(2, "out")];

        let sync = sync_collection_status(&mut inputs, &mut outputs, &mut [], &maps);

        assert_eq!(inputs[0].total_files, 3);
        assert_eq!(inputs[0].processed_files, 2);
        assert_eq!(inputs[0].processing_files, 1);
        assert_eq!(outputs[0].total_files, 2);
        assert_eq!(outputs[0].processed_files, 1);
        assert_eq!(outputs[0].processing_files, 1);
        // Missing counts as processing for the counters but is final for the
        // statistics.
        assert_eq!(sync.output_statistics["Available"], 1);
        assert_eq!(sync.output_statistics["Missing"], 1);
        assert!(sync.all_updates_flushed);
    }

    #[test]
    fn unflushed_output_clears_the_flag() {
        let mut output =
            sample_content(1, 2, 1, "o1", ContentRelationType::Output, ContentStatus::New);
        output.substatus = ContentStatus::Available;
        let maps = registered(vec![], vec![output]);
        let mut outputs = [sample_collection(2, "out")];

        let sync = sync_collection_status(&mut [], &mut outputs, &mut [], &maps);

        assert!(!sync.all_updates_flushed);
    }

    #[test]
    fn collections_outside_the_maps_are_untouched() {
        let maps = registered(vec![], vec![]);
        let mut inputs = [sample_collection(1, "in")];
        inputs[0].total_files = 42;

        sync_collection_status(&mut inputs, &mut [], &mut [], &maps);

        assert_eq!(inputs[0].total_files, 42);
    }

    fn arb_status() -> impl Strategy<Value = ContentStatus> {
        prop_oneof![
            Just(ContentStatus::New),
            Just(ContentStatus::Processing),
            Just(ContentStatus::Available),
            Just(ContentStatus::FakeAvailable),
            Just(ContentStatus::FinalFailed),
            Just(ContentStatus::Missing),
            Just(ContentStatus::Mapped),
        ]
    }

    proptest! {
        #[test]
        fn totals_are_conserved(statuses in proptest::collection::vec(arb_status(), 0..40)) {
            let inputs: Vec<Content> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    sample_content(1, 1, 1, &format!("f{i}"), ContentRelationType::Input, *status)
                })
                .collect();
            let maps = registered(inputs, vec![]);
            let mut collections = [sample_collection(1, "in")];

            sync_collection_status(&mut collections, &mut [], &mut [], &maps);

            prop_assert_eq!(
                collections[0].total_files,
                collections[0].processed_files + collections[0].processing_files
            );
        }

        #[test]
        fn output_statistics_count_every_status(statuses in proptest::collection::vec(arb_status(), 0..40)) {
            let outputs: Vec<Content> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    sample_content(1, 2, 1, &format!("f{i}"), ContentRelationType::Output, *status)
                })
                .collect();
            let maps = registered(vec![], outputs);
            let mut collections = [sample_collection(2, "out")];

            let sync = sync_collection_status(&mut [], &mut collections, &mut [], &maps);

            let counted: i64 = sync.output_statistics.values().sum();
            prop_assert_eq!(counted, statuses.len() as i64);
            for status in &statuses {
                prop_assert!(sync.output_statistics[status.name()] > 0);
            }
        }
    }
}
