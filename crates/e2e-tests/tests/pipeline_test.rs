//! End-to-end tests of the index action happy path.
//!
//! Commands go through scroll -> batch builder -> bulk submitter -> status
//! aggregation -> completion reactor on the in-process harness.

use std::io::Write;

use pretty_assertions::assert_eq;

use bulk_indexing::{IndexBatch, SubmitterState};
use bulk_types::{BucketAggregator, BulkCommand, BulkState, DataBucket, IndexActionSettings};
use e2e_tests::{LocalPipeline, REPOSITORY, WRITE_INDEX};

fn index_command() -> BulkCommand {
    BulkCommand::new("index", REPOSITORY, "SELECT * FROM Document")
}

fn decode_batches(pipeline: &LocalPipeline) -> Vec<DataBucket> {
    pipeline
        .batches()
        .iter()
        .map(|r| serde_json::from_slice(&r.data).unwrap())
        .collect()
}

#[test]
fn test_index_command_end_to_end() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default());
    let ids = pipeline.put_documents("doc", 120);

    let command = index_command()
        .with_param("refresh", true)
        .with_param("updateAlias", true);
    let command_id = pipeline.run(command, &ids).unwrap();

    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 120);

    let status = pipeline.status(&command_id);
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.total, 120);
    assert_eq!(status.processed, 120);
    assert!(status.result.is_empty());

    assert_eq!(pipeline.admin.refresh_count(REPOSITORY), 1);
    assert_eq!(
        pipeline.admin.search_alias(REPOSITORY).as_deref(),
        Some(WRITE_INDEX)
    );
    assert_eq!(pipeline.reactor_progress(), (1, 1));

    // 3 buckets of at most 50 ids
    assert_eq!(pipeline.builder_offset(), 3);
    // Every consumed batch is committed after the flush
    assert_eq!(pipeline.submitter_offsets(), pipeline.submitter_consumed());
    assert!(pipeline
        .submitter_states()
        .iter()
        .all(|s| *s == SubmitterState::Active));
}

#[test]
fn test_nothing_indexed_before_flush() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default());
    let ids = pipeline.put_documents("doc", 10);

    pipeline.submit(index_command(), &ids).unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 0);
    assert!(pipeline.submitter_offsets().iter().all(|o| *o == 0));

    pipeline.tick().unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 10);
}

#[test]
fn test_index_name_override() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default());
    let ids = pipeline.put_documents("doc", 5);

    pipeline
        .run(index_command().with_param("indexName", "reindex-target"), &ids)
        .unwrap();

    assert_eq!(pipeline.sink.document_count("reindex-target"), 5);
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 0);
}

#[test]
fn test_unloadable_documents_are_reconciled() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default()).with_bucket_size(10);
    let ids = pipeline.put_documents("doc", 30);
    for id in &ids[..5] {
        pipeline.documents.delete(REPOSITORY, id).unwrap();
    }
    pipeline.documents.mark_unreadable(&ids[29]).unwrap();
    pipeline.documents.mark_unreadable(&ids[15]).unwrap();

    let command_id = pipeline.run(index_command(), &ids).unwrap();

    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 23);
    let status = pipeline.status(&command_id);
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 30);
    // Shortfall records are committed like any other input
    assert_eq!(pipeline.submitter_offsets(), pipeline.submitter_consumed());

    let buckets = decode_batches(&pipeline);
    assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 30);
    let missing: Vec<&str> = pipeline
        .batches()
        .iter()
        .filter(|r| r.key.ends_with("-missing"))
        .map(|r| r.key.as_str())
        .collect();
    // First bucket lost 5, second 1, third 1
    assert_eq!(missing.len(), 3);
}

#[test]
fn test_batches_respect_byte_ceiling() {
    let settings = IndexActionSettings {
        batch_max_bytes: 1_000,
        ..Default::default()
    };
    let mut pipeline = LocalPipeline::new(settings).with_bucket_size(100);
    let ids = pipeline.put_documents("doc", 100);

    pipeline.run(index_command(), &ids).unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 100);

    let mut total_bytes = 0;
    let buckets = decode_batches(&pipeline);
    for bucket in &buckets {
        let size = bucket.payload.len();
        assert!(size <= 1_000, "batch of {size} bytes exceeds ceiling");
        let batch: IndexBatch = serde_json::from_slice(&bucket.payload).unwrap();
        assert_eq!(bucket.count, batch.len() as u64);
        total_bytes += size;
    }
    assert!(buckets.len() >= total_bytes.div_ceil(1_000));
}

#[test]
fn test_batches_reaggregate_per_command() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default()).with_bucket_size(7);
    let first_ids = pipeline.put_documents("a", 20);
    let second_ids = pipeline.put_documents("b", 13);
    pipeline.documents.delete(REPOSITORY, &second_ids[0]).unwrap();

    let first = pipeline.run(index_command(), &first_ids).unwrap();
    let second = pipeline.run(index_command(), &second_ids).unwrap();

    // The generic carrier folds back into one bucket per command
    let mut aggregator = BucketAggregator::new(usize::MAX);
    let mut combined = Vec::new();
    for bucket in decode_batches(&pipeline) {
        let total = if bucket.command_id == first { 20 } else { 13 };
        combined.extend(aggregator.append(bucket, total));
    }

    assert_eq!(combined.len(), 2);
    assert_eq!(aggregator.pending_commands(), 0);
    let count_of = |id: &str| {
        combined
            .iter()
            .find(|b| b.command_id == id)
            .map(|b| b.count)
    };
    assert_eq!(count_of(&first), Some(20));
    assert_eq!(count_of(&second), Some(13));
}

#[test]
fn test_empty_command_completes_immediately() {
    let mut pipeline = LocalPipeline::new(IndexActionSettings::default());

    let command_id = pipeline
        .submit(index_command().with_param("refresh", true), &[])
        .unwrap();

    let status = pipeline.status(&command_id);
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(pipeline.admin.refresh_count(REPOSITORY), 1);
    assert!(pipeline.batches().is_empty());
}

#[test]
fn test_settings_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "partitions = 2").unwrap();
    writeln!(file, "flush_interval_secs = 5").unwrap();
    writeln!(file, "bulk_actions = 10").unwrap();
    writeln!(file, "log_level = \"warn\"").unwrap();

    let settings = IndexActionSettings::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(settings.partitions, 2);
    assert_eq!(settings.flush_interval_secs, 5);

    let mut pipeline = LocalPipeline::new(settings);
    assert_eq!(pipeline.submitter_states().len(), 2);

    let ids = pipeline.put_documents("doc", 45);
    // bulk_actions = 10 flushes on threshold before the timer fires
    pipeline.submit(index_command(), &ids).unwrap();
    assert!(pipeline.sink.document_count(WRITE_INDEX) >= 40);

    pipeline.tick().unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 45);
}
