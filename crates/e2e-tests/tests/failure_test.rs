//! End-to-end tests of submission failures.
//!
//! A non-tolerated failure trips the submitter's abort latch from the
//! submission worker thread; the submitter then drops records and fails
//! fatally on its next flush timer unless it runs with
//! `continue_on_failure`.

use pretty_assertions::assert_eq;

use bulk_indexing::{SinkError, SubmitterState, INDEXING_ERRORS_RESULT};
use bulk_stream::StreamError;
use bulk_types::{BulkCommand, BulkState, IndexActionSettings};
use e2e_tests::{LocalPipeline, REPOSITORY, WRITE_INDEX};

fn single_partition() -> IndexActionSettings {
    IndexActionSettings {
        partitions: 1,
        retry_delay_ms: 1,
        ..Default::default()
    }
}

fn index_command() -> BulkCommand {
    BulkCommand::new("index", REPOSITORY, "SELECT * FROM Document")
}

#[test]
fn test_rejected_document_aborts_submitter() {
    let mut pipeline = LocalPipeline::new(single_partition());
    let ids = pipeline.put_documents("doc", 10);
    pipeline.sink.reject_id(&ids[3]);

    // The failing flush itself succeeds but skips the checkpoint
    let command_id = pipeline.run(index_command(), &ids).unwrap();
    assert_eq!(pipeline.submitter_offsets(), vec![0]);
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 9);

    let status = pipeline.status(&command_id);
    assert_eq!(
        status.result.get(INDEXING_ERRORS_RESULT),
        Some(&serde_json::json!(1))
    );

    // Records arriving after the failure are dropped
    let late_ids = pipeline.put_documents("late", 3);
    pipeline.submit(index_command(), &late_ids).unwrap();
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Draining]);

    let result = pipeline.tick();
    assert!(matches!(result, Err(StreamError::Aborted(_))));
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Terminated]);
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 9);
}

#[test]
fn test_restart_after_abort_replays_uncommitted_batches() {
    let mut pipeline = LocalPipeline::new(single_partition());
    let ids = pipeline.put_documents("doc", 10);
    pipeline.sink.reject_id(&ids[0]);

    pipeline.run(index_command(), &ids).unwrap();
    assert!(pipeline.tick().is_err());

    // The host tears the stage down and redelivers from the last commit
    pipeline.restart_submitters().unwrap();
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Active]);

    let replay = pipeline.batches().to_vec();
    for record in replay {
        pipeline.deliver_batch(record).unwrap();
    }
    // Already indexed documents conflict; the rejected one fails again
    pipeline.tick().unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 9);
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Draining]);
}

#[test]
fn test_continue_on_failure_keeps_indexing() {
    let settings = IndexActionSettings {
        continue_on_failure: true,
        ..single_partition()
    };
    let mut pipeline = LocalPipeline::new(settings);
    let ids = pipeline.put_documents("doc", 10);
    pipeline.sink.reject_id(&ids[3]);
    pipeline.sink.reject_id(&ids[7]);

    let first = pipeline.run(index_command(), &ids).unwrap();
    let more = pipeline.put_documents("more", 5);
    let second = pipeline.run(index_command(), &more).unwrap();

    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Active]);
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 13);
    assert_eq!(pipeline.submitter_offsets(), pipeline.submitter_consumed());

    let status = pipeline.status(&first);
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(
        status.result.get(INDEXING_ERRORS_RESULT),
        Some(&serde_json::json!(2))
    );
    assert!(pipeline.status(&second).result.is_empty());
}

#[test]
fn test_unavailable_sink_is_retried() {
    let mut pipeline = LocalPipeline::new(single_partition());
    let ids = pipeline.put_documents("doc", 10);
    pipeline
        .sink
        .fail_next(SinkError::Unavailable("too many requests".to_string()));
    pipeline
        .sink
        .fail_next(SinkError::Unavailable("too many requests".to_string()));

    pipeline.run(index_command(), &ids).unwrap();

    assert_eq!(pipeline.sink.submissions(), 3);
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 10);
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Active]);
    assert_eq!(pipeline.submitter_offsets(), vec![1]);
}

#[test]
fn test_exhausted_retries_abort() {
    let settings = IndexActionSettings {
        max_retries: 1,
        ..single_partition()
    };
    let mut pipeline = LocalPipeline::new(settings);
    let ids = pipeline.put_documents("doc", 4);
    for _ in 0..2 {
        pipeline
            .sink
            .fail_next(SinkError::Unavailable("too many requests".to_string()));
    }

    let command_id = pipeline.run(index_command(), &ids).unwrap();
    assert_eq!(pipeline.sink.document_count(WRITE_INDEX), 0);
    assert_eq!(
        pipeline.status(&command_id).result.get(INDEXING_ERRORS_RESULT),
        Some(&serde_json::json!(4))
    );
    assert!(matches!(pipeline.tick(), Err(StreamError::Aborted(_))));
}

#[test]
fn test_transport_error_aborts() {
    let mut pipeline = LocalPipeline::new(single_partition());
    let ids = pipeline.put_documents("doc", 4);
    pipeline
        .sink
        .fail_next(SinkError::Transport("connection reset".to_string()));

    pipeline.run(index_command(), &ids).unwrap();
    assert_eq!(pipeline.sink.submissions(), 1);
    assert_eq!(pipeline.submitter_states(), vec![SubmitterState::Draining]);
    assert!(pipeline.tick().is_err());
}
