mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;

use common::*;
use stream_deduplicator::store::{LocalStateBackend, StateBackend};
use stream_deduplicator::{BatchState, PipelineError, Row, StoreError};

fn scenario_batches() -> Vec<Vec<Row>> {
    vec![
        repeated_events(10, 15, 5),
        events(&[25]),
        events(&[25]),
        events(&[40]),
        events(&[40]),
    ]
}

#[tokio::test]
async fn test_restart_resumes_from_last_committed_batch() {
    let temp_dir = TempDir::new().unwrap();
    let mut batches = scenario_batches();
    let tail = batches.split_off(3);

    let mut uninterrupted = dedup_then_count_pipeline(in_memory()).await;
    let expected = run_batches(&mut uninterrupted, 1, scenario_batches()).await;

    {
        let backend = Arc::new(LocalStateBackend::new(temp_dir.path()));
        let mut pipeline = dedup_then_count_pipeline(backend).await;
        run_batches(&mut pipeline, 1, batches).await;
        assert_eq!(pipeline.last_committed(), 3);
    }
    assert!(temp_dir.path().join("commits/3.json").exists());
    assert!(temp_dir
        .path()
        .join("state/0-deduplicate/0/3.delta")
        .exists());

    let backend = Arc::new(LocalStateBackend::new(temp_dir.path()));
    let mut restarted = dedup_then_count_pipeline(backend).await;
    assert_eq!(restarted.last_committed(), 3);
    assert_eq!(restarted.watermark(), Some(15_000));
    assert_eq!(restarted.state(), BatchState::Idle);

    let resumed = run_batches(&mut restarted, 4, tail).await;
    assert_eq!(resumed, expected[3..].to_vec());
    assert_eq!(windows(&resumed[1]), vec![(15, 1), (25, 1)]);
}

#[tokio::test]
async fn test_recover_from_earlier_batch_reproduces_output() {
    let mut pipeline = dedup_then_count_pipeline(in_memory()).await;
    let original = run_batches(&mut pipeline, 1, scenario_batches()).await;

    pipeline.recover_from(2).await.unwrap();
    assert_eq!(pipeline.last_committed(), 2);
    assert_eq!(pipeline.watermark(), original[1].watermark);

    let replayed = run_batches(&mut pipeline, 3, scenario_batches().split_off(2)).await;
    assert_eq!(replayed, original[2..].to_vec());

    pipeline.recover_from(0).await.unwrap();
    assert_eq!(pipeline.last_committed(), 0);
    assert_eq!(pipeline.watermark(), None);
    let fresh = pipeline
        .process_batch(1, scenario_batches().remove(0))
        .await
        .unwrap();
    assert_eq!(fresh, original[0]);
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let backend = in_memory();
    let mut pipeline = event_dedup_pipeline(backend.clone()).await;
    pipeline.process_batch(1, events(&[1, 2])).await.unwrap();

    backend.fail_next_writes(1);
    let output = pipeline.process_batch(2, events(&[2, 3])).await.unwrap();
    assert_eq!(output.rows, events(&[3]));
    assert_eq!(state_counts(&output), vec![(3, 1)]);
    assert_eq!(pipeline.last_committed(), 2);
    assert!(backend.contains("commits/2.json"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_batch() {
    let backend = in_memory();
    let b: Arc<dyn StateBackend> = backend.clone();
    let mut pipeline = event_dedup_builder(b)
        .config(fast_retries(2))
        .event_time("eventTime", Some(std::time::Duration::from_secs(10)))
        .build()
        .await
        .unwrap();

    backend.fail_next_writes(usize::MAX);
    let err = pipeline.process_batch(1, events(&[1])).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::BatchFailed {
            batch_id: 1,
            attempts: 3,
            source: StoreError::Io { .. },
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(pipeline.state(), BatchState::Failed);
    assert_eq!(pipeline.last_committed(), 0);
    assert!(!backend.contains("commits/1.json"));

    backend.fail_next_writes(0);
    let output = pipeline.process_batch(1, events(&[1])).await.unwrap();
    assert_eq!(output.rows, events(&[1]));
    assert_eq!(pipeline.state(), BatchState::Idle);
    assert_eq!(pipeline.last_committed(), 1);
}

#[tokio::test]
async fn test_state_without_commit_marker_is_not_committed() {
    let backend = Arc::new(FlakyCommitBackend::new());
    let b: Arc<dyn StateBackend> = backend.clone();
    let mut pipeline = event_dedup_builder(b.clone())
        .config(fast_retries(0))
        .event_time("eventTime", Some(std::time::Duration::from_secs(10)))
        .build()
        .await
        .unwrap();

    pipeline.process_batch(1, events(&[1, 2])).await.unwrap();

    backend.fail_next_commits(1);
    let err = pipeline.process_batch(2, events(&[2, 3])).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::BatchFailed {
            batch_id: 2,
            attempts: 1,
            ..
        }
    ));
    // operator state of batch 2 was written, its marker was not
    assert!(backend.contains("state/0-deduplicate/0/2.delta"));
    assert!(!backend.contains("commits/2.json"));

    drop(pipeline);
    let mut restarted = event_dedup_pipeline(b).await;
    assert_eq!(restarted.last_committed(), 1);

    let output = restarted.process_batch(2, events(&[2, 3])).await.unwrap();
    assert_eq!(output.rows, events(&[3]));
    assert_eq!(state_counts(&output), vec![(3, 1)]);
    assert!(backend.contains("commits/2.json"));
}

#[tokio::test]
async fn test_maintenance_keeps_only_retained_versions() {
    let backend = in_memory();
    let b: Arc<dyn StateBackend> = backend.clone();
    let mut pipeline = event_dedup_builder(b)
        .store_config(small_store_config(2, 3))
        .build()
        .await
        .unwrap();

    let batches = (1..=10).map(|i| events(&[i])).collect::<Vec<_>>();
    run_batches(&mut pipeline, 1, batches).await;

    let prefix = "state/0-deduplicate/0/";
    let state_files = backend
        .keys()
        .iter()
        .filter_map(|key| key.strip_prefix(prefix).map(str::to_string))
        .collect::<BTreeSet<_>>();
    let expected = [
        "6.delta",
        "6.snapshot",
        "7.delta",
        "8.delta",
        "8.snapshot",
        "9.delta",
        "10.delta",
        "10.snapshot",
    ]
    .into_iter()
    .map(str::to_string)
    .collect::<BTreeSet<_>>();
    assert_eq!(state_files, expected);

    assert_eq!(
        pipeline.commit_log().committed_batches().await.unwrap(),
        vec![7, 8, 9, 10]
    );

    pipeline.recover_from(7).await.unwrap();
    assert_eq!(pipeline.last_committed(), 7);

    let err = pipeline.recover_from(5).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotCommitted { batch_id: 5 }));
}
