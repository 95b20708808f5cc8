//! Test: History - run summaries saved after a run

use crate::helpers::*;
use hyperpipe::core::ExecutionStatus;
use hyperpipe::persistence::{create_summary, InMemoryPersistence, PersistenceBackend};

async fn record_two_runs(store: &dyn PersistenceBackend) {
    let ws = Workspace::new();
    ws.subjects(3);
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[]);

    let first = run_pipeline(&pipeline, &config).await;
    store.save_run(&create_summary(&first)).await.unwrap();
    let second = run_pipeline(&pipeline, &config).await;
    store.save_run(&create_summary(&second)).await.unwrap();

    let runs = store.list_runs(Some("scenario"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    // Most recent first
    assert_eq!(runs[0].run_id, second.run_id);
    assert_eq!(runs[0].skipped_units, 3);
    assert_eq!(runs[1].completed_units, 3);
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Completed));
    assert!(runs.iter().all(|r| r.stages_run == 1));

    let loaded = store.load_run(first.run_id).await.unwrap().unwrap();
    assert_eq!(loaded.pipeline_name, "scenario");
    assert!(loaded.duration().is_some());
}

#[tokio::test]
async fn test_in_memory_history() {
    let store = InMemoryPersistence::new();
    record_two_runs(&store).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = hyperpipe::persistence::SqliteRunStore::new(&dir.path().join("runs.db"))
        .await
        .unwrap();
    record_two_runs(&store).await;
    assert_eq!(store.list_pipelines().await.unwrap(), vec!["scenario"]);
}
