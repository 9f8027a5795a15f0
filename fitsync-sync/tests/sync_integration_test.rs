/// Sync integration tests
///
/// Drive the tracker, engine and connectivity observer against the in-process
/// remote store: offline logging, queued divisions, failed batches,
/// coalesced triggers and restarts.

use fitsync_core::{is_local_id, Division, NewSet, Split, Store, SyncState, DIVISIONS, SPLITS};
use fitsync_sync::remote::{REMOTE_DIVISIONS, REMOTE_SPLITS, REMOTE_WORKOUT_LOGS};
use fitsync_sync::{
    ConnectivityObserver, DivisionDraft, FitnessTracker, MemoryRemote, SyncEngine,
    SyncEngineBuilder, SyncEvent, SyncOutcome, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn setup(store: Store) -> (FitnessTracker, Arc<MemoryRemote>) {
    let remote = Arc::new(MemoryRemote::new());
    let engine = SyncEngineBuilder::new()
        .with_store(Arc::new(store))
        .with_remote(remote.clone())
        .with_owner("user-1")
        .with_sync_interval(Duration::from_millis(50))
        .build()
        .unwrap();
    (FitnessTracker::new(engine), remote)
}

fn set(split_id: &str, weight: f64, reps: u32) -> NewSet {
    NewSet {
        workout_id: "w1".into(),
        split_id: split_id.into(),
        exercise_id: "bench".into(),
        weight,
        reps,
    }
}

fn ppl() -> DivisionDraft {
    DivisionDraft {
        name: "PPL".into(),
        frequency: "6x".into(),
        splits: vec!["Push".into(), "Pull".into(), "Legs".into()],
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..300 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not reached in time")
}

fn engine(tracker: &FitnessTracker) -> &SyncEngine {
    tracker.engine()
}

#[tokio::test]
async fn test_offline_log_synced_on_reconnect() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);

    let observer = ConnectivityObserver::new(false);
    engine(&tracker).start(&observer).await?;

    let log = tracker.log_set(set("split-1", 80.0, 8))?;
    assert_eq!(log.sync_state, SyncState::Pending);
    assert_eq!(tracker.pending_logs()?.len(), 1);
    assert_eq!(engine(&tracker).status(), SyncStatus::Offline);
    assert_eq!(remote.calls("insert_workout_logs"), 0);

    observer.set_online(true);
    wait_until(|| tracker.pending_logs().map(|p| p.is_empty()).unwrap_or(false)).await?;

    assert_eq!(remote.calls("insert_workout_logs"), 1);
    let rows = remote.rows(REMOTE_WORKOUT_LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["weight"], 80.0);
    assert_eq!(rows[0]["reps"], 8);
    assert!(rows[0].get("local_id").is_none());
    assert!(rows[0].get("sync_state").is_none());

    wait_until(|| engine(&tracker).status() == SyncStatus::Synced).await?;
    engine(&tracker).stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_queued_division_replaced_after_reconnect() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);

    let created = tracker.create_division(ppl()).await?;
    assert!(created.is_queued());
    let temp_division = created.division().id.clone();
    let temp_push = created.splits()[0].id.clone();

    // A set logged on a temporary split waits for the division
    tracker.log_set(set(&temp_push, 60.0, 10))?;
    assert_eq!(engine(&tracker).division_queue().len()?, 1);

    engine(&tracker).set_online(true);
    let outcome = engine(&tracker).sync_now().await?;
    let SyncOutcome::Completed(report) = outcome else {
        panic!("expected a completed pass, got {:?}", outcome);
    };
    assert_eq!(report.divisions_created, 1);
    assert_eq!(report.logs_synced, 1);
    assert_eq!(report.logs_held_back, 0);
    assert!(report.is_clean());

    assert!(engine(&tracker).division_queue().is_empty()?);
    let store = engine(&tracker).store();
    assert!(store.get::<Division>(&temp_division.as_str().into())?.is_none());

    let divisions: Vec<Division> = store.all()?;
    assert_eq!(divisions.len(), 1);
    assert!(!is_local_id(&divisions[0].id));
    assert_eq!(remote.rows(REMOTE_DIVISIONS).len(), 1);
    assert_eq!(remote.rows(REMOTE_DIVISIONS)[0]["id"], divisions[0].id.as_str());

    let splits: Vec<Split> = store
        .query::<Split>()
        .eq("division_id", &divisions[0].id)
        .order_by("order_index")
        .fetch()?;
    let names: Vec<&str> = splits.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Push", "Pull", "Legs"]);
    assert!(splits.iter().all(|s| !is_local_id(&s.id)));
    assert_eq!(store.count(SPLITS)?, 3);
    assert_eq!(remote.rows(REMOTE_SPLITS).len(), 3);

    // The log went out against the remote split id
    let logs = remote.rows(REMOTE_WORKOUT_LOGS);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["split_id"], splits[0].id.as_str());
    assert_eq!(tracker.all_logs()?[0].split_id, splits[0].id);

    assert_eq!(engine(&tracker).status(), SyncStatus::Synced);
    Ok(())
}

#[tokio::test]
async fn test_failed_division_holds_back_its_logs() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);

    let created = tracker.create_division(ppl()).await?;
    tracker.log_set(set(&created.splits()[1].id, 40.0, 12))?;
    tracker.log_set(set("remote-split", 100.0, 5))?;

    engine(&tracker).set_online(true);
    remote.fail_next_on("insert_division", 1);
    let SyncOutcome::Completed(report) = engine(&tracker).sync_now().await? else {
        panic!("expected a completed pass");
    };

    assert_eq!(report.divisions_pending, 1);
    assert_eq!(report.logs_held_back, 1);
    assert_eq!(report.logs_synced, 1);
    assert_eq!(engine(&tracker).status(), SyncStatus::Offline);

    let queued = engine(&tracker).division_queue().list()?;
    assert_eq!(queued[0].attempts, 1);
    assert!(queued[0].last_error.is_some());

    let SyncOutcome::Completed(report) = engine(&tracker).sync_now().await? else {
        panic!("expected a completed pass");
    };
    assert_eq!(report.divisions_created, 1);
    assert_eq!(report.logs_synced, 1);
    assert!(tracker.pending_logs()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_batch_stays_pending_and_is_resent() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    tracker.log_set(set("split-1", 80.0, 8))?;
    tracker.log_set(set("split-1", 85.0, 6))?;

    remote.fail_next(1);
    let mut events = engine(&tracker).subscribe();
    let observer = ConnectivityObserver::new(true);
    engine(&tracker).start(&observer).await?;

    // The startup pass fails; the retry is left to the timer
    let failed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::PassCompleted { report }) if !report.is_clean() => break Ok(report),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        }
    })
    .await??;
    assert_eq!(failed.logs_synced, 0);
    assert_eq!(failed.errors.len(), 1);

    wait_until(|| remote.rows(REMOTE_WORKOUT_LOGS).len() == 2).await?;
    wait_until(|| tracker.pending_logs().map(|p| p.is_empty()).unwrap_or(false)).await?;
    assert_eq!(remote.calls("insert_workout_logs"), 2);
    let weights: Vec<f64> = remote
        .rows(REMOTE_WORKOUT_LOGS)
        .iter()
        .filter_map(|r| r["weight"].as_f64())
        .collect();
    assert_eq!(weights, vec![80.0, 85.0]);
    wait_until(|| engine(&tracker).status() == SyncStatus::Synced).await?;

    engine(&tracker).stop().await?;
    let stats = engine(&tracker).stats();
    assert_eq!(stats.failed_passes, 1);
    assert!(stats.successful_passes >= 1);
    assert_eq!(stats.logs_synced, 2);
    Ok(())
}

#[tokio::test]
async fn test_logs_on_replaced_split_are_sent() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    let created = tracker.create_division(ppl()).await?;
    let temp_push = created.splits()[0].id.clone();
    let temp_pull = created.splits()[1].id.clone();

    engine(&tracker).set_online(true);
    engine(&tracker).sync_now().await?;
    assert!(engine(&tracker).division_queue().is_empty()?);

    let store = engine(&tracker).store();
    let splits: Vec<Split> = store
        .query::<Split>()
        .eq("division_id", &store.all::<Division>()?[0].id)
        .order_by("order_index")
        .fetch()?;
    assert_eq!(engine(&tracker).resolve_id(&temp_push)?, Some(splits[0].id.clone()));

    // A screen still holding the temporary ids keeps logging against them
    let stale = fitsync_core::WorkoutLog::pending(set(&temp_pull, 50.0, 12), "2024-02-20T10:00:00Z".into())?;
    store.put(&stale)?;
    let logged = tracker.log_set(set(&temp_push, 60.0, 10))?;
    assert_eq!(logged.split_id, splits[0].id);

    wait_until(|| tracker.pending_logs().map(|p| p.is_empty()).unwrap_or(false)).await?;
    engine(&tracker).wait_idle().await;

    let mut sent: Vec<String> = remote
        .rows(REMOTE_WORKOUT_LOGS)
        .iter()
        .filter_map(|r| r["split_id"].as_str().map(String::from))
        .collect();
    sent.sort();
    let mut expected = vec![splits[0].id.clone(), splits[1].id.clone()];
    expected.sort();
    assert_eq!(sent, expected);
    assert!(tracker.all_logs()?.iter().all(|l| !is_local_id(&l.split_id)));
    assert_eq!(engine(&tracker).status(), SyncStatus::Synced);
    Ok(())
}

#[tokio::test]
async fn test_held_back_logs_keep_status_unsynced() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    tracker.log_set(set(&fitsync_core::new_local_id(), 70.0, 8))?;

    engine(&tracker).set_online(true);
    let SyncOutcome::Completed(report) = engine(&tracker).sync_now().await? else {
        panic!("expected a completed pass");
    };
    assert!(report.is_clean());
    assert_eq!(report.logs_held_back, 1);
    assert_eq!(remote.calls("insert_workout_logs"), 0);
    assert_ne!(engine(&tracker).status(), SyncStatus::Synced);
    Ok(())
}

#[tokio::test]
async fn test_delete_during_division_create_removes_remote_copy() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    let created = tracker.create_division(ppl()).await?;
    let temp_id = created.division().id.clone();

    engine(&tracker).set_online(true);
    remote.set_latency(Duration::from_millis(200));
    let running = engine(&tracker).clone();
    let pass = tokio::spawn(async move { running.sync_now().await });

    // The remote insert is in flight
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.calls("insert_division"), 1);
    tracker.delete_division(&temp_id).await?;

    pass.await??;
    let store = engine(&tracker).store();
    assert_eq!(store.count(DIVISIONS)?, 0);
    assert_eq!(store.count(SPLITS)?, 0);
    assert!(engine(&tracker).division_queue().is_empty()?);
    assert!(remote.rows(REMOTE_DIVISIONS).is_empty());
    assert!(remote.rows(REMOTE_SPLITS).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pending_logs_submitted_as_one_batch() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    tracker.log_set(set("split-1", 80.0, 8))?;
    tracker.log_set(set("split-1", 82.5, 8))?;

    engine(&tracker).set_online(true);
    engine(&tracker).sync_now().await?;

    assert_eq!(remote.calls("insert_workout_logs"), 1);
    assert_eq!(remote.rows(REMOTE_WORKOUT_LOGS).len(), 2);
    assert_eq!(tracker.synced_log_count()?, 2);
    Ok(())
}

#[tokio::test]
async fn test_logs_not_marked_before_remote_accepts() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    tracker.log_set(set("split-1", 80.0, 8))?;
    engine(&tracker).set_online(true);

    remote.set_latency(Duration::from_millis(200));
    let running = engine(&tracker).clone();
    let pass = tokio::spawn(async move { running.sync_now().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine(&tracker).status(), SyncStatus::Syncing);
    assert_eq!(tracker.pending_logs()?.len(), 1);

    pass.await??;
    assert!(tracker.pending_logs()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_triggers_coalesce() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    for weight in [60.0, 70.0, 80.0] {
        tracker.log_set(set("split-1", weight, 5))?;
    }
    engine(&tracker).set_online(true);
    remote.set_latency(Duration::from_millis(100));

    let e = engine(&tracker);
    let (a, b, c) = tokio::join!(e.sync_now(), e.sync_now(), e.sync_now());
    let outcomes = [a?, b?, c?];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Completed(_)))
        .count();
    let coalesced = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Coalesced))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(coalesced, 2);

    // The follow-up pass finds nothing pending
    assert_eq!(remote.calls("insert_workout_logs"), 1);
    assert_eq!(remote.max_concurrent_log_inserts(), 1);
    assert_eq!(remote.rows(REMOTE_WORKOUT_LOGS).len(), 3);
    assert_eq!(e.stats().coalesced_triggers, 2);
    Ok(())
}

#[tokio::test]
async fn test_startup_trigger_syncs_when_online() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    engine(&tracker).set_online(false);
    tracker.log_set(set("split-1", 80.0, 8))?;

    let observer = ConnectivityObserver::new(true);
    engine(&tracker).start(&observer).await?;
    wait_until(|| remote.rows(REMOTE_WORKOUT_LOGS).len() == 1).await?;

    engine(&tracker).stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_timer_fires_only_while_online() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    let observer = ConnectivityObserver::new(false);
    engine(&tracker).start(&observer).await?;

    // Written straight to the store so nothing but the timer submits it
    let log = fitsync_core::WorkoutLog::pending(set("split-1", 80.0, 8), "2024-02-20T10:00:00Z".into())?;
    engine(&tracker).store().put(&log)?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.calls("insert_workout_logs"), 0);

    observer.set_online(true);
    wait_until(|| remote.rows(REMOTE_WORKOUT_LOGS).len() == 1).await?;

    let log = fitsync_core::WorkoutLog::pending(set("split-1", 90.0, 8), "2024-02-20T10:05:00Z".into())?;
    engine(&tracker).store().put(&log)?;
    wait_until(|| remote.rows(REMOTE_WORKOUT_LOGS).len() == 2).await?;
    assert!(engine(&tracker).stats().total_passes >= 2);

    engine(&tracker).stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_queue_survives_restart() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let temp_id = {
        let (tracker, _remote) = setup(Store::open(dir.path())?);
        engine(&tracker).set_online(false);
        tracker.log_set(set("split-1", 80.0, 8))?;
        let created = tracker.create_division(ppl()).await?;
        created.division().id.clone()
    };

    let (tracker, remote) = setup(Store::open(dir.path())?);
    assert_eq!(tracker.pending_logs()?.len(), 1);
    let queued = engine(&tracker).division_queue().list()?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, temp_id);
    assert_eq!(engine(&tracker).store().count(DIVISIONS)?, 1);

    engine(&tracker).sync_now().await?;
    assert!(engine(&tracker).division_queue().is_empty()?);
    assert_eq!(remote.rows(REMOTE_WORKOUT_LOGS).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_divisions_render_local_then_refresh() -> anyhow::Result<()> {
    let (tracker, remote) = setup(Store::in_memory());
    remote.insert_row(
        REMOTE_DIVISIONS,
        serde_json::json!({
            "id": "d-remote",
            "user_id": "user-1",
            "name": "Upper/Lower",
            "frequency": "4x",
            "created_at": "2024-01-01T00:00:00Z"
        }),
    );

    let loaded = tracker.divisions().await?;
    assert!(loaded.rows.is_empty());
    assert_eq!(loaded.refresh.await??, 1);

    let again = tracker.divisions().await?;
    assert_eq!(again.rows.len(), 1);
    assert_eq!(again.rows[0].name, "Upper/Lower");
    Ok(())
}

mod properties {
    use super::*;
    use fitsync_core::PendingDivisionCreate;
    use fitsync_sync::{Completion, PendingWriteQueue, RemoteError, SyncError};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Every logged set reaches the remote store exactly once, whatever
        /// the failure pattern, and is only marked synced after that
        #[test]
        fn prop_no_loss_under_failures(
            weights in prop::collection::vec(1.0f64..300.0, 1..8),
            failures in 0usize..4,
        ) {
            tokio_test::block_on(async {
                let (tracker, remote) = setup(Store::in_memory());
                engine(&tracker).set_online(false);
                for w in &weights {
                    tracker.log_set(set("split-1", *w, 5)).unwrap();
                }
                engine(&tracker).set_online(true);
                remote.fail_next(failures);

                for _ in 0..=failures {
                    let synced = remote.rows(REMOTE_WORKOUT_LOGS).len();
                    let marked = tracker.synced_log_count().unwrap();
                    assert_eq!(synced, marked);
                    engine(&tracker).sync_now().await.unwrap();
                }

                assert_eq!(remote.rows(REMOTE_WORKOUT_LOGS).len(), weights.len());
                assert!(tracker.pending_logs().unwrap().is_empty());
            });
        }

        /// Failed entries keep their relative order in the queue
        #[test]
        fn prop_queue_preserves_order(fail_mask in prop::collection::vec(any::<bool>(), 1..10)) {
            tokio_test::block_on(async {
                let queue = PendingWriteQueue::<PendingDivisionCreate>::new(Arc::new(Store::in_memory()));
                for i in 0..fail_mask.len() {
                    let division = Division {
                        id: fitsync_core::new_local_id(),
                        owner_id: "user-1".into(),
                        name: format!("d{}", i),
                        frequency: "3x".into(),
                        created_at: "2024-02-20T09:00:00Z".into(),
                    };
                    queue.enqueue(&PendingDivisionCreate::new(division, Vec::new())).unwrap();
                }

                let mask = fail_mask.clone();
                queue
                    .drain(|entry| {
                        let index: usize = entry.division.name[1..].parse().unwrap();
                        let fail = mask[index];
                        async move {
                            if fail {
                                Err(SyncError::Remote(RemoteError::Unreachable("down".into())))
                            } else {
                                Ok(Completion::dequeue())
                            }
                        }
                    })
                    .await
                    .unwrap();

                let expected: Vec<String> = fail_mask
                    .iter()
                    .enumerate()
                    .filter(|(_, fail)| **fail)
                    .map(|(i, _)| format!("d{}", i))
                    .collect();
                let left: Vec<String> = queue
                    .list()
                    .unwrap()
                    .into_iter()
                    .map(|e| e.division.name)
                    .collect();
                assert_eq!(left, expected);
            });
        }
    }
}
