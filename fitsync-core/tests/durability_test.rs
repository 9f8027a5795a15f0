/// Durability tests for the local store
///
/// Reopen the store after writes, torn journal tails, checkpoints and schema
/// upgrades, and check that exactly the committed transactions survive.

use fitsync_core::journal::{Journal, Op};
use fitsync_core::{
    Division, Key, NewSet, PendingDivisionCreate, Split, Store, StoreConfig, SyncState,
    WorkoutLog, DIVISIONS, PENDING_DIVISION_CREATES, SCHEMA_VERSION, SPLITS, WORKOUT_LOGS,
};
use proptest::prelude::*;
use serde_json::json;
use std::fs::OpenOptions;
use tempfile::TempDir;

fn new_set(weight: f64, reps: u32) -> NewSet {
    NewSet {
        workout_id: "workout-1".to_string(),
        split_id: "split-1".to_string(),
        exercise_id: "bench".to_string(),
        weight,
        reps,
    }
}

fn pending_log(weight: f64, reps: u32) -> WorkoutLog {
    WorkoutLog::pending(new_set(weight, reps), "2024-02-20T10:00:00Z".to_string()).unwrap()
}

fn division(id: &str) -> Division {
    Division {
        id: id.to_string(),
        owner_id: "user-1".to_string(),
        name: "PPL".to_string(),
        frequency: "6x".to_string(),
        created_at: "2024-02-20T09:00:00Z".to_string(),
    }
}

fn split(id: &str, division_id: &str, order: i64) -> Split {
    Split {
        id: id.to_string(),
        division_id: division_id.to_string(),
        name: format!("Day {}", order),
        order_index: order,
        created_at: "2024-02-20T09:00:00Z".to_string(),
    }
}

#[test]
fn test_logs_survive_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    {
        let store = Store::open(dir.path())?;
        store.put(&pending_log(80.0, 8))?;
        store.put(&pending_log(82.5, 6))?;
    }

    let store = Store::open(dir.path())?;
    let pending: Vec<WorkoutLog> = store
        .query::<WorkoutLog>()
        .eq("sync_state", SyncState::Pending)
        .fetch()?;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].local_id, Some(1));
    assert_eq!(pending[1].weight, 82.5);
    Ok(())
}

#[test]
fn test_torn_commit_is_not_recovered() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    {
        let store = Store::open(dir.path())?;
        store.put(&pending_log(80.0, 8))?;
        store.transaction(&[DIVISIONS, SPLITS, PENDING_DIVISION_CREATES], |tx| {
            let div = division("local-d1");
            let splits = vec![split("local-s1", "local-d1", 0), split("local-s2", "local-d1", 1)];
            tx.put(&div)?;
            for s in &splits {
                tx.put(s)?;
            }
            tx.put(&PendingDivisionCreate::new(div, splits))?;
            Ok(())
        })?;
    }

    // Crash halfway through writing the second transaction's frame
    let journal_path = dir.path().join("journal.log");
    let len = std::fs::metadata(&journal_path)?.len();
    let file = OpenOptions::new().write(true).open(&journal_path)?;
    file.set_len(len - 10)?;
    drop(file);

    let store = Store::open(dir.path())?;
    assert_eq!(store.count(WORKOUT_LOGS)?, 1);
    // None of the torn transaction's writes are visible
    assert_eq!(store.count(DIVISIONS)?, 0);
    assert_eq!(store.count(SPLITS)?, 0);
    assert_eq!(store.count(PENDING_DIVISION_CREATES)?, 0);

    // The store keeps working after the truncation
    store.put(&division("d2"))?;
    drop(store);
    let store = Store::open(dir.path())?;
    assert_eq!(store.count(DIVISIONS)?, 1);
    Ok(())
}

#[test]
fn test_checkpoint_and_journal_replay() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = StoreConfig::new()
        .with_sync_on_commit(false)
        .with_checkpoint_after_frames(4);

    {
        let store = Store::open_with_config(dir.path(), config.clone())?;
        for i in 0..10 {
            store.put(&pending_log(60.0 + i as f64, 5))?;
        }
        store.delete(WORKOUT_LOGS, &Key::Int(3))?;
    }

    let store = Store::open_with_config(dir.path(), config)?;
    let logs: Vec<WorkoutLog> = store.all()?;
    assert_eq!(logs.len(), 9);
    assert!(logs.iter().all(|l| l.local_id != Some(3)));

    // Insertion order is kept across snapshot and replay
    let ids: Vec<u64> = logs.iter().filter_map(|l| l.local_id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let key = store.put(&pending_log(100.0, 1))?;
    assert_eq!(key, Key::Int(11));
    Ok(())
}

#[test]
fn test_older_schema_is_upgraded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    // A journal written by an older build, including a table that no longer exists
    {
        let mut journal = Journal::create(dir.path().join("journal.log"), SCHEMA_VERSION - 1)?;
        journal.append(
            1,
            &[
                Op::Put {
                    table: DIVISIONS.to_string(),
                    key: Key::from("d1"),
                    row: json!({"id": "d1", "owner_id": "user-1"}).to_string(),
                },
                Op::Put {
                    table: "legacy_drafts".to_string(),
                    key: Key::from("x"),
                    row: json!({"id": "x"}).to_string(),
                },
            ],
            true,
        )?;
    }

    {
        let store = Store::open(dir.path())?;
        assert_eq!(store.query_by_index(DIVISIONS, "owner_id", "user-1")?.len(), 1);
    }

    // The upgrade folded everything into a current-version snapshot
    let (_journal, recovered) = Journal::open(dir.path().join("journal.log"))?;
    assert_eq!(recovered.schema_version, SCHEMA_VERSION);
    assert!(recovered.frames.is_empty());

    let store = Store::open(dir.path())?;
    assert_eq!(store.count(DIVISIONS)?, 1);
    Ok(())
}

#[test]
fn test_newer_schema_is_refused() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    Journal::create(dir.path().join("journal.log"), SCHEMA_VERSION + 1)?;

    let err = Store::open(dir.path()).err().expect("open must fail");
    assert_eq!(err.code(), "SCHEMA_MISMATCH");
    Ok(())
}

#[test]
fn test_splits_ordered_within_division() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path())?;

    store.put(&split("s-legs", "d1", 2))?;
    store.put(&split("s-push", "d1", 0))?;
    store.put(&split("s-other", "d2", 0))?;
    store.put(&split("s-pull", "d1", 1))?;

    let names: Vec<String> = store
        .query::<Split>()
        .eq("division_id", "d1")
        .order_by("order_index")
        .fetch()?
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(names, vec!["s-push", "s-pull", "s-legs"]);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Writing the same row twice is indistinguishable from writing it once
    #[test]
    fn prop_put_is_idempotent(
        weight in 0.5f64..500.0,
        reps in 1u32..50,
        repeats in 1usize..4,
    ) {
        let once = Store::in_memory();
        let twice = Store::in_memory();

        let mut log = pending_log(weight, reps);
        log.local_id = Some(7);

        once.put(&log).unwrap();
        for _ in 0..=repeats {
            twice.put(&log).unwrap();
        }

        let a: Vec<WorkoutLog> = once.all().unwrap();
        let b: Vec<WorkoutLog> = twice.all().unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(
            once.query_by_index(WORKOUT_LOGS, "sync_state", "pending").unwrap().len(),
            twice.query_by_index(WORKOUT_LOGS, "sync_state", "pending").unwrap().len()
        );
    }
}
