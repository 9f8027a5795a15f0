/// Table formatting for CLI output using comfy-table

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use fitsync_core::history::SessionSummary;
use fitsync_core::{Division, Split, WorkoutLog};
use fitsync_sync::SyncStats;

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(Cell::new).collect::<Vec<_>>());
    table
}

/// Format logged sets, one row per set
pub fn format_logs_table(logs: &[WorkoutLog]) -> String {
    if logs.is_empty() {
        return "No sets found".to_string();
    }

    let mut table = new_table(&[
        "local_id", "workout", "split", "exercise", "weight", "reps", "timestamp", "state",
    ]);
    for log in logs {
        table.add_row(vec![
            Cell::new(log.local_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into())),
            Cell::new(&log.workout_id),
            Cell::new(&log.split_id),
            Cell::new(&log.exercise_id),
            Cell::new(log.weight),
            Cell::new(log.reps),
            Cell::new(&log.timestamp),
            Cell::new(log.sync_state),
        ]);
    }
    table.to_string()
}

pub fn format_divisions_table(divisions: &[(Division, Vec<Split>)], queued: &[String]) -> String {
    if divisions.is_empty() {
        return "No divisions found".to_string();
    }

    let mut table = new_table(&["id", "name", "frequency", "splits", "state"]);
    for (division, splits) in divisions {
        let names: Vec<&str> = splits.iter().map(|s| s.name.as_str()).collect();
        let state = if queued.contains(&division.id) {
            "queued"
        } else {
            "remote"
        };
        table.add_row(vec![
            Cell::new(&division.id),
            Cell::new(&division.name),
            Cell::new(&division.frequency),
            Cell::new(names.join(" / ")),
            Cell::new(state),
        ]);
    }
    table.to_string()
}

pub fn format_sessions_table(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No sessions found".to_string();
    }

    let mut table = new_table(&["workout", "started", "exercises", "sets", "volume"]);
    for session in sessions {
        table.add_row(vec![
            Cell::new(&session.workout_id),
            Cell::new(session.started_at.format("%Y-%m-%d %H:%M")),
            Cell::new(session.exercises.len()),
            Cell::new(session.set_count),
            Cell::new(format!("{:.1}", session.total_volume)),
        ]);
    }
    table.to_string()
}

pub fn format_stats_table(stats: &SyncStats) -> String {
    let mut table = new_table(&["metric", "value"]);
    let last_sync = stats
        .last_sync_time
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".into());

    let rows: [(&str, String); 7] = [
        ("passes", stats.total_passes.to_string()),
        ("successful", stats.successful_passes.to_string()),
        ("failed", stats.failed_passes.to_string()),
        ("coalesced triggers", stats.coalesced_triggers.to_string()),
        ("logs synced", stats.logs_synced.to_string()),
        ("divisions created", stats.divisions_created.to_string()),
        ("last sync", last_sync),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    if let Some(error) = &stats.last_error {
        table.add_row(vec![Cell::new("last error"), Cell::new(error)]);
    }
    table.to_string()
}
