//! Summaries derived from logged sets for the history and evolution views.

use crate::WorkoutLog;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All sets of one exercise within a session, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSets {
    pub exercise_id: String,
    pub sets: Vec<WorkoutLog>,
}

impl ExerciseSets {
    pub fn volume(&self) -> f64 {
        self.sets.iter().map(WorkoutLog::volume).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub workout_id: String,
    pub started_at: DateTime<Utc>,
    pub total_volume: f64,
    pub set_count: usize,
    pub exercises: Vec<ExerciseSets>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyVolume {
    pub date: NaiveDate,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMax {
    pub date: NaiveDate,
    pub max_weight: f64,
}

fn parse_timestamp(log: &WorkoutLog) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(&log.timestamp) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(
                timestamp = %log.timestamp,
                error = %e,
                "skipping log with unparseable timestamp"
            );
            None
        }
    }
}

fn dated<'a>(logs: &'a [WorkoutLog]) -> impl Iterator<Item = (DateTime<Utc>, &'a WorkoutLog)> {
    logs.iter()
        .filter_map(|log| parse_timestamp(log).map(|ts| (ts, log)))
}

/// Group sets into sessions, newest session first
pub fn summarize_sessions(logs: &[WorkoutLog]) -> Vec<SessionSummary> {
    let mut sessions: BTreeMap<&str, Vec<(DateTime<Utc>, &WorkoutLog)>> = BTreeMap::new();
    for (ts, log) in dated(logs) {
        sessions.entry(log.workout_id.as_str()).or_default().push((ts, log));
    }

    let mut summaries: Vec<SessionSummary> = sessions
        .into_iter()
        .filter_map(|(workout_id, mut sets)| {
            sets.sort_by_key(|(ts, _)| *ts);
            let started_at = sets.first()?.0;

            // Exercises appear in the order they were first trained
            let mut exercises: Vec<ExerciseSets> = Vec::new();
            for (_, log) in &sets {
                match exercises.iter_mut().find(|e| e.exercise_id == log.exercise_id) {
                    Some(group) => group.sets.push((*log).clone()),
                    None => exercises.push(ExerciseSets {
                        exercise_id: log.exercise_id.clone(),
                        sets: vec![(*log).clone()],
                    }),
                }
            }

            Some(SessionSummary {
                workout_id: workout_id.to_string(),
                started_at,
                total_volume: sets.iter().map(|(_, log)| log.volume()).sum(),
                set_count: sets.len(),
                exercises,
            })
        })
        .collect();

    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries
}

/// Total volume per calendar day (UTC), oldest first
pub fn daily_volume(logs: &[WorkoutLog]) -> Vec<DailyVolume> {
    let mut days: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (ts, log) in dated(logs) {
        *days.entry(ts.date_naive()).or_insert(0.0) += log.volume();
    }
    days.into_iter()
        .map(|(date, volume)| DailyVolume { date, volume })
        .collect()
}

/// Heaviest set of `exercise_id` per calendar day (UTC), oldest first
pub fn max_weight_by_day(logs: &[WorkoutLog], exercise_id: &str) -> Vec<DailyMax> {
    let mut days: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (ts, log) in dated(logs).filter(|(_, log)| log.exercise_id == exercise_id) {
        let max = days.entry(ts.date_naive()).or_insert(log.weight);
        *max = max.max(log.weight);
    }
    days.into_iter()
        .map(|(date, max_weight)| DailyMax { date, max_weight })
        .collect()
}
