use crate::domain::models::{Task, Tempo};
use crate::domain::progress::dominant_tempo;
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;

/// Summary of one local day of completed work.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DailyComposition {
    pub date: NaiveDate,
    pub measures_earned: u32,
    pub notes_completed: usize,
    pub dominant_tempo: Option<Tempo>,
}

fn completion_date(task: &Task, timezone: Tz) -> Option<NaiveDate> {
    task.completed_at
        .filter(|_| task.completed)
        .map(|completed_at| completed_at.with_timezone(&timezone).date_naive())
}

pub fn daily_composition(tasks: &[Task], date: NaiveDate, timezone: Tz) -> DailyComposition {
    let completed = tasks
        .iter()
        .filter(|task| completion_date(task, timezone) == Some(date))
        .collect::<Vec<_>>();
    DailyComposition {
        date,
        measures_earned: completed.iter().map(|task| task.energy_boost.max(1)).sum(),
        notes_completed: completed.len(),
        dominant_tempo: dominant_tempo(completed.iter().copied()),
    }
}

/// Consecutive days with at least one completion, counted back from `today`.
/// A streak that ended yesterday is still alive.
pub fn rhythm_streak(tasks: &[Task], today: NaiveDate, timezone: Tz) -> u32 {
    let active_days = tasks
        .iter()
        .filter_map(|task| completion_date(task, timezone))
        .collect::<HashSet<_>>();

    let mut cursor = if active_days.contains(&today) {
        today
    } else {
        today - Duration::days(1)
    };
    let mut streak = 0;
    while active_days.contains(&cursor) {
        streak += 1;
        cursor -= Duration::days(1);
    }
    streak
}
