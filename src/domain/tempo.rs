use crate::domain::models::{Tempo, TempoHistoryEntry};
use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;

pub const HISTORY_WINDOW_DAYS: i64 = 30;
pub const HISTORY_SAMPLE_LIMIT: usize = 50;
pub const HOUR_TOLERANCE: i64 = 2;
pub const CHECK_IN_INTERVAL_HOURS: i64 = 4;

/// Default tempo for a local hour of day.
pub fn tempo_for_hour(hour: u32) -> Tempo {
    match hour {
        6..=10 => Tempo::Moderato,
        11..=14 => Tempo::Allegro,
        15..=18 => Tempo::Moderato,
        _ => Tempo::Adagio,
    }
}

/// Suggests a tempo from recent choices made around the same local hour,
/// falling back to the time-of-day default.
pub fn suggest_tempo(history: &[TempoHistoryEntry], now: DateTime<Utc>, timezone: Tz) -> Tempo {
    let hour = i64::from(now.with_timezone(&timezone).hour());
    let window_start = now - Duration::days(HISTORY_WINDOW_DAYS);

    let mut recent = history
        .iter()
        .filter(|entry| entry.timestamp >= window_start && entry.timestamp <= now)
        .collect::<Vec<_>>();
    recent.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
    recent.truncate(HISTORY_SAMPLE_LIMIT);

    let mut counts = [0usize; 3];
    for entry in recent {
        let entry_hour = i64::from(entry.timestamp.with_timezone(&timezone).hour());
        if (entry_hour - hour).abs() > HOUR_TOLERANCE {
            continue;
        }
        if let Some(slot) = Tempo::ALL.iter().position(|tempo| *tempo == entry.tempo) {
            counts[slot] += 1;
        }
    }

    let mut best: Option<(Tempo, usize)> = None;
    for (tempo, count) in Tempo::ALL.iter().zip(counts) {
        if count > best.map_or(0, |(_, best_count)| best_count) {
            best = Some((*tempo, count));
        }
    }

    best.map(|(tempo, _)| tempo)
        .unwrap_or_else(|| tempo_for_hour(hour as u32))
}

pub fn should_prompt_check_in(history: &[TempoHistoryEntry], now: DateTime<Utc>) -> bool {
    let Some(latest) = history.iter().map(|entry| entry.timestamp).max() else {
        return true;
    };
    now - latest >= Duration::hours(CHECK_IN_INTERVAL_HOURS)
}
