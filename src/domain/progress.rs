use crate::domain::models::{Movement, Task, Tempo};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MovementProgress {
    pub total: usize,
    pub completed: usize,
    pub percentage: u8,
    pub remaining_tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MovementWithProgress {
    #[serde(flatten)]
    pub movement: Movement,
    pub task_count: usize,
    pub completed_count: usize,
    pub percentage: u8,
    pub dominant_tempo: Option<Tempo>,
}

pub fn completion_percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u8
}

pub fn progress_of<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> MovementProgress {
    let mut total = 0;
    let mut completed = 0;
    let mut remaining_tasks = Vec::new();
    for task in tasks {
        total += 1;
        if task.completed {
            completed += 1;
        } else {
            remaining_tasks.push(task.clone());
        }
    }
    MovementProgress {
        total,
        completed,
        percentage: completion_percentage(completed, total),
        remaining_tasks,
    }
}

/// Most frequent tempo across all given tasks. Equal counts resolve to the
/// earlier variant in `Tempo::ALL`.
pub fn dominant_tempo<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Option<Tempo> {
    let mut counts = [0usize; 3];
    for task in tasks {
        let slot = Tempo::ALL
            .iter()
            .position(|tempo| *tempo == task.tempo_required)
            .unwrap_or_default();
        counts[slot] += 1;
    }

    let mut best: Option<(Tempo, usize)> = None;
    for (tempo, count) in Tempo::ALL.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((*tempo, count)),
        }
    }
    best.map(|(tempo, _)| tempo)
}

pub fn with_progress(movement: &Movement, all_tasks: &[Task]) -> MovementWithProgress {
    let member_tasks = all_tasks
        .iter()
        .filter(|task| task.belongs_to(&movement.id))
        .collect::<Vec<_>>();
    let completed_count = member_tasks.iter().filter(|task| task.completed).count();
    MovementWithProgress {
        movement: movement.clone(),
        task_count: member_tasks.len(),
        completed_count,
        percentage: completion_percentage(completed_count, member_tasks.len()),
        dominant_tempo: dominant_tempo(member_tasks.iter().copied()),
    }
}
