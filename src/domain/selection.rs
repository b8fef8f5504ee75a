use crate::domain::models::{Task, Tempo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortKey {
    #[default]
    Newest,
    Oldest,
    Priority,
    Duration,
}

impl TaskSortKey {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "newest" => Some(Self::Newest),
            "oldest" => Some(Self::Oldest),
            "priority" => Some(Self::Priority),
            "duration" | "time" => Some(Self::Duration),
            _ => None,
        }
    }
}

/// Stable sort; equal keys keep their incoming order.
pub fn sort_tasks(mut tasks: Vec<Task>, key: TaskSortKey) -> Vec<Task> {
    match key {
        TaskSortKey::Newest => tasks.sort_by(|left, right| right.created_at.cmp(&left.created_at)),
        TaskSortKey::Oldest => tasks.sort_by(|left, right| left.created_at.cmp(&right.created_at)),
        TaskSortKey::Priority => tasks.sort_by_key(|task| task.priority),
        TaskSortKey::Duration => tasks.sort_by_key(|task| task.estimated_minutes),
    }
    tasks
}

/// Picks the lowest-effort incomplete task: gentlest tempo, then most urgent,
/// then shortest.
pub fn gentlest(tasks: &[Task]) -> Option<Task> {
    let mut incomplete = tasks
        .iter()
        .filter(|task| !task.completed)
        .collect::<Vec<_>>();
    incomplete.sort_by_key(|task| {
        (
            task.tempo_required.gentleness_rank(),
            task.priority,
            task.estimated_minutes,
        )
    });
    incomplete.first().map(|task| (*task).clone())
}

pub fn tasks_for_tempo(tasks: &[Task], tempo: Tempo) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| !task.completed && task.tempo_required == tempo)
        .cloned()
        .collect()
}
