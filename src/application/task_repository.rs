use crate::application::{next_id, system_now, NowProvider};
use crate::domain::models::{
    energy_boost, normalize_optional, validate_minutes, validate_non_empty, validate_priority,
    NewTask, Task, TaskUpdate, TempoFilter,
};
use crate::domain::selection::{sort_tasks, TaskSortKey};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_client::RemoteTable;
use crate::infrastructure::storage::{LocalStore, PendingChange};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub tempo: TempoFilter,
    pub movement_id: Option<String>,
    pub include_completed: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if !self.include_completed && task.completed {
            return false;
        }
        if let Some(movement_id) = self.movement_id.as_deref() {
            if !task.belongs_to(movement_id) {
                return false;
            }
        }
        self.tempo.matches(task.tempo_required)
    }
}

/// Owns the task list. Every mutation writes the full list to the store and
/// swaps the in-memory copy only once that write succeeded.
pub struct TaskRepository {
    store: Arc<LocalStore>,
    tasks: Mutex<Vec<Task>>,
    now_provider: NowProvider,
}

impl TaskRepository {
    pub fn load(store: Arc<LocalStore>) -> Self {
        let tasks = store.tasks();
        Self {
            store,
            tasks: Mutex::new(tasks),
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        (self.now_provider)()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Vec<Task>>, InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::Storage(format!("task list lock poisoned: {error}")))
    }

    fn commit(&self, guard: &mut MutexGuard<'_, Vec<Task>>, next: Vec<Task>) -> Result<(), InfraError> {
        self.store.save_tasks(&next)?;
        **guard = next;
        Ok(())
    }

    pub fn create(&self, new_task: NewTask) -> Result<Task, InfraError> {
        let title = new_task.title.trim();
        validate_non_empty(title, "title").map_err(InfraError::Validation)?;
        validate_priority(new_task.priority, "priority").map_err(InfraError::Validation)?;
        validate_minutes(new_task.estimated_minutes, "estimated_minutes")
            .map_err(InfraError::Validation)?;

        let now = self.now();
        let task = Task {
            id: next_id("tsk"),
            title: title.to_string(),
            description: normalize_optional(new_task.description.as_deref()),
            tempo_required: new_task.tempo_required,
            completed: false,
            movement_id: normalize_optional(new_task.movement_id.as_deref()),
            priority: new_task.priority,
            estimated_minutes: new_task.estimated_minutes,
            energy_boost: energy_boost(new_task.priority, new_task.estimated_minutes),
            created_at: now,
            completed_at: None,
            updated_at: now,
        };

        let mut guard = self.lock()?;
        let mut next = guard.clone();
        next.push(task.clone());
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(task_id = %task.id, tempo = task.tempo_required.as_str(), "task created");
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        let guard = self.lock()?;
        Ok(guard.iter().find(|task| task.id == task_id).cloned())
    }

    pub fn list(&self) -> Result<Vec<Task>, InfraError> {
        Ok(self.lock()?.clone())
    }

    pub fn list_filtered(&self, filter: &TaskFilter) -> Result<Vec<Task>, InfraError> {
        let guard = self.lock()?;
        Ok(guard
            .iter()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect())
    }

    pub fn list_sorted(&self, filter: &TaskFilter, sort_key: TaskSortKey) -> Result<Vec<Task>, InfraError> {
        Ok(sort_tasks(self.list_filtered(filter)?, sort_key))
    }

    pub fn update(&self, task_id: &str, update: TaskUpdate) -> Result<Task, InfraError> {
        let mut guard = self.lock()?;
        let Some(index) = guard.iter().position(|task| task.id == task_id) else {
            return Err(InfraError::not_found("task", task_id));
        };

        let now = self.now();
        let mut task = guard[index].clone();
        apply_update(&mut task, &update, now)?;
        task.validate().map_err(InfraError::Validation)?;

        let mut next = guard.clone();
        next[index] = task.clone();
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(task_id = %task.id, "task updated");
        Ok(task)
    }

    /// Completing an already completed task is a no-op that returns it as is.
    pub fn complete(&self, task_id: &str) -> Result<Task, InfraError> {
        let mut guard = self.lock()?;
        let Some(index) = guard.iter().position(|task| task.id == task_id) else {
            return Err(InfraError::not_found("task", task_id));
        };
        if guard[index].completed {
            return Ok(guard[index].clone());
        }

        let mut task = guard[index].clone();
        task.mark_completed(self.now());

        let mut next = guard.clone();
        next[index] = task.clone();
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(task_id = %task.id, energy_boost = task.energy_boost, "task completed");
        Ok(task)
    }

    pub fn delete(&self, task_id: &str) -> Result<bool, InfraError> {
        let mut guard = self.lock()?;
        if !guard.iter().any(|task| task.id == task_id) {
            return Ok(false);
        }
        let next = guard
            .iter()
            .filter(|task| task.id != task_id)
            .cloned()
            .collect::<Vec<_>>();
        self.store
            .save_tasks_with_pending(&next, &[PendingChange::deleted(RemoteTable::Tasks, task_id)])?;
        *guard = next;
        drop(guard);

        tracing::info!(task_id, "task deleted");
        Ok(true)
    }

    /// Re-reads the list from the store, e.g. after an import.
    pub fn reload(&self) -> Result<(), InfraError> {
        let mut guard = self.lock()?;
        *guard = self.store.tasks();
        Ok(())
    }
}

fn apply_update(
    task: &mut Task,
    update: &TaskUpdate,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), InfraError> {
    if let Some(title) = update.title.as_deref() {
        let title = title.trim();
        validate_non_empty(title, "title").map_err(InfraError::Validation)?;
        task.title = title.to_string();
    }
    if let Some(description) = update.description.as_ref() {
        task.description = normalize_optional(description.as_deref());
    }
    if let Some(tempo) = update.tempo_required {
        task.tempo_required = tempo;
    }
    if let Some(priority) = update.priority {
        validate_priority(priority, "priority").map_err(InfraError::Validation)?;
        task.priority = priority;
    }
    if let Some(minutes) = update.estimated_minutes {
        validate_minutes(minutes, "estimated_minutes").map_err(InfraError::Validation)?;
        task.estimated_minutes = minutes;
    }
    if let Some(movement_id) = update.movement_id.as_ref() {
        task.movement_id = normalize_optional(movement_id.as_deref());
    }
    if update.changes_energy_boost() {
        task.refresh_energy_boost();
    }

    task.updated_at = now;
    match update.completed {
        Some(true) if !task.completed => task.mark_completed(now),
        Some(false) if task.completed => task.mark_incomplete(now),
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::models::Tempo;
    use crate::infrastructure::storage::{InMemoryKeyValueStore, KeyValueStore};
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    /// Wraps an in-memory store and fails every write while `fail_writes` is set.
    #[derive(Default)]
    pub(crate) struct FlakyKeyValueStore {
        inner: InMemoryKeyValueStore,
        pub(crate) fail_writes: AtomicBool,
    }

    impl KeyValueStore for FlakyKeyValueStore {
        fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
            self.inner.get(key)
        }

        fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), InfraError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(InfraError::Storage("disk full".to_string()));
            }
            self.inner.set_many(entries)
        }

        fn remove_many(&self, keys: &[&str]) -> Result<(), InfraError> {
            self.inner.remove_many(keys)
        }
    }

    pub(crate) fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T08:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    /// Clock that advances one minute per call.
    pub(crate) fn ticking_clock() -> NowProvider {
        let ticks = Arc::new(AtomicI64::new(0));
        Arc::new(move || fixed_time() + Duration::minutes(ticks.fetch_add(1, Ordering::SeqCst)))
    }

    fn repository() -> (TaskRepository, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::in_memory());
        let repository = TaskRepository::load(Arc::clone(&store)).with_now_provider(ticking_clock());
        (repository, store)
    }

    #[test]
    fn create_buy_milk_computes_energy_boost() {
        let (repository, store) = repository();
        let task = repository
            .create(NewTask::new("  Buy milk ", Tempo::Adagio).with_priority(2))
            .expect("create task");

        assert_eq!(task.title, "Buy milk");
        assert_eq!(task.energy_boost, 5);
        assert!(!task.completed);
        assert!(task.completed_at.is_none());
        assert_eq!(store.tasks(), vec![task]);
    }

    #[test]
    fn create_rejects_invalid_input() {
        let (repository, _) = repository();
        assert!(matches!(
            repository.create(NewTask::new("   ", Tempo::Adagio)),
            Err(InfraError::Validation(_))
        ));
        assert!(matches!(
            repository.create(NewTask::new("Call", Tempo::Adagio).with_priority(9)),
            Err(InfraError::Validation(_))
        ));
        assert!(matches!(
            repository.create(NewTask::new("Call", Tempo::Adagio).with_minutes(0)),
            Err(InfraError::Validation(_))
        ));
        assert!(repository.list().expect("list").is_empty());
    }

    #[test]
    fn update_recomputes_boost_and_refreshes_timestamp() {
        let (repository, _) = repository();
        let created = repository
            .create(NewTask::new("Buy milk", Tempo::Adagio).with_priority(2))
            .expect("create task");

        let updated = repository
            .update(
                &created.id,
                TaskUpdate {
                    priority: Some(1),
                    estimated_minutes: Some(60),
                    description: Some(Some(" oat ".to_string())),
                    ..TaskUpdate::default()
                },
            )
            .expect("update task");

        assert_eq!(updated.energy_boost, energy_boost(1, 60));
        assert_eq!(updated.description.as_deref(), Some("oat"));
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let (repository, _) = repository();
        let result = repository.update("missing", TaskUpdate::default());
        assert!(matches!(result, Err(InfraError::NotFound { .. })));
    }

    #[test]
    fn update_completed_flag_keeps_completion_invariant() {
        let (repository, _) = repository();
        let created = repository
            .create(NewTask::new("Stretch", Tempo::Adagio))
            .expect("create task");

        let done = repository
            .update(
                &created.id,
                TaskUpdate {
                    completed: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .expect("complete via update");
        assert!(done.completed && done.completed_at.is_some());

        let reopened = repository
            .update(
                &created.id,
                TaskUpdate {
                    completed: Some(false),
                    ..TaskUpdate::default()
                },
            )
            .expect("reopen via update");
        assert!(!reopened.completed && reopened.completed_at.is_none());
    }

    #[test]
    fn complete_twice_keeps_first_completion_time() {
        let (repository, _) = repository();
        let created = repository
            .create(NewTask::new("Water plants", Tempo::Moderato))
            .expect("create task");

        let first = repository.complete(&created.id).expect("first completion");
        let second = repository.complete(&created.id).expect("second completion");
        assert!(first.completed);
        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(first, second);
    }

    #[test]
    fn complete_missing_task_is_not_found() {
        let (repository, _) = repository();
        assert!(matches!(
            repository.complete("missing"),
            Err(InfraError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (repository, store) = repository();
        let created = repository
            .create(NewTask::new("Tidy desk", Tempo::Allegro))
            .expect("create task");

        assert!(repository.delete(&created.id).expect("first delete"));
        assert!(!repository.delete(&created.id).expect("second delete"));
        assert!(repository.get(&created.id).expect("get").is_none());
        assert!(store.tasks().is_empty());
        assert_eq!(
            store.pending_sync(),
            vec![PendingChange::deleted(RemoteTable::Tasks, created.id)]
        );
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let raw = Arc::new(FlakyKeyValueStore::default());
        let store = Arc::new(LocalStore::new(raw.clone(), "tempofy"));
        let repository = TaskRepository::load(Arc::clone(&store));
        let created = repository
            .create(NewTask::new("Buy milk", Tempo::Adagio))
            .expect("create task");

        raw.fail_writes.store(true, Ordering::SeqCst);
        assert!(repository.complete(&created.id).is_err());
        assert!(repository.create(NewTask::new("Other", Tempo::Adagio)).is_err());

        let tasks = repository.list().expect("list");
        assert_eq!(tasks, vec![created]);
        assert_eq!(store.tasks(), tasks);
    }

    #[test]
    fn list_filtered_by_tempo_movement_and_completion() {
        let (repository, _) = repository();
        let slow = repository
            .create(NewTask::new("Read", Tempo::Adagio).in_movement("mvt-1"))
            .expect("create slow");
        let fast = repository
            .create(NewTask::new("Run", Tempo::Allegro).in_movement("mvt-1"))
            .expect("create fast");
        let done = repository
            .create(NewTask::new("Nap", Tempo::Adagio))
            .expect("create done");
        repository.complete(&done.id).expect("complete");

        let adagio_open = repository
            .list_filtered(&TaskFilter {
                tempo: TempoFilter::Only(Tempo::Adagio),
                ..TaskFilter::default()
            })
            .expect("filter adagio");
        assert_eq!(adagio_open, vec![slow.clone()]);

        let in_movement = repository
            .list_filtered(&TaskFilter {
                movement_id: Some("mvt-1".to_string()),
                ..TaskFilter::default()
            })
            .expect("filter movement");
        assert_eq!(in_movement.len(), 2);

        let everything = repository
            .list_filtered(&TaskFilter {
                include_completed: true,
                ..TaskFilter::default()
            })
            .expect("filter all");
        assert_eq!(everything.len(), 3);

        let oldest_first = repository
            .list_sorted(&TaskFilter::default(), TaskSortKey::Oldest)
            .expect("sorted");
        assert_eq!(oldest_first, vec![slow, fast]);
    }

    #[test]
    fn reload_picks_up_store_contents() {
        let store = Arc::new(LocalStore::in_memory());
        let writer = TaskRepository::load(Arc::clone(&store));
        let reader = TaskRepository::load(Arc::clone(&store));
        writer
            .create(NewTask::new("Buy milk", Tempo::Adagio))
            .expect("create");
        assert!(reader.list().expect("list").is_empty());
        reader.reload().expect("reload");
        assert_eq!(reader.list().expect("list").len(), 1);
    }

    proptest! {
        #[test]
        fn created_tasks_satisfy_invariants(
            title in "[A-Za-z][A-Za-z ]{0,30}",
            priority in 1u8..=5u8,
            minutes in 1u32..600u32,
        ) {
            let (repository, _) = repository();
            let task = repository
                .create(NewTask::new(title, Tempo::Moderato).with_priority(priority).with_minutes(minutes))
                .expect("create task");
            prop_assert!(task.validate().is_ok());
            prop_assert_eq!(task.energy_boost, energy_boost(priority, minutes));
            prop_assert!(task.energy_boost >= 1);
        }
    }
}
