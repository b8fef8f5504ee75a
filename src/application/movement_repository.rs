use crate::application::task_repository::TaskRepository;
use crate::application::{next_id, system_now, NowProvider};
use crate::domain::models::{
    normalize_optional, validate_non_empty, Movement, MovementTemplate, MovementType,
    MovementUpdate, NewMovement, Task, TaskUpdate, MOVEMENT_TEMPLATES,
};
use crate::domain::progress::{progress_of, with_progress, MovementProgress, MovementWithProgress};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_client::RemoteTable;
use crate::infrastructure::storage::{LocalStore, PendingChange};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletionFailure {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CompleteAllReport {
    pub completed_count: usize,
    pub already_completed_count: usize,
    pub failures: Vec<CompletionFailure>,
}

/// Owns the movement list and coordinates with the task repository for
/// anything that touches task membership.
///
/// Lock order is always movements first, then tasks.
pub struct MovementRepository {
    store: Arc<LocalStore>,
    tasks: Arc<TaskRepository>,
    movements: Mutex<Vec<Movement>>,
    now_provider: NowProvider,
}

impl MovementRepository {
    pub fn load(store: Arc<LocalStore>, tasks: Arc<TaskRepository>) -> Self {
        let movements = store.movements();
        Self {
            store,
            tasks,
            movements: Mutex::new(movements),
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Movement>>, InfraError> {
        self.movements
            .lock()
            .map_err(|error| InfraError::Storage(format!("movement list lock poisoned: {error}")))
    }

    fn commit(
        &self,
        guard: &mut MutexGuard<'_, Vec<Movement>>,
        next: Vec<Movement>,
    ) -> Result<(), InfraError> {
        self.store.save_movements(&next)?;
        **guard = next;
        Ok(())
    }

    pub fn templates(&self) -> &'static [MovementTemplate] {
        MOVEMENT_TEMPLATES
    }

    pub fn find_template(name: &str) -> Option<&'static MovementTemplate> {
        let name = name.trim();
        MOVEMENT_TEMPLATES
            .iter()
            .find(|template| template.name.eq_ignore_ascii_case(name))
    }

    pub fn create(&self, new_movement: NewMovement) -> Result<Movement, InfraError> {
        let name = new_movement.name.trim();
        validate_non_empty(name, "name").map_err(InfraError::Validation)?;
        let color_theme = new_movement.color_theme.trim();
        validate_non_empty(color_theme, "color_theme").map_err(InfraError::Validation)?;

        let now = self.now();
        let movement = Movement {
            id: next_id("mvt"),
            name: name.to_string(),
            description: normalize_optional(new_movement.description.as_deref()),
            movement_type: new_movement.movement_type,
            ensemble_members: Vec::new(),
            color_theme: color_theme.to_string(),
            template_category: normalize_optional(new_movement.template_category.as_deref()),
            created_at: now,
            updated_at: now,
        };

        let mut guard = self.lock()?;
        let mut next = guard.clone();
        next.push(movement.clone());
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(movement_id = %movement.id, kind = movement.movement_type.label(), "movement created");
        Ok(movement)
    }

    pub fn create_from_template(&self, template: &MovementTemplate) -> Result<Movement, InfraError> {
        self.create(template.to_new_movement())
    }

    pub fn get(&self, movement_id: &str) -> Result<Option<Movement>, InfraError> {
        let guard = self.lock()?;
        Ok(guard.iter().find(|movement| movement.id == movement_id).cloned())
    }

    pub fn list(&self) -> Result<Vec<Movement>, InfraError> {
        Ok(self.lock()?.clone())
    }

    pub fn update(&self, movement_id: &str, update: MovementUpdate) -> Result<Movement, InfraError> {
        self.modify(movement_id, |movement| {
            if let Some(name) = update.name.as_deref() {
                let name = name.trim();
                validate_non_empty(name, "name").map_err(InfraError::Validation)?;
                movement.name = name.to_string();
            }
            if let Some(description) = update.description.as_ref() {
                movement.description = normalize_optional(description.as_deref());
            }
            if let Some(movement_type) = update.movement_type {
                movement.movement_type = movement_type;
                if movement_type != MovementType::Ensemble {
                    movement.ensemble_members.clear();
                }
            }
            if let Some(color_theme) = update.color_theme.as_deref() {
                let color_theme = color_theme.trim();
                validate_non_empty(color_theme, "color_theme").map_err(InfraError::Validation)?;
                movement.color_theme = color_theme.to_string();
            }
            if let Some(category) = update.template_category.as_ref() {
                movement.template_category = normalize_optional(category.as_deref());
            }
            Ok(())
        })
    }

    fn modify<F>(&self, movement_id: &str, change: F) -> Result<Movement, InfraError>
    where
        F: FnOnce(&mut Movement) -> Result<(), InfraError>,
    {
        let mut guard = self.lock()?;
        let Some(index) = guard.iter().position(|movement| movement.id == movement_id) else {
            return Err(InfraError::not_found("movement", movement_id));
        };

        let mut movement = guard[index].clone();
        change(&mut movement)?;
        movement.updated_at = self.now();
        movement.validate().map_err(InfraError::Validation)?;

        let mut next = guard.clone();
        next[index] = movement.clone();
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(movement_id = %movement.id, "movement updated");
        Ok(movement)
    }

    /// Removes the movement and unlinks its tasks in one atomic write.
    /// Returns how many tasks were unlinked.
    pub fn delete(&self, movement_id: &str) -> Result<usize, InfraError> {
        let mut movements = self.lock()?;
        let Some(index) = movements.iter().position(|movement| movement.id == movement_id) else {
            return Err(InfraError::not_found("movement", movement_id));
        };
        let mut tasks = self.tasks.lock()?;

        let now = self.now();
        let mut unlinked = 0;
        let next_tasks = tasks
            .iter()
            .cloned()
            .map(|mut task| {
                if task.belongs_to(movement_id) {
                    task.movement_id = None;
                    task.updated_at = now;
                    unlinked += 1;
                }
                task
            })
            .collect::<Vec<_>>();
        let mut next_movements = movements.clone();
        next_movements.remove(index);

        self.store.save_tasks_and_movements_with_pending(
            &next_tasks,
            &next_movements,
            &[PendingChange::deleted(RemoteTable::Movements, movement_id)],
        )?;
        *tasks = next_tasks;
        *movements = next_movements;
        drop(tasks);
        drop(movements);

        tracing::info!(movement_id, unlinked, "movement deleted");
        Ok(unlinked)
    }

    fn ensure_exists(&self, movement_id: &str) -> Result<Movement, InfraError> {
        self.get(movement_id)?
            .ok_or_else(|| InfraError::not_found("movement", movement_id))
    }

    pub fn tasks_for(&self, movement_id: &str) -> Result<Vec<Task>, InfraError> {
        let tasks = self.tasks.lock()?;
        Ok(tasks
            .iter()
            .filter(|task| task.belongs_to(movement_id))
            .cloned()
            .collect())
    }

    pub fn link_task(&self, task_id: &str, movement_id: &str) -> Result<Task, InfraError> {
        let movements = self.lock()?;
        if !movements.iter().any(|movement| movement.id == movement_id) {
            return Err(InfraError::not_found("movement", movement_id));
        }
        let task = self.tasks.update(
            task_id,
            TaskUpdate {
                movement_id: Some(Some(movement_id.to_string())),
                ..TaskUpdate::default()
            },
        )?;
        drop(movements);
        Ok(task)
    }

    pub fn unlink_task(&self, task_id: &str) -> Result<Task, InfraError> {
        self.tasks.update(
            task_id,
            TaskUpdate {
                movement_id: Some(None),
                ..TaskUpdate::default()
            },
        )
    }

    pub fn progress_for(&self, movement_id: &str) -> Result<MovementProgress, InfraError> {
        self.ensure_exists(movement_id)?;
        let tasks = self.tasks.lock()?;
        Ok(progress_of(
            tasks.iter().filter(|task| task.belongs_to(movement_id)),
        ))
    }

    pub fn progress_for_all(&self) -> Result<Vec<MovementWithProgress>, InfraError> {
        let movements = self.lock()?;
        let tasks = self.tasks.lock()?;
        Ok(movements
            .iter()
            .map(|movement| with_progress(movement, &tasks))
            .collect())
    }

    /// Completes every open task of the movement one by one. A failing task
    /// is reported and the rest still run.
    pub fn complete_all(&self, movement_id: &str) -> Result<CompleteAllReport, InfraError> {
        let member_tasks = {
            let movements = self.lock()?;
            if !movements.iter().any(|movement| movement.id == movement_id) {
                return Err(InfraError::not_found("movement", movement_id));
            }
            let tasks = self.tasks.lock()?;
            tasks
                .iter()
                .filter(|task| task.belongs_to(movement_id))
                .map(|task| (task.id.clone(), task.completed))
                .collect::<Vec<_>>()
        };

        let mut report = CompleteAllReport::default();
        for (task_id, completed) in member_tasks {
            if completed {
                report.already_completed_count += 1;
                continue;
            }
            match self.tasks.complete(&task_id) {
                Ok(_) => report.completed_count += 1,
                Err(error) => {
                    tracing::warn!(movement_id, task_id = %task_id, %error, "failed to complete task");
                    report.failures.push(CompletionFailure {
                        task_id,
                        message: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            movement_id,
            completed = report.completed_count,
            failed = report.failures.len(),
            "movement completed"
        );
        Ok(report)
    }

    pub fn add_member(&self, movement_id: &str, member: &str) -> Result<Movement, InfraError> {
        let member = member.trim();
        validate_non_empty(member, "member").map_err(InfraError::Validation)?;
        self.modify(movement_id, |movement| {
            if movement.movement_type != MovementType::Ensemble {
                return Err(InfraError::Validation(format!(
                    "movement {} is not an ensemble",
                    movement.id
                )));
            }
            if movement.ensemble_members.iter().any(|existing| existing == member) {
                return Err(InfraError::Validation(format!(
                    "{member} is already a member of movement {}",
                    movement.id
                )));
            }
            movement.ensemble_members.push(member.to_string());
            Ok(())
        })
    }

    pub fn remove_member(&self, movement_id: &str, member: &str) -> Result<Movement, InfraError> {
        let member = member.trim();
        self.modify(movement_id, |movement| {
            if movement.movement_type != MovementType::Ensemble {
                return Err(InfraError::Validation(format!(
                    "movement {} is not an ensemble",
                    movement.id
                )));
            }
            let Some(position) = movement
                .ensemble_members
                .iter()
                .position(|existing| existing == member)
            else {
                return Err(InfraError::not_found("ensemble member", member));
            };
            movement.ensemble_members.remove(position);
            Ok(())
        })
    }

    /// Clears task references to movements that no longer exist.
    pub fn repair_dangling_references(&self) -> Result<usize, InfraError> {
        let movements = self.lock()?;
        let mut tasks = self.tasks.lock()?;

        let mut next_tasks = tasks.clone();
        let repaired = clear_dangling_links(&mut next_tasks, &movements, self.now());
        if repaired > 0 {
            self.store.save_tasks(&next_tasks)?;
            *tasks = next_tasks;
            tracing::warn!(repaired, "cleared dangling movement references");
        }
        Ok(repaired)
    }

    /// Rewrites both lists under both locks and persists the result in one
    /// atomic write. Used to fold remote changes into local state.
    pub fn rewrite_all<F, R>(&self, rewrite: F) -> Result<R, InfraError>
    where
        F: FnOnce(Vec<Movement>, Vec<Task>) -> (Vec<Movement>, Vec<Task>, R),
    {
        let mut movement_guard = self.lock()?;
        let mut task_guard = self.tasks.lock()?;
        let (movements, tasks, outcome) = rewrite(movement_guard.clone(), task_guard.clone());
        self.store.save_tasks_and_movements(&tasks, &movements)?;
        *task_guard = tasks;
        *movement_guard = movements;
        Ok(outcome)
    }

    pub fn reload(&self) -> Result<(), InfraError> {
        let mut guard = self.lock()?;
        *guard = self.store.movements();
        Ok(())
    }
}

/// Clears every task's reference to a movement missing from `movements` and
/// returns how many tasks changed.
pub(crate) fn clear_dangling_links(
    tasks: &mut [Task],
    movements: &[Movement],
    now: DateTime<Utc>,
) -> usize {
    let known = movements
        .iter()
        .map(|movement| movement.id.as_str())
        .collect::<HashSet<_>>();
    let mut repaired = 0;
    for task in tasks.iter_mut() {
        if task
            .movement_id
            .as_deref()
            .is_some_and(|movement_id| !known.contains(movement_id))
        {
            task.movement_id = None;
            task.updated_at = now;
            repaired += 1;
        }
    }
    repaired
}
