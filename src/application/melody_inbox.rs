use crate::application::task_repository::TaskRepository;
use crate::application::{next_id, system_now, NowProvider};
use crate::domain::melody::{extract_task_suggestions, processing_notes, suggested_title};
use crate::domain::models::{
    validate_non_empty, Melody, NewTask, Task, Tempo, DEFAULT_ESTIMATED_MINUTES, DEFAULT_PRIORITY,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::LocalStore;
use std::sync::{Arc, Mutex, MutexGuard};

/// Quick captures ("melodies") waiting to be turned into tasks.
pub struct MelodyInbox {
    store: Arc<LocalStore>,
    tasks: Arc<TaskRepository>,
    melodies: Mutex<Vec<Melody>>,
    now_provider: NowProvider,
}

impl MelodyInbox {
    pub fn load(store: Arc<LocalStore>, tasks: Arc<TaskRepository>) -> Self {
        let melodies = store.melodies();
        Self {
            store,
            tasks,
            melodies: Mutex::new(melodies),
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Melody>>, InfraError> {
        self.melodies
            .lock()
            .map_err(|error| InfraError::Storage(format!("melody list lock poisoned: {error}")))
    }

    fn commit(
        &self,
        guard: &mut MutexGuard<'_, Vec<Melody>>,
        next: Vec<Melody>,
    ) -> Result<(), InfraError> {
        self.store.save_melodies(&next)?;
        **guard = next;
        Ok(())
    }

    pub fn capture(&self, content: &str, is_voice: bool) -> Result<Melody, InfraError> {
        let content = content.trim();
        validate_non_empty(content, "content").map_err(InfraError::Validation)?;

        let melody = Melody {
            id: next_id("mel"),
            content: content.to_string(),
            is_voice,
            processed: false,
            processing_notes: None,
            created_at: (self.now_provider)(),
            processed_at: None,
        };

        let mut guard = self.lock()?;
        let mut next = guard.clone();
        next.push(melody.clone());
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(melody_id = %melody.id, is_voice, "melody captured");
        Ok(melody)
    }

    pub fn list(&self) -> Result<Vec<Melody>, InfraError> {
        Ok(self.lock()?.clone())
    }

    /// Unprocessed captures, newest first.
    pub fn unprocessed(&self) -> Result<Vec<Melody>, InfraError> {
        let mut melodies = self
            .lock()?
            .iter()
            .filter(|melody| !melody.processed)
            .cloned()
            .collect::<Vec<_>>();
        melodies.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(melodies)
    }

    /// Extracts task suggestions and marks the melody processed.
    pub fn process(&self, melody_id: &str) -> Result<Vec<String>, InfraError> {
        let mut guard = self.lock()?;
        let Some(index) = guard.iter().position(|melody| melody.id == melody_id) else {
            return Err(InfraError::not_found("melody", melody_id));
        };

        let suggestions = extract_task_suggestions(&guard[index].content);
        let mut melody = guard[index].clone();
        melody.processed = true;
        melody.processing_notes = Some(processing_notes(suggestions.len()));
        melody.processed_at = Some((self.now_provider)());

        let mut next = guard.clone();
        next[index] = melody;
        self.commit(&mut guard, next)?;
        drop(guard);

        tracing::info!(melody_id, suggestions = suggestions.len(), "melody processed");
        Ok(suggestions)
    }

    /// Creates one task per suggestion, or a single task from the whole
    /// capture when nothing actionable was found.
    pub fn convert_to_tasks(
        &self,
        melody_id: &str,
        tempo: Tempo,
        movement_id: Option<&str>,
    ) -> Result<Vec<Task>, InfraError> {
        let content = {
            let guard = self.lock()?;
            guard
                .iter()
                .find(|melody| melody.id == melody_id)
                .map(|melody| melody.content.clone())
                .ok_or_else(|| InfraError::not_found("melody", melody_id))?
        };

        let mut titles = self.process(melody_id)?;
        if titles.is_empty() {
            titles.push(content.clone());
        }

        let mut created = Vec::with_capacity(titles.len());
        for title in titles {
            let mut new_task = NewTask::new(suggested_title(&title), tempo)
                .with_priority(DEFAULT_PRIORITY)
                .with_minutes(DEFAULT_ESTIMATED_MINUTES)
                .with_description(content.clone());
            if let Some(movement_id) = movement_id {
                new_task = new_task.in_movement(movement_id);
            }
            created.push(self.tasks.create(new_task)?);
        }
        Ok(created)
    }

    pub fn clear_processed(&self) -> Result<usize, InfraError> {
        let mut guard = self.lock()?;
        let next = guard
            .iter()
            .filter(|melody| !melody.processed)
            .cloned()
            .collect::<Vec<_>>();
        let removed = guard.len() - next.len();
        if removed > 0 {
            self.commit(&mut guard, next)?;
        }
        Ok(removed)
    }

    pub fn reload(&self) -> Result<(), InfraError> {
        let mut guard = self.lock()?;
        *guard = self.store.melodies();
        Ok(())
    }
}
