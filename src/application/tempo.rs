use crate::application::{next_id, system_now, NowProvider};
use crate::domain::models::{Tempo, TempoHistoryEntry};
use crate::domain::tempo::{should_prompt_check_in, suggest_tempo};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::LocalStore;
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, MutexGuard};

pub const MAX_HISTORY_ENTRIES: usize = 100;

struct TempoState {
    current: Tempo,
    history: Vec<TempoHistoryEntry>,
}

pub struct TempoService {
    store: Arc<LocalStore>,
    timezone: Tz,
    state: Mutex<TempoState>,
    now_provider: NowProvider,
}

impl TempoService {
    pub fn load(store: Arc<LocalStore>, timezone: Tz) -> Self {
        let state = TempoState {
            current: store.current_tempo(),
            history: store.tempo_history(),
        };
        Self {
            store,
            timezone,
            state: Mutex::new(state),
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, TempoState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::Storage(format!("tempo state lock poisoned: {error}")))
    }

    pub fn current(&self) -> Result<Tempo, InfraError> {
        Ok(self.lock()?.current)
    }

    pub fn history(&self) -> Result<Vec<TempoHistoryEntry>, InfraError> {
        Ok(self.lock()?.history.clone())
    }

    /// Switches the current tempo. A change is recorded in the history, which
    /// keeps only the newest entries.
    pub fn set(&self, tempo: Tempo, context: &str) -> Result<Tempo, InfraError> {
        let mut state = self.lock()?;
        if state.current == tempo {
            return Ok(tempo);
        }

        let context = context.trim();
        let entry = TempoHistoryEntry {
            id: next_id("tmp"),
            tempo,
            previous_tempo: Some(state.current),
            context: if context.is_empty() {
                "user_selection".to_string()
            } else {
                context.to_string()
            },
            timestamp: (self.now_provider)(),
        };
        let mut history = state.history.clone();
        history.push(entry);
        if history.len() > MAX_HISTORY_ENTRIES {
            let overflow = history.len() - MAX_HISTORY_ENTRIES;
            history.drain(..overflow);
        }

        self.store.save_tempo_change(tempo, &history)?;
        let previous = state.current;
        state.current = tempo;
        state.history = history;
        drop(state);

        tracing::info!(from = previous.as_str(), to = tempo.as_str(), "tempo changed");
        Ok(tempo)
    }

    pub fn suggest(&self) -> Result<Tempo, InfraError> {
        let state = self.lock()?;
        Ok(suggest_tempo(&state.history, (self.now_provider)(), self.timezone))
    }

    pub fn should_prompt_check(&self) -> Result<bool, InfraError> {
        let state = self.lock()?;
        Ok(should_prompt_check_in(&state.history, (self.now_provider)()))
    }

    pub fn tempo_for_energy(level: u8) -> Tempo {
        Tempo::for_energy(level)
    }

    pub fn reload(&self) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.current = self.store.current_tempo();
        state.history = self.store.tempo_history();
        Ok(())
    }
}
