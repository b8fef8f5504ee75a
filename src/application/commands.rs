use crate::application::bootstrap::bootstrap_workspace;
use crate::application::melody_inbox::MelodyInbox;
use crate::application::movement_repository::{CompleteAllReport, MovementRepository};
use crate::application::sync::{
    with_user_id, ChangeOp, ConnectionState, PullReport, PushReport, RetryPolicy, SyncService,
    SyncStatus,
};
use crate::application::task_repository::{TaskFilter, TaskRepository};
use crate::application::tempo::TempoService;
use crate::domain::composition::{daily_composition, rhythm_streak, DailyComposition};
use crate::domain::models::{
    Melody, Movement, MovementTemplate, MovementType, MovementUpdate, NewMovement, NewTask, Task,
    TaskUpdate, Tempo, TempoFilter, TempoHistoryEntry, DEFAULT_ESTIMATED_MINUTES,
    DEFAULT_MOVEMENT_COLOR, DEFAULT_PRIORITY,
};
use crate::domain::progress::{MovementProgress, MovementWithProgress};
use crate::domain::selection::{gentlest, tasks_for_tempo, TaskSortKey};
use crate::infrastructure::config::{read_app_settings, read_remote_config, AppSettings, RemoteConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_client::{
    ChangeKind, RemoteStoreClient, RemoteTable, ReqwestRemoteStoreClient,
};
use crate::infrastructure::storage::{LocalStore, SqliteKeyValueStore, StoreSnapshot};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ACTIVITY_LOG: &str = "activity.log";
const MAX_ENERGY_LEVEL: u8 = 10;

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    settings: AppSettings,
    remote_config: RemoteConfig,
    store: Arc<LocalStore>,
    tasks: Arc<TaskRepository>,
    movements: Arc<MovementRepository>,
    melodies: MelodyInbox,
    tempo: TempoService,
    sync: Option<SyncService>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::build(workspace_root, None)
    }

    /// Syncs through `client` instead of the REST endpoint in `sync.json`.
    /// The rest of the sync settings still come from the config file.
    pub fn with_remote_client(
        workspace_root: PathBuf,
        client: Arc<dyn RemoteStoreClient>,
    ) -> Result<Self, InfraError> {
        Self::build(workspace_root, Some(client))
    }

    fn build(
        workspace_root: PathBuf,
        client: Option<Arc<dyn RemoteStoreClient>>,
    ) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let settings = read_app_settings(&bootstrap.config_dir)?;
        let remote_config = read_remote_config(&bootstrap.config_dir)?;

        let store = Arc::new(LocalStore::new(
            Arc::new(SqliteKeyValueStore::new(&bootstrap.database_path)),
            settings.namespace.clone(),
        ));
        let tasks = Arc::new(TaskRepository::load(Arc::clone(&store)));
        let movements = Arc::new(MovementRepository::load(Arc::clone(&store), Arc::clone(&tasks)));
        let melodies = MelodyInbox::load(Arc::clone(&store), Arc::clone(&tasks));
        let tempo = TempoService::load(Arc::clone(&store), settings.timezone);
        let client = match client {
            Some(client) => Some(client),
            None => configured_client(&remote_config)?,
        };
        let sync = client.map(|client| sync_service(client, &remote_config, &store, &movements));

        let repaired = movements.repair_dangling_references()?;
        tracing::info!(
            namespace = %settings.namespace,
            timezone = %settings.timezone,
            remote_sync = sync.is_some(),
            repaired,
            "app state ready"
        );

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            settings,
            remote_config,
            store,
            tasks,
            movements,
            melodies,
            tempo,
            sync,
            log_guard: Mutex::new(()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        tracing::error!(command, %error, "command failed");
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join(ACTIVITY_LOG);
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.settings.timezone).date_naive()
    }
}

fn configured_client(
    remote_config: &RemoteConfig,
) -> Result<Option<Arc<dyn RemoteStoreClient>>, InfraError> {
    if !remote_config.is_usable() {
        if remote_config.enabled {
            tracing::warn!("remote sync enabled but base url or api key is missing");
        }
        return Ok(None);
    }
    let (Some(base_url), Some(api_key)) = (
        remote_config.base_url.as_deref(),
        remote_config.api_key.as_deref(),
    ) else {
        return Ok(None);
    };

    let client: Arc<dyn RemoteStoreClient> = Arc::new(ReqwestRemoteStoreClient::new(
        base_url,
        api_key,
        remote_config.timeout_ms,
    )?);
    Ok(Some(client))
}

fn sync_service(
    client: Arc<dyn RemoteStoreClient>,
    remote_config: &RemoteConfig,
    store: &Arc<LocalStore>,
    movements: &Arc<MovementRepository>,
) -> SyncService {
    SyncService::new(client, Arc::clone(store), Arc::clone(movements))
        .with_retry_policy(RetryPolicy {
            max_attempts: remote_config.retry_max_attempts,
            base_delay_ms: remote_config.retry_base_delay_ms,
        })
        .with_timeouts(
            Duration::from_millis(remote_config.timeout_ms),
            Duration::from_millis(remote_config.slow_threshold_ms),
        )
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    /// An empty string clears the description.
    pub description: Option<String>,
    pub tempo: Option<String>,
    pub priority: Option<u8>,
    pub estimated_minutes: Option<u32>,
    /// An empty string unlinks the task.
    pub movement_id: Option<String>,
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMovementRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub movement_type: Option<String>,
    pub color_theme: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteMovementResponse {
    pub movement_id: String,
    pub unlinked_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMelodyResponse {
    pub melody_id: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TempoStateResponse {
    pub current: Tempo,
    pub suggested: Tempo,
    pub should_check_in: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCompositionResponse {
    pub composition: DailyComposition,
    pub rhythm_streak: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportDataResponse {
    pub tasks: usize,
    pub movements: usize,
    pub melodies: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncNowResponse {
    pub push: PushReport,
    pub pull: PullReport,
}

pub fn create_task_impl(
    state: &AppState,
    title: String,
    description: Option<String>,
    tempo: String,
    priority: Option<u8>,
    estimated_minutes: Option<u32>,
    movement_id: Option<String>,
) -> Result<Task, InfraError> {
    let tempo = parse_tempo(&tempo)?;
    let movement_id = non_empty(movement_id);
    if let Some(movement_id) = movement_id.as_deref() {
        ensure_movement_exists(state, movement_id)?;
    }

    let mut new_task = NewTask::new(title, tempo)
        .with_priority(priority.unwrap_or(DEFAULT_PRIORITY))
        .with_minutes(estimated_minutes.unwrap_or(DEFAULT_ESTIMATED_MINUTES));
    new_task.description = description;
    new_task.movement_id = movement_id;

    let task = state.tasks.create(new_task)?;
    state.log_info("create_task", &format!("created task_id={}", task.id));
    Ok(task)
}

pub fn get_task_impl(state: &AppState, task_id: String) -> Result<Task, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    state
        .tasks
        .get(task_id)?
        .ok_or_else(|| InfraError::not_found("task", task_id))
}

pub fn list_tasks_impl(
    state: &AppState,
    tempo: Option<String>,
    movement_id: Option<String>,
    include_completed: Option<bool>,
    sort: Option<String>,
) -> Result<Vec<Task>, InfraError> {
    let tempo = match tempo.as_deref() {
        Some(value) => TempoFilter::parse(value)
            .ok_or_else(|| InfraError::Validation(format!("unknown tempo filter: {value}")))?,
        None => TempoFilter::All,
    };
    let sort_key = match sort.as_deref() {
        Some(value) => TaskSortKey::parse(value)
            .ok_or_else(|| InfraError::Validation(format!("unknown sort key: {value}")))?,
        None => TaskSortKey::default(),
    };
    let filter = TaskFilter {
        tempo,
        movement_id: non_empty(movement_id),
        include_completed: include_completed.unwrap_or(false),
    };
    state.tasks.list_sorted(&filter, sort_key)
}

pub fn update_task_impl(
    state: &AppState,
    task_id: String,
    request: UpdateTaskRequest,
) -> Result<Task, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    let movement_id = request.movement_id.map(|value| non_empty(Some(value)));
    if let Some(Some(movement_id)) = movement_id.as_ref() {
        ensure_movement_exists(state, movement_id)?;
    }

    let update = TaskUpdate {
        title: request.title,
        description: request.description.map(|value| non_empty(Some(value))),
        tempo_required: request.tempo.as_deref().map(parse_tempo).transpose()?,
        priority: request.priority,
        estimated_minutes: request.estimated_minutes,
        movement_id,
        completed: request.completed,
    };
    if update.is_empty() {
        return get_task_impl(state, task_id.to_string());
    }

    let task = state.tasks.update(task_id, update)?;
    state.log_info("update_task", &format!("updated task_id={task_id}"));
    Ok(task)
}

pub fn complete_task_impl(state: &AppState, task_id: String) -> Result<Task, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    let task = state.tasks.complete(task_id)?;
    state.log_info(
        "complete_task",
        &format!("completed task_id={task_id} energy_boost={}", task.energy_boost),
    );
    Ok(task)
}

pub fn delete_task_impl(state: &AppState, task_id: String) -> Result<bool, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    let deleted = state.tasks.delete(task_id)?;
    if deleted {
        state.log_info("delete_task", &format!("deleted task_id={task_id}"));
    }
    Ok(deleted)
}

pub fn gentlest_task_impl(state: &AppState) -> Result<Option<Task>, InfraError> {
    Ok(gentlest(&state.tasks.list()?))
}

/// Open tasks for the given tempo, or for the current tempo when omitted.
pub fn tasks_for_tempo_impl(state: &AppState, tempo: Option<String>) -> Result<Vec<Task>, InfraError> {
    let tempo = match tempo.as_deref() {
        Some(value) => parse_tempo(value)?,
        None => state.tempo.current()?,
    };
    Ok(tasks_for_tempo(&state.tasks.list()?, tempo))
}

pub fn create_movement_impl(
    state: &AppState,
    name: String,
    description: Option<String>,
    movement_type: Option<String>,
    color_theme: Option<String>,
) -> Result<Movement, InfraError> {
    let movement_type = match movement_type.as_deref() {
        Some(value) => parse_movement_type(value)?,
        None => MovementType::default(),
    };
    let mut new_movement = NewMovement::new(name, movement_type);
    new_movement.description = description;
    new_movement.color_theme = non_empty(color_theme).unwrap_or_else(|| DEFAULT_MOVEMENT_COLOR.to_string());

    let movement = state.movements.create(new_movement)?;
    state.log_info("create_movement", &format!("created movement_id={}", movement.id));
    Ok(movement)
}

pub fn list_movement_templates_impl(state: &AppState) -> Vec<MovementTemplate> {
    state.movements.templates().to_vec()
}

pub fn create_movement_from_template_impl(
    state: &AppState,
    template_name: String,
) -> Result<Movement, InfraError> {
    let template = MovementRepository::find_template(&template_name)
        .ok_or_else(|| InfraError::not_found("movement template", template_name.trim()))?;
    let movement = state.movements.create_from_template(template)?;
    state.log_info(
        "create_movement_from_template",
        &format!("created movement_id={} template={}", movement.id, template.name),
    );
    Ok(movement)
}

pub fn list_movements_impl(state: &AppState) -> Result<Vec<MovementWithProgress>, InfraError> {
    state.movements.progress_for_all()
}

pub fn update_movement_impl(
    state: &AppState,
    movement_id: String,
    request: UpdateMovementRequest,
) -> Result<Movement, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    let update = MovementUpdate {
        name: request.name,
        description: request.description.map(|value| non_empty(Some(value))),
        movement_type: request
            .movement_type
            .as_deref()
            .map(parse_movement_type)
            .transpose()?,
        color_theme: request.color_theme,
        template_category: None,
    };
    let movement = state.movements.update(movement_id, update)?;
    state.log_info("update_movement", &format!("updated movement_id={movement_id}"));
    Ok(movement)
}

pub fn delete_movement_impl(
    state: &AppState,
    movement_id: String,
) -> Result<DeleteMovementResponse, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    let unlinked_tasks = state.movements.delete(movement_id)?;
    state.log_info(
        "delete_movement",
        &format!("deleted movement_id={movement_id} unlinked_tasks={unlinked_tasks}"),
    );
    Ok(DeleteMovementResponse {
        movement_id: movement_id.to_string(),
        unlinked_tasks,
    })
}

pub fn movement_tasks_impl(state: &AppState, movement_id: String) -> Result<Vec<Task>, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    ensure_movement_exists(state, movement_id)?;
    state.movements.tasks_for(movement_id)
}

pub fn movement_progress_impl(
    state: &AppState,
    movement_id: String,
) -> Result<MovementProgress, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    state.movements.progress_for(movement_id)
}

pub fn complete_movement_impl(
    state: &AppState,
    movement_id: String,
) -> Result<CompleteAllReport, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    let report = state.movements.complete_all(movement_id)?;
    let message = format!(
        "completed movement_id={movement_id} completed={} failed={}",
        report.completed_count,
        report.failures.len()
    );
    if report.failures.is_empty() {
        state.log_info("complete_movement", &message);
    } else {
        state.log_error("complete_movement", &message);
    }
    Ok(report)
}

pub fn link_task_impl(
    state: &AppState,
    task_id: String,
    movement_id: String,
) -> Result<Task, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    let movement_id = required_id(&movement_id, "movement_id")?;
    let task = state.movements.link_task(task_id, movement_id)?;
    state.log_info("link_task", &format!("linked task_id={task_id} movement_id={movement_id}"));
    Ok(task)
}

pub fn unlink_task_impl(state: &AppState, task_id: String) -> Result<Task, InfraError> {
    let task_id = required_id(&task_id, "task_id")?;
    let task = state.movements.unlink_task(task_id)?;
    state.log_info("unlink_task", &format!("unlinked task_id={task_id}"));
    Ok(task)
}

pub fn add_ensemble_member_impl(
    state: &AppState,
    movement_id: String,
    member: String,
) -> Result<Movement, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    let movement = state.movements.add_member(movement_id, &member)?;
    state.log_info("add_ensemble_member", &format!("movement_id={movement_id} member added"));
    Ok(movement)
}

pub fn remove_ensemble_member_impl(
    state: &AppState,
    movement_id: String,
    member: String,
) -> Result<Movement, InfraError> {
    let movement_id = required_id(&movement_id, "movement_id")?;
    let movement = state.movements.remove_member(movement_id, &member)?;
    state.log_info("remove_ensemble_member", &format!("movement_id={movement_id} member removed"));
    Ok(movement)
}

pub fn capture_melody_impl(
    state: &AppState,
    content: String,
    is_voice: Option<bool>,
) -> Result<Melody, InfraError> {
    let melody = state.melodies.capture(&content, is_voice.unwrap_or(false))?;
    state.log_info("capture_melody", &format!("captured melody_id={}", melody.id));
    Ok(melody)
}

pub fn list_melodies_impl(state: &AppState, unprocessed_only: Option<bool>) -> Result<Vec<Melody>, InfraError> {
    if unprocessed_only.unwrap_or(false) {
        state.melodies.unprocessed()
    } else {
        state.melodies.list()
    }
}

pub fn process_melody_impl(
    state: &AppState,
    melody_id: String,
) -> Result<ProcessMelodyResponse, InfraError> {
    let melody_id = required_id(&melody_id, "melody_id")?;
    let suggestions = state.melodies.process(melody_id)?;
    state.log_info(
        "process_melody",
        &format!("processed melody_id={melody_id} suggestions={}", suggestions.len()),
    );
    Ok(ProcessMelodyResponse {
        melody_id: melody_id.to_string(),
        suggestions,
    })
}

pub fn convert_melody_impl(
    state: &AppState,
    melody_id: String,
    tempo: Option<String>,
    movement_id: Option<String>,
) -> Result<Vec<Task>, InfraError> {
    let melody_id = required_id(&melody_id, "melody_id")?;
    let tempo = match tempo.as_deref() {
        Some(value) => parse_tempo(value)?,
        None => state.tempo.current()?,
    };
    let movement_id = non_empty(movement_id);
    if let Some(movement_id) = movement_id.as_deref() {
        ensure_movement_exists(state, movement_id)?;
    }

    let tasks = state
        .melodies
        .convert_to_tasks(melody_id, tempo, movement_id.as_deref())?;
    state.log_info(
        "convert_melody",
        &format!("converted melody_id={melody_id} tasks={}", tasks.len()),
    );
    Ok(tasks)
}

pub fn clear_processed_melodies_impl(state: &AppState) -> Result<usize, InfraError> {
    let removed = state.melodies.clear_processed()?;
    state.log_info("clear_processed_melodies", &format!("removed={removed}"));
    Ok(removed)
}

pub fn get_tempo_impl(state: &AppState) -> Result<TempoStateResponse, InfraError> {
    Ok(TempoStateResponse {
        current: state.tempo.current()?,
        suggested: state.tempo.suggest()?,
        should_check_in: state.tempo.should_prompt_check()?,
    })
}

pub fn set_tempo_impl(
    state: &AppState,
    tempo: String,
    context: Option<String>,
) -> Result<Tempo, InfraError> {
    let tempo = parse_tempo(&tempo)?;
    let tempo = state
        .tempo
        .set(tempo, context.as_deref().unwrap_or_default())?;
    state.log_info("set_tempo", &format!("tempo={}", tempo.as_str()));
    Ok(tempo)
}

pub fn tempo_history_impl(state: &AppState) -> Result<Vec<TempoHistoryEntry>, InfraError> {
    state.tempo.history()
}

pub fn tempo_for_energy_impl(level: u8) -> Result<Tempo, InfraError> {
    if !(1..=MAX_ENERGY_LEVEL).contains(&level) {
        return Err(InfraError::Validation(format!(
            "energy level must be between 1 and {MAX_ENERGY_LEVEL}"
        )));
    }
    Ok(TempoService::tempo_for_energy(level))
}

pub fn daily_composition_impl(
    state: &AppState,
    date: Option<String>,
) -> Result<DailyCompositionResponse, InfraError> {
    let today = state.today();
    let date = match date.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|error| {
            InfraError::Validation(format!("invalid date '{value}': {error}"))
        })?,
        None => today,
    };
    let tasks = state.tasks.list()?;
    Ok(DailyCompositionResponse {
        composition: daily_composition(&tasks, date, state.settings.timezone),
        rhythm_streak: rhythm_streak(&tasks, today, state.settings.timezone),
    })
}

pub fn export_data_impl(state: &AppState) -> StoreSnapshot {
    state.store.export_snapshot()
}

pub fn import_data_impl(
    state: &AppState,
    snapshot: StoreSnapshot,
) -> Result<ImportDataResponse, InfraError> {
    for task in &snapshot.tasks {
        task.validate().map_err(InfraError::Validation)?;
    }
    for movement in &snapshot.movements {
        movement.validate().map_err(InfraError::Validation)?;
    }
    for melody in &snapshot.melodies {
        melody.validate().map_err(InfraError::Validation)?;
    }

    state.store.import_snapshot(&snapshot, Utc::now())?;
    reload_all(state)?;
    let repaired = state.movements.repair_dangling_references()?;

    state.log_info(
        "import_data",
        &format!(
            "imported tasks={} movements={} melodies={} repaired={repaired}",
            snapshot.tasks.len(),
            snapshot.movements.len(),
            snapshot.melodies.len()
        ),
    );
    Ok(ImportDataResponse {
        tasks: snapshot.tasks.len(),
        movements: snapshot.movements.len(),
        melodies: snapshot.melodies.len(),
    })
}

pub fn clear_data_impl(state: &AppState) -> Result<(), InfraError> {
    state.store.clear_all()?;
    reload_all(state)?;
    state.log_info("clear_data", "cleared all local data");
    Ok(())
}

pub async fn sync_status_impl(state: &AppState) -> SyncStatus {
    match state.sync.as_ref() {
        Some(sync) => sync.status().await,
        None => SyncStatus {
            state: ConnectionState::Offline,
            message: Some("remote sync is not configured".to_string()),
            last_sync: state.store.last_sync(),
            last_error: None,
        },
    }
}

/// Pushes everything changed since the last sync plus any change still
/// queued from earlier attempts, then pulls and merges.
pub async fn sync_now_impl(state: &AppState) -> Result<SyncNowResponse, InfraError> {
    let Some(sync) = state.sync.as_ref() else {
        return Err(InfraError::InvalidConfig(
            "remote sync is not configured".to_string(),
        ));
    };
    let user_id = state
        .remote_config
        .user_id
        .as_deref()
        .ok_or_else(|| InfraError::InvalidConfig("sync userId is not configured".to_string()))?;

    let collected_at = Utc::now();
    let batch = collect_changes(state, user_id, state.store.last_sync())?;
    let push = sync.push_and_settle(&batch, collected_at).await?;
    let pull = sync.pull_and_merge(user_id).await?;

    let message = format!(
        "pushed={} push_errors={} tasks_added={} tasks_updated={}",
        push.processed,
        push.errors.len(),
        pull.tasks.added,
        pull.tasks.updated
    );
    if push.success {
        state.log_info("sync_now", &message);
    } else {
        state.log_error("sync_now", &message);
    }
    Ok(SyncNowResponse { push, pull })
}

/// Builds the push batch: movements, then tasks, then queued deletes. A
/// record with a queued change keeps that change's kind.
fn collect_changes(
    state: &AppState,
    user_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ChangeOp>, InfraError> {
    let queued = state.store.pending_sync();
    let queued_kind = |table: RemoteTable, id: &str| {
        queued
            .iter()
            .find(|entry| entry.table == table && entry.id == id)
            .map(|entry| entry.kind)
    };

    let mut batch = Vec::new();
    for movement in state.movements.list()? {
        let kind = queued_kind(RemoteTable::Movements, &movement.id)
            .or_else(|| change_kind(movement.created_at, movement.updated_at, since));
        if let Some(kind) = kind {
            let payload = with_user_id(&movement, user_id)?;
            batch.extend(change_op(kind, RemoteTable::Movements, &movement.id, payload));
        }
    }
    for task in state.tasks.list()? {
        let kind = queued_kind(RemoteTable::Tasks, &task.id)
            .or_else(|| change_kind(task.created_at, task.updated_at, since));
        if let Some(kind) = kind {
            let payload = with_user_id(&task, user_id)?;
            batch.extend(change_op(kind, RemoteTable::Tasks, &task.id, payload));
        }
    }
    batch.extend(
        queued
            .iter()
            .filter(|entry| entry.kind == ChangeKind::Delete)
            .map(|entry| ChangeOp::delete(entry.table, entry.id.clone())),
    );
    Ok(batch)
}

fn change_kind(
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    since: Option<DateTime<Utc>>,
) -> Option<ChangeKind> {
    match since {
        None => Some(ChangeKind::Create),
        Some(since) if created_at > since => Some(ChangeKind::Create),
        Some(since) if updated_at > since => Some(ChangeKind::Update),
        Some(_) => None,
    }
}

/// Existing records never turn into deletes here.
fn change_op(
    kind: ChangeKind,
    table: RemoteTable,
    id: &str,
    payload: serde_json::Value,
) -> Option<ChangeOp> {
    match kind {
        ChangeKind::Create => Some(ChangeOp::create(table, payload)),
        ChangeKind::Update => Some(ChangeOp::update(table, id, payload)),
        ChangeKind::Delete => None,
    }
}

fn reload_all(state: &AppState) -> Result<(), InfraError> {
    state.tasks.reload()?;
    state.movements.reload()?;
    state.melodies.reload()?;
    state.tempo.reload()
}

fn ensure_movement_exists(state: &AppState, movement_id: &str) -> Result<(), InfraError> {
    if state.movements.get(movement_id)?.is_none() {
        return Err(InfraError::not_found("movement", movement_id));
    }
    Ok(())
}

fn required_id<'a>(value: &'a str, field_name: &str) -> Result<&'a str, InfraError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InfraError::Validation(format!("{field_name} must not be empty")));
    }
    Ok(value)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_tempo(value: &str) -> Result<Tempo, InfraError> {
    Tempo::parse(value).ok_or_else(|| InfraError::Validation(format!("unknown tempo: {value}")))
}

fn parse_movement_type(value: &str) -> Result<MovementType, InfraError> {
    MovementType::parse(value)
        .ok_or_else(|| InfraError::Validation(format!("unknown movement type: {value}")))
}
