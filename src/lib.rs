pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::{bootstrap_workspace, init_tracing};
use application::commands::{
    add_ensemble_member_impl, capture_melody_impl, clear_data_impl,
    clear_processed_melodies_impl, complete_movement_impl, complete_task_impl,
    convert_melody_impl, create_movement_from_template_impl, create_movement_impl,
    create_task_impl, daily_composition_impl, delete_movement_impl, delete_task_impl,
    export_data_impl, gentlest_task_impl, get_task_impl, get_tempo_impl, import_data_impl,
    link_task_impl, list_melodies_impl, list_movement_templates_impl, list_movements_impl,
    list_tasks_impl, movement_progress_impl, movement_tasks_impl, process_melody_impl,
    remove_ensemble_member_impl, set_tempo_impl, sync_now_impl, sync_status_impl,
    tasks_for_tempo_impl, tempo_for_energy_impl, tempo_history_impl, unlink_task_impl,
    update_movement_impl, update_task_impl,
};
use application::movement_repository::CompleteAllReport;
use application::sync::SyncStatus;
use domain::models::{Melody, Movement, MovementTemplate, Task, Tempo, TempoHistoryEntry};
use domain::progress::{MovementProgress, MovementWithProgress};
use infrastructure::storage::StoreSnapshot;
use serde::Serialize;
use std::path::PathBuf;

pub use application::commands::{
    AppState, DailyCompositionResponse, DeleteMovementResponse, ImportDataResponse,
    ProcessMelodyResponse, SyncNowResponse, TempoStateResponse, UpdateMovementRequest,
    UpdateTaskRequest,
};

#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub workspace_root: String,
    pub database_path: String,
}

fn resolve_root(root: Option<String>) -> Result<PathBuf, String> {
    match root {
        Some(path) => Ok(PathBuf::from(path)),
        None => std::env::current_dir().map_err(|error| error.to_string()),
    }
}

pub fn bootstrap(root: Option<String>) -> Result<BootstrapResponse, String> {
    let workspace_root = resolve_root(root)?;
    let result = bootstrap_workspace(&workspace_root).map_err(|error| error.to_string())?;
    Ok(BootstrapResponse {
        workspace_root: result.workspace_root.display().to_string(),
        database_path: result.database_path.display().to_string(),
    })
}

pub fn ping() -> &'static str {
    "pong"
}

/// Installs logging and opens the workspace at `root`, or the current
/// directory when omitted.
pub fn open(root: Option<String>) -> Result<AppState, String> {
    init_tracing();
    let workspace_root = resolve_root(root)?;
    AppState::new(workspace_root).map_err(|error| error.to_string())
}

pub fn create_task(
    state: &AppState,
    title: String,
    description: Option<String>,
    tempo: String,
    priority: Option<u8>,
    estimated_minutes: Option<u32>,
    movement_id: Option<String>,
) -> Result<Task, String> {
    create_task_impl(
        state,
        title,
        description,
        tempo,
        priority,
        estimated_minutes,
        movement_id,
    )
    .map_err(|error| state.command_error("create_task", &error))
}

pub fn get_task(state: &AppState, task_id: String) -> Result<Task, String> {
    get_task_impl(state, task_id).map_err(|error| state.command_error("get_task", &error))
}

pub fn list_tasks(
    state: &AppState,
    tempo: Option<String>,
    movement_id: Option<String>,
    include_completed: Option<bool>,
    sort: Option<String>,
) -> Result<Vec<Task>, String> {
    list_tasks_impl(state, tempo, movement_id, include_completed, sort)
        .map_err(|error| state.command_error("list_tasks", &error))
}

pub fn update_task(
    state: &AppState,
    task_id: String,
    request: UpdateTaskRequest,
) -> Result<Task, String> {
    update_task_impl(state, task_id, request)
        .map_err(|error| state.command_error("update_task", &error))
}

pub fn complete_task(state: &AppState, task_id: String) -> Result<Task, String> {
    complete_task_impl(state, task_id).map_err(|error| state.command_error("complete_task", &error))
}

pub fn delete_task(state: &AppState, task_id: String) -> Result<bool, String> {
    delete_task_impl(state, task_id).map_err(|error| state.command_error("delete_task", &error))
}

pub fn gentlest_task(state: &AppState) -> Result<Option<Task>, String> {
    gentlest_task_impl(state).map_err(|error| state.command_error("gentlest_task", &error))
}

pub fn tasks_for_tempo(state: &AppState, tempo: Option<String>) -> Result<Vec<Task>, String> {
    tasks_for_tempo_impl(state, tempo)
        .map_err(|error| state.command_error("tasks_for_tempo", &error))
}

pub fn create_movement(
    state: &AppState,
    name: String,
    description: Option<String>,
    movement_type: Option<String>,
    color_theme: Option<String>,
) -> Result<Movement, String> {
    create_movement_impl(state, name, description, movement_type, color_theme)
        .map_err(|error| state.command_error("create_movement", &error))
}

pub fn list_movement_templates(state: &AppState) -> Vec<MovementTemplate> {
    list_movement_templates_impl(state)
}

pub fn create_movement_from_template(
    state: &AppState,
    template_name: String,
) -> Result<Movement, String> {
    create_movement_from_template_impl(state, template_name)
        .map_err(|error| state.command_error("create_movement_from_template", &error))
}

pub fn list_movements(state: &AppState) -> Result<Vec<MovementWithProgress>, String> {
    list_movements_impl(state).map_err(|error| state.command_error("list_movements", &error))
}

pub fn update_movement(
    state: &AppState,
    movement_id: String,
    request: UpdateMovementRequest,
) -> Result<Movement, String> {
    update_movement_impl(state, movement_id, request)
        .map_err(|error| state.command_error("update_movement", &error))
}

pub fn delete_movement(
    state: &AppState,
    movement_id: String,
) -> Result<DeleteMovementResponse, String> {
    delete_movement_impl(state, movement_id)
        .map_err(|error| state.command_error("delete_movement", &error))
}

pub fn movement_tasks(state: &AppState, movement_id: String) -> Result<Vec<Task>, String> {
    movement_tasks_impl(state, movement_id)
        .map_err(|error| state.command_error("movement_tasks", &error))
}

pub fn movement_progress(state: &AppState, movement_id: String) -> Result<MovementProgress, String> {
    movement_progress_impl(state, movement_id)
        .map_err(|error| state.command_error("movement_progress", &error))
}

pub fn complete_movement(
    state: &AppState,
    movement_id: String,
) -> Result<CompleteAllReport, String> {
    complete_movement_impl(state, movement_id)
        .map_err(|error| state.command_error("complete_movement", &error))
}

pub fn link_task(state: &AppState, task_id: String, movement_id: String) -> Result<Task, String> {
    link_task_impl(state, task_id, movement_id)
        .map_err(|error| state.command_error("link_task", &error))
}

pub fn unlink_task(state: &AppState, task_id: String) -> Result<Task, String> {
    unlink_task_impl(state, task_id).map_err(|error| state.command_error("unlink_task", &error))
}

pub fn add_ensemble_member(
    state: &AppState,
    movement_id: String,
    member: String,
) -> Result<Movement, String> {
    add_ensemble_member_impl(state, movement_id, member)
        .map_err(|error| state.command_error("add_ensemble_member", &error))
}

pub fn remove_ensemble_member(
    state: &AppState,
    movement_id: String,
    member: String,
) -> Result<Movement, String> {
    remove_ensemble_member_impl(state, movement_id, member)
        .map_err(|error| state.command_error("remove_ensemble_member", &error))
}

pub fn capture_melody(
    state: &AppState,
    content: String,
    is_voice: Option<bool>,
) -> Result<Melody, String> {
    capture_melody_impl(state, content, is_voice)
        .map_err(|error| state.command_error("capture_melody", &error))
}

pub fn list_melodies(state: &AppState, unprocessed_only: Option<bool>) -> Result<Vec<Melody>, String> {
    list_melodies_impl(state, unprocessed_only)
        .map_err(|error| state.command_error("list_melodies", &error))
}

pub fn process_melody(state: &AppState, melody_id: String) -> Result<ProcessMelodyResponse, String> {
    process_melody_impl(state, melody_id)
        .map_err(|error| state.command_error("process_melody", &error))
}

pub fn convert_melody(
    state: &AppState,
    melody_id: String,
    tempo: Option<String>,
    movement_id: Option<String>,
) -> Result<Vec<Task>, String> {
    convert_melody_impl(state, melody_id, tempo, movement_id)
        .map_err(|error| state.command_error("convert_melody", &error))
}

pub fn clear_processed_melodies(state: &AppState) -> Result<usize, String> {
    clear_processed_melodies_impl(state)
        .map_err(|error| state.command_error("clear_processed_melodies", &error))
}

pub fn get_tempo(state: &AppState) -> Result<TempoStateResponse, String> {
    get_tempo_impl(state).map_err(|error| state.command_error("get_tempo", &error))
}

pub fn set_tempo(state: &AppState, tempo: String, context: Option<String>) -> Result<Tempo, String> {
    set_tempo_impl(state, tempo, context).map_err(|error| state.command_error("set_tempo", &error))
}

pub fn tempo_history(state: &AppState) -> Result<Vec<TempoHistoryEntry>, String> {
    tempo_history_impl(state).map_err(|error| state.command_error("tempo_history", &error))
}

pub fn tempo_for_energy(state: &AppState, level: u8) -> Result<Tempo, String> {
    tempo_for_energy_impl(level).map_err(|error| state.command_error("tempo_for_energy", &error))
}

pub fn daily_composition(
    state: &AppState,
    date: Option<String>,
) -> Result<DailyCompositionResponse, String> {
    daily_composition_impl(state, date)
        .map_err(|error| state.command_error("daily_composition", &error))
}

pub fn export_data(state: &AppState) -> StoreSnapshot {
    export_data_impl(state)
}

pub fn import_data(state: &AppState, snapshot: StoreSnapshot) -> Result<ImportDataResponse, String> {
    import_data_impl(state, snapshot).map_err(|error| state.command_error("import_data", &error))
}

pub fn clear_data(state: &AppState) -> Result<(), String> {
    clear_data_impl(state).map_err(|error| state.command_error("clear_data", &error))
}

pub async fn sync_status(state: &AppState) -> SyncStatus {
    sync_status_impl(state).await
}

pub async fn sync_now(state: &AppState) -> Result<SyncNowResponse, String> {
    sync_now_impl(state)
        .await
        .map_err(|error| state.command_error("sync_now", &error))
}
