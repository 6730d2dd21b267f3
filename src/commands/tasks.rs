//! Tauri commands for the task lifecycle surface (SPEC_FULL.md §6). Thin
//! wrappers over `engine::Coordinator`: each handler takes the shared
//! `AppState`, delegates, and maps the coordinator's typed error to the
//! `Result<T, String>` shape Tauri's invoke bridge expects.

use tauri::State;

use crate::db::models::{CommandRun, Event, Task, TaskItem, TaskSummary};
use crate::engine::coordinator::{CreateTaskOptions, CreateTaskRequest, LogChunkRecord};

use super::AppState;

fn summarize(state: &AppState, task: Task) -> Result<TaskSummary, String> {
    let items = state.coordinator.get_task_details(&task.id).map_err(|e| e.to_string())?.items;
    Ok(TaskSummary { task, items })
}

#[tauri::command]
pub async fn bootstrap(state: State<'_, AppState>) -> Result<serde_json::Value, String> {
    let resumed_task_id = state.coordinator.bootstrap().await.map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "resumedTaskId": resumed_task_id }))
}

#[tauri::command]
pub fn list_tasks(state: State<'_, AppState>) -> Result<Vec<Task>, String> {
    state.coordinator.list_tasks().map_err(|e| e.to_string())
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailsResponse {
    pub task: Task,
    pub items: Vec<TaskItem>,
    pub runs: Vec<CommandRun>,
    pub events: Vec<Event>,
}

#[tauri::command]
pub fn get_task_details(state: State<'_, AppState>, task_id: String) -> Result<TaskDetailsResponse, String> {
    let details = state.coordinator.get_task_details(&task_id).map_err(|e| e.to_string())?;
    Ok(TaskDetailsResponse { task: details.task, items: details.items, runs: details.runs, events: details.events })
}

#[tauri::command]
pub fn create_task(state: State<'_, AppState>, request: CreateTaskRequest) -> Result<TaskSummary, String> {
    let task = state.coordinator.create_task(request).map_err(|e| e.to_string())?;
    summarize(&state, task)
}

#[tauri::command]
pub async fn start_task(state: State<'_, AppState>, task_id: String) -> Result<TaskSummary, String> {
    let task = state.coordinator.start_task(&task_id).await.map_err(|e| e.to_string())?;
    summarize(&state, task)
}

#[tauri::command]
pub fn pause_task(state: State<'_, AppState>, task_id: String) -> Result<TaskSummary, String> {
    let task = state.coordinator.pause_task(&task_id).map_err(|e| e.to_string())?;
    summarize(&state, task)
}

#[tauri::command]
pub async fn resume_task(state: State<'_, AppState>, task_id: String) -> Result<TaskSummary, String> {
    let task = state.coordinator.resume_task(&task_id).await.map_err(|e| e.to_string())?;
    summarize(&state, task)
}

#[tauri::command]
pub fn retry_task_item(state: State<'_, AppState>, task_item_id: String) -> Result<TaskSummary, String> {
    let task = state.coordinator.retry_task_item(&task_item_id).map_err(|e| e.to_string())?;
    summarize(&state, task)
}

#[tauri::command]
pub async fn delete_task(state: State<'_, AppState>, task_id: String) -> Result<serde_json::Value, String> {
    state.coordinator.delete_task(&task_id).await.map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "deleted": true }))
}

#[tauri::command]
pub fn stream_task_logs(state: State<'_, AppState>, task_id: String, limit: u32) -> Result<Vec<LogChunkRecord>, String> {
    state.coordinator.stream_task_logs(&task_id, limit).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_create_task_options(state: State<'_, AppState>) -> Result<CreateTaskOptions, String> {
    state.coordinator.get_create_task_options().map_err(|e| e.to_string())
}
