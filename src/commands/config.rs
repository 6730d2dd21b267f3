//! Tauri commands for the config manager surface (SPEC_FULL.md §4.I, §6).

use tauri::State;

use crate::config::{ConfigOverview, OrchestratorConfig};
use crate::db::models::ConfigVersion;

use super::AppState;

#[tauri::command]
pub fn get_config_overview(state: State<'_, AppState>) -> Result<ConfigOverview, String> {
    state.config.load_overview().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn save_config_from_form(state: State<'_, AppState>, config: OrchestratorConfig) -> Result<ConfigOverview, String> {
    state.config.save_from_form(config, "gui").map_err(|e| e.to_string())?;
    state.config.load_overview().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn save_config_from_yaml(state: State<'_, AppState>, yaml: String) -> Result<ConfigOverview, String> {
    state.config.save_from_yaml(&yaml, "gui").map_err(|e| e.to_string())?;
    state.config.load_overview().map_err(|e| e.to_string())
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateYamlResponse {
    pub valid: bool,
    pub normalized_yaml: String,
}

#[tauri::command]
pub fn validate_config_yaml(state: State<'_, AppState>, yaml: String) -> Result<ValidateYamlResponse, String> {
    let normalized_yaml = state.config.validate_yaml(&yaml).map_err(|e| e.to_string())?;
    Ok(ValidateYamlResponse { valid: true, normalized_yaml })
}

#[tauri::command]
pub fn list_config_versions(state: State<'_, AppState>) -> Result<Vec<ConfigVersion>, String> {
    state.config.list_versions().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_config_version(state: State<'_, AppState>, version: i64) -> Result<ConfigVersion, String> {
    state.config.get_version(version).map_err(|e| e.to_string())
}
