use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{ConfigVersion, Database};

/// Errors raised while loading, validating, or persisting the orchestrator
/// config document (SPEC_FULL.md §4.I, §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("referential integrity error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] crate::db::DbError),

    #[error("lock poisoned")]
    Lock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_arg")]
    pub shell_arg: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { shell: default_shell(), shell_arg: default_shell_arg() }
    }
}

fn default_shell() -> String {
    if cfg!(windows) { "cmd.exe".to_string() } else { "/bin/bash".to_string() }
}

fn default_shell_arg() -> String {
    if cfg!(windows) { "/C".to_string() } else { "-lc".to_string() }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResumeConfig {
    #[serde(default)]
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub workflow: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root_path: String,
    #[serde(default)]
    pub qa_targets: Vec<String>,
    pub ticket_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentTemplates {
    pub init_once: Option<String>,
    pub qa: Option<String>,
    pub fix: Option<String>,
    pub retest: Option<String>,
    pub loop_guard: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub templates: AgentTemplates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGroupConfig {
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    InitOnce,
    Qa,
    TicketScan,
    Fix,
    Retest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrehookConfig {
    pub engine: String,
    pub when: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub agent_group_id: Option<String>,
    pub prehook: Option<PrehookConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Once,
    Infinite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub stop_when_no_unresolved: bool,
    pub max_cycles: Option<u32>,
    pub agent_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub mode: LoopMode,
    pub guard: LoopGuardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRuleConfig {
    pub id: String,
    pub engine: String,
    pub when: String,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinalizeConfig {
    #[serde(default)]
    pub rules: Vec<FinalizeRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub steps: Vec<StepConfig>,
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    #[serde(default)]
    pub finalize: Option<FinalizeConfig>,
}

/// The full orchestrator config document (SPEC_FULL.md §4.I). One struct per
/// nesting level, mirroring the document shape 1:1 so `serde_yaml` round
/// trips without custom (de)serialization logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub resume: ResumeConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub workspaces: HashMap<String, WorkspaceConfig>,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub agent_groups: HashMap<String, AgentGroupConfig>,
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowConfig>,
}

/// Snapshot returned by `load_overview`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOverview {
    pub config: OrchestratorConfig,
    pub yaml: String,
    pub version: i64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    config: OrchestratorConfig,
    yaml: String,
}

/// Holds the canonical config behind an `RwLock` so readers (the runner
/// snapshotting config at task creation, `load_overview`) never block on
/// each other, only on the rarer write path (SPEC_FULL.md §4.I, §5).
pub struct ConfigManager {
    path: PathBuf,
    db: Database,
    inner: RwLock<Inner>,
}

impl ConfigManager {
    /// Load `path` if it exists, otherwise start from a default (empty)
    /// config and persist it on first save.
    pub fn load(path: PathBuf, db: Database) -> Result<Self, ConfigError> {
        let (config, yaml) = if path.exists() {
            let yaml = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
            let config: OrchestratorConfig = serde_yaml::from_str(&yaml)?;
            (config, yaml)
        } else {
            let config = OrchestratorConfig::default();
            let yaml = serde_yaml::to_string(&config)?;
            (config, yaml)
        };

        Ok(Self { path, db, inner: RwLock::new(Inner { config, yaml }) })
    }

    pub fn load_overview(&self) -> Result<ConfigOverview, ConfigError> {
        let inner = self.inner.read().map_err(|_| ConfigError::Lock)?;
        let latest = self.db.list_config_versions()?;
        let (version, updated_at) = latest
            .first()
            .map(|v| (v.version, v.created_at))
            .unwrap_or((0, chrono::Utc::now()));
        Ok(ConfigOverview { config: inner.config.clone(), yaml: inner.yaml.clone(), version, updated_at })
    }

    pub fn current(&self) -> Result<OrchestratorConfig, ConfigError> {
        Ok(self.inner.read().map_err(|_| ConfigError::Lock)?.config.clone())
    }

    pub fn save_from_form(&self, config: OrchestratorConfig, author: &str) -> Result<ConfigVersion, ConfigError> {
        let normalized = normalize_and_validate(config)?;
        let yaml = serde_yaml::to_string(&normalized)?;
        self.persist(normalized, yaml, author)
    }

    pub fn save_from_yaml(&self, yaml: &str, author: &str) -> Result<ConfigVersion, ConfigError> {
        let config: OrchestratorConfig = serde_yaml::from_str(yaml)?;
        let normalized = normalize_and_validate(config)?;
        let rendered = serde_yaml::to_string(&normalized)?;
        self.persist(normalized, rendered, author)
    }

    /// Validate without persisting; returns the normalized YAML a caller
    /// could go on to submit via `save_from_yaml`.
    pub fn validate_yaml(&self, yaml: &str) -> Result<String, ConfigError> {
        let config: OrchestratorConfig = serde_yaml::from_str(yaml)?;
        let normalized = normalize_and_validate(config)?;
        Ok(serde_yaml::to_string(&normalized)?)
    }

    pub fn list_versions(&self) -> Result<Vec<ConfigVersion>, ConfigError> {
        Ok(self.db.list_config_versions()?)
    }

    pub fn get_version(&self, version: i64) -> Result<ConfigVersion, ConfigError> {
        Ok(self.db.get_config_version(version)?)
    }

    fn persist(&self, config: OrchestratorConfig, yaml: String, author: &str) -> Result<ConfigVersion, ConfigError> {
        let mut inner = self.inner.write().map_err(|_| ConfigError::Lock)?;

        write_atomic(&self.path, &yaml)?;
        let version = self.db.save_config_version(&yaml, author)?;

        inner.config = config;
        inner.yaml = yaml;

        Ok(version)
    }
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file,
/// then rename over the target, so a crash mid-write never leaves a
/// truncated config file behind.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents).map_err(|e| ConfigError::Io(tmp_path.clone(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    Ok(())
}

/// Single validator both save paths funnel through (SPEC_FULL.md §4.I):
/// every `agent_group_id` referenced by a workflow step or loop guard must
/// exist, every agent id referenced by an agent group must exist, and the
/// configured defaults must resolve to a real workspace/workflow.
fn normalize_and_validate(config: OrchestratorConfig) -> Result<OrchestratorConfig, ConfigError> {
    for (workflow_id, workflow) in &config.workflows {
        for step in &workflow.steps {
            if let Some(group_id) = &step.agent_group_id {
                if !config.agent_groups.contains_key(group_id) {
                    return Err(ConfigError::Validation(format!(
                        "workflow '{workflow_id}' step '{}' references unknown agent_group_id '{group_id}'",
                        step.id
                    )));
                }
            }
        }
        if let Some(group_id) = &workflow.loop_.guard.agent_group_id {
            if !config.agent_groups.contains_key(group_id) {
                return Err(ConfigError::Validation(format!(
                    "workflow '{workflow_id}' loop guard references unknown agent_group_id '{group_id}'"
                )));
            }
        }
    }

    for (group_id, group) in &config.agent_groups {
        for agent_id in &group.agents {
            if !config.agents.contains_key(agent_id) {
                return Err(ConfigError::Validation(format!(
                    "agent_group '{group_id}' references unknown agent id '{agent_id}'"
                )));
            }
        }
    }

    if !config.defaults.workspace.is_empty() && !config.workspaces.contains_key(&config.defaults.workspace) {
        return Err(ConfigError::Validation(format!(
            "defaults.workspace '{}' does not resolve to a configured workspace",
            config.defaults.workspace
        )));
    }

    if !config.defaults.workflow.is_empty() && !config.workflows.contains_key(&config.defaults.workflow) {
        return Err(ConfigError::Validation(format!(
            "defaults.workflow '{}' does not resolve to a configured workflow",
            config.defaults.workflow
        )));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
defaults:
  workspace: ws1
  workflow: wf1
workspaces:
  ws1:
    root_path: /tmp/ws1
    qa_targets: ["qa"]
    ticket_dir: tickets
agents:
  agent1:
    templates:
      qa: "run qa on {{qa_file}}"
agent_groups:
  group1:
    agents: ["agent1"]
workflows:
  wf1:
    steps:
      - id: qa_step
        type: qa
        enabled: true
        agent_group_id: group1
    loop:
      mode: once
      guard:
        enabled: false
        stop_when_no_unresolved: true
"#
    }

    #[test]
    fn load_creates_default_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();

        let manager = ConfigManager::load(path, db).unwrap();
        let overview = manager.load_overview().unwrap();
        assert!(overview.config.workspaces.is_empty());
    }

    #[test]
    fn save_from_yaml_validates_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();
        let manager = ConfigManager::load(path.clone(), db).unwrap();

        let version = manager.save_from_yaml(sample_yaml(), "tester").unwrap();
        assert_eq!(version.version, 1);
        assert!(path.exists());

        let current = manager.current().unwrap();
        assert_eq!(current.defaults.workspace, "ws1");
    }

    #[test]
    fn save_rejects_unknown_agent_group_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();
        let manager = ConfigManager::load(path, db).unwrap();

        let bad_yaml = r#"
workflows:
  wf1:
    steps:
      - id: qa_step
        type: qa
        enabled: true
        agent_group_id: missing_group
    loop:
      mode: once
      guard:
        enabled: false
        stop_when_no_unresolved: true
"#;
        let err = manager.save_from_yaml(bad_yaml, "tester").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn save_rejects_unresolvable_default_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();
        let manager = ConfigManager::load(path, db).unwrap();

        let bad_yaml = r#"
defaults:
  workspace: does_not_exist
  workflow: ""
"#;
        let err = manager.save_from_yaml(bad_yaml, "tester").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn validate_yaml_does_not_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();
        let manager = ConfigManager::load(path.clone(), db).unwrap();

        manager.validate_yaml(sample_yaml()).unwrap();
        assert!(!path.exists());
        assert!(manager.list_versions().unwrap().is_empty());
    }

    #[test]
    fn list_and_get_versions_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let db = Database::open_in_memory().unwrap();
        let manager = ConfigManager::load(path, db).unwrap();

        manager.save_from_yaml(sample_yaml(), "tester").unwrap();
        let versions = manager.list_versions().unwrap();
        assert_eq!(versions.len(), 1);

        let fetched = manager.get_version(1).unwrap();
        assert_eq!(fetched.author, "tester");
    }
}
