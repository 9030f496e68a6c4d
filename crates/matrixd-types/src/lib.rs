use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

pub mod client;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5000";

pub const API_HEALTH: &str = "/api/health";
pub const API_STATUS: &str = "/api/status";
pub const API_PROJECTS: &str = "/api/projects";
pub const API_STOP: &str = "/api/stop";
pub const API_DEFAULT_PROJECT: &str = "/api/default-project";

pub const ACTION_START: &str = "start";
pub const ACTION_STOP: &str = "stop";
pub const ACTION_RESTART: &str = "restart";
pub const ACTION_CONFIG: &str = "config";

/// Validated configuration values of one project, keyed by config key.
pub type ConfigValues = BTreeMap<String, Value>;

pub fn project_route(name: &str, action: &str) -> String {
    format!("{API_PROJECTS}/{name}/{action}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ApiResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            kind: None,
        }
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
            kind: Some(kind.into()),
        }
    }
}

/// Phase of the single hardware-ownership slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Idle,
    Starting,
    Running,
    Stopping,
    Restarting,
}

impl SlotPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotPhase::Idle => "idle",
            SlotPhase::Starting => "starting",
            SlotPhase::Running => "running",
            SlotPhase::Stopping => "stopping",
            SlotPhase::Restarting => "restarting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub handle_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub active_project: Option<String>,
    pub state: SlotPhase,
    pub default_project: Option<String>,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
}

/// Declared type and allowed range of one configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSpec {
    Boolean,
    Integer { min: i64, max: i64 },
    Choice { values: Vec<String> },
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigKeyInfo {
    pub name: String,
    #[serde(flatten)]
    pub spec: ValueSpec,
    pub default: Value,
    pub hot_applicable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub display_name: String,
    pub active: bool,
    pub keys: Vec<ConfigKeyInfo>,
    pub config: ConfigValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListResult {
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfigResult {
    pub project: String,
    pub config: ConfigValues,
}

/// How a configuration update reached the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Project not active; takes effect on next start.
    Persisted,
    /// Active, but no value differed from what the process was launched with.
    Unchanged,
    HotApplied,
    Restarted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigResult {
    pub project: String,
    pub config: ConfigValues,
    pub applied: ApplyMode,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub message: String,
    pub status: StatusResult,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultProjectParams {
    pub project: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultProjectResult {
    pub default_project: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub daemon: String,
    pub version: String,
}

pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("matrixd");
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".matrixd");
    }

    PathBuf::from(".matrixd")
}

pub fn default_state_path() -> PathBuf {
    default_data_dir().join("matrix_config.json")
}

pub fn default_logs_dir() -> PathBuf {
    default_data_dir().join("logs")
}
