use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("project '{project}' does not recognize config key '{key}'")]
    InvalidConfigKey { project: String, key: String },

    #[error("invalid value {value} for '{project}.{key}': {reason}")]
    InvalidConfigValue {
        project: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to launch '{project}' ({executable}): {reason}")]
    Launch {
        project: String,
        executable: String,
        reason: String,
    },

    #[error("failed to persist configuration to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration store {} is corrupt: {source}", path.display())]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("project '{project}' cannot hot-apply changes: {reason}")]
    HotApplyUnsupported { project: String, reason: String },
}

impl SupervisorError {
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::UnknownProject(_) => "unknown_project",
            SupervisorError::InvalidConfigKey { .. } => "invalid_config_key",
            SupervisorError::InvalidConfigValue { .. } => "invalid_config_value",
            SupervisorError::Launch { .. } => "launch_error",
            SupervisorError::Persistence { .. } => "persistence_error",
            SupervisorError::CorruptStore { .. } => "corrupt_store",
            SupervisorError::HotApplyUnsupported { .. } => "hot_apply_unsupported",
        }
    }

    pub fn http_status(&self) -> &'static str {
        match self {
            SupervisorError::InvalidConfigKey { .. }
            | SupervisorError::InvalidConfigValue { .. } => "400 Bad Request",
            SupervisorError::UnknownProject(_) => "404 Not Found",
            SupervisorError::Launch { .. }
            | SupervisorError::Persistence { .. }
            | SupervisorError::CorruptStore { .. }
            | SupervisorError::HotApplyUnsupported { .. } => "500 Internal Server Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = SupervisorError::InvalidConfigValue {
            project: "retro-clock".to_string(),
            key: "brightness".to_string(),
            value: "150".to_string(),
            reason: "must be between 1 and 100".to_string(),
        };
        assert_eq!(err.http_status(), "400 Bad Request");
        assert_eq!(err.kind(), "invalid_config_value");
        assert_eq!(
            err.to_string(),
            "invalid value 150 for 'retro-clock.brightness': must be between 1 and 100"
        );
    }

    #[test]
    fn unknown_project_maps_to_not_found() {
        let err = SupervisorError::UnknownProject("lava-lamp".to_string());
        assert_eq!(err.http_status(), "404 Not Found");
    }
}
