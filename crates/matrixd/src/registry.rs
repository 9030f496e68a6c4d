use anyhow::{bail, Context, Result};
use matrixd_types::{ConfigKeyInfo, ConfigValues, ValueSpec};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

const BUILTIN_REGISTRY: &str = include_str!("../registry.toml");

/// How a running display receives live configuration updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlChannel {
    /// One JSON line per update on the child's stdin.
    Stdin,
    #[default]
    None,
}

#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub control: ControlChannel,
}

#[derive(Debug, Clone)]
pub struct ConfigKeySpec {
    pub name: String,
    pub spec: ValueSpec,
    pub default: Value,
    pub hot_applicable: bool,
    pub flag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectDefinition {
    pub name: String,
    pub display_name: String,
    pub launch: LaunchTemplate,
    pub keys: Vec<ConfigKeySpec>,
}

impl ProjectDefinition {
    pub fn key(&self, name: &str) -> Option<&ConfigKeySpec> {
        self.keys.iter().find(|key| key.name == name)
    }

    pub fn defaults(&self) -> ConfigValues {
        self.keys
            .iter()
            .map(|key| (key.name.clone(), key.default.clone()))
            .collect()
    }

    pub fn validate_entry(&self, key: &str, value: &Value) -> Result<(), SupervisorError> {
        let Some(spec) = self.key(key) else {
            return Err(SupervisorError::InvalidConfigKey {
                project: self.name.clone(),
                key: key.to_string(),
            });
        };
        check_value(&spec.spec, value).map_err(|reason| SupervisorError::InvalidConfigValue {
            project: self.name.clone(),
            key: key.to_string(),
            value: value.to_string(),
            reason,
        })
    }

    pub fn validate_values(&self, values: &ConfigValues) -> Result<(), SupervisorError> {
        for (key, value) in values {
            self.validate_entry(key, value)?;
        }
        Ok(())
    }

    pub fn key_infos(&self) -> Vec<ConfigKeyInfo> {
        self.keys
            .iter()
            .map(|key| ConfigKeyInfo {
                name: key.name.clone(),
                spec: key.spec.clone(),
                default: key.default.clone(),
                hot_applicable: key.hot_applicable,
            })
            .collect()
    }
}

pub fn check_value(spec: &ValueSpec, value: &Value) -> Result<(), String> {
    match spec {
        ValueSpec::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err("expected a boolean".to_string())
            }
        }
        ValueSpec::Integer { min, max } => match value.as_i64() {
            Some(number) if (*min..=*max).contains(&number) => Ok(()),
            Some(_) => Err(format!("must be between {min} and {max}")),
            None => Err(format!("expected an integer between {min} and {max}")),
        },
        ValueSpec::Choice { values } => match value.as_str() {
            Some(choice) if values.iter().any(|allowed| allowed == choice) => Ok(()),
            _ => Err(format!("must be one of: {}", values.join(", "))),
        },
        ValueSpec::Text => {
            if value.is_string() {
                Ok(())
            } else {
                Err("expected a string".to_string())
            }
        }
    }
}

/// Static catalog of display projects, in declaration order.
#[derive(Debug, Clone)]
pub struct Registry {
    projects: Vec<ProjectDefinition>,
}

impl Registry {
    pub fn builtin(projects_dir: &Path) -> Result<Self> {
        Self::parse(BUILTIN_REGISTRY, projects_dir).context("built-in registry is invalid")
    }

    pub fn from_file(path: &Path, projects_dir: Option<&Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read registry file: {}", path.display()))?;
        let base_dir = match projects_dir {
            Some(dir) => dir.to_path_buf(),
            None => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Self::parse(&raw, &base_dir)
            .with_context(|| format!("invalid registry file: {}", path.display()))
    }

    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let parsed: RawRegistry = toml::from_str(raw).context("failed to parse registry TOML")?;
        let mut seen = HashSet::new();
        let mut projects = Vec::with_capacity(parsed.projects.len());
        for raw_project in parsed.projects {
            let definition = build_definition(raw_project, base_dir)?;
            if !seen.insert(definition.name.clone()) {
                bail!("duplicate project name in registry: {}", definition.name);
            }
            projects.push(definition);
        }
        if projects.is_empty() {
            bail!("registry declares no projects");
        }
        Ok(Self { projects })
    }

    pub fn definition_of(&self, name: &str) -> Result<&ProjectDefinition, SupervisorError> {
        self.projects
            .iter()
            .find(|project| project.name == name)
            .ok_or_else(|| SupervisorError::UnknownProject(name.to_string()))
    }

    pub fn list_projects(&self) -> &[ProjectDefinition] {
        &self.projects
    }

    pub fn is_hot_applicable(&self, name: &str, key: &str) -> bool {
        self.definition_of(name)
            .ok()
            .and_then(|project| project.key(key))
            .is_some_and(|key| key.hot_applicable)
    }
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    projects: Vec<RawProjectDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawProjectDefinition {
    name: String,
    display_name: Option<String>,
    executable: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
    #[serde(default)]
    control: ControlChannel,
    #[serde(default)]
    keys: Vec<RawConfigKey>,
}

#[derive(Debug, Deserialize)]
struct RawConfigKey {
    name: String,
    #[serde(flatten)]
    spec: ValueSpec,
    default: Value,
    #[serde(default)]
    hot_apply: bool,
    flag: Option<String>,
}

fn build_definition(raw: RawProjectDefinition, base_dir: &Path) -> Result<ProjectDefinition> {
    let name = non_empty_field(&raw.name, "projects.name")?;
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        bail!("project name '{name}' must not contain '/' or whitespace");
    }
    let executable = non_empty_field(&raw.executable, &format!("{name}.executable"))?;
    let cwd = match raw.cwd.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => {
            let path = PathBuf::from(dir);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        }
        _ => base_dir.to_path_buf(),
    };

    let mut seen_keys = HashSet::new();
    let mut keys = Vec::with_capacity(raw.keys.len());
    for raw_key in raw.keys {
        let key_name = non_empty_field(&raw_key.name, &format!("{name}.keys.name"))?;
        if !seen_keys.insert(key_name.clone()) {
            bail!("duplicate config key '{key_name}' in project '{name}'");
        }
        match &raw_key.spec {
            ValueSpec::Integer { min, max } if min > max => {
                bail!("config key '{name}.{key_name}' has min {min} greater than max {max}")
            }
            ValueSpec::Choice { values } if values.is_empty() => {
                bail!("config key '{name}.{key_name}' declares no choices")
            }
            _ => {}
        }
        if let Err(reason) = check_value(&raw_key.spec, &raw_key.default) {
            bail!("default for '{name}.{key_name}' is invalid: {reason}");
        }
        let flag = raw_key
            .flag
            .map(|flag| flag.trim().to_string())
            .filter(|flag| !flag.is_empty());
        keys.push(ConfigKeySpec {
            name: key_name,
            spec: raw_key.spec,
            default: raw_key.default,
            hot_applicable: raw_key.hot_apply,
            flag,
        });
    }

    Ok(ProjectDefinition {
        display_name: raw
            .display_name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| name.clone()),
        name,
        launch: LaunchTemplate {
            executable,
            args: raw.args,
            cwd,
            control: raw.control,
        },
        keys,
    })
}

fn non_empty_field(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{field} must not be empty");
    }
    Ok(trimmed.to_string())
}
