use matrixd_types::ConfigValues;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::SupervisorError;
use crate::registry::{ProjectDefinition, Registry};

/// On-disk shape of the store. Older snake_case field names are still
/// accepted on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    #[serde(default, alias = "projects")]
    pub project_configs: BTreeMap<String, ConfigValues>,
    #[serde(default, alias = "default_project")]
    pub default_project: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    pub project: String,
    pub values: ConfigValues,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    document: PersistedDocument,
}

impl ConfigStore {
    pub fn open(path: PathBuf) -> Result<Self, SupervisorError> {
        let document = Self::load(&path)?;
        Ok(Self { path, document })
    }

    pub fn load(path: &Path) -> Result<PersistedDocument, SupervisorError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedDocument::default())
            }
            Err(source) => {
                return Err(SupervisorError::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(PersistedDocument::default());
        }
        serde_json::from_str(&raw).map_err(|source| SupervisorError::CorruptStore {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self) -> Result<(), SupervisorError> {
        let persistence = |source| SupervisorError::Persistence {
            path: self.path.clone(),
            source,
        };
        let data = serde_json::to_string_pretty(&self.document)
            .map_err(|err| persistence(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        atomic_write_file(&self.path, data.as_bytes()).map_err(persistence)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn document(&self) -> &PersistedDocument {
        &self.document
    }

    /// Drops persisted entries for projects the registry no longer knows.
    pub fn retain_known(&mut self, registry: &Registry) {
        self.document.project_configs.retain(|name, _| {
            let known = registry.definition_of(name).is_ok();
            if !known {
                warn!("dropping persisted config for unknown project '{name}'");
            }
            known
        });
        if let Some(name) = self.document.default_project.clone() {
            if registry.definition_of(&name).is_err() {
                warn!("ignoring persisted default project '{name}': not in registry");
                self.document.default_project = None;
            }
        }
    }

    pub fn get_config(&mut self, definition: &ProjectDefinition) -> ProjectConfig {
        let mut values = definition.defaults();
        if let Some(persisted) = self.document.project_configs.get(&definition.name) {
            for (key, value) in persisted {
                if definition.key(key).is_some() {
                    values.insert(key.clone(), value.clone());
                } else {
                    warn!(
                        "dropping unrecognized persisted key '{key}' for project '{}'",
                        definition.name
                    );
                }
            }
        }
        self.document
            .project_configs
            .insert(definition.name.clone(), values.clone());
        ProjectConfig {
            project: definition.name.clone(),
            values,
        }
    }

    /// Validates every entry before touching state, merges, then saves. A
    /// `Persistence` error means the in-memory merge already happened.
    pub fn set_config(
        &mut self,
        definition: &ProjectDefinition,
        partial: &ConfigValues,
    ) -> Result<ProjectConfig, SupervisorError> {
        definition.validate_values(partial)?;
        let mut config = self.get_config(definition);
        for (key, value) in partial {
            config.values.insert(key.clone(), value.clone());
        }
        self.document
            .project_configs
            .insert(definition.name.clone(), config.values.clone());
        self.save()?;
        Ok(config)
    }

    pub fn default_project(&self) -> Option<&str> {
        self.document.default_project.as_deref()
    }

    pub fn set_default_project(&mut self, name: Option<String>) -> Result<(), SupervisorError> {
        self.document.default_project = name;
        self.save()
    }
}

fn atomic_write_file(target: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn registry() -> Registry {
        Registry::builtin(Path::new("/tmp")).unwrap()
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock drift before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("matrixd-store-{label}-{nanos}"))
    }

    fn values(pairs: &[(&str, serde_json::Value)]) -> ConfigValues {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn load_missing_file_returns_empty_document() {
        let base = unique_temp_dir("missing");
        let document = ConfigStore::load(&base.join("matrix_config.json")).unwrap();
        assert_eq!(document, PersistedDocument::default());
    }

    #[test]
    fn load_blank_file_returns_empty_document() {
        let base = unique_temp_dir("blank");
        fs::create_dir_all(&base).unwrap();
        let path = base.join("matrix_config.json");
        fs::write(&path, "  \n").unwrap();
        assert_eq!(ConfigStore::load(&path).unwrap(), PersistedDocument::default());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn load_unparseable_file_is_corrupt() {
        let base = unique_temp_dir("corrupt");
        fs::create_dir_all(&base).unwrap();
        let path = base.join("matrix_config.json");
        fs::write(&path, "{\"projectConfigs\": [").unwrap();
        let err = ConfigStore::load(&path).unwrap_err();
        assert!(matches!(err, SupervisorError::CorruptStore { .. }));
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn load_accepts_legacy_field_names() {
        let base = unique_temp_dir("legacy");
        fs::create_dir_all(&base).unwrap();
        let path = base.join("matrix_config.json");
        fs::write(
            &path,
            r#"{"default_project": "retro-clock", "projects": {"retro-clock": {"brightness": 40}}}"#,
        )
        .unwrap();
        let document = ConfigStore::load(&path).unwrap();
        assert_eq!(document.default_project.as_deref(), Some("retro-clock"));
        assert_eq!(
            document.project_configs["retro-clock"]["brightness"],
            json!(40)
        );
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn set_then_get_round_trips_merged_values() {
        let base = unique_temp_dir("round-trip");
        let registry = registry();
        let retro = registry.definition_of("retro-clock").unwrap();
        let mut store = ConfigStore::open(base.join("matrix_config.json")).unwrap();

        let update = values(&[("brightness", json!(55)), ("color_theme", json!("dark_green"))]);
        store.set_config(retro, &update).unwrap();

        let config = store.get_config(retro);
        assert_eq!(config.values["brightness"], json!(55));
        assert_eq!(config.values["color_theme"], json!("dark_green"));
        assert_eq!(config.values["animation_mode"], json!("scroll_down"));
        assert_eq!(config.values["show_ampm"], json!(true));

        let reopened = ConfigStore::open(base.join("matrix_config.json")).unwrap();
        assert_eq!(
            reopened.document().project_configs["retro-clock"]["brightness"],
            json!(55)
        );
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejected_update_leaves_persisted_config_unchanged() {
        let base = unique_temp_dir("reject");
        let path = base.join("matrix_config.json");
        let registry = registry();
        let retro = registry.definition_of("retro-clock").unwrap();
        let mut store = ConfigStore::open(path.clone()).unwrap();
        store
            .set_config(retro, &values(&[("brightness", json!(30))]))
            .unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let err = store
            .set_config(
                retro,
                &values(&[("color_theme", json!("light_blue")), ("brightness", json!(150))]),
            )
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfigValue { ref key, .. } if key == "brightness"));

        let err = store
            .set_config(retro, &values(&[("volume", json!(3))]))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfigKey { .. }));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        let config = store.get_config(retro);
        assert_eq!(config.values["brightness"], json!(30));
        assert_eq!(config.values["color_theme"], json!("orange"));
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn get_config_drops_unrecognized_persisted_keys() {
        let base = unique_temp_dir("unrecognized");
        fs::create_dir_all(&base).unwrap();
        let path = base.join("matrix_config.json");
        fs::write(
            &path,
            r#"{"projectConfigs": {"retro-clock": {"brightness": 20, "legacy_font": "9x18B"}}}"#,
        )
        .unwrap();
        let registry = registry();
        let retro = registry.definition_of("retro-clock").unwrap();
        let mut store = ConfigStore::open(path).unwrap();

        let config = store.get_config(retro);
        assert_eq!(config.values["brightness"], json!(20));
        assert!(!config.values.contains_key("legacy_font"));
        assert!(!store.document().project_configs["retro-clock"].contains_key("legacy_font"));
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn retain_known_drops_unknown_default_and_projects() {
        let mut store = ConfigStore {
            path: PathBuf::from("/tmp/unused.json"),
            document: PersistedDocument {
                project_configs: BTreeMap::from([
                    ("retro-clock".to_string(), ConfigValues::new()),
                    ("lava-lamp".to_string(), ConfigValues::new()),
                ]),
                default_project: Some("lava-lamp".to_string()),
            },
        };
        store.retain_known(&registry());
        assert!(store.default_project().is_none());
        assert_eq!(store.document().project_configs.len(), 1);
    }

    #[test]
    fn save_failure_keeps_in_memory_state() {
        let base = unique_temp_dir("save-failure");
        fs::create_dir_all(&base).unwrap();
        // A directory where the file should be makes the rename fail.
        let path = base.join("matrix_config.json");
        fs::create_dir_all(&path).unwrap();
        let registry = registry();
        let retro = registry.definition_of("retro-clock").unwrap();
        let mut store = ConfigStore {
            path: path.clone(),
            document: PersistedDocument::default(),
        };

        let err = store
            .set_config(retro, &values(&[("brightness", json!(10))]))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Persistence { .. }));
        assert_eq!(store.get_config(retro).values["brightness"], json!(10));
        let _ = fs::remove_dir_all(&base);
    }
}
