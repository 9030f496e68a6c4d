use matrixd_types::{
    ActionResult, ApplyMode, ConfigValues, DefaultProjectResult, ProcessInfo, ProjectConfigResult,
    ProjectListResult, ProjectSummary, SlotPhase, StatusResult, UpdateConfigResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::process::{DisplayProcess, Launcher, Liveness};
use crate::registry::{ProjectDefinition, Registry};
use crate::store::ConfigStore;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub stop_timeout: Duration,
    /// An auto-restarted default project that dies again within this window
    /// is left stopped.
    pub crash_loop_window: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            crash_loop_window: Duration::from_secs(10),
        }
    }
}

struct ActiveProject {
    name: String,
    handle: Box<dyn DisplayProcess>,
    auto_restarted: bool,
}

struct SupervisorState {
    active: Option<ActiveProject>,
    store: ConfigStore,
}

#[derive(Debug)]
pub struct CrashReport {
    pub project: String,
    pub exit: Liveness,
    /// `None` when no restart was attempted.
    pub restart: Option<Result<(), String>>,
}

/// Owns the hardware slot. Every mutation runs under `state`; `snapshot` is a
/// copy of the last published status so readers never wait on a slow stop.
pub struct Supervisor {
    registry: Registry,
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    snapshot: Mutex<StatusResult>,
}

impl Supervisor {
    pub fn new(
        registry: Registry,
        mut store: ConfigStore,
        launcher: Arc<dyn Launcher>,
        options: SupervisorOptions,
    ) -> Self {
        store.retain_known(&registry);
        let snapshot = StatusResult {
            active_project: None,
            state: SlotPhase::Idle,
            default_project: store.default_project().map(str::to_string),
            running: false,
            process: None,
        };
        Self {
            registry,
            launcher,
            options,
            state: Mutex::new(SupervisorState {
                active: None,
                store,
            }),
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn status(&self) -> StatusResult {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_project(&self) -> Option<String> {
        self.status().default_project
    }

    /// Starts the persisted default project, if any.
    pub fn startup(&self) -> Result<Option<String>, SupervisorError> {
        let Some(name) = self.default_project() else {
            info!("no default project configured; staying idle");
            return Ok(None);
        };
        info!("auto-starting default project '{name}'");
        self.start_project(&name)?;
        Ok(Some(name))
    }

    pub fn start_project(&self, name: &str) -> Result<ActionResult, SupervisorError> {
        let definition = self.registry.definition_of(name)?;
        let mut state = self.lock_state();
        self.start_locked(&mut state, definition, false, false)?;
        Ok(self.action_result(format!("Started {}", definition.display_name)))
    }

    pub fn restart_project(&self, name: &str) -> Result<ActionResult, SupervisorError> {
        let definition = self.registry.definition_of(name)?;
        let mut state = self.lock_state();
        self.start_locked(&mut state, definition, true, false)?;
        Ok(self.action_result(format!("Restarted {}", definition.display_name)))
    }

    pub fn stop_project(&self) -> ActionResult {
        let mut state = self.lock_state();
        let message = match self.stop_locked(&mut state, SlotPhase::Stopping) {
            Some(name) => format!("Stopped {name}"),
            None => "No project running".to_string(),
        };
        self.publish(&state, SlotPhase::Idle, None);
        self.action_result(message)
    }

    /// Stops `name` only if it is the active project.
    pub fn stop_project_named(&self, name: &str) -> Result<ActionResult, SupervisorError> {
        let definition = self.registry.definition_of(name)?;
        let mut state = self.lock_state();
        let is_active = state
            .active
            .as_ref()
            .is_some_and(|active| active.name == definition.name);
        if !is_active {
            return Ok(self.action_result(format!("{} is not running", definition.display_name)));
        }
        self.stop_locked(&mut state, SlotPhase::Stopping);
        self.publish(&state, SlotPhase::Idle, None);
        Ok(self.action_result(format!("Stopped {}", definition.display_name)))
    }

    /// Stops the active project without touching the default; used when the
    /// daemon itself exits.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if let Some(name) = self.stop_locked(&mut state, SlotPhase::Stopping) {
            info!("stopped '{name}' for shutdown");
        }
        self.publish(&state, SlotPhase::Idle, None);
    }

    pub fn get_config(&self, name: &str) -> Result<ProjectConfigResult, SupervisorError> {
        let definition = self.registry.definition_of(name)?;
        let mut state = self.lock_state();
        let config = state.store.get_config(definition);
        Ok(ProjectConfigResult {
            project: config.project,
            config: config.values,
        })
    }

    pub fn update_config(
        &self,
        name: &str,
        partial: &ConfigValues,
    ) -> Result<UpdateConfigResult, SupervisorError> {
        let definition = self.registry.definition_of(name)?;
        let mut state = self.lock_state();
        let mut warnings = Vec::new();
        let config = match state.store.set_config(definition, partial) {
            Ok(config) => config,
            Err(err @ SupervisorError::Persistence { .. }) => {
                warn!("{err}; keeping in-memory config for '{name}'");
                warnings.push(err.to_string());
                state.store.get_config(definition)
            }
            Err(err) => return Err(err),
        };

        let applied = self.apply_to_active(&mut state, definition, &config.values)?;
        Ok(UpdateConfigResult {
            project: config.project,
            config: config.values,
            applied,
            warnings,
        })
    }

    pub fn set_default_project(
        &self,
        name: Option<&str>,
    ) -> Result<DefaultProjectResult, SupervisorError> {
        let name = name
            .map(|name| self.registry.definition_of(name).map(|def| def.name.clone()))
            .transpose()?;
        let mut state = self.lock_state();
        let mut warnings = Vec::new();
        if let Err(err) = state.store.set_default_project(name.clone()) {
            warn!("{err}; default project change kept in memory only");
            warnings.push(err.to_string());
        }
        match name.as_deref() {
            Some(name) => info!("default project set to '{name}'"),
            None => info!("default project cleared"),
        }
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.default_project = name.clone();
        Ok(DefaultProjectResult {
            default_project: name,
            warnings,
        })
    }

    pub fn list_projects(&self) -> ProjectListResult {
        let mut state = self.lock_state();
        let active = state.active.as_ref().map(|active| active.name.clone());
        let projects = self
            .registry
            .list_projects()
            .iter()
            .map(|definition| ProjectSummary {
                name: definition.name.clone(),
                display_name: definition.display_name.clone(),
                active: active.as_deref() == Some(definition.name.as_str()),
                keys: definition.key_infos(),
                config: state.store.get_config(definition).values,
            })
            .collect();
        ProjectListResult { projects }
    }

    /// One crash-monitor tick: if the active process has exited, clear the
    /// slot and, for the default project, make a single restart attempt.
    pub fn check_liveness(&self) -> Option<CrashReport> {
        let mut state = self.lock_state();
        let exit = state.active.as_mut()?.handle.poll();
        if exit.is_running() {
            return None;
        }
        let crashed = state.active.take()?;
        error!(
            "project '{}' exited unexpectedly ({exit:?}); hardware slot is idle",
            crashed.name
        );
        self.publish(&state, SlotPhase::Idle, None);

        if state.store.default_project() != Some(crashed.name.as_str()) {
            return Some(CrashReport {
                project: crashed.name,
                exit,
                restart: None,
            });
        }
        let uptime = crashed
            .handle
            .started_at()
            .elapsed()
            .unwrap_or(Duration::ZERO);
        if crashed.auto_restarted && uptime < self.options.crash_loop_window {
            warn!(
                "default project '{}' crashed again {}ms after an automatic restart; not restarting",
                crashed.name,
                uptime.as_millis()
            );
            return Some(CrashReport {
                project: crashed.name,
                exit,
                restart: None,
            });
        }

        let restart = match self.registry.definition_of(&crashed.name) {
            Ok(definition) => {
                info!("restarting default project '{}' after crash", crashed.name);
                self.start_locked(&mut state, definition, false, true)
                    .map_err(|err| err.to_string())
            }
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = &restart {
            error!("automatic restart of '{}' failed: {err}", crashed.name);
        }
        Some(CrashReport {
            project: crashed.name,
            exit,
            restart: Some(restart),
        })
    }

    pub fn spawn_crash_monitor(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                supervisor.check_liveness();
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches `definition`, stopping whatever holds the slot first. Name and
    /// config are validated before the slot is touched; a failed launch leaves
    /// the slot idle.
    fn start_locked(
        &self,
        state: &mut SupervisorState,
        definition: &ProjectDefinition,
        restart: bool,
        auto_restarted: bool,
    ) -> Result<(), SupervisorError> {
        let config = state.store.get_config(definition);
        definition.validate_values(&config.values)?;

        let same_project = state
            .active
            .as_ref()
            .is_some_and(|active| active.name == definition.name);
        let phase = if restart || same_project {
            SlotPhase::Restarting
        } else {
            SlotPhase::Starting
        };
        let stop_phase = if phase == SlotPhase::Restarting {
            SlotPhase::Restarting
        } else {
            SlotPhase::Stopping
        };
        self.stop_locked(state, stop_phase);

        self.publish(state, phase, Some(&definition.name));
        match self.launcher.start(definition, &config) {
            Ok(handle) => {
                info!(
                    "'{}' is running (handle {}, pid {:?})",
                    definition.name,
                    handle.handle_id(),
                    handle.pid()
                );
                state.active = Some(ActiveProject {
                    name: definition.name.clone(),
                    handle,
                    auto_restarted,
                });
                self.publish(state, SlotPhase::Running, Some(&definition.name));
                Ok(())
            }
            Err(err) => {
                error!("failed to start '{}': {err}", definition.name);
                self.publish(state, SlotPhase::Idle, None);
                Err(err)
            }
        }
    }

    /// Stops the active handle, if any, returning its project name. The
    /// caller publishes the phase that follows.
    fn stop_locked(&self, state: &mut SupervisorState, phase: SlotPhase) -> Option<String> {
        let name = state.active.as_ref()?.name.clone();
        self.publish(state, phase, Some(&name));
        let mut active = state.active.take()?;
        let exit = active.handle.stop(self.options.stop_timeout);
        info!(
            "stopped '{}' (handle {}): {exit:?}",
            name,
            active.handle.handle_id()
        );
        Some(name)
    }

    fn apply_to_active(
        &self,
        state: &mut SupervisorState,
        definition: &ProjectDefinition,
        values: &ConfigValues,
    ) -> Result<ApplyMode, SupervisorError> {
        let Some(active) = state
            .active
            .as_mut()
            .filter(|active| active.name == definition.name)
        else {
            return Ok(ApplyMode::Persisted);
        };

        let changed: ConfigValues = values
            .iter()
            .filter(|(key, value)| active.handle.launch_values().get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if changed.is_empty() {
            return Ok(ApplyMode::Unchanged);
        }

        let restart_only: Vec<&str> = changed
            .keys()
            .map(String::as_str)
            .filter(|key| !self.registry.is_hot_applicable(&definition.name, key))
            .collect();
        if restart_only.is_empty() {
            match active.handle.hot_apply(&changed) {
                Ok(()) => {
                    info!(
                        "hot-applied {} key(s) to '{}'",
                        changed.len(),
                        definition.name
                    );
                    return Ok(ApplyMode::HotApplied);
                }
                Err(err) => warn!("{err}; falling back to restart"),
            }
        } else {
            info!(
                "restart-only keys changed for '{}': {}",
                definition.name,
                restart_only.join(", ")
            );
        }

        self.start_locked(state, definition, true, false)?;
        Ok(ApplyMode::Restarted)
    }

    fn publish(&self, state: &SupervisorState, phase: SlotPhase, project: Option<&str>) {
        let process = state.active.as_ref().map(|active| process_info(active.handle.as_ref()));
        let status = StatusResult {
            active_project: project.map(str::to_string),
            state: phase,
            default_project: state.store.default_project().map(str::to_string),
            running: phase == SlotPhase::Running && state.active.is_some(),
            process,
        };
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn action_result(&self, message: String) -> ActionResult {
        ActionResult {
            message,
            status: self.status(),
            warnings: Vec::new(),
        }
    }
}

fn process_info(handle: &dyn DisplayProcess) -> ProcessInfo {
    let started_at_ms = handle
        .started_at()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    ProcessInfo {
        handle_id: handle.handle_id(),
        pid: handle.pid(),
        started_at_ms,
    }
}
