use matrixd_types::ConfigValues;
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::registry::{ControlChannel, ProjectDefinition};
use crate::store::ProjectConfig;

const STARTUP_GRACE: Duration = Duration::from_millis(80);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DROP_STOP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(i32),
    Killed(Option<i32>),
}

impl Liveness {
    pub fn is_running(self) -> bool {
        matches!(self, Liveness::Running)
    }

    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Liveness::Exited(code),
            None => Liveness::Killed(status.signal()),
        }
    }
}

/// One launched display instance. The supervisor only talks to this trait.
pub trait DisplayProcess: Send {
    fn handle_id(&self) -> u64;
    fn pid(&self) -> Option<u32>;
    fn started_at(&self) -> SystemTime;
    /// Values the process is currently running with, including hot-applied ones.
    fn launch_values(&self) -> &ConfigValues;
    /// Must not block; a display that is not reading gets an error instead.
    fn hot_apply(&mut self, changed: &ConfigValues) -> Result<(), SupervisorError>;
    /// Once this reports an exit, nothing the process spawned is left running.
    fn poll(&mut self) -> Liveness;
    /// Graceful stop, escalating to a forced kill after `timeout`.
    fn stop(&mut self, timeout: Duration) -> Liveness;
}

pub trait Launcher: Send + Sync {
    fn start(
        &self,
        definition: &ProjectDefinition,
        config: &ProjectConfig,
    ) -> Result<Box<dyn DisplayProcess>, SupervisorError>;
}

pub fn build_launch_args(definition: &ProjectDefinition, values: &ConfigValues) -> Vec<String> {
    let mut args = definition.launch.args.clone();
    for key in &definition.keys {
        let (Some(flag), Some(value)) = (key.flag.as_deref(), values.get(&key.name)) else {
            continue;
        };
        match value {
            Value::Bool(true) => args.push(flag.to_string()),
            Value::Bool(false) | Value::Null => {}
            Value::String(text) => {
                args.push(flag.to_string());
                args.push(text.clone());
            }
            other => {
                args.push(flag.to_string());
                args.push(other.to_string());
            }
        }
    }
    args
}

/// Spawns display programs as real child processes.
pub struct ChildLauncher {
    logs_dir: PathBuf,
    next_handle_id: AtomicU64,
}

impl ChildLauncher {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            next_handle_id: AtomicU64::new(1),
        }
    }

    pub fn log_path(&self, project: &str) -> PathBuf {
        self.logs_dir
            .join(format!("{}.log", sanitize_log_component(project)))
    }
}

impl Launcher for ChildLauncher {
    fn start(
        &self,
        definition: &ProjectDefinition,
        config: &ProjectConfig,
    ) -> Result<Box<dyn DisplayProcess>, SupervisorError> {
        let launch = &definition.launch;
        let launch_error = |reason: String| SupervisorError::Launch {
            project: definition.name.clone(),
            executable: launch.executable.clone(),
            reason,
        };

        fs::create_dir_all(&self.logs_dir).map_err(|err| {
            launch_error(format!(
                "failed to create log directory {}: {err}",
                self.logs_dir.display()
            ))
        })?;
        let log_path = self.log_path(&definition.name);
        let args = build_launch_args(definition, &config.values);
        let config_json = serde_json::to_string(&config.values)
            .map_err(|err| launch_error(format!("failed to encode config: {err}")))?;

        let mut child = Command::new(&launch.executable)
            .args(&args)
            .current_dir(&launch.cwd)
            .env("MATRIXD_PROJECT", &definition.name)
            .env("MATRIXD_CONFIG", config_json)
            .stdin(match launch.control {
                ControlChannel::Stdin => Stdio::piped(),
                ControlChannel::None => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|err| launch_error(describe_spawn_error(&err, &launch.cwd)))?;

        let handle_id = self.next_handle_id.fetch_add(1, Ordering::SeqCst);
        let banner = format!(
            "--- {} handle {handle_id} pid {}: {} {}",
            definition.name,
            child.id(),
            launch.executable,
            args.join(" ")
        );
        if let Err(err) = attach_process_logs(&mut child, &log_path, &banner) {
            abandon_child(&mut child);
            return Err(launch_error(format!(
                "failed to open log file {}: {err}",
                log_path.display()
            )));
        }

        let control = child.stdin.take();
        if let Some(stdin) = &control {
            if let Err(err) = set_nonblocking(stdin) {
                abandon_child(&mut child);
                return Err(launch_error(format!("failed to prepare control channel: {err}")));
            }
        }

        thread::sleep(STARTUP_GRACE);
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                kill_leftover_group(child.id());
                return Err(launch_error(format!("exited immediately with status {status}")));
            }
            Ok(_) => {}
            Err(err) => {
                abandon_child(&mut child);
                return Err(launch_error(format!("failed to check process status: {err}")));
            }
        }

        info!(
            "launched '{}' as pid {} (handle {handle_id}, log {})",
            definition.name,
            child.id(),
            log_path.display()
        );
        Ok(Box::new(ChildProcess {
            project: definition.name.clone(),
            handle_id,
            started_at: SystemTime::now(),
            launch_values: config.values.clone(),
            control,
            exit: None,
            child,
        }))
    }
}

fn abandon_child(child: &mut Child) {
    let _ = signal_process_group(child.id(), libc::SIGKILL);
    let _ = child.wait();
}

/// SIGKILLs whatever is left in a group whose leader has exited.
fn kill_leftover_group(pgid: u32) {
    match unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) } {
        0 => info!("killed processes left behind in group {pgid}"),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("failed to kill process group {pgid}: {err}");
            }
        }
    }
}

/// The child leads its own process group, so this reaches its whole tree.
/// Falls back to the leader alone when the group cannot be signalled.
fn signal_process_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = pid as i32;
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let direct = io::Error::last_os_error();
    if direct.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(direct)
    }
}

fn set_nonblocking(stdin: &ChildStdin) -> io::Result<()> {
    let fd = stdin.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn describe_spawn_error(err: &io::Error, cwd: &Path) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!(
            "executable or working directory not found (cwd {}): {err}",
            cwd.display()
        ),
        io::ErrorKind::PermissionDenied => format!("permission denied: {err}"),
        _ => err.to_string(),
    }
}

pub struct ChildProcess {
    project: String,
    handle_id: u64,
    started_at: SystemTime,
    launch_values: ConfigValues,
    control: Option<ChildStdin>,
    exit: Option<Liveness>,
    child: Child,
}

impl ChildProcess {
    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        signal_process_group(self.child.id(), signal)
    }

    /// Caches the exit and clears out the rest of the group, once per handle.
    fn record_exit(&mut self, exit: Liveness) -> Liveness {
        if self.exit.is_none() {
            self.exit = Some(exit);
            self.control = None;
            kill_leftover_group(self.child.id());
        }
        exit
    }

    fn wait_until(&mut self, deadline: Instant) -> Option<Liveness> {
        while Instant::now() < deadline {
            let liveness = self.poll();
            if !liveness.is_running() {
                return Some(liveness);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        None
    }
}

impl DisplayProcess for ChildProcess {
    fn handle_id(&self) -> u64 {
        self.handle_id
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn started_at(&self) -> SystemTime {
        self.started_at
    }

    fn launch_values(&self) -> &ConfigValues {
        &self.launch_values
    }

    fn hot_apply(&mut self, changed: &ConfigValues) -> Result<(), SupervisorError> {
        let project = self.project.clone();
        let unsupported = |reason: String| SupervisorError::HotApplyUnsupported {
            project: project.clone(),
            reason,
        };
        if !self.poll().is_running() {
            return Err(unsupported("process is not running".to_string()));
        }
        let Some(control) = self.control.as_mut() else {
            return Err(unsupported("no control channel".to_string()));
        };
        let mut line = json!({ "type": "config", "values": changed }).to_string();
        line.push('\n');
        // The pipe is non-blocking; a display that stopped reading fails here
        // instead of stalling the supervisor. A partial line poisons the channel.
        if let Err(err) = control.write_all(line.as_bytes()) {
            self.control = None;
            let reason = if err.kind() == io::ErrorKind::WouldBlock {
                "control channel is full, display is not reading".to_string()
            } else {
                format!("control channel write failed: {err}")
            };
            return Err(unsupported(reason));
        }
        for (key, value) in changed {
            self.launch_values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn poll(&mut self) -> Liveness {
        if let Some(exit) = self.exit {
            return exit;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.record_exit(Liveness::from_status(status)),
            Ok(None) => Liveness::Running,
            Err(err) => {
                warn!(
                    "failed to poll process status for '{}' (handle {}): {err}",
                    self.project, self.handle_id
                );
                Liveness::Running
            }
        }
    }

    fn stop(&mut self, timeout: Duration) -> Liveness {
        if let Some(exit) = self.exit {
            return exit;
        }
        // Closing stdin lets programs that watch for EOF exit on their own.
        self.control = None;
        if let Err(err) = self.signal_group(libc::SIGTERM) {
            warn!("failed to send SIGTERM to '{}': {err}", self.project);
        }
        if let Some(exit) = self.wait_until(Instant::now() + timeout) {
            return exit;
        }

        warn!(
            "'{}' did not exit within {}ms, sending SIGKILL",
            self.project,
            timeout.as_millis()
        );
        if let Err(err) = self.signal_group(libc::SIGKILL) {
            warn!("failed to send SIGKILL to '{}': {err}", self.project);
        }
        let exit = match self.child.wait() {
            Ok(status) => Liveness::from_status(status),
            Err(err) => {
                warn!("failed to reap '{}': {err}", self.project);
                Liveness::Killed(Some(libc::SIGKILL))
            }
        };
        self.record_exit(exit)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.poll().is_running() {
            self.stop(DROP_STOP_TIMEOUT);
        }
    }
}

/// Appends a banner for this launch, then copies stdout and stderr into the
/// project log one line at a time so the two streams never split a line.
fn attach_process_logs(child: &mut Child, log_path: &Path, banner: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(file, "{banner}")?;
    let log = Arc::new(Mutex::new(file));

    if let Some(stdout) = child.stdout.take() {
        spawn_log_copy_thread(stdout, log.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_copy_thread(stderr, log);
    }
    Ok(())
}

fn spawn_log_copy_thread<R>(reader: R, log: Arc<Mutex<File>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(reader).split(b'\n') {
            let Ok(mut line) = line else { break };
            line.push(b'\n');
            let Ok(mut file) = log.lock() else { break };
            if file.write_all(&line).is_err() {
                break;
            }
        }
    });
}

fn sanitize_log_component(raw: &str) -> String {
    let output: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if output.trim_matches('_').is_empty() {
        "project".to_string()
    } else {
        output
    }
}
