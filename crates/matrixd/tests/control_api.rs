use matrixd_types::client::{request, wait_for_health, HttpReply};
use serde_json::{json, Value};
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const DISPLAY_SCRIPT: &str = "#!/usr/bin/env sh\n\
echo \"display-start project=$MATRIXD_PROJECT args=$*\"\n\
trap 'echo \"display-stop\"; exit 0' TERM INT\n\
while read line; do echo \"control $line\"; done\n\
while true; do sleep 0.1; done\n";

const CRASHING_SCRIPT: &str = "#!/usr/bin/env sh\n\
echo \"crasher-start\"\n\
sleep 0.4\n\
exit 3\n";

const REGISTRY: &str = r#"
[[projects]]
name = "clock"
display_name = "Test Clock"
executable = "sh"
args = ["./display.sh"]
control = "stdin"

[[projects.keys]]
name = "color_theme"
type = "choice"
values = ["orange", "blue"]
default = "orange"
hot_apply = true

[[projects.keys]]
name = "brightness"
type = "integer"
min = 1
max = 100
default = 80
flag = "--led-brightness"

[[projects]]
name = "ticker"
executable = "sh"
args = ["./display.sh"]

[[projects]]
name = "crasher"
executable = "sh"
args = ["./crasher.sh"]
"#;

/// Scratch directory holding the registry, scripts, store and logs. Shared by
/// successive daemons in one test.
struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let root = unique_temp_dir(label);
        fs::create_dir_all(&root).expect("failed to create workspace");
        write_executable_script(&root.join("display.sh"), DISPLAY_SCRIPT);
        write_executable_script(&root.join("crasher.sh"), CRASHING_SCRIPT);
        fs::write(root.join("registry.toml"), REGISTRY).expect("failed to write registry");
        Self { root }
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("matrix_config.json")
    }

    fn log_path(&self, project: &str) -> PathBuf {
        self.root.join("logs").join(format!("{project}.log"))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct DaemonHarness {
    child: Child,
    addr: String,
}

impl DaemonHarness {
    fn start(workspace: &Workspace) -> Self {
        let addr = format!("127.0.0.1:{}", free_port());
        let child = Command::new(env!("CARGO_BIN_EXE_matrixd"))
            .arg("--listen")
            .arg(&addr)
            .arg("--state")
            .arg(workspace.state_path())
            .arg("--registry")
            .arg(workspace.root.join("registry.toml"))
            .arg("--logs-dir")
            .arg(workspace.root.join("logs"))
            .arg("--stop-timeout-ms")
            .arg("2000")
            .arg("--poll-interval-ms")
            .arg("50")
            .env("MATRIXD_LOG", "debug")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn matrixd binary");
        let harness = Self { child, addr };
        wait_for_health(&harness.addr, Duration::from_secs(5))
            .expect("timed out waiting for matrixd to answer health checks");
        harness
    }

    fn get(&self, path: &str) -> HttpReply {
        request(&self.addr, "GET", path, None).expect("GET request failed")
    }

    fn post(&self, path: &str, body: Option<Value>) -> HttpReply {
        request(&self.addr, "POST", path, body.as_ref()).expect("POST request failed")
    }

    fn status(&self) -> Value {
        result_of(self.get("/api/status"))
    }

    fn wait_for_state(&self, expected: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = self.status();
            if status["state"] == expected {
                return status;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for state '{expected}', last status: {status}");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn terminate(&mut self) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.terminate();
        }
    }
}

fn result_of(reply: HttpReply) -> Value {
    assert_eq!(reply.status, 200, "unexpected error: {:?}", reply.response);
    assert!(reply.response.ok);
    reply.response.result.unwrap_or(Value::Null)
}

#[test]
fn start_update_and_stop_over_http() {
    let workspace = Workspace::new("lifecycle");
    let daemon = DaemonHarness::start(&workspace);
    assert_eq!(daemon.status()["state"], "idle");

    let started = result_of(daemon.post("/api/projects/clock/start", None));
    assert_eq!(started["status"]["activeProject"], "clock");
    assert_eq!(started["status"]["state"], "running");
    let log = workspace.log_path("clock");
    wait_for_log_contains(&log, "display-start project=clock args=--led-brightness 80");
    let first_handle = daemon.status()["process"]["handleId"].clone();

    let updated = result_of(daemon.post(
        "/api/projects/clock/config",
        Some(json!({"color_theme": "blue"})),
    ));
    assert_eq!(updated["applied"], "hot_applied");
    wait_for_log_contains(&log, "\"color_theme\":\"blue\"");
    assert_eq!(daemon.status()["process"]["handleId"], first_handle);

    let updated = result_of(daemon.post(
        "/api/projects/clock/config",
        Some(json!({"color_theme": "blue"})),
    ));
    assert_eq!(updated["applied"], "unchanged");

    let updated = result_of(daemon.post(
        "/api/projects/clock/config",
        Some(json!({"brightness": 30})),
    ));
    assert_eq!(updated["applied"], "restarted");
    wait_for_log_contains(&log, "--led-brightness 30");
    let status = daemon.status();
    assert_eq!(status["activeProject"], "clock");
    assert_ne!(status["process"]["handleId"], first_handle);

    let config = result_of(daemon.get("/api/projects/clock/config"));
    assert_eq!(config["config"]["brightness"], 30);
    assert_eq!(config["config"]["color_theme"], "blue");

    let stopped = result_of(daemon.post("/api/stop", None));
    assert_eq!(stopped["status"]["state"], "idle");
    wait_for_log_contains(&log, "display-stop");
    let stopped = result_of(daemon.post("/api/stop", None));
    assert_eq!(stopped["message"], "No project running");
}

#[test]
fn switching_projects_replaces_the_owner() {
    let workspace = Workspace::new("switch");
    let daemon = DaemonHarness::start(&workspace);

    result_of(daemon.post("/api/projects/clock/start", None));
    result_of(daemon.post("/api/projects/ticker/start", None));
    wait_for_log_contains(&workspace.log_path("clock"), "display-stop");
    wait_for_log_contains(&workspace.log_path("ticker"), "display-start project=ticker");

    let listed = result_of(daemon.get("/api/projects"));
    let active: Vec<&str> = listed["projects"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|project| project["active"] == true)
        .map(|project| project["name"].as_str().unwrap())
        .collect();
    assert_eq!(active, vec!["ticker"]);
}

#[test]
fn rejected_requests_carry_status_and_kind() {
    let workspace = Workspace::new("errors");
    let daemon = DaemonHarness::start(&workspace);

    let reply = daemon.post("/api/projects/lava-lamp/start", None);
    assert_eq!(reply.status, 404);
    assert_eq!(reply.response.kind.as_deref(), Some("unknown_project"));

    let reply = daemon.post(
        "/api/projects/clock/config",
        Some(json!({"brightness": 150})),
    );
    assert_eq!(reply.status, 400);
    assert_eq!(reply.response.kind.as_deref(), Some("invalid_config_value"));
    let config = result_of(daemon.get("/api/projects/clock/config"));
    assert_eq!(config["config"]["brightness"], 80);

    let reply = daemon.post("/api/projects/clock/config", Some(json!("loud")));
    assert_eq!(reply.status, 400);

    let reply = daemon.get("/api/projects/clock/start");
    assert_eq!(reply.status, 405);

    let reply = daemon.get("/api/unknown");
    assert_eq!(reply.status, 404);
    assert_eq!(daemon.status()["state"], "idle");
}

/// Sends `raw` as-is and returns the whole response text.
fn exchange(addr: &str, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("failed to connect to matrixd");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("failed to set read timeout");
    stream
        .write_all(raw.as_bytes())
        .expect("failed to write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("failed to read response");
    response
}

#[test]
fn browser_panel_and_cors_preflight_are_served() {
    let workspace = Workspace::new("web");
    let daemon = DaemonHarness::start(&workspace);

    let page = exchange(&daemon.addr, "GET / HTTP/1.1\r\nHost: matrix\r\n\r\n");
    assert!(page.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(page.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(page.contains("Access-Control-Allow-Origin: *\r\n"));
    assert!(page.contains("LED Matrix Controller"));

    let script = exchange(&daemon.addr, "GET /app.js HTTP/1.1\r\nHost: matrix\r\n\r\n");
    assert!(script.contains("/api/projects"));

    let preflight = exchange(
        &daemon.addr,
        "OPTIONS /api/projects/clock/config HTTP/1.1\r\nOrigin: http://panel\r\n\r\n",
    );
    assert!(preflight.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(preflight.contains("Access-Control-Allow-Headers: Content-Type\r\n"));

    let api = exchange(&daemon.addr, "GET /api/status HTTP/1.1\r\nHost: matrix\r\n\r\n");
    assert!(api.contains("Access-Control-Allow-Origin: *\r\n"));
    assert!(api.contains("\"state\":\"idle\""));
}

#[test]
fn crashed_project_leaves_the_slot_idle() {
    let workspace = Workspace::new("crash");
    let daemon = DaemonHarness::start(&workspace);

    result_of(daemon.post("/api/projects/crasher/start", None));
    let status = daemon.wait_for_state("idle");
    assert!(status["activeProject"].is_null());
    assert_eq!(status["running"], false);
}

#[test]
fn default_project_is_restored_by_the_next_daemon() {
    let workspace = Workspace::new("default");
    {
        let daemon = DaemonHarness::start(&workspace);
        result_of(daemon.post(
            "/api/projects/clock/config",
            Some(json!({"brightness": 55})),
        ));
        let result = result_of(daemon.post(
            "/api/default-project",
            Some(json!({"project": "clock"})),
        ));
        assert_eq!(result["defaultProject"], "clock");
        assert_eq!(daemon.status()["state"], "idle");
    }

    let daemon = DaemonHarness::start(&workspace);
    let status = daemon.wait_for_state("running");
    assert_eq!(status["activeProject"], "clock");
    assert_eq!(status["defaultProject"], "clock");
    wait_for_log_contains(&workspace.log_path("clock"), "--led-brightness 55");

    result_of(daemon.post("/api/default-project", Some(json!({"project": null}))));
    let persisted: Value =
        serde_json::from_str(&fs::read_to_string(workspace.state_path()).unwrap()).unwrap();
    assert!(persisted["defaultProject"].is_null());
    assert_eq!(persisted["projectConfigs"]["clock"]["brightness"], 55);
}

#[test]
fn corrupt_store_refuses_to_start() {
    let workspace = Workspace::new("corrupt");
    fs::write(workspace.state_path(), "{not json").unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_matrixd"))
        .arg("--listen")
        .arg(format!("127.0.0.1:{}", free_port()))
        .arg("--state")
        .arg(workspace.state_path())
        .arg("--registry")
        .arg(workspace.root.join("registry.toml"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to run matrixd");
    assert!(!status.success());
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("failed to reserve a local port")
        .port()
}

fn write_executable_script(path: &Path, content: &str) {
    fs::write(path, content).expect("failed to write script");
    let mut perms = fs::metadata(path)
        .expect("missing script metadata")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("failed to set executable permissions");
}

fn wait_for_log_contains(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(6);
    while Instant::now() < deadline {
        if let Ok(content) = fs::read_to_string(path) {
            if content.contains(expected) {
                return;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!(
        "timed out waiting for '{}' in log file {}",
        expected,
        path.display()
    );
}

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("matrixd-it-{label}-{nanos}"))
}
