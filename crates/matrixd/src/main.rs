mod error;
mod http;
mod process;
mod registry;
mod store;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use matrixd_types::{default_logs_dir, default_state_path, DEFAULT_LISTEN_ADDR};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::process::ChildLauncher;
use crate::registry::Registry;
use crate::store::ConfigStore;
use crate::supervisor::{Supervisor, SupervisorOptions};

const DEFAULT_LOG_DIRECTIVES: &str = "info";

#[derive(Debug, Parser)]
#[command(name = "matrixd", version, about = "LED matrix project supervisor")]
struct Args {
    /// Address the control API listens on.
    #[arg(long, env = "MATRIXD_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,
    #[arg(long, env = "MATRIXD_STATE_PATH")]
    state: Option<PathBuf>,
    /// Project catalog (TOML); the built-in catalog is used when omitted.
    #[arg(long, env = "MATRIXD_REGISTRY")]
    registry: Option<PathBuf>,
    #[arg(long, env = "MATRIXD_PROJECTS_DIR")]
    projects_dir: Option<PathBuf>,
    #[arg(long, env = "MATRIXD_LOGS_DIR")]
    logs_dir: Option<PathBuf>,
    #[arg(long, env = "MATRIXD_STOP_TIMEOUT_MS", default_value_t = 5000)]
    stop_timeout_ms: u64,
    #[arg(long, env = "MATRIXD_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(long, env = "MATRIXD_CRASH_LOOP_WINDOW_MS", default_value_t = 10_000)]
    crash_loop_window_ms: u64,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let registry = match &args.registry {
        Some(path) => Registry::from_file(path, args.projects_dir.as_deref())?,
        None => {
            let projects_dir = match args.projects_dir.clone() {
                Some(dir) => dir,
                None => std::env::current_dir().context("failed to resolve current directory")?,
            };
            Registry::builtin(&projects_dir)?
        }
    };
    info!(
        "loaded {} project(s): {}",
        registry.list_projects().len(),
        registry
            .list_projects()
            .iter()
            .map(|project| project.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let state_path = args.state.clone().unwrap_or_else(default_state_path);
    let store = ConfigStore::open(state_path.clone())
        .with_context(|| format!("refusing to start with store {}", state_path.display()))?;
    info!("config store at {}", store.path().display());
    let logs_dir = args.logs_dir.clone().unwrap_or_else(default_logs_dir);

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("failed to bind control API: {}", args.listen))?;
    listener
        .set_nonblocking(true)
        .context("failed to set listener as non-blocking")?;

    let supervisor = Arc::new(Supervisor::new(
        registry,
        store,
        Arc::new(ChildLauncher::new(logs_dir.clone())),
        SupervisorOptions {
            stop_timeout: Duration::from_millis(args.stop_timeout_ms),
            crash_loop_window: Duration::from_millis(args.crash_loop_window_ms),
        },
    ));
    info!("project logs in {}", logs_dir.display());

    if let Err(err) = supervisor.startup() {
        error!("failed to start default project: {err}");
    }

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone());
    let monitor = supervisor.spawn_crash_monitor(
        Duration::from_millis(args.poll_interval_ms.max(10)),
        running.clone(),
    );

    info!("matrixd listening on {}", args.listen);
    http::serve(listener, supervisor.clone(), running);

    supervisor.shutdown();
    let _ = monitor.join();
    info!("matrixd shutdown complete");
    Ok(())
}

/// `MATRIXD_LOG` wins over `RUST_LOG`; an unparsable filter falls back to `info`.
fn init_logging() {
    let directives = log_directives(
        std::env::var("MATRIXD_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("matrixd: ignoring log filter '{directives}': {err}");
        EnvFilter::new(DEFAULT_LOG_DIRECTIVES)
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn log_directives(matrixd_log: Option<String>, rust_log: Option<String>) -> String {
    [matrixd_log, rust_log]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVES.to_string())
}

fn install_signal_handler(running: Arc<AtomicBool>) {
    static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
    }

    // Only an atomic store is async-signal-safe; propagate from a thread.
    thread::spawn(move || {
        while !SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
        info!("received signal, stopping active project and shutting down");
        running.store(false, Ordering::SeqCst);
    });
}
