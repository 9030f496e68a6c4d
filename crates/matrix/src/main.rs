use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use matrixd_types::client::{self, HttpReply};
use matrixd_types::{
    project_route, ActionResult, ConfigValues, DefaultProjectResult, ProjectConfigResult,
    ProjectListResult, StatusResult, UpdateConfigResult, ValueSpec, ACTION_CONFIG,
    ACTION_RESTART, ACTION_START, ACTION_STOP, API_DEFAULT_PROJECT, API_HEALTH, API_PROJECTS,
    API_STATUS, API_STOP, DEFAULT_SERVER_ADDR,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt::Write as _;

#[derive(Debug, Parser)]
#[command(name = "matrix", version, about = "CLI for the matrixd LED matrix supervisor")]
struct Cli {
    /// Daemon address as host:port.
    #[arg(long, env = "MATRIXD_ADDR", default_value = DEFAULT_SERVER_ADDR)]
    server: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show which project owns the display.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List projects with their config keys and current values.
    List,
    /// Start a project, replacing whatever is running.
    Start { name: String },
    /// Stop the running project, or only NAME if it is the one running.
    Stop { name: Option<String> },
    Restart { name: String },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show or change the project started when the daemon boots.
    Default {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
    /// Ping daemon health.
    Ping,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get {
        name: String,
    },
    /// Set values as KEY=VALUE; VALUE is read as JSON, falling back to a string.
    Set {
        name: String,
        #[arg(value_name = "KEY=VALUE", required = true)]
        assignments: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let server = cli.server.as_str();

    match cli.command {
        Commands::Status { json } => cmd_status(server, json),
        Commands::List => cmd_list(server),
        Commands::Start { name } => cmd_action(server, &project_route(&name, ACTION_START)),
        Commands::Stop { name: Some(name) } => {
            cmd_action(server, &project_route(&name, ACTION_STOP))
        }
        Commands::Stop { name: None } => cmd_action(server, API_STOP),
        Commands::Restart { name } => cmd_action(server, &project_route(&name, ACTION_RESTART)),
        Commands::Config { command } => match command {
            ConfigCommand::Get { name } => cmd_config_get(server, &name),
            ConfigCommand::Set { name, assignments } => {
                cmd_config_set(server, &name, &assignments)
            }
        },
        Commands::Default { name, clear } => cmd_default(server, name, clear),
        Commands::Ping => cmd_ping(server),
    }
}

fn call<R: DeserializeOwned>(
    server: &str,
    method: &str,
    path: &str,
    body: Option<&Value>,
) -> Result<R> {
    let reply = client::request(server, method, path, body)?;
    client::parse_ok_response(reply).with_context(|| format!("{method} {path} failed"))
}

fn cmd_status(server: &str, json_output: bool) -> Result<()> {
    let status: StatusResult = call(server, "GET", API_STATUS, None)?;
    print!("{}", format_status_output(&status, json_output)?);
    Ok(())
}

fn cmd_list(server: &str) -> Result<()> {
    let result: ProjectListResult = call(server, "GET", API_PROJECTS, None)?;
    for project in result.projects {
        let marker = if project.active { "*" } else { " " };
        println!("{marker} {}\t{}", project.name, project.display_name);
        for key in &project.keys {
            let current = project.config.get(&key.name).unwrap_or(&key.default);
            println!(
                "    {}={}\t{}{}",
                key.name,
                current,
                describe_spec(&key.spec),
                if key.hot_applicable { "" } else { " (restart)" }
            );
        }
    }
    Ok(())
}

fn cmd_action(server: &str, path: &str) -> Result<()> {
    let result: ActionResult = call(server, "POST", path, None)?;
    println!("{}", result.message);
    print!("{}", format_status_output(&result.status, false)?);
    print_warnings(&result.warnings);
    Ok(())
}

fn cmd_config_get(server: &str, name: &str) -> Result<()> {
    let result: ProjectConfigResult =
        call(server, "GET", &project_route(name, ACTION_CONFIG), None)?;
    print!("{}", format_config(&result.config));
    Ok(())
}

fn cmd_config_set(server: &str, name: &str, assignments: &[String]) -> Result<()> {
    let values = parse_assignments(assignments)?;
    let body = serde_json::to_value(&values).context("failed to serialize config values")?;
    let result: UpdateConfigResult = call(
        server,
        "POST",
        &project_route(name, ACTION_CONFIG),
        Some(&body),
    )?;
    println!(
        "updated {} ({})",
        result.project,
        serde_json::to_value(result.applied)
            .ok()
            .and_then(|mode| mode.as_str().map(str::to_string))
            .unwrap_or_default()
    );
    print!("{}", format_config(&result.config));
    print_warnings(&result.warnings);
    Ok(())
}

fn cmd_default(server: &str, name: Option<String>, clear: bool) -> Result<()> {
    let result: DefaultProjectResult = if name.is_none() && !clear {
        call(server, "GET", API_DEFAULT_PROJECT, None)?
    } else {
        call(
            server,
            "POST",
            API_DEFAULT_PROJECT,
            Some(&json!({ "project": name })),
        )?
    };
    match result.default_project {
        Some(name) => println!("default project: {name}"),
        None => println!("no default project"),
    }
    print_warnings(&result.warnings);
    Ok(())
}

fn cmd_ping(server: &str) -> Result<()> {
    let reply = client::request(server, "GET", API_HEALTH, None)?;
    print_ping(reply)
}

fn print_ping(reply: HttpReply) -> Result<()> {
    if !reply.response.ok {
        bail!(
            "daemon returned error: {}",
            reply
                .response
                .error
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&reply.response.result.unwrap_or_else(|| json!({})))
            .context("failed to format ping response")?
    );
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn parse_assignments(assignments: &[String]) -> Result<ConfigValues> {
    let mut values = ConfigValues::new();
    for assignment in assignments {
        let Some((key, raw)) = assignment.split_once('=') else {
            bail!("expected KEY=VALUE, got '{assignment}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("missing key in '{assignment}'");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!(raw));
        values.insert(key.to_string(), value);
    }
    Ok(values)
}

fn format_status_output(status: &StatusResult, json_output: bool) -> Result<String> {
    if json_output {
        return serde_json::to_string(status).context("failed to serialize status JSON");
    }
    let mut output = String::new();
    let _ = write!(
        output,
        "state={}\tproject={}\tdefault={}",
        status.state.as_str(),
        status.active_project.as_deref().unwrap_or("-"),
        status.default_project.as_deref().unwrap_or("-")
    );
    if let Some(process) = &status.process {
        let _ = write!(output, "\thandle={}", process.handle_id);
        if let Some(pid) = process.pid {
            let _ = write!(output, "\tpid={pid}");
        }
    }
    output.push('\n');
    Ok(output)
}

fn format_config(config: &ConfigValues) -> String {
    let mut output = String::new();
    for (key, value) in config {
        let _ = writeln!(output, "{key}={value}");
    }
    output
}

fn describe_spec(spec: &ValueSpec) -> String {
    match spec {
        ValueSpec::Boolean => "boolean".to_string(),
        ValueSpec::Integer { min, max } => format!("integer {min}..={max}"),
        ValueSpec::Choice { values } => format!("one of {}", values.join("|")),
        ValueSpec::Text => "text".to_string(),
    }
}
