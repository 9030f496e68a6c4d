use anyhow::{Context, Result};
use matrixd_types::{
    ApiResponse, ConfigValues, DefaultProjectParams, DefaultProjectResult, HealthResult,
    ACTION_CONFIG, ACTION_RESTART, ACTION_START, ACTION_STOP, API_DEFAULT_PROJECT, API_HEALTH,
    API_PROJECTS, API_STATUS, API_STOP,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SupervisorError;
use crate::supervisor::Supervisor;

const MAX_CONCURRENT_STREAMS: usize = 64;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const HEADER_LIMIT_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

const STATUS_OK: &str = "200 OK";
const STATUS_NO_CONTENT: &str = "204 No Content";
const STATUS_BAD_REQUEST: &str = "400 Bad Request";
const STATUS_NOT_FOUND: &str = "404 Not Found";
const STATUS_METHOD_NOT_ALLOWED: &str = "405 Method Not Allowed";
const STATUS_REQUEST_TIMEOUT: &str = "408 Request Timeout";
const STATUS_PAYLOAD_TOO_LARGE: &str = "413 Payload Too Large";
const STATUS_HEADER_TOO_LARGE: &str = "431 Request Header Fields Too Large";
const STATUS_INTERNAL: &str = "500 Internal Server Error";
const STATUS_UNAVAILABLE: &str = "503 Service Unavailable";

const WEB_INDEX_HTML: &str = include_str!("../web/index.html");
const WEB_STYLE_CSS: &str = include_str!("../web/style.css");
const WEB_APP_JS: &str = include_str!("../web/app.js");

/// Accepts control connections until `running` is cleared, one thread per
/// connection.
pub fn serve(listener: TcpListener, supervisor: Arc<Supervisor>, running: Arc<AtomicBool>) {
    let active_streams = Arc::new(AtomicUsize::new(0));
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let in_flight = active_streams.fetch_add(1, Ordering::SeqCst);
                if in_flight >= MAX_CONCURRENT_STREAMS {
                    active_streams.fetch_sub(1, Ordering::SeqCst);
                    warn!(
                        "dropped connection from {peer}: too many active requests (limit={MAX_CONCURRENT_STREAMS})"
                    );
                    let busy = Reply::error(STATUS_UNAVAILABLE, "busy", "server is busy");
                    let _ = write_reply(&mut stream, &busy);
                    continue;
                }
                let supervisor = supervisor.clone();
                let active_streams = active_streams.clone();
                thread::spawn(move || {
                    let _guard = StreamGuard::new(active_streams);
                    if let Err(err) = handle_stream(stream, &supervisor) {
                        warn!("control request from {peer} failed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                warn!("accept error: {err}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

struct StreamGuard {
    active_streams: Arc<AtomicUsize>,
}

impl StreamGuard {
    fn new(active_streams: Arc<AtomicUsize>) -> Self {
        Self { active_streams }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_stream(mut client: TcpStream, supervisor: &Supervisor) -> Result<()> {
    client
        .set_nonblocking(false)
        .context("failed to make control stream blocking")?;
    client
        .set_read_timeout(Some(HEADER_TIMEOUT))
        .context("failed to configure header timeout")?;
    let request = match read_request(&mut client) {
        Ok(request) => request,
        Err(reply) => return write_reply(&mut client, &reply),
    };
    client
        .set_read_timeout(None)
        .context("failed to clear header timeout")?;

    debug!("{} {}", request.method, request.path);
    match request.method.as_str() {
        "OPTIONS" => return write_response(&mut client, STATUS_NO_CONTENT, None, &[]),
        "GET" => {
            if let Some((content_type, body)) = web_asset(&request.path) {
                return write_response(&mut client, STATUS_OK, Some(content_type), body);
            }
        }
        _ => {}
    }
    let reply = dispatch(supervisor, &request.method, &request.path, &request.body);
    write_reply(&mut client, &reply)
}

/// Files of the browser control panel, served from the binary.
fn web_asset(path: &str) -> Option<(&'static str, &'static [u8])> {
    let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
    match path {
        "/" | "/index.html" => Some(("text/html; charset=utf-8", WEB_INDEX_HTML.as_bytes())),
        "/style.css" => Some(("text/css; charset=utf-8", WEB_STYLE_CSS.as_bytes())),
        "/app.js" => Some((
            "application/javascript; charset=utf-8",
            WEB_APP_JS.as_bytes(),
        )),
        _ => None,
    }
}

#[derive(Debug)]
struct Reply {
    status: &'static str,
    response: ApiResponse,
}

impl Reply {
    fn ok<T: Serialize>(result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                status: STATUS_OK,
                response: ApiResponse::ok(value),
            },
            Err(err) => Self::error(
                STATUS_INTERNAL,
                "internal_error",
                format!("failed to serialize result: {err}"),
            ),
        }
    }

    fn error(status: &'static str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            response: ApiResponse::err(kind, message),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, SupervisorError>) -> Self {
        match result {
            Ok(value) => Self::ok(&value),
            Err(err) => Self::error(err.http_status(), err.kind(), err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Status,
    Projects,
    StopActive,
    DefaultProject,
    Project { name: &'a str, action: &'a str },
}

impl Route<'_> {
    fn allowed_methods(self) -> &'static [&'static str] {
        match self {
            Route::Health | Route::Status | Route::Projects => &["GET"],
            Route::StopActive => &["POST"],
            Route::DefaultProject => &["GET", "POST"],
            Route::Project { action, .. } if action == ACTION_CONFIG => &["GET", "POST"],
            Route::Project { .. } => &["POST"],
        }
    }
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
    match path {
        API_HEALTH => return Some(Route::Health),
        API_STATUS => return Some(Route::Status),
        API_PROJECTS => return Some(Route::Projects),
        API_STOP => return Some(Route::StopActive),
        API_DEFAULT_PROJECT => return Some(Route::DefaultProject),
        _ => {}
    }
    let rest = path.strip_prefix(API_PROJECTS)?.strip_prefix('/')?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() || action.contains('/') {
        return None;
    }
    matches!(
        action,
        ACTION_START | ACTION_STOP | ACTION_RESTART | ACTION_CONFIG
    )
    .then_some(Route::Project { name, action })
}

fn dispatch(supervisor: &Supervisor, method: &str, path: &str, body: &[u8]) -> Reply {
    let Some(route) = parse_route(path) else {
        return Reply::error(STATUS_NOT_FOUND, "not_found", format!("no route for {path}"));
    };
    if !route.allowed_methods().contains(&method) {
        return Reply::error(
            STATUS_METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{method} is not allowed on {path}"),
        );
    }

    match (method, route) {
        ("GET", Route::Health) => Reply::ok(&HealthResult {
            daemon: "matrixd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        ("GET", Route::Status) => Reply::ok(&supervisor.status()),
        ("GET", Route::Projects) => Reply::ok(&supervisor.list_projects()),
        ("POST", Route::StopActive) => Reply::ok(&supervisor.stop_project()),
        ("GET", Route::DefaultProject) => Reply::ok(&DefaultProjectResult {
            default_project: supervisor.default_project(),
            warnings: Vec::new(),
        }),
        ("POST", Route::DefaultProject) => match parse_body::<DefaultProjectParams>(body) {
            Ok(params) => {
                Reply::from_result(supervisor.set_default_project(params.project.as_deref()))
            }
            Err(reply) => reply,
        },
        ("GET", Route::Project { name, .. }) => Reply::from_result(supervisor.get_config(name)),
        ("POST", Route::Project { name, action }) => match action {
            ACTION_START => Reply::from_result(supervisor.start_project(name)),
            ACTION_STOP => Reply::from_result(supervisor.stop_project_named(name)),
            ACTION_RESTART => Reply::from_result(supervisor.restart_project(name)),
            _ => match parse_body::<ConfigValues>(body) {
                Ok(values) => Reply::from_result(supervisor.update_config(name, &values)),
                Err(reply) => reply,
            },
        },
        _ => Reply::error(
            STATUS_METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{method} is not allowed on {path}"),
        ),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Reply> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Reply::error(
            STATUS_BAD_REQUEST,
            "invalid_request",
            "request body is required",
        ));
    }
    serde_json::from_slice(body).map_err(|err| {
        Reply::error(
            STATUS_BAD_REQUEST,
            "invalid_request",
            format!("invalid JSON body: {err}"),
        )
    })
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> Result<()> {
    let body = serde_json::to_vec(&reply.response).context("failed to serialize response")?;
    write_response(stream, reply.status, Some("application/json"), &body)
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    content_length: usize,
}

fn bad_request(message: impl Into<String>) -> Reply {
    Reply::error(STATUS_BAD_REQUEST, "invalid_request", message)
}

/// Reads one request. Anything unreadable comes back as the reply to send.
fn read_request<S: Read>(stream: &mut S) -> Result<Request, Reply> {
    let (buffer, head_end) = read_http_head(stream)?;
    let head = parse_request_head(&buffer[..head_end])?;
    if head.content_length > MAX_BODY_BYTES {
        return Err(Reply::error(
            STATUS_PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {MAX_BODY_BYTES} bytes"),
        ));
    }

    let mut body = buffer[head_end..].to_vec();
    body.truncate(head.content_length);
    if body.len() < head.content_length {
        let mut rest = vec![0_u8; head.content_length - body.len()];
        stream
            .read_exact(&mut rest)
            .map_err(|err| read_failure(&err, "request body"))?;
        body.extend_from_slice(&rest);
    }
    Ok(Request {
        method: head.method,
        path: head.path,
        body,
    })
}

fn read_failure(err: &io::Error, what: &str) -> Reply {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Reply::error(
            STATUS_REQUEST_TIMEOUT,
            "request_timeout",
            format!("{what} not received within {}s", HEADER_TIMEOUT.as_secs()),
        ),
        io::ErrorKind::UnexpectedEof => bad_request(format!("connection closed during {what}")),
        _ => bad_request(format!("failed to read {what}: {err}")),
    }
}

/// Returns everything read so far and the offset just past the blank line.
fn read_http_head<S: Read>(stream: &mut S) -> Result<(Vec<u8>, usize), Reply> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0_u8; 4096];
    loop {
        let head_end = buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i + 4);
        if head_end.unwrap_or(buffer.len()) > HEADER_LIMIT_BYTES {
            return Err(Reply::error(
                STATUS_HEADER_TOO_LARGE,
                "header_too_large",
                format!("request head exceeds {HEADER_LIMIT_BYTES} bytes"),
            ));
        }
        if let Some(end) = head_end {
            return Ok((buffer, end));
        }
        match stream.read(&mut chunk) {
            Ok(0) if buffer.is_empty() => return Err(bad_request("empty request")),
            Ok(0) => return Err(bad_request("connection closed before end of request head")),
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(read_failure(&err, "request head")),
        }
    }
}

fn parse_request_head(head: &[u8]) -> Result<RequestHead, Reply> {
    let text = std::str::from_utf8(head).map_err(|_| bad_request("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(path)) = (request_line.next(), request_line.next()) else {
        return Err(bad_request("malformed request line"));
    };

    let mut content_length = 0;
    for (name, value) in lines.filter_map(|line| line.split_once(':')) {
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| bad_request(format!("invalid Content-Length: {}", value.trim())))?;
        }
    }
    Ok(RequestHead {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        content_length,
    })
}

fn response_head(status: &str, content_type: Option<&str>, content_length: usize) -> String {
    let mut head = format!("HTTP/1.1 {status}\r\n");
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {content_length}\r\n\
Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type\r\n\
Connection: close\r\n\r\n"
    ));
    head
}

fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<()> {
    let head = response_head(status, content_type, body.len());
    stream
        .write_all(head.as_bytes())
        .and_then(|()| stream.write_all(body))
        .with_context(|| format!("failed to write {status} response"))
}
