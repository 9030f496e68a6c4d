use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::{ApiResponse, API_HEALTH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
// Stopping a display may wait out the daemon's full graceful-stop window.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpReply {
    pub status: u16,
    pub response: ApiResponse,
}

pub fn request(addr: &str, method: &str, path: &str, body: Option<&Value>) -> Result<HttpReply> {
    let socket_addr = addr
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve daemon address {addr}"))?
        .next()
        .with_context(|| format!("daemon address {addr} resolved to nothing"))?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)
        .with_context(|| format!("failed to connect to matrixd at {addr}"))?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .context("failed to set read timeout")?;

    let payload = match body {
        Some(value) => serde_json::to_vec(value).context("failed to serialize request body")?,
        None => Vec::new(),
    };
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream
        .write_all(head.as_bytes())
        .context("failed to write request head")?;
    stream
        .write_all(&payload)
        .context("failed to write request body")?;
    stream.flush().context("failed to flush request")?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .context("failed to read daemon response")?;
    parse_reply(&raw)
}

fn parse_reply(raw: &[u8]) -> Result<HttpReply> {
    let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        bail!("daemon returned a truncated HTTP response");
    };
    let head = std::str::from_utf8(&raw[..split]).context("response head is not UTF-8")?;
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .with_context(|| format!("malformed status line in response: {head}"))?;
    let body = &raw[split + 4..];
    let response = serde_json::from_slice::<ApiResponse>(body).with_context(|| {
        format!(
            "failed to parse daemon response (HTTP {status}): {}",
            String::from_utf8_lossy(body)
        )
    })?;
    Ok(HttpReply { status, response })
}

pub fn parse_ok_response<T: serde::de::DeserializeOwned>(reply: HttpReply) -> Result<T> {
    if !reply.response.ok {
        bail!(
            "daemon returned error ({}): {}",
            reply.status,
            reply
                .response
                .error
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
    serde_json::from_value(reply.response.result.unwrap_or(Value::Null))
        .context("failed to parse daemon response body")
}

pub fn wait_for_health(addr: &str, timeout: Duration) -> Result<HttpReply> {
    let attempts = (timeout.as_millis() / 100).max(1) as usize;
    let mut last_error: Option<anyhow::Error> = None;

    for _ in 0..attempts {
        match request(addr, "GET", API_HEALTH, None) {
            Ok(reply) => return Ok(reply),
            Err(err) => {
                last_error = Some(err);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("timed out waiting for matrixd")))
}
