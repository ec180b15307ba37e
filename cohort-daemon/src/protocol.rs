//! Newline-delimited JSON over the daemon's Unix socket.
//!
//! A client writes one `{"cmd": "..."}` line per request and reads one
//! response line back. Unknown commands are answered with `ok: false`.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};

/// Longest a client waits for the daemon to answer.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between connection attempts while the daemon binds.
const CONNECT_RETRY_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Runtime counters plus the instance's heartbeat and held locks.
    Status,
    /// Refresh the heartbeat now.
    Ping,
    /// Full stale sweep now.
    Sweep,
    /// Deregister and exit.
    Stop,
}

impl DaemonRequest {
    pub fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Sweep => "sweep",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Payload of a successful response; a failed one becomes
    /// [`DaemonError::Protocol`].
    pub fn into_data(self) -> Result<Value, DaemonError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self
            .error
            .unwrap_or_else(|| "daemon reported an error without a message".to_string());
        Err(DaemonError::Protocol(message))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking client for one daemon socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
    connect_attempts: u32,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            connect_attempts: 1,
        }
    }

    /// Retry connecting while the socket is absent or refusing, for callers
    /// racing a daemon that is still starting.
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `request` and return the response payload.
    pub fn call(&self, request: DaemonRequest) -> Result<Value, DaemonError> {
        self.exchange(request)?.into_data()
    }

    /// Send `request` and return the raw response.
    pub fn exchange(&self, request: DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let mut stream = self.connect()?;
        stream
            .set_read_timeout(Some(RESPONSE_TIMEOUT))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut answer = String::new();
        let read = BufReader::new(stream)
            .read_line(&mut answer)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(format!(
                "daemon hung up without answering '{}'",
                request.name()
            )));
        }
        Ok(serde_json::from_str(answer.trim_end())?)
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        let mut attempt = 1;
        loop {
            match self.try_connect() {
                Err(DaemonError::DaemonNotRunning { .. }) if attempt < self.connect_attempts => {
                    std::thread::sleep(CONNECT_RETRY_STEP);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn try_connect(&self) -> Result<UnixStream, DaemonError> {
        let not_running = || DaemonError::DaemonNotRunning {
            socket: self.socket.clone(),
        };
        if !self.socket.exists() {
            return Err(not_running());
        }
        UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                not_running()
            }
            _ => io_err(&self.socket, err),
        })
    }
}

/// Status payload. Retries briefly so it works right after `daemon start`.
pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    DaemonClient::new(socket)
        .with_connect_attempts(5)
        .call(DaemonRequest::Status)
}

pub fn request_ping(socket: &Path) -> Result<Value, DaemonError> {
    DaemonClient::new(socket).call(DaemonRequest::Ping)
}

pub fn request_sweep(socket: &Path) -> Result<Value, DaemonError> {
    DaemonClient::new(socket).call(DaemonRequest::Sweep)
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    DaemonClient::new(socket)
        .call(DaemonRequest::Stop)
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_socket_means_not_running() {
        let dir = TempDir::new().unwrap();
        let client = DaemonClient::new(dir.path().join("none.sock")).with_connect_attempts(2);
        let err = client.call(DaemonRequest::Status).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn requests_are_tagged_by_cmd() {
        assert_eq!(
            serde_json::to_string(&DaemonRequest::Sweep).unwrap(),
            r#"{"cmd":"sweep"}"#
        );
        let parsed: DaemonRequest = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(parsed, DaemonRequest::Stop);
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn failed_response_becomes_protocol_error() {
        let err = DaemonResponse::error("nope").into_data().unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(m) if m == "nope"));
    }

    #[test]
    fn ok_response_omits_error_field() {
        let encoded = serde_json::to_string(&DaemonResponse::ok(serde_json::json!(1))).unwrap();
        assert_eq!(encoded, r#"{"ok":true,"data":1}"#);
    }
}
