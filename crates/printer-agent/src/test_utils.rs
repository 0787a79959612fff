use crate::controller::Controller;
use crate::files::{DownloadError, GcodeStore};
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use protocol::{FilamentInfo, PrinterStatus, TelemetrySnapshot, UPDATE_ACTION};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!("{prefix}-{nanos}-{seq}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn sample_snapshot() -> TelemetrySnapshot {
    TelemetrySnapshot {
        action: UPDATE_ACTION.to_string(),
        token: "TOKEN_1".to_string(),
        name: "bench".to_string(),
        client_version: "0.1.0".to_string(),
        uptime: "0h 1m".to_string(),
        timestamp: "2026-01-01T00:00:00Z".to_string(),
        status: PrinterStatus::Idle,
        temp_hotend: 21.0,
        temp_bed: 20.0,
        temp_hotend_target: 0.0,
        temp_bed_target: 0.0,
        print_speed: 100,
        fan_speed: 0,
        progress: None,
        current_file: None,
        time_remaining: None,
        last_completed: None,
        system: None,
        files: Vec::new(),
        tags: Vec::new(),
        filament: FilamentInfo::default(),
        bed_status: String::new(),
        location: String::new(),
        image: None,
    }
}

pub(crate) fn json_response(value: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: Bytes::from(value.to_string()),
    }
}

pub(crate) fn status_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        body: Bytes::new(),
    }
}

type Responder =
    dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Scripted backend. The responder sees each request together with how many
/// earlier requests went to the same URL.
pub(crate) struct FakeBackend {
    responder: Box<Responder>,
    latency: Duration,
    calls: Mutex<Vec<(HttpRequest, Instant)>>,
    per_url: Mutex<HashMap<String, usize>>,
}

impl FakeBackend {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_latency(Duration::ZERO, responder)
    }

    pub(crate) fn with_latency<F>(latency: Duration, responder: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency,
            calls: Mutex::new(Vec::new()),
            per_url: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    async fn respond(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.clone(), Instant::now()));
        let index = {
            let mut per_url = self.per_url.lock().expect("per-url lock");
            let counter = per_url.entry(request.url.clone()).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.responder)(request, index)
    }
}

#[async_trait]
impl HttpBackend for FakeBackend {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.respond(request).await
    }

    async fn download_to(&self, request: &HttpRequest, dest: &Path) -> Result<u64, TransportError> {
        let response = self.respond(request).await?;
        if !response.is_success() {
            return Err(TransportError::Status(response.status));
        }
        fs::write(dest, &response.body).map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(response.body.len() as u64)
    }
}

#[derive(Default)]
struct ControllerState {
    status: Value,
    history: Vec<Value>,
    files: Vec<Value>,
    info: Value,
    connection: VecDeque<bool>,
    connected: bool,
    failing_endpoints: HashSet<String>,
    commands: Vec<(String, Option<Value>)>,
}

/// In-memory controller that records every command it is sent.
pub(crate) struct FakeController {
    state: Mutex<ControllerState>,
}

impl FakeController {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                status: json!({}),
                info: json!({"state": "ready"}),
                connected: true,
                ..ControllerState::default()
            }),
        }
    }

    pub(crate) fn set_status(&self, status: Value) {
        self.state.lock().expect("controller lock").status = status;
    }

    pub(crate) fn set_history(&self, jobs: Vec<Value>) {
        self.state.lock().expect("controller lock").history = jobs;
    }

    pub(crate) fn set_files(&self, files: Vec<Value>) {
        self.state.lock().expect("controller lock").files = files;
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock().expect("controller lock");
        state.connection.clear();
        state.connected = connected;
    }

    /// Answers for the next connection probes; once used up the last value
    /// given to `set_connected` applies.
    pub(crate) fn script_connection(&self, probes: &[bool]) {
        self.state
            .lock()
            .expect("controller lock")
            .connection
            .extend(probes.iter().copied());
    }

    pub(crate) fn fail_endpoint(&self, endpoint: &str) {
        self.state
            .lock()
            .expect("controller lock")
            .failing_endpoints
            .insert(endpoint.to_string());
    }

    pub(crate) fn commands(&self) -> Vec<(String, Option<Value>)> {
        self.state.lock().expect("controller lock").commands.clone()
    }

    pub(crate) fn endpoints(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|(endpoint, _)| endpoint)
            .collect()
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(endpoint, _)| endpoint == "printer/gcode/script")
            .filter_map(|(_, body)| {
                body.and_then(|body| body.get("script").and_then(Value::as_str).map(String::from))
            })
            .collect()
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn check_connection(&self) -> bool {
        let mut state = self.state.lock().expect("controller lock");
        match state.connection.pop_front() {
            Some(answer) => answer,
            None => state.connected,
        }
    }

    async fn query(&self, endpoint: &str) -> Option<Value> {
        let state = self.state.lock().expect("controller lock");
        if endpoint.starts_with("printer/objects/query") {
            Some(json!({ "status": state.status.clone() }))
        } else if endpoint.starts_with("server/history/list") {
            Some(json!({ "jobs": state.history.clone() }))
        } else if endpoint.starts_with("server/files/list") {
            Some(Value::Array(state.files.clone()))
        } else if endpoint == "printer/info" {
            Some(state.info.clone())
        } else {
            None
        }
    }

    async fn command(&self, endpoint: &str, body: Option<Value>) -> bool {
        let mut state = self.state.lock().expect("controller lock");
        state.commands.push((endpoint.to_string(), body));
        !state
            .failing_endpoints
            .iter()
            .any(|failing| endpoint.starts_with(failing.as_str()))
    }
}

/// Gcode directory stand-in: a set of present names and a scripted download
/// result.
pub(crate) struct FakeStore {
    present: Mutex<HashSet<String>>,
    fail_downloads: bool,
    downloads: Mutex<Vec<(String, String, Option<String>)>>,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self {
            present: Mutex::new(HashSet::new()),
            fail_downloads: false,
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_downloads: true,
            ..Self::new()
        }
    }

    pub(crate) fn with_file(self, name: &str) -> Self {
        self.present
            .lock()
            .expect("store lock")
            .insert(name.to_string());
        self
    }

    pub(crate) fn downloads(&self) -> Vec<(String, String, Option<String>)> {
        self.downloads.lock().expect("store lock").clone()
    }
}

#[async_trait]
impl GcodeStore for FakeStore {
    fn contains(&self, name: &str) -> bool {
        self.present.lock().expect("store lock").contains(name)
    }

    async fn download(
        &self,
        name: &str,
        url: &str,
        checksum: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        self.downloads.lock().expect("store lock").push((
            name.to_string(),
            url.to_string(),
            checksum.map(String::from),
        ));
        if self.fail_downloads {
            return Err(DownloadError::Transport(TransportError::Connect(
                "refused".to_string(),
            )));
        }
        self.present
            .lock()
            .expect("store lock")
            .insert(name.to_string());
        Ok(PathBuf::from("/gcodes").join(name))
    }

    fn cleanup_old_files(&self) -> usize {
        0
    }
}
