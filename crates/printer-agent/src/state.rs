use protocol::TelemetrySnapshot;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const DEFAULT_STATE_FILE: &str = "printer_state.json";
pub const PENDING_CAPACITY: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunStatistics {
    pub updates_sent: u64,
    pub updates_failed: u64,
    pub commands_received: u64,
    pub commands_executed: u64,
    pub reconnections: u64,
    pub files_downloaded: u64,
    pub pending_replayed: u64,
    pub pending_dropped: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingUpdate {
    pub timestamp: String,
    pub data: TelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    last_update: Option<String>,
    uptime_start: String,
    statistics: RunStatistics,
    pending_updates: VecDeque<PendingUpdate>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            last_update: None,
            uptime_start: now_rfc3339(),
            statistics: RunStatistics::default(),
            pending_updates: VecDeque::new(),
        }
    }
}

/// Run statistics and undelivered telemetry, mirrored to a JSON file.
///
/// Loading never fails: a missing or unreadable file starts from empty state.
/// Saving never fails either; write errors are logged and counted in
/// `persistence_failures`.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = load_state(&path);
        state.uptime_start = now_rfc3339();
        while state.pending_updates.len() > PENDING_CAPACITY {
            state.pending_updates.pop_front();
        }
        if !state.pending_updates.is_empty() {
            tracing::info!(
                pending = state.pending_updates.len(),
                "restored undelivered updates"
            );
        }
        Self { path, state }
    }

    pub fn stats(&self) -> &RunStatistics {
        &self.state.statistics
    }

    pub fn stats_mut(&mut self) -> &mut RunStatistics {
        &mut self.state.statistics
    }

    pub fn last_update(&self) -> Option<&str> {
        self.state.last_update.as_deref()
    }

    pub fn mark_update_delivered(&mut self) {
        self.state.last_update = Some(now_rfc3339());
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending_updates.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.state.pending_updates.iter()
    }

    /// Buffers a snapshot whose delivery was not confirmed, evicting the oldest
    /// entry when the queue is full, and persists immediately.
    pub fn enqueue_pending(&mut self, snapshot: TelemetrySnapshot) -> Option<PendingUpdate> {
        let evicted = if self.state.pending_updates.len() >= PENDING_CAPACITY {
            self.state.pending_updates.pop_front()
        } else {
            None
        };
        if let Some(evicted) = evicted.as_ref() {
            tracing::warn!(
                evicted_at = %evicted.timestamp,
                "pending queue full, dropped oldest update"
            );
        }
        self.state.pending_updates.push_back(PendingUpdate {
            timestamp: now_rfc3339(),
            data: snapshot,
        });
        self.save();
        evicted
    }

    /// Returns every buffered update in arrival order and empties the queue.
    /// The drain is destructive: whatever the caller fails to redeliver is gone.
    pub fn drain_pending(&mut self) -> Vec<PendingUpdate> {
        if self.state.pending_updates.is_empty() {
            return Vec::new();
        }
        let drained: Vec<PendingUpdate> = self.state.pending_updates.drain(..).collect();
        self.save();
        drained
    }

    pub fn save(&mut self) -> bool {
        match write_atomic(&self.path, &self.state) {
            Ok(()) => true,
            Err(err) => {
                self.state.statistics.persistence_failures += 1;
                tracing::warn!(
                    error = %err,
                    path = %self.path.display(),
                    failures = self.state.statistics.persistence_failures,
                    "failed to persist agent state"
                );
                false
            }
        }
    }
}

fn load_state(path: &Path) -> PersistedState {
    let payload = match fs::read(path) {
        Ok(payload) => payload,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return PersistedState::default(),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "failed to read state, starting fresh");
            return PersistedState::default();
        }
    };
    match serde_json::from_slice(&payload) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "corrupt state file, starting fresh");
            PersistedState::default()
        }
    }
}

fn write_atomic(path: &Path, state: &PersistedState) -> io::Result<()> {
    let payload = serde_json::to_vec_pretty(state)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)
}

pub fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}
