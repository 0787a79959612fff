use crate::config::AgentConfig;
use crate::controller::Controller;
use crate::files::format_bytes;
use protocol::{PrinterStatus, RemoteFile, SystemMetrics, TelemetrySnapshot, UPDATE_ACTION};
use serde_json::Value;
use std::time::{Duration, UNIX_EPOCH};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MAX_REPORTED_FILES: usize = 50;

/// Raw controller data for one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct ControllerView {
    pub status: Value,
    pub last_job: Option<Value>,
    pub files: Vec<Value>,
}

/// Queries the controller and builds a fresh snapshot. Failed queries leave
/// the corresponding fields at their neutral values.
pub async fn collect(
    controller: &dyn Controller,
    config: &AgentConfig,
    uptime: Duration,
    image: Option<String>,
) -> TelemetrySnapshot {
    let view = ControllerView {
        status: controller.full_status().await,
        last_job: controller.job_history(1).await.into_iter().next(),
        files: controller.list_files().await,
    };
    build_snapshot(config, &view, uptime, crate::state::now_rfc3339(), image)
}

pub fn build_snapshot(
    config: &AgentConfig,
    view: &ControllerView,
    uptime: Duration,
    timestamp: String,
    image: Option<String>,
) -> TelemetrySnapshot {
    let status = &view.status;
    let print_stats = &status["print_stats"];
    let state = print_stats["state"].as_str().unwrap_or("unknown");
    let active = matches!(state, "printing" | "paused");

    let (progress, current_file, time_remaining) = if active {
        let total = number(&print_stats["total_duration"]);
        let elapsed = number(&print_stats["print_duration"]);
        (
            Some(percent(number(&status["display_status"]["progress"]))),
            Some(print_stats["filename"].as_str().unwrap_or_default().to_string()),
            (total > 0.0).then(|| ((total - elapsed) / 60.0).max(0.0) as u32),
        )
    } else {
        (None, None, None)
    };

    let system = status
        .get("system_stats")
        .filter(|stats| stats.as_object().is_some_and(|map| !map.is_empty()))
        .map(|stats| SystemMetrics {
            cpu_usage: round1(number(&stats["cpu_usage"])),
            memory_usage: round1(number(&stats["memavail"]) / 1024.0 / 1024.0),
            cpu_temp: round1(number(&stats["cputemp"])),
        });

    let files = view
        .files
        .iter()
        .take(MAX_REPORTED_FILES)
        .map(|file| RemoteFile {
            name: file["filename"]
                .as_str()
                .or_else(|| file["path"].as_str())
                .unwrap_or_default()
                .to_string(),
            size: format_bytes(number(&file["size"]).max(0.0) as u64),
            modified: number(&file["modified"]),
        })
        .collect();

    let printer_data = &config.printer_data;
    TelemetrySnapshot {
        action: UPDATE_ACTION.to_string(),
        token: config.printer_token.clone(),
        name: config.printer_name.clone(),
        client_version: CLIENT_VERSION.to_string(),
        uptime: format_uptime(uptime),
        timestamp,
        status: PrinterStatus::from_controller_state(state),
        temp_hotend: round1(number(&status["extruder"]["temperature"])),
        temp_bed: round1(number(&status["heater_bed"]["temperature"])),
        temp_hotend_target: round1(number(&status["extruder"]["target"])),
        temp_bed_target: round1(number(&status["heater_bed"]["target"])),
        print_speed: percent(status["gcode_move"]["speed_factor"].as_f64().unwrap_or(1.0)),
        fan_speed: percent(number(&status["fan"]["speed"])),
        progress,
        current_file,
        time_remaining,
        last_completed: view.last_job.as_ref().and_then(last_completed),
        system,
        files,
        tags: printer_data.tags.clone(),
        filament: printer_data.filament.clone(),
        bed_status: printer_data.bed_status.clone(),
        location: printer_data.location.clone(),
        image,
    }
}

/// `"<file> (HH:MM)"` for the most recent job, if it has an end time.
fn last_completed(job: &Value) -> Option<String> {
    let end = number(&job["end_time"]);
    if end <= 0.0 {
        return None;
    }
    let filename = job["filename"].as_str().unwrap_or_default();
    let at = UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(end).ok()?)?;
    let stamp = humantime::format_rfc3339_seconds(at).to_string();
    Some(format!("{filename} ({})", stamp.get(11..16).unwrap_or("--:--")))
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

fn number(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn percent(factor: f64) -> u32 {
    (factor * 100.0) as u32
}
