use serde::{Deserialize, Serialize};

pub mod command;
pub mod server;

pub const UPDATE_ACTION: &str = "update_printer";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Error,
}

impl PrinterStatus {
    /// Maps the controller's `print_stats.state` onto the coarse status the
    /// server understands. Unknown states report as idle.
    pub fn from_controller_state(state: &str) -> Self {
        match state {
            "printing" | "paused" => Self::Printing,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub cpu_temp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFile {
    pub name: String,
    pub size: String,
    #[serde(default)]
    pub modified: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilamentInfo {
    pub material: String,
    pub color: String,
    pub remaining: f64,
}

impl Default for FilamentInfo {
    fn default() -> Self {
        Self {
            material: "PLA".to_string(),
            color: "Negro".to_string(),
            remaining: 100.0,
        }
    }
}

/// One status record pushed to the management server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub action: String,
    pub token: String,
    pub name: String,
    pub client_version: String,
    pub uptime: String,
    pub timestamp: String,
    pub status: PrinterStatus,
    pub temp_hotend: f64,
    pub temp_bed: f64,
    pub temp_hotend_target: f64,
    pub temp_bed_target: f64,
    pub print_speed: u32,
    pub fan_speed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetrics>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub filament: FilamentInfo,
    #[serde(default)]
    pub bed_status: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}
