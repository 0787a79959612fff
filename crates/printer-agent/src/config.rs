use anyhow::Context;
use protocol::FilamentInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "printer_config.json";

const REQUIRED_FIELDS: &[&str] = &["server_url", "printer_token", "printer_name", "moonraker_url"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    pub printer_token: String,
    pub printer_name: String,
    pub moonraker_url: String,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default)]
    pub file_management: FileManagementConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub auto_update: AutoUpdateConfig,
    #[serde(default)]
    pub printer_data: PrinterDataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub resolution: String,
    pub capture_interval: u64,
    pub timelapse_enabled: bool,
    pub timelapse_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub status_update: f64,
    pub command_check: f64,
    pub health_check: f64,
    pub reconnect_attempt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub moonraker: f64,
    pub server: f64,
    pub camera: f64,
    pub file_download: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub exponential_backoff: bool,
    pub base_delay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileManagementConfig {
    pub auto_cleanup: bool,
    pub max_age_days: u64,
    pub verify_checksums: bool,
    pub gcode_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub max_size_mb: u64,
    pub backup_count: usize,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub validate_dangerous_commands: bool,
    pub rate_limit_seconds: f64,
    pub allowed_gcode_patterns: Vec<String>,
}

/// Accepted for compatibility with existing config files; the agent does not
/// update itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoUpdateConfig {
    pub enabled: bool,
    pub check_interval: u64,
    pub update_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterDataConfig {
    pub tags: Vec<String>,
    pub filament: FilamentInfo,
    pub bed_status: String,
    pub location: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "https://tmeduca.org/printerhub/api.php".to_string(),
            printer_token: "TECMED_PRINTER_001".to_string(),
            printer_name: "Mi Impresora 3D".to_string(),
            moonraker_url: "http://localhost:7125".to_string(),
            camera: CameraConfig::default(),
            intervals: IntervalsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            retries: RetryConfig::default(),
            file_management: FileManagementConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            auto_update: AutoUpdateConfig::default(),
            printer_data: PrinterDataConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            urls: vec!["http://localhost:8080/?action=snapshot".to_string()],
            resolution: "high".to_string(),
            capture_interval: 30,
            timelapse_enabled: true,
            timelapse_interval: 60,
        }
    }
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            status_update: 5.0,
            command_check: 3.0,
            health_check: 60.0,
            reconnect_attempt: 10.0,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            moonraker: 5.0,
            server: 10.0,
            camera: 5.0,
            file_download: 60.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            exponential_backoff: true,
            base_delay: 2.0,
        }
    }
}

impl Default for FileManagementConfig {
    fn default() -> Self {
        Self {
            auto_cleanup: true,
            max_age_days: 30,
            verify_checksums: true,
            gcode_directory: PathBuf::from("/home/pi/printer_data/gcodes"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            max_size_mb: 10,
            backup_count: 5,
            verbose: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            validate_dangerous_commands: true,
            rate_limit_seconds: 1.0,
            allowed_gcode_patterns: vec!["G*".to_string(), "M*".to_string(), "T*".to_string()],
        }
    }
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: 3600,
            update_url: String::new(),
        }
    }
}

impl Default for PrinterDataConfig {
    fn default() -> Self {
        Self {
            tags: vec!["Prusa".to_string(), "PLA".to_string()],
            filament: FilamentInfo::default(),
            bed_status: "limpia".to_string(),
            location: "Lab Principal".to_string(),
        }
    }
}

impl IntervalsConfig {
    pub fn status_update(&self) -> Duration {
        secs(self.status_update)
    }

    pub fn command_check(&self) -> Duration {
        secs(self.command_check)
    }

    pub fn health_check(&self) -> Duration {
        secs(self.health_check)
    }
}

impl TimeoutsConfig {
    pub fn moonraker(&self) -> Duration {
        secs(self.moonraker)
    }

    pub fn server(&self) -> Duration {
        secs(self.server)
    }

    pub fn camera(&self) -> Duration {
        secs(self.camera)
    }

    pub fn file_download(&self) -> Duration {
        secs(self.file_download)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl AgentConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("server_url", &self.server_url),
            ("printer_token", &self.printer_token),
            ("moonraker_url", &self.moonraker_url),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{name} cannot be empty");
            }
        }
        if self.retries.max_attempts == 0 {
            anyhow::bail!("retries.max_attempts must be at least 1");
        }
        for (name, value) in [
            ("intervals.status_update", self.intervals.status_update),
            ("intervals.command_check", self.intervals.command_check),
            ("intervals.health_check", self.intervals.health_check),
        ] {
            if !(value > 0.0) {
                anyhow::bail!("{name} must be positive");
            }
        }
        Ok(())
    }
}

/// The full default document, as written on first run.
pub fn default_document() -> Value {
    serde_json::to_value(AgentConfig::default()).unwrap_or(Value::Null)
}

/// Recursively overlays `overrides` onto `defaults`. Objects merge key by key;
/// every other value in `overrides` replaces the default outright.
pub fn merge_with_defaults(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(custom)) => {
            let mut merged = base.clone();
            for (key, value) in custom {
                let next = match merged.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_with_defaults(existing, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, custom) => custom.clone(),
    }
}

fn validate_required(raw: &Value) -> anyhow::Result<()> {
    let Some(object) = raw.as_object() else {
        anyhow::bail!("config root must be a JSON object");
    };
    for field in REQUIRED_FIELDS {
        if !object.contains_key(*field) {
            anyhow::bail!("missing required field: {field}");
        }
    }
    Ok(())
}

pub fn parse_config(raw: &str) -> anyhow::Result<AgentConfig> {
    let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
    validate_required(&value)?;
    let merged = merge_with_defaults(&default_document(), &value);
    let config: AgentConfig = serde_json::from_value(merged).context("invalid config value")?;
    config.validate()?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_vec_pretty(&default_document())?;
    std::fs::write(path, payload)
        .with_context(|| format!("failed to write config {}", path.display()))?;
    Ok(())
}

pub enum LoadOutcome {
    Loaded(ConfigManager),
    /// No file existed; a default one was written and needs editing.
    CreatedDefault(PathBuf),
}

#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    config: AgentConfig,
}

impl ConfigManager {
    pub fn load_or_create(path: &Path) -> anyhow::Result<LoadOutcome> {
        if !path.exists() {
            write_default_config(path)?;
            return Ok(LoadOutcome::CreatedDefault(path.to_path_buf()));
        }
        let config = load_config(path)?;
        Ok(LoadOutcome::Loaded(Self {
            path: path.to_path_buf(),
            config,
        }))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn into_config(self) -> AgentConfig {
        self.config
    }

    /// Re-reads the file. The running agent keeps its startup config; this is
    /// for tooling that wants to pick up edits.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        self.config = load_config(&self.path)?;
        Ok(())
    }
}

fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}
