use crate::config::SecurityConfig;
use crate::controller::Controller;
use crate::files::GcodeStore;
use protocol::command::Command;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Unrecognized(String),
    Malformed { action: String, reason: String },
    RateLimited { retry_in: Duration },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(action) => write!(f, "unknown action {action:?}"),
            Self::Malformed { action, reason } => write!(f, "malformed {action}: {reason}"),
            Self::RateLimited { retry_in } => {
                write!(f, "rate limited, retry in {}", humantime::format_duration(*retry_in))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rejected(Rejection),
    Executed { success: bool, downloaded: bool },
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Executed { success: true, .. })
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub action: String,
    pub success: bool,
}

/// Screens inbound commands and turns the accepted ones into controller calls.
///
/// Checks run in a fixed order: classification, then rate limit. A command
/// that clears both is dispatched and recorded. The security check after them
/// only warns: dangerous actions and gcode lines outside
/// `allowed_gcode_patterns` are logged and still executed.
pub struct CommandGate {
    rate_limit: Duration,
    validate: bool,
    gcode_patterns: Vec<Regex>,
    last_accepted: Option<Instant>,
    history: VecDeque<HistoryEntry>,
}

impl CommandGate {
    pub fn new(config: &SecurityConfig) -> Self {
        let gcode_patterns = config
            .allowed_gcode_patterns
            .iter()
            .filter_map(|pattern| match glob_to_regex(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    tracing::warn!(pattern, error = %err, "ignoring invalid gcode pattern");
                    None
                }
            })
            .collect();
        Self {
            rate_limit: Duration::try_from_secs_f64(config.rate_limit_seconds.max(0.0))
                .unwrap_or(Duration::MAX),
            validate: config.validate_dangerous_commands,
            gcode_patterns,
            last_accepted: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub async fn process(
        &mut self,
        command: Command,
        controller: &dyn Controller,
        store: &dyn GcodeStore,
    ) -> Outcome {
        let action = command.action().to_string();
        if let Err(rejection) = self.screen(&command) {
            tracing::warn!(action = %action, reason = %rejection, "command rejected");
            return Outcome::Rejected(rejection);
        }

        tracing::info!(action = %action, "executing command");
        let (success, downloaded) = dispatch(&command, controller, store).await;
        if success {
            tracing::info!(action = %action, "command succeeded");
        } else {
            tracing::error!(action = %action, "command failed");
        }
        self.record(action, success);
        Outcome::Executed {
            success,
            downloaded,
        }
    }

    fn screen(&mut self, command: &Command) -> Result<(), Rejection> {
        match command {
            Command::Unrecognized { action } => {
                return Err(Rejection::Unrecognized(action.clone()))
            }
            Command::Malformed { action, reason } => {
                return Err(Rejection::Malformed {
                    action: action.clone(),
                    reason: reason.clone(),
                })
            }
            _ => {}
        }

        let now = Instant::now();
        if let Some(last) = self.last_accepted {
            let elapsed = now.duration_since(last);
            if elapsed < self.rate_limit {
                return Err(Rejection::RateLimited {
                    retry_in: self.rate_limit - elapsed,
                });
            }
        }
        self.last_accepted = Some(now);

        if !self.validate {
            return Ok(());
        }
        if command.is_dangerous() {
            tracing::warn!(action = command.action(), "dangerous command");
        }
        if let Command::Gcode { gcode } = command {
            if let Some(line) = self.unlisted_gcode_line(gcode) {
                tracing::warn!(line, "gcode outside allowed patterns");
            }
        }
        Ok(())
    }

    /// First non-comment line that matches none of the allowed patterns.
    fn unlisted_gcode_line<'a>(&self, script: &'a str) -> Option<&'a str> {
        if self.gcode_patterns.is_empty() {
            return None;
        }
        script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(';'))
            .find(|line| !self.gcode_patterns.iter().any(|regex| regex.is_match(line)))
    }

    fn record(&mut self, action: String, success: bool) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            timestamp: crate::state::now_rfc3339(),
            action,
            success,
        });
    }
}

async fn dispatch(
    command: &Command,
    controller: &dyn Controller,
    store: &dyn GcodeStore,
) -> (bool, bool) {
    if let Some(axis) = command.home_axis() {
        let script = match axis {
            Some(axis) => format!("G28 {}", axis.letter()),
            None => "G28".to_string(),
        };
        return (controller.execute_gcode(&script).await, false);
    }
    let success = match command {
        Command::Heat {
            hotend_temp,
            bed_temp,
        } => {
            let hotend = controller
                .execute_gcode(&format!("M104 S{}", number(*hotend_temp)))
                .await;
            let bed = controller
                .execute_gcode(&format!("M140 S{}", number(*bed_temp)))
                .await;
            hotend && bed
        }
        Command::CoolDown => {
            let hotend = controller.execute_gcode("M104 S0").await;
            let bed = controller.execute_gcode("M140 S0").await;
            hotend && bed
        }
        Command::Pause => controller.command("printer/print/pause", None).await,
        Command::Resume => controller.command("printer/print/resume", None).await,
        Command::Cancel => controller.command("printer/print/cancel", None).await,
        Command::SetSpeed { speed } => {
            controller
                .execute_gcode(&format!("M220 S{}", number(*speed)))
                .await
        }
        Command::SetFlow { flow } => {
            controller
                .execute_gcode(&format!("M221 S{}", number(*flow)))
                .await
        }
        Command::ToggleFan => controller.execute_gcode("M106 S255").await,
        Command::SetFan { speed } => {
            controller
                .execute_gcode(&format!("M106 S{}", number(*speed)))
                .await
        }
        Command::FanOff => controller.execute_gcode("M107").await,
        Command::EmergencyStop => controller.command("printer/emergency_stop", None).await,
        Command::FirmwareRestart => controller.command("printer/firmware_restart", None).await,
        Command::Reboot => controller.command("machine/reboot", None).await,
        Command::Shutdown => controller.command("machine/shutdown", None).await,
        Command::Print {
            file,
            download_url,
            checksum,
        } => {
            return start_print(
                file,
                download_url.as_deref(),
                checksum.as_deref(),
                controller,
                store,
            )
            .await
        }
        Command::Gcode { gcode } if !gcode.trim().is_empty() => {
            controller.execute_gcode(gcode).await
        }
        Command::Macro { macro_name, params } if !macro_name.trim().is_empty() => {
            controller.execute_macro(macro_name, params).await
        }
        _ => false,
    };
    (success, false)
}

async fn start_print(
    file: &str,
    download_url: Option<&str>,
    checksum: Option<&str>,
    controller: &dyn Controller,
    store: &dyn GcodeStore,
) -> (bool, bool) {
    if file.trim().is_empty() {
        tracing::error!("print command without a file name");
        return (false, false);
    }
    let mut downloaded = false;
    if !store.contains(file) {
        let Some(url) = download_url.filter(|url| !url.trim().is_empty()) else {
            tracing::error!(file, "file not present and no download url given");
            return (false, false);
        };
        if let Err(err) = store.download(file, url, checksum).await {
            tracing::error!(file, error = %err, "download failed");
            return (false, false);
        }
        downloaded = true;
    }
    let started = controller
        .command(&format!("printer/print/start?filename={file}"), None)
        .await;
    (started, downloaded)
}

/// Whole values print without a fractional part, so `200.0` becomes `S200`.
fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// `G*` style pattern to an anchored, case-insensitive regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::from("(?i)^");
    for ch in pattern.trim().chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source)
}
