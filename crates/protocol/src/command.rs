use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Actions flagged for extra scrutiny before dispatch.
pub const DANGEROUS_ACTIONS: &[&str] = &["emergency_stop", "firmware_restart", "reboot"];

const KNOWN_ACTIONS: &[&str] = &[
    "home",
    "home_x",
    "home_y",
    "home_z",
    "heat",
    "cool_down",
    "pause",
    "resume",
    "cancel",
    "set_speed",
    "set_flow",
    "toggle_fan",
    "set_fan",
    "fan_off",
    "emergency_stop",
    "firmware_restart",
    "reboot",
    "shutdown",
    "print",
    "gcode",
    "macro",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn letter(&self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
        }
    }
}

/// An instruction pulled from the management server.
///
/// Known actions carry only their typed parameters. Anything the agent does
/// not recognise, or recognises but cannot read the parameters of, lands in
/// `Unrecognized` / `Malformed` so the gate can reject it without dispatching.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Home,
    #[serde(rename = "home_x")]
    HomeX,
    #[serde(rename = "home_y")]
    HomeY,
    #[serde(rename = "home_z")]
    HomeZ,
    Heat {
        #[serde(default = "default_hotend_temp", deserialize_with = "lenient_f64")]
        hotend_temp: f64,
        #[serde(default = "default_bed_temp", deserialize_with = "lenient_f64")]
        bed_temp: f64,
    },
    CoolDown,
    Pause,
    Resume,
    Cancel,
    SetSpeed {
        #[serde(default = "default_percent", deserialize_with = "lenient_f64")]
        speed: f64,
    },
    SetFlow {
        #[serde(default = "default_percent", deserialize_with = "lenient_f64")]
        flow: f64,
    },
    ToggleFan,
    SetFan {
        #[serde(default = "default_fan_pwm", deserialize_with = "lenient_f64")]
        speed: f64,
    },
    FanOff,
    EmergencyStop,
    FirmwareRestart,
    Reboot,
    Shutdown,
    Print {
        #[serde(default)]
        file: String,
        #[serde(default)]
        download_url: Option<String>,
        #[serde(default)]
        checksum: Option<String>,
    },
    Gcode {
        #[serde(default)]
        gcode: String,
    },
    Macro {
        #[serde(default)]
        macro_name: String,
        #[serde(default)]
        params: BTreeMap<String, Value>,
    },
    #[serde(skip)]
    Unrecognized { action: String },
    #[serde(skip)]
    Malformed { action: String, reason: String },
}

impl Command {
    /// Reads one command object as delivered by the server. Never fails: bad
    /// input becomes `Unrecognized` or `Malformed`.
    pub fn parse(value: Value) -> Self {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match serde_json::from_value::<Command>(value) {
            Ok(command) => command,
            Err(err) if KNOWN_ACTIONS.contains(&action.as_str()) => Self::Malformed {
                action,
                reason: err.to_string(),
            },
            Err(_) => Self::Unrecognized { action },
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Self::Home => "home",
            Self::HomeX => "home_x",
            Self::HomeY => "home_y",
            Self::HomeZ => "home_z",
            Self::Heat { .. } => "heat",
            Self::CoolDown => "cool_down",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::SetSpeed { .. } => "set_speed",
            Self::SetFlow { .. } => "set_flow",
            Self::ToggleFan => "toggle_fan",
            Self::SetFan { .. } => "set_fan",
            Self::FanOff => "fan_off",
            Self::EmergencyStop => "emergency_stop",
            Self::FirmwareRestart => "firmware_restart",
            Self::Reboot => "reboot",
            Self::Shutdown => "shutdown",
            Self::Print { .. } => "print",
            Self::Gcode { .. } => "gcode",
            Self::Macro { .. } => "macro",
            Self::Unrecognized { action } | Self::Malformed { action, .. } => action,
        }
    }

    pub fn is_dangerous(&self) -> bool {
        DANGEROUS_ACTIONS.contains(&self.action())
    }

    pub fn home_axis(&self) -> Option<Option<Axis>> {
        match self {
            Self::Home => Some(None),
            Self::HomeX => Some(Some(Axis::X)),
            Self::HomeY => Some(Some(Axis::Y)),
            Self::HomeZ => Some(Some(Axis::Z)),
            _ => None,
        }
    }
}

fn default_hotend_temp() -> f64 {
    200.0
}

fn default_bed_temp() -> f64 {
    60.0
}

fn default_percent() -> f64 {
    100.0
}

fn default_fan_pwm() -> f64 {
    255.0
}

// The server stores parameters as text, so numbers may arrive quoted.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range"))?,
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|err| serde::de::Error::custom(format!("invalid number {text:?}: {err}")))?,
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected number, got {other}"
            )))
        }
    };
    if !value.is_finite() {
        return Err(serde::de::Error::custom(format!("non-finite number {value}")));
    }
    Ok(value)
}
