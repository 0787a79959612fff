use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to a telemetry push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reply to `?action=get_commands`. Commands stay raw so each one is parsed
/// on its own and a bad entry cannot poison the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub commands: Vec<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Envelope returned by every controller `GET`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerReply {
    #[serde(default)]
    pub result: Value,
}

pub fn commands_query(server_url: &str, token: &str) -> String {
    let separator = if server_url.contains('?') { '&' } else { '?' };
    format!("{server_url}{separator}action=get_commands&token={token}")
}

pub fn printers_query(server_url: &str) -> String {
    let separator = if server_url.contains('?') { '&' } else { '?' };
    format!("{server_url}{separator}action=get_printers")
}

/// The image endpoint sits next to the API script.
pub fn upload_url(server_url: &str) -> String {
    if server_url.contains("api.php") {
        return server_url.replace("api.php", "upload_image.php");
    }
    format!("{}/upload_image.php", server_url.trim_end_matches('/'))
}
