use crate::transport::{Method, Payload, RetryingTransport};
use async_trait::async_trait;
use protocol::server::ControllerReply;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATUS_OBJECTS: &[&str] = &[
    "heater_bed",
    "extruder",
    "print_stats",
    "gcode_move",
    "fan",
    "toolhead",
    "display_status",
    "virtual_sdcard",
    "motion_report",
    "system_stats",
    "webhooks",
];

/// The local machine controller as the agent sees it: an opaque status tree
/// behind `query` and a fire-and-forget sink behind `command`.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn check_connection(&self) -> bool;

    /// `result` of `GET <base>/<endpoint>`, or `None` when the call failed.
    async fn query(&self, endpoint: &str) -> Option<Value>;

    /// `POST <base>/<endpoint>`; true when the controller acknowledged it.
    async fn command(&self, endpoint: &str, body: Option<Value>) -> bool;

    async fn execute_gcode(&self, script: &str) -> bool {
        self.command("printer/gcode/script", Some(json!({ "script": script })))
            .await
    }

    async fn execute_macro(&self, name: &str, params: &BTreeMap<String, Value>) -> bool {
        self.execute_gcode(&macro_script(name, params)).await
    }

    async fn full_status(&self) -> Value {
        let endpoint = format!("printer/objects/query?{}", STATUS_OBJECTS.join("&"));
        self.query(&endpoint)
            .await
            .and_then(|result| result.get("status").cloned())
            .unwrap_or_else(|| json!({}))
    }

    async fn printer_info(&self) -> Value {
        self.query("printer/info").await.unwrap_or_else(|| json!({}))
    }

    async fn list_files(&self) -> Vec<Value> {
        self.query("server/files/list?root=gcodes")
            .await
            .and_then(|result| match result {
                Value::Array(items) => Some(items),
                Value::Object(mut map) => map.remove("gcodes").and_then(|v| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                }),
                _ => None,
            })
            .unwrap_or_default()
    }

    async fn job_history(&self, limit: usize) -> Vec<Value> {
        self.query(&format!("server/history/list?limit={limit}"))
            .await
            .and_then(|result| result.get("jobs").and_then(Value::as_array).cloned())
            .unwrap_or_default()
    }
}

pub fn macro_script(name: &str, params: &BTreeMap<String, Value>) -> String {
    let mut script = name.to_string();
    for (key, value) in params {
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        script.push_str(&format!(" {key}={value}"));
    }
    script
}

/// Moonraker's REST API over the retrying transport.
pub struct Moonraker {
    base_url: String,
    transport: Arc<RetryingTransport>,
    timeout: Duration,
    connected: AtomicBool,
}

impl Moonraker {
    pub fn new(base_url: &str, transport: Arc<RetryingTransport>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
            timeout,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl Controller for Moonraker {
    async fn check_connection(&self) -> bool {
        let ok = self
            .transport
            .get(&self.url("server/info"), self.timeout)
            .await
            .is_ok();
        self.connected.store(ok, Ordering::Relaxed);
        ok
    }

    async fn query(&self, endpoint: &str) -> Option<Value> {
        let response = match self.transport.get(&self.url(endpoint), self.timeout).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(endpoint, error = %err, "controller query failed");
                return None;
            }
        };
        match response.json::<ControllerReply>() {
            Ok(reply) => Some(reply.result),
            Err(err) => {
                tracing::error!(endpoint, error = %err, "controller returned invalid JSON");
                None
            }
        }
    }

    async fn command(&self, endpoint: &str, body: Option<Value>) -> bool {
        let payload = body.map(Payload::Json);
        match self
            .transport
            .execute(Method::Post, &self.url(endpoint), payload, self.timeout)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(endpoint, error = %err, "controller command failed");
                false
            }
        }
    }
}
