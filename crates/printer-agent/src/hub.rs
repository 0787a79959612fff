use crate::transport::{FilePart, Method, Payload, RetryingTransport};
use anyhow::Context;
use bytes::Bytes;
use protocol::server::{self, CommandsReply, UpdateReply, UploadReply};
use protocol::TelemetrySnapshot;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// What became of one telemetry push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The server answered and said no. Resending the same record will not help.
    Rejected(Option<String>),
    /// Delivery could not be confirmed; the record is worth keeping.
    Unconfirmed(String),
}

/// Client for the management server endpoints.
pub struct HubClient {
    server_url: String,
    token: String,
    transport: Arc<RetryingTransport>,
    timeout: Duration,
}

impl HubClient {
    pub fn new(
        server_url: &str,
        token: &str,
        transport: Arc<RetryingTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_url: server_url.to_string(),
            token: token.to_string(),
            transport,
            timeout,
        }
    }

    pub async fn push(&self, snapshot: &TelemetrySnapshot) -> PushOutcome {
        let response = match self
            .transport
            .post_json(&self.server_url, snapshot, self.timeout)
            .await
        {
            Ok(response) => response,
            Err(err) => return PushOutcome::Unconfirmed(err.to_string()),
        };
        match response.json::<UpdateReply>() {
            Ok(reply) if reply.success => PushOutcome::Delivered,
            Ok(reply) => PushOutcome::Rejected(reply.message),
            Err(err) => PushOutcome::Unconfirmed(format!("unreadable reply: {err}")),
        }
    }

    /// Raw command objects waiting for this printer. A reply with
    /// `success: false` yields an empty batch.
    pub async fn fetch_commands(&self) -> anyhow::Result<Vec<Value>> {
        let url = server::commands_query(&self.server_url, &self.token);
        let response = self
            .transport
            .get(&url, self.timeout)
            .await
            .context("failed to fetch commands")?;
        let reply: CommandsReply = response.json().context("invalid commands reply")?;
        if !reply.success {
            tracing::debug!(reason = ?reply.message, "server reported no commands");
            return Ok(Vec::new());
        }
        Ok(reply.commands)
    }

    /// Uploads a camera frame and returns the URL the server stored it under.
    pub async fn upload_image(&self, image: Bytes) -> Option<String> {
        let payload = Payload::Multipart {
            fields: vec![("token".to_string(), self.token.clone())],
            file: FilePart {
                field: "image".to_string(),
                file_name: "snapshot.jpg".to_string(),
                mime: "image/jpeg".to_string(),
                data: image,
            },
        };
        let url = server::upload_url(&self.server_url);
        let response = match self
            .transport
            .execute(Method::Post, &url, Some(payload), self.timeout)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "image upload failed");
                return None;
            }
        };
        match response.json::<UploadReply>() {
            Ok(reply) if reply.success => reply.image_url,
            Ok(_) => {
                tracing::debug!("server refused image upload");
                None
            }
            Err(err) => {
                tracing::debug!(error = %err, "invalid upload reply");
                None
            }
        }
    }

    pub async fn probe(&self) -> bool {
        self.transport
            .get(&server::printers_query(&self.server_url), self.timeout)
            .await
            .is_ok()
    }
}
