use crate::config::CameraConfig;
use crate::transport::RetryingTransport;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pulls still frames from the configured camera URLs, at most once per
/// `capture_interval` per camera.
pub struct CameraManager {
    enabled: bool,
    urls: Vec<String>,
    interval: Duration,
    timeout: Duration,
    transport: Arc<RetryingTransport>,
    last_capture: HashMap<usize, Instant>,
}

impl CameraManager {
    pub fn new(config: &CameraConfig, transport: Arc<RetryingTransport>, timeout: Duration) -> Self {
        Self {
            enabled: config.enabled,
            urls: config.urls.clone(),
            interval: Duration::from_secs(config.capture_interval),
            timeout,
            transport,
            last_capture: HashMap::new(),
        }
    }

    pub fn should_capture(&self, camera: usize) -> bool {
        if !self.enabled || camera >= self.urls.len() {
            return false;
        }
        match self.last_capture.get(&camera) {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    pub async fn capture_snapshot(&mut self, camera: usize) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        let url = self.urls.get(camera)?;
        match self.transport.get(url, self.timeout).await {
            Ok(response) => {
                self.last_capture.insert(camera, Instant::now());
                Some(response.body)
            }
            Err(err) => {
                tracing::warn!(camera, error = %err, "camera capture failed");
                None
            }
        }
    }
}
