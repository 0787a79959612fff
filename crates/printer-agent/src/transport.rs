use crate::config::RetryConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const USER_AGENT: &str = concat!("printhub-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub payload: Option<Payload>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Why a send was not confirmed. Non-2xx statuses count as failures here; an
/// application-level `success: false` inside a 2xx body does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Status(u16),
    Request(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Connect(message) => write!(f, "connection failed: {message}"),
            Self::Status(status) => write!(f, "unexpected HTTP status {status}"),
            Self::Request(message) => write!(f, "request failed: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One HTTP exchange, no retries. Implementations return every response they
/// receive; classifying statuses is the transport's job.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Streams a `GET` body into `dest`, returning the byte count. Non-2xx
    /// statuses are failures here since there is no body worth keeping.
    async fn download_to(&self, request: &HttpRequest, dest: &Path) -> Result<u64, TransportError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build http client: {err}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder
            .header("Accept", "application/json")
            .timeout(request.timeout);
        match request.payload.clone() {
            Some(Payload::Json(value)) => {
                builder = builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(value.to_string());
            }
            Some(Payload::Multipart { fields, file }) => {
                let part = reqwest::multipart::Part::stream(file.data)
                    .file_name(file.file_name)
                    .mime_str(&file.mime)
                    .map_err(|err| TransportError::Request(err.to_string()))?;
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                builder = builder.multipart(form.part(file.field, part));
            }
            None => {}
        }
        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }

    async fn download_to(&self, request: &HttpRequest, dest: &Path) -> Result<u64, TransportError> {
        let response = self
            .client
            .get(&request.url)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| TransportError::Request(format!("create {}: {err}", dest.display())))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_reqwest_error)?;
            file.write_all(&chunk)
                .await
                .map_err(|err| TransportError::Request(format!("write {}: {err}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| TransportError::Request(format!("flush {}: {err}", dest.display())))?;
        Ok(written)
    }
}

pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::try_from_secs_f64(config.base_delay.max(0.0))
                .unwrap_or(Duration::MAX),
            exponential: config.exponential_backoff,
        }
    }

    /// Sleep before retrying after the failure of attempt `attempt_index`
    /// (zero based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        if self.exponential {
            self.base_delay
                .saturating_mul(2u32.saturating_pow(attempt_index))
        } else {
            self.base_delay
        }
    }

    /// Longest a single call can hold up the caller: every attempt runs into
    /// `call_timeout` and every gap between attempts is slept in full.
    ///
    /// `max_attempts × call_timeout + Σ delay_for(i) for i < max_attempts - 1`.
    /// With the defaults (5 attempts, 2 s exponential base) and a 10 s call
    /// timeout this is 50 s + 30 s = 80 s, which is how far a cadence can drift
    /// on one unreachable endpoint.
    pub fn worst_case_stall(&self, call_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps = (0..attempts - 1)
            .map(|index| self.delay_for(index))
            .fold(Duration::ZERO, Duration::saturating_add);
        call_timeout.saturating_mul(attempts).saturating_add(sleeps)
    }

    /// Runs `op` until it succeeds or attempts run out, sleeping between
    /// attempts. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => {
                    tracing::error!(label, attempts, error = %err, "all attempts failed");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay = %humantime::format_duration(delay),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub struct RetryingTransport {
    backend: Arc<dyn HttpBackend>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(backend: Arc<dyn HttpBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Sends the request with bounded retries. A 2xx is returned as soon as it
    /// arrives, whatever the body says.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let request = HttpRequest {
            method,
            url: url.to_string(),
            payload,
            timeout,
        };
        let label = format!("{method} {url}");
        self.policy
            .run(&label, |_| async {
                match self.backend.send(&request).await {
                    Ok(response) if response.is_success() => Ok(response),
                    Ok(response) => Err(TransportError::Status(response.status)),
                    Err(err) => Err(err),
                }
            })
            .await
    }

    pub async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        self.execute(Method::Get, url, None, timeout).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let value =
            serde_json::to_value(body).map_err(|err| TransportError::Request(err.to_string()))?;
        self.execute(Method::Post, url, Some(Payload::Json(value)), timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{json_response, status_response, FakeBackend};
    use serde_json::json;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, base_secs: u64, exponential: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(base_secs),
            exponential,
        }
    }

    #[test]
    fn exponential_delays_double() {
        let policy = policy(5, 2, true);
        let delays: Vec<u64> = (0..4).map(|index| policy.delay_for(index).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[test]
    fn constant_delay_when_not_exponential() {
        let policy = policy(5, 3, false);
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn worst_case_stall_with_defaults() {
        let defaults = RetryPolicy::default();
        assert_eq!(
            defaults.worst_case_stall(Duration::from_secs(10)),
            Duration::from_secs(80)
        );
        assert_eq!(
            policy(1, 2, true).worst_case_stall(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_call_sleeps_2_4_8_16() {
        let backend = Arc::new(FakeBackend::new(|_, _| {
            Err(TransportError::Connect("refused".to_string()))
        }));
        let transport = RetryingTransport::new(backend.clone(), policy(5, 2, true));
        let started = Instant::now();
        let result = transport
            .get("http://server/api.php", Duration::from_secs(10))
            .await;
        assert_eq!(
            result.unwrap_err(),
            TransportError::Connect("refused".to_string())
        );
        assert_eq!(backend.call_count(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        let gaps: Vec<u64> = backend
            .call_times()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![2, 4, 8, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_then_success() {
        let backend = Arc::new(FakeBackend::new(|_, call| {
            if call < 4 {
                Ok(status_response(500))
            } else {
                Ok(json_response(json!({"success": true})))
            }
        }));
        let transport = RetryingTransport::new(backend.clone(), policy(5, 2, true));
        let response = transport
            .post_json("http://server/api.php", &json!({"a": 1}), Duration::from_secs(10))
            .await
            .expect("fifth attempt succeeds");
        assert_eq!(response.status, 200);
        assert_eq!(backend.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn application_failure_is_not_retried() {
        let backend = Arc::new(FakeBackend::new(|_, _| {
            Ok(json_response(json!({"success": false, "message": "nope"})))
        }));
        let transport = RetryingTransport::new(backend.clone(), policy(5, 2, true));
        let started = Instant::now();
        let response = transport
            .get("http://server/api.php", Duration::from_secs(10))
            .await
            .expect("2xx is returned");
        let reply: protocol::server::UpdateReply = response.json().expect("json");
        assert!(!reply.success);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn constant_backoff_elapsed() {
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(status_response(503))));
        let transport = RetryingTransport::new(backend.clone(), policy(4, 2, false));
        let started = Instant::now();
        let result = transport
            .get("http://server/api.php", Duration::from_secs(10))
            .await;
        assert_eq!(result.unwrap_err(), TransportError::Status(503));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_hit_the_documented_bound() {
        let timeout = Duration::from_secs(10);
        let backend = Arc::new(FakeBackend::with_latency(timeout, |_, _| {
            Err(TransportError::Timeout)
        }));
        let policy = policy(5, 2, true);
        let transport = RetryingTransport::new(backend, policy);
        let started = Instant::now();
        let result = transport.get("http://server/api.php", timeout).await;
        assert_eq!(result.unwrap_err(), TransportError::Timeout);
        assert_eq!(started.elapsed(), policy.worst_case_stall(timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn policy_runs_arbitrary_operations() {
        let policy = policy(3, 1, true);
        let result: Result<u32, String> = policy
            .run("probe", |attempt| async move {
                if attempt < 2 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }
}
