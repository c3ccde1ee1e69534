use async_trait::async_trait;
use bytes::Bytes;
use decision_core::config::UploadConfig;
use decision_core::error::{DecisionError, DecisionResult};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Delivers one upload body for one partition.
///
/// Implementations report retryable failures as `TransientUpload` and
/// permanent ones as `FatalUpload`.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send(&self, partition_key: &str, body: Bytes) -> DecisionResult<()>;
}

/// Timeouts, 408, 429 and 5xx are worth retrying; other failures are not.
pub fn classify_status(status: StatusCode) -> Option<DecisionError> {
    if status.is_success() {
        return None;
    }
    let message = format!("endpoint answered {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Some(DecisionError::TransientUpload(message))
    } else {
        Some(DecisionError::FatalUpload(message))
    }
}

fn classify_error(err: reqwest::Error) -> DecisionError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        DecisionError::TransientUpload(err.to_string())
    } else {
        DecisionError::FatalUpload(err.to_string())
    }
}

/// POSTs each body to a fixed endpoint, tagging it with the partition key.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    authorization_token: Option<String>,
}

impl HttpTransport {
    pub const PARTITION_HEADER: &'static str = "x-partition-key";

    pub fn new(config: &UploadConfig) -> DecisionResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| DecisionError::Config(format!("invalid upload endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.connection_timeout_ms))
            .build()
            .map_err(|e| DecisionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            authorization_token: config.authorization_token.clone(),
        })
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send(&self, partition_key: &str, body: Bytes) -> DecisionResult<()> {
        let size = body.len();
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(Self::PARTITION_HEADER, partition_key)
            .body(body);
        if let Some(token) = &self.authorization_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_error)?;
        let status = response.status();
        debug!(partition = partition_key, size, status = %status, "Upload response");
        match classify_status(status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Scripted outcome for [`MemoryTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ok,
    Transient,
    Fatal,
}

/// In-process transport that records sends. Outcomes are taken from a
/// script, one per send, and default to success once it runs out.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(String, Bytes)>>,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    attempts: Mutex<usize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Successfully delivered `(partition_key, body)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, Bytes)> {
        self.sent.lock().clone()
    }

    /// Every send call, failed or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn send(&self, partition_key: &str, body: Bytes) -> DecisionResult<()> {
        *self.attempts.lock() += 1;
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ScriptedOutcome::Ok);
        match outcome {
            ScriptedOutcome::Ok => {
                self.sent.lock().push((partition_key.to_string(), body));
                Ok(())
            }
            ScriptedOutcome::Transient => {
                Err(DecisionError::TransientUpload("scripted transient".into()))
            }
            ScriptedOutcome::Fatal => Err(DecisionError::FatalUpload("scripted fatal".into())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(classify_status(StatusCode::ACCEPTED).is_none());
        for transient in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(classify_status(transient).unwrap().is_transient());
        }
        for fatal in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::PAYLOAD_TOO_LARGE,
        ] {
            assert!(matches!(
                classify_status(fatal),
                Some(DecisionError::FatalUpload(_))
            ));
        }
    }

    #[test]
    fn test_http_transport_rejects_bad_endpoint() {
        let config = UploadConfig {
            endpoint: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(DecisionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_script() {
        let t = MemoryTransport::with_script([ScriptedOutcome::Transient, ScriptedOutcome::Fatal]);
        assert!(t.send("p", Bytes::from_static(b"{}")).await.unwrap_err().is_transient());
        assert!(matches!(
            t.send("p", Bytes::from_static(b"{}")).await,
            Err(DecisionError::FatalUpload(_))
        ));
        t.send("p", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(t.attempts(), 3);
        assert_eq!(t.sent().len(), 1);
    }
}
