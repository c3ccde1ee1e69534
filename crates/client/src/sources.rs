//! Where models and settings come from.

use async_trait::async_trait;
use bytes::Bytes;
use decision_core::error::{DecisionError, DecisionResult};
use decision_core::types::Settings;
use parking_lot::Mutex;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use url::Url;

/// Outcome of one model fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelFetch {
    Updated(Bytes),
    /// The source has nothing newer than what was fetched last.
    NotModified,
}

#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch_model(&self) -> DecisionResult<ModelFetch>;

    /// Point the source at a new model location. Returns whether the
    /// location changed. Sources that cannot be redirected ignore the call.
    fn set_location(&self, _uri: &str) -> DecisionResult<bool> {
        Ok(false)
    }
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn fetch_settings(&self) -> DecisionResult<Settings>;
}

fn build_client(timeout: Duration) -> DecisionResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DecisionError::Transport(e.to_string()))
}

fn parse_url(raw: &str) -> DecisionResult<Url> {
    Url::parse(raw).map_err(|e| DecisionError::Config(format!("invalid url `{raw}`: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
struct ModelTarget {
    url: Url,
    /// ETag of the last model fetched from `url`.
    etag: Option<String>,
}

/// Model published at a URL. Conditional GETs with the last seen ETag
/// skip unchanged models.
pub struct HttpModelSource {
    client: reqwest::Client,
    target: Mutex<ModelTarget>,
}

impl HttpModelSource {
    pub fn new(url: &str, timeout: Duration) -> DecisionResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            target: Mutex::new(ModelTarget {
                url: parse_url(url)?,
                etag: None,
            }),
        })
    }

    pub fn url(&self) -> Url {
        self.target.lock().url.clone()
    }
}

#[async_trait]
impl ModelSource for HttpModelSource {
    async fn fetch_model(&self) -> DecisionResult<ModelFetch> {
        let ModelTarget { url, etag } = self.target.lock().clone();
        let mut request = self.client.get(url.clone());
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DecisionError::poll("model", e.to_string()))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(ModelFetch::NotModified),
            // Nothing published yet.
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "No model published");
                return Ok(ModelFetch::NotModified);
            }
            status if !status.is_success() => {
                return Err(DecisionError::poll("model", format!("{url} answered {status}")))
            }
            _ => {}
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DecisionError::poll("model", e.to_string()))?;
        let mut target = self.target.lock();
        // The location may have moved while this request was in flight.
        if target.url == url {
            target.etag = etag;
        }
        Ok(ModelFetch::Updated(bytes))
    }

    fn set_location(&self, uri: &str) -> DecisionResult<bool> {
        let url = parse_url(uri)?;
        let mut target = self.target.lock();
        if target.url == url {
            return Ok(false);
        }
        info!(from = %target.url, to = %url, "Model location changed");
        *target = ModelTarget { url, etag: None };
        Ok(true)
    }
}

/// Settings document published at a URL.
pub struct HttpSettingsSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpSettingsSource {
    pub fn new(url: &str, timeout: Duration) -> DecisionResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: parse_url(url)?,
        })
    }
}

#[async_trait]
impl SettingsSource for HttpSettingsSource {
    async fn fetch_settings(&self) -> DecisionResult<Settings> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| DecisionError::poll("settings", e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::poll(
                "settings",
                format!("{} answered {status}", self.url),
            ));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DecisionError::poll("settings", e.to_string()))?;
        Settings::from_slice(&body)
    }
}

/// Model file on local disk, re-read whenever its mtime changes.
pub struct FileModelSource {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileModelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ModelSource for FileModelSource {
    async fn fetch_model(&self) -> DecisionResult<ModelFetch> {
        let modified = tokio::fs::metadata(&self.path).await?.modified()?;
        if *self.last_modified.lock() == Some(modified) {
            return Ok(ModelFetch::NotModified);
        }
        let bytes = tokio::fs::read(&self.path).await?;
        *self.last_modified.lock() = Some(modified);
        Ok(ModelFetch::Updated(Bytes::from(bytes)))
    }
}
