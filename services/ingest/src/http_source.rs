//! [`ChannelSource`] backed by the session gateway's JSON/HTTP API.
//!
//! Endpoints:
//! - `GET /channels/{handle}`
//! - `GET /channels/{handle}/messages?after_id=&limit=`
//! - `GET /channels/{handle}/messages/{id}/media`

use crate::config::SourceConfig;
use crate::source::{ChannelInfo, ChannelSource, MediaPayload, SourceMessage};
use medlens_pipeline::store::async_trait;
use medlens_pipeline::Failure;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Wait used when a 429 carries no usable hint.
const DEFAULT_FLOOD_WAIT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct MessagePage {
    messages: Vec<SourceMessage>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    retry_after: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpChannelSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChannelSource {
    pub fn new(config: &SourceConfig) -> Result<Self, Failure> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Failure::fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, Failure> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_wait = retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, header_wait, &body))
    }
}

/// Seconds from a `Retry-After` header given as delta-seconds.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Map a non-success HTTP response onto the failure taxonomy.
pub fn map_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> Failure {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = retry_after
            .or_else(|| parsed.as_ref().and_then(|b| b.retry_after))
            .unwrap_or(DEFAULT_FLOOD_WAIT_SECS);
        return Failure::rate_limited_secs(wait);
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Failure::transient(format!("source returned {}: {}", status, detail));
    }

    Failure::fatal(format!("source returned {}: {}", status, detail))
}

fn map_transport_error(err: reqwest::Error) -> Failure {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        Failure::transient(err.to_string())
    } else if err.is_decode() {
        Failure::fatal(format!("unreadable source response: {}", err))
    } else {
        Failure::transient(err.to_string())
    }
}

#[async_trait]
impl ChannelSource for HttpChannelSource {
    async fn resolve(&self, handle: &str) -> Result<ChannelInfo, Failure> {
        let response = self.send(self.get(&format!("/channels/{}", handle))).await?;
        response.json().await.map_err(map_transport_error)
    }

    async fn fetch_after(
        &self,
        handle: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, Failure> {
        let request = self
            .get(&format!("/channels/{}/messages", handle))
            .query(&[("after_id", after_id.to_string()), ("limit", limit.to_string())]);

        let page: MessagePage = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(map_transport_error)?;

        debug!(handle, after_id, received = page.messages.len(), "Fetched message page");
        Ok(page.messages)
    }

    async fn download_media(&self, handle: &str, message_id: i64) -> Result<MediaPayload, Failure> {
        let response = self
            .send(self.get(&format!("/channels/{}/messages/{}/media", handle, message_id)))
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(map_transport_error)?;

        Ok(MediaPayload {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
