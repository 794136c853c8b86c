//! Request/response model and the network seam.
//!
//! Everything that talks to the network goes through the [`Network`] trait:
//! the strategy engine, the content fetcher, telemetry transports and the
//! offline relay. [`HttpNetwork`] is the reqwest-backed implementation; the
//! intermediary's `InterceptingNetwork` wraps another `Network` and answers
//! from cache first.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NetworkError;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// A top-level page navigation.
    Navigate,
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub keepalive: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            mode: RequestMode::default(),
            keepalive: false,
        }
    }

    pub fn post_json(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body.into()),
            mode: RequestMode::default(),
            keepalive: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn keepalive(mut self) -> Self {
        self.keepalive = true;
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// True for `http:` and `https:` URLs only.
    pub fn is_http(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response, from the network or from a cache namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// A plain-text response, used for synthesized 503s.
    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, body.to_string())
            .with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(k, _)| *k != name);
        self.headers.push((name, value.to_string()));
        self
    }

    /// 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Resolve `path` (absolute or origin-relative) against `origin`.
pub fn resolve_url(origin: &Url, path: &str) -> Result<String, NetworkError> {
    origin
        .join(path)
        .map(|u| u.to_string())
        .map_err(|e| NetworkError::InvalidUrl(format!("{path}: {e}")))
}

/// Anything that can perform a request.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform `request`. HTTP error statuses are responses, not errors;
    /// `Err` means no response was obtained at all.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError>;
}

/// reqwest-backed network with optional retry on transport failure.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    timeout_ms: u64,
    max_retries: u32,
}

impl HttpNetwork {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("upm-embed/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            timeout_ms,
            max_retries: 0,
        }
    }

    /// Retry transport failures up to `max_retries` times with exponential backoff.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn fetch_once(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| NetworkError::InvalidUrl(format!("bad method {}: {e}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(self.timeout_ms));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout(self.timeout_ms)
            } else if e.is_builder() {
                NetworkError::InvalidUrl(request.url.clone())
            } else {
                NetworkError::Transport(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp.bytes().await?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let mut retries = 0u32;
        loop {
            match self.fetch_once(request).await {
                Ok(resp) => return Ok(resp),
                Err(NetworkError::InvalidUrl(u)) => return Err(NetworkError::InvalidUrl(u)),
                Err(e) if retries < self.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(retries - 1));
                    tracing::debug!("retrying {} after {e} (attempt {retries})", request.url);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
