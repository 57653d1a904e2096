//! JSON client for the shop REST API.
//!
//! Every request carries the session cookie jar and, when configured, a bearer
//! token. [`ApiClient::fetcher`] adapts a GET request into a query fetcher so
//! observers read the API through the cache.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use reqwest::{Client, Method, Response, StatusCode, header};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ApiSettings;
use crate::query::{BoxError, KeySegment, QueryFn, QueryKey};

const HTTPS_PREFIX: &str = "https://";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to parse response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid bearer token: {0}")]
    Token(#[from] header::InvalidHeaderValue),
}

impl ApiError {
    /// HTTP status of a non-success response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            _ => None,
        }
    }
}

/// Turn a configured API address into an absolute base URL.
///
/// Addresses without a scheme are treated as https; protocol-relative
/// addresses (`//host/path`) resolve to https as well. The result always ends
/// with `/` so relative resource paths join beneath it.
pub fn normalize_base_url(raw: &str) -> Result<Url, url::ParseError> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();

    let absolute = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("//") {
        format!("{HTTPS_PREFIX}{rest}")
    } else {
        format!("{HTTPS_PREFIX}{raw}")
    };

    let mut url = Url::parse(&absolute)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Cache identity for a GET request: `["GET", path, {name: [values]}]`.
///
/// Parameters are grouped by name, so the order of distinct names does not
/// change the key. Repeated names keep every value in the order given.
pub fn resource_key(path: &str, params: &[(String, String)]) -> QueryKey {
    let mut grouped: Map<String, Value> = Map::new();
    for (name, value) in params {
        let values = grouped
            .entry(name.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = values {
            values.push(Value::String(value.clone()));
        }
    }
    QueryKey::new([
        KeySegment::from("GET"),
        KeySegment::from(path),
        KeySegment::from(Value::Object(grouped)),
    ])
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        Self::with_parts(settings.base_url.clone(), settings.token.clone(), settings.timeout)
    }

    pub fn with_parts(
        base: Url,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("shopdesk/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve a resource path beneath the base URL.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(ApiError::Url)
    }

    /// GET `path` with `query` parameters and decode the JSON body.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let mut url = self.url(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        self.send(Method::GET, url, None).await
    }

    /// Send `body` as JSON with `method` and decode the JSON response.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = self.url(path)?;
        self.send(method, url, body).await
    }

    /// Query fetcher that GETs `path` with `params` on every call.
    pub fn fetcher(&self, path: &str, params: &[(String, String)]) -> QueryFn<Value> {
        let api = self.clone();
        let path = path.to_string();
        let params = params.to_vec();
        Arc::new(move || {
            let api = api.clone();
            let path = path.clone();
            let params = params.clone();
            async move {
                api.get_json(&path, &params)
                    .await
                    .map_err(|err| Box::new(err) as BoxError)
            }
            .boxed()
        })
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value, ApiError> {
        debug!(method = %method, url = %url, "Sending API request");

        let mut req = self.client.request(method, url);
        if let Some(token) = self.token.as_deref() {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            req = req.header(header::AUTHORIZATION, value);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        Self::handle(resp).await
    }

    async fn handle(resp: Response) -> Result<Value, ApiError> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(ApiError::Status { status, body });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(ApiError::Decode)
    }
}
