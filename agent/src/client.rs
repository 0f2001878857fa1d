//! HTTP transport for the management API.

use crate::config::Config;
use crate::error::Result;
use async_trait::async_trait;
use converge_engine::{response_items, ApiError, Page, Transport, Version};
use reqwest::{header, Client, Method, Response};
use serde_json::Value;
use tracing::debug;

/// Header carrying the tenant every request is scoped to.
pub const TENANT_HEADER: &str = "X-Tenant";

/// Query parameter carrying a page token.
const PAGE_TOKEN_PARAM: &str = "pageToken";

/// Keys a list response may hold its items under.
const LIST_KEYS: &[&str] = &["items", "data", "results"];

/// `Transport` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
    tenant: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            tenant: config.tenant.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> std::result::Result<Value, ApiError> {
        let mut builder = self
            .client
            .request(method.clone(), self.url(path))
            .header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(tenant) = &self.tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        debug!(method = %method, path, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::new(method.as_str(), path, None, e.to_string()))?;

        read_response(method.as_str(), path, response).await
    }

    /// Server capability version from `GET /version`.
    ///
    /// Servers without the endpoint, or with a version that does not parse,
    /// report the lowest version.
    pub async fn capability_version(&self) -> std::result::Result<Version, ApiError> {
        match self.send(Method::GET, "/version", &[], None).await {
            Ok(body) => Ok(version_from_body(&body)),
            Err(err) if err.is_not_found() => Ok(Version::lowest()),
            Err(err) => Err(err),
        }
    }
}

async fn read_response(
    method: &str,
    path: &str,
    response: Response,
) -> std::result::Result<Value, ApiError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ApiError::new(method, path, Some(status.as_u16()), e.to_string()))?;

    if !status.is_success() {
        let message = error_message(&text)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        return Err(ApiError::new(method, path, Some(status.as_u16()), message));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| {
        ApiError::new(
            method,
            path,
            Some(status.as_u16()),
            format!("invalid JSON response: {e}"),
        )
    })
}

/// Message of an error body: `{"message": ..}`, `{"error": ..}` or raw text.
fn error_message(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let from_json = serde_json::from_str::<Value>(text).ok().and_then(|body| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str).map(String::from))
    });
    Some(from_json.unwrap_or_else(|| text.to_string()))
}

fn version_from_body(body: &Value) -> Version {
    match body {
        Value::String(version) => Version::parse(version),
        Value::Object(obj) => obj
            .get("version")
            .and_then(Value::as_str)
            .map(Version::parse)
            .unwrap_or_else(Version::lowest),
        _ => Version::lowest(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn list(
        &self,
        path: &str,
        filters: &[(String, String)],
        page_token: Option<&str>,
    ) -> std::result::Result<Page, ApiError> {
        let mut query = filters.to_vec();
        if let Some(token) = page_token {
            query.push((PAGE_TOKEN_PARAM.to_string(), token.to_string()));
        }

        let body = self.send(Method::GET, path, &query, None).await?;
        let next_page_token = body
            .get("nextPageToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(String::from);
        let items = match body {
            Value::Null => Vec::new(),
            Value::Object(ref obj) if !LIST_KEYS.iter().any(|k| obj.contains_key(*k)) => Vec::new(),
            other => response_items(other),
        };

        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn get(&self, path: &str) -> std::result::Result<Value, ApiError> {
        self.send(Method::GET, path, &[], None).await
    }

    async fn post(
        &self,
        path: &str,
        query: &[(String, String)],
        body: Value,
    ) -> std::result::Result<Value, ApiError> {
        self.send(Method::POST, path, query, Some(body)).await
    }

    async fn put(&self, path: &str, body: Value) -> std::result::Result<Value, ApiError> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    async fn delete(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> std::result::Result<(), ApiError> {
        self.send(Method::DELETE, path, query, None).await.map(|_| ())
    }
}
