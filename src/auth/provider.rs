use std::time::Duration;

use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::http_client::HttpsClient;
use crate::uuid_util::normalize_uuid;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A source of authorized UUIDs. Merge order across providers is by
/// ascending priority; earlier writers win on conflict.
pub enum UuidProvider {
    /// Fixed list, typically the DEV_MODE UUID.
    Static {
        name: String,
        priority: u8,
        uuids: Vec<String>,
    },
    /// Remnawave-style panel: `GET {api_url}/api/users` with a bearer.
    Remote {
        name: String,
        api_url: String,
        api_key: String,
    },
    /// Bare endpoint returning either `[...]` or `{"uuids": [...]}`.
    GenericHttp { name: String, url: String },
}

impl UuidProvider {
    pub fn name(&self) -> &str {
        match self {
            UuidProvider::Static { name, .. } => name,
            UuidProvider::Remote { name, .. } => name,
            UuidProvider::GenericHttp { name, .. } => name,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            UuidProvider::Static { priority, .. } => *priority,
            UuidProvider::Remote { .. } => 10,
            UuidProvider::GenericHttp { .. } => 20,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            UuidProvider::Static { uuids, .. } => !uuids.is_empty(),
            UuidProvider::Remote {
                api_url, api_key, ..
            } => !api_url.is_empty() && !api_key.is_empty(),
            UuidProvider::GenericHttp { url, .. } => !url.is_empty(),
        }
    }

    pub async fn fetch(&self, client: &HttpsClient) -> Result<Vec<String>, AuthError> {
        match self {
            UuidProvider::Static { uuids, .. } => Ok(uuids
                .iter()
                .filter_map(|u| normalize_uuid(u).ok())
                .collect()),
            UuidProvider::Remote {
                api_url, api_key, ..
            } => {
                let url = format!("{}/api/users", api_url.trim_end_matches('/'));
                let body = http_get_json(client, &url, Some(api_key)).await?;
                parse_panel_users(&body)
            }
            UuidProvider::GenericHttp { url, .. } => {
                let body = http_get_json(client, url, None).await?;
                parse_generic_uuids(&body)
            }
        }
    }
}

async fn http_get_json(
    client: &HttpsClient,
    url: &str,
    bearer: Option<&str>,
) -> Result<Value, AuthError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| AuthError::Http(format!("invalid url {}: {}", url, e)))?;

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::ACCEPT, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = builder
        .body(Full::new(bytes::Bytes::new()))
        .map_err(|e| AuthError::Http(e.to_string()))?;

    let response = timeout(FETCH_TIMEOUT, client.request(request))
        .await
        .map_err(|_| AuthError::Timeout)?
        .map_err(|e| AuthError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Http(format!("status {}", status)));
    }

    let body = timeout(FETCH_TIMEOUT, response.into_body().collect())
        .await
        .map_err(|_| AuthError::Timeout)?
        .map_err(|e| AuthError::Http(e.to_string()))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
}

/// Panel responses come in several envelope shapes; users are kept when
/// their `vlessUuid` parses, `enabled` is not `false`, and `status` is
/// not `"disabled"`.
pub(crate) fn parse_panel_users(value: &Value) -> Result<Vec<String>, AuthError> {
    let users = value
        .get("response")
        .and_then(|r| r.get("users"))
        .or_else(|| value.get("users"))
        .or_else(|| value.get("data"))
        .or(if value.is_array() { Some(value) } else { None })
        .and_then(Value::as_array)
        .ok_or_else(|| AuthError::InvalidResponse("no user array found".to_string()))?;

    let mut uuids = Vec::with_capacity(users.len());
    for user in users {
        let Some(uuid) = user.get("vlessUuid").and_then(Value::as_str) else {
            continue;
        };
        let Ok(normalized) = normalize_uuid(uuid) else {
            continue;
        };
        if user.get("enabled").and_then(Value::as_bool) == Some(false) {
            continue;
        }
        if let Some(status) = user.get("status").and_then(Value::as_str) {
            if status.eq_ignore_ascii_case("disabled") {
                continue;
            }
        }
        uuids.push(normalized);
    }
    Ok(uuids)
}

pub(crate) fn parse_generic_uuids(value: &Value) -> Result<Vec<String>, AuthError> {
    let entries = value
        .as_array()
        .or_else(|| value.get("uuids").and_then(Value::as_array))
        .ok_or_else(|| AuthError::InvalidResponse("no uuid array found".to_string()))?;

    Ok(entries
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|u| normalize_uuid(u).ok())
        .collect())
}
