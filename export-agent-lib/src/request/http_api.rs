//! JSON api client
//!
//! Issues requests to a provider's JSON api through a [`RetryClient`] and classifies
//! each response into an [`ApiResult`].

use super::retry::{ApiResult, RetryClient, ThrottleHint};
use crate::Result;
use chrono::{DateTime, Utc};
use ohno::{AppError, EnrichableExt, IntoAppError, app_err};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

const LOG_TARGET: &str = "  http_api";

/// Body fragment GitHub-style providers return when secondary rate limits trigger.
const ABUSE_DETECTION_PHRASE: &str = "You have triggered an abuse detection mechanism";

/// Error type embedded in a successful response when the quota is exhausted.
const RATE_LIMITED_ERROR_TYPE: &str = "RATE_LIMITED";

/// Rate limit information from response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddedErrors {
    #[serde(default)]
    errors: Vec<EmbeddedError>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedError {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Client for one provider api, bound to a base url and credentials.
#[derive(Debug, Clone)]
#[expect(clippy::struct_field_names, reason = "client field stores the underlying HTTP client")]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
    retry: Arc<RetryClient>,
}

impl HttpApi {
    /// Create a client sending `Authorization: bearer <token>` when a token is given.
    pub fn new(base_url: &str, token: Option<&str>, retry: Arc<RetryClient>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(concat!("export-agent/", env!("CARGO_PKG_VERSION")));

        if let Some(t) = token {
            let mut auth_val = HeaderValue::from_str(&format!("bearer {t}"))?;
            auth_val.set_sensitive(true);

            let mut headers = HeaderMap::new();
            let _ = headers.insert(AUTHORIZATION, auth_val);
            builder = builder.default_headers(headers);
        }

        // A trailing slash makes relative joins append rather than replace the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };

        Ok(Self {
            client: builder.build()?,
            base_url: Url::parse(&normalized).into_app_err_with(|| format!("invalid api base url '{base_url}'"))?,
            retry,
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub const fn retry(&self) -> &Arc<RetryClient> {
        &self.retry
    }

    /// GET `path` with query parameters, retrying per policy.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = &self.url(path)?;
        self.retry
            .call(|| async move {
                let request = self.client.get(url.clone()).query(query);
                self.attempt(request).await
            })
            .await
    }

    /// POST a JSON body to `path`, retrying per policy.
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let url = &self.url(path)?;
        self.retry
            .call(|| async move {
                let request = self.client.post(url.clone()).json(body);
                self.attempt(request).await
            })
            .await
    }

    /// POST a JSON body to `path` exactly once.
    pub async fn post_once<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let url = &self.url(path)?;
        self.retry
            .call_once(|| async move {
                let request = self.client.post(url.clone()).json(body);
                self.attempt(request).await
            })
            .await
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .into_app_err_with(|| format!("invalid api path '{path}'"))
    }

    async fn attempt<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> ApiResult<T> {
        let resp = match request.send().await {
            Ok(r) => r,
            Err(e) => return ApiResult::Transient(AppError::from(e)),
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return ApiResult::Transient(AppError::from(e)),
        };

        classify(status, &headers, &body)
    }
}

/// Turn a raw response into an [`ApiResult`].
pub fn classify<T: DeserializeOwned>(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ApiResult<T> {
    if status != StatusCode::OK {
        return classify_error_status(status, headers, body);
    }

    if let Ok(embedded) = serde_json::from_slice::<EmbeddedErrors>(body)
        && let Some(first) = embedded.errors.first()
    {
        log::info!(target: LOG_TARGET, "Request returned errors in the response body: {}", String::from_utf8_lossy(body));
        if first.kind == RATE_LIMITED_ERROR_TYPE {
            return ApiResult::Throttled(reset_hint(headers));
        }
        return ApiResult::Failed(app_err!("api request failed: type {} message {}", first.kind, first.message));
    }

    match serde_json::from_slice(body) {
        Ok(value) => ApiResult::Success(value),
        Err(e) => ApiResult::Failed(AppError::from(e).enrich("decoding api response")),
    }
}

fn classify_error_status<T>(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ApiResult<T> {
    let text = String::from_utf8_lossy(body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ApiResult::Throttled(reset_hint(headers));
    }

    if status == StatusCode::FORBIDDEN && text.contains(ABUSE_DETECTION_PHRASE) {
        return ApiResult::Throttled(ThrottleHint::Abuse);
    }

    if status == StatusCode::UNAUTHORIZED
        && let Ok(msg) = serde_json::from_slice::<ErrorMessage>(body)
        && !msg.message.is_empty()
    {
        return ApiResult::Failed(app_err!("api request failed with status code {}: {}", status.as_u16(), msg.message));
    }

    log::info!(target: LOG_TARGET, "Request failed with status {status}: {text}");
    let error = app_err!("api request failed with status code {}", status.as_u16());

    if status == StatusCode::BAD_GATEWAY {
        ApiResult::Transient(error)
    } else {
        ApiResult::Failed(error)
    }
}

fn reset_hint(headers: &HeaderMap) -> ThrottleHint {
    parse_reset(headers).map_or(ThrottleHint::Unknown, ThrottleHint::ResetAt)
}

fn parse_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get("x-ratelimit-reset")?.to_str().ok()?;
    match value.parse::<i64>() {
        Ok(secs) => DateTime::from_timestamp(secs, 0),
        Err(e) => {
            log::error!(target: LOG_TARGET, "Could not parse X-RateLimit-Reset '{value}': {e}");
            None
        }
    }
}

/// Extract rate limit information from response headers.
#[must_use]
pub fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = headers.get("x-ratelimit-remaining")?.to_str().ok()?.parse::<u64>().ok()?;
    let reset_at = parse_reset(headers)?;
    let limit = headers
        .get("x-ratelimit-limit")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Some(RateLimitInfo { limit, remaining, reset_at })
}
