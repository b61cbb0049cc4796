use std::time::Duration;

use quarry_core::error::{AppError, FetchError};
use quarry_core::models::Cursor;
use quarry_core::traits::{FetchRequest, ProfileFetcher, RawResponse};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Proxy};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.instagram.com";
pub const DEFAULT_APP_ID: &str = "936619743392459";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

const PROFILE_PATH: &str = "/api/v1/users/web_profile_info/";
const CURSOR_PARAM: &str = "after";

/// Connection settings for [`GraphQlFetcher`].
#[derive(Debug, Clone)]
pub struct GraphQlFetcherConfig {
    pub base_url: String,
    pub app_id: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// `http://`, `https://` or `socks5://` proxy for every request.
    pub proxy_url: Option<String>,
}

impl Default for GraphQlFetcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            proxy_url: None,
        }
    }
}

impl GraphQlFetcherConfig {
    /// Defaults overridden by environment variables.
    ///
    /// - `QUARRY_BASE_URL` (optional)
    /// - `QUARRY_PROXY_URL` (optional)
    /// - `QUARRY_TIMEOUT_SECS` (optional, defaults to 30)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();
        if let Some(base_url) = var("QUARRY_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(proxy) = var("QUARRY_PROXY_URL")
            && !proxy.trim().is_empty()
        {
            config.proxy_url = Some(proxy);
        }
        if let Some(raw) = var("QUARRY_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                AppError::InvalidConfig(format!(
                    "Invalid QUARRY_TIMEOUT_SECS '{raw}': not a valid number"
                ))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Authenticated profile fetcher backed by reqwest.
///
/// Sends the session cookie with every request and maps HTTP failures onto
/// the [`FetchError`] taxonomy. Redirects are followed.
#[derive(Clone)]
pub struct GraphQlFetcher {
    client: Client,
    endpoint: Url,
}

impl GraphQlFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_config(GraphQlFetcherConfig::default())
    }

    pub fn with_config(config: GraphQlFetcherConfig) -> Result<Self, AppError> {
        let endpoint = Url::parse(&config.base_url)
            .and_then(|base| base.join(PROFILE_PATH))
            .map_err(|e| {
                AppError::InvalidConfig(format!("Invalid base URL '{}': {e}", config.base_url))
            })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ig-app-id",
            HeaderValue::from_str(&config.app_id)
                .map_err(|e| AppError::InvalidConfig(format!("Invalid app id: {e}")))?,
        );

        let mut builder = Client::builder()
            .user_agent(config.user_agent)
            .default_headers(headers)
            .timeout(config.timeout);
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| AppError::InvalidConfig(format!("Invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::HttpClient(e.to_string()))?;

        Ok(Self { client, endpoint })
    }

    /// Profile URL for one page request.
    pub fn page_url(&self, request: &FetchRequest) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("username", request.identifier.as_str());
            if let Cursor::Token(token) = &request.cursor {
                query.append_pair(CURSOR_PARAM, token);
            }
        }
        url
    }
}

impl ProfileFetcher for GraphQlFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
        let credential = request
            .credential()
            .ok_or_else(|| FetchError::AuthExpired("no session credential attached".into()))?;
        let cookie = HeaderValue::from_str(credential.expose())
            .map_err(|_| FetchError::AuthExpired("session cookie is not a valid header".into()))?;

        let url = self.page_url(request);
        tracing::debug!(identifier = %request.identifier, url = %url, "Fetching profile page");

        let response = self
            .client
            .get(url)
            .header(COOKIE, cookie)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("Failed to read response body: {e}")))?;

        if let Some(err) = FetchError::from_status(status, retry_after, &body) {
            tracing::debug!(identifier = %request.identifier, %status, "Upstream rejected request");
            return Err(err);
        }

        serde_json::from_str(&body)
            .map(RawResponse::new)
            .map_err(|e| FetchError::Malformed(format!("Invalid JSON: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::Permanent {
            status: 0,
            message: e.to_string(),
        }
    } else if e.is_timeout() {
        FetchError::Transient(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        FetchError::Transient(format!("Connection failed: {e}"))
    } else {
        FetchError::Transient(e.to_string())
    }
}

/// `Retry-After` in its delta-seconds form.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
