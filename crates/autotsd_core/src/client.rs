use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{ApiError, ContentApi, Document, DocumentRef, DocumentUpdate, SearchPage};
use crate::config::{
    AutoTsdConfig, DEFAULT_MAX_RETRIES, DEFAULT_PAGE_SIZE, DEFAULT_RATE_LIMIT_MS,
    DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS,
};

const CONTENT_PATH: [&str; 4] = ["wiki", "rest", "api", "content"];
const LABEL_PAGE_SIZE: usize = 200;
const ERROR_DETAIL_LIMIT: usize = 300;

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    /// Site root such as `https://sol-jira.atlassian.net`.
    pub base_url: String,
    pub email: Option<String>,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub page_size: usize,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &AutoTsdConfig) -> Self {
        let section = &config.confluence;
        Self {
            base_url: section.base_url(),
            email: section.email(),
            api_token: section.api_token(),
            user_agent: section.user_agent(),
            timeout_ms: section.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            rate_limit_ms: section.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS),
            max_retries: section.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: section.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            page_size: section.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
        }
    }
}

/// Confluence Cloud REST v1 client authenticated with an account email and API token.
///
/// Reads are retried with backoff on throttling and gateway errors. Writes are sent once:
/// a retried label add or page update could land twice.
pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    base: Url,
    email: String,
    api_token: String,
    last_request_at: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

/// A non-2xx response or a transport failure, before it is mapped per endpoint.
#[derive(Debug)]
struct HttpFailure {
    status: Option<StatusCode>,
    detail: String,
}

impl HttpFailure {
    fn into_api_error(self) -> ApiError {
        match self.status {
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                ApiError::Unauthorized(self.detail)
            }
            Some(StatusCode::NOT_FOUND) => ApiError::NotFound(self.detail),
            _ => ApiError::Transport(self.detail),
        }
    }
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("invalid Confluence base URL: {}", config.base_url))?;
        if base.cannot_be_a_base() {
            bail!("Confluence base URL must be an http(s) URL: {}", config.base_url);
        }
        let Some(email) = config.email.clone() else {
            bail!("FORGE_EMAIL is not set");
        };
        let Some(api_token) = config.api_token.clone() else {
            bail!("FORGE_API_TOKEN is not set");
        };
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            base,
            email,
            api_token,
            last_request_at: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        content_url(&self.base, segments)
    }

    fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
        retryable: bool,
    ) -> Result<Response, HttpFailure> {
        let max_retries = if retryable { self.config.max_retries } else { 0 };
        for attempt in 0..=max_retries {
            self.apply_rate_limit();
            let response = build()
                .basic_auth(&self.email, Some(&self.api_token))
                .header(USER_AGENT, self.config.user_agent.as_str())
                .header(ACCEPT, "application/json")
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < max_retries && is_retryable_status(status) {
                        warn!(%status, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    let body = response.text().unwrap_or_default();
                    return Err(HttpFailure {
                        status: Some(status),
                        detail: failure_detail(status, &body),
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        warn!(%error, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(HttpFailure {
                        status: None,
                        detail: format!("failed to call Confluence: {error}"),
                    });
                }
            }
        }

        Err(HttpFailure {
            status: None,
            detail: "Confluence request exhausted retry budget".to_string(),
        })
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        debug!(url = %url, "GET");
        let response = self
            .send(|| self.client.get(url.clone()).query(query), true)
            .map_err(HttpFailure::into_api_error)?;
        response
            .json::<T>()
            .map_err(|error| ApiError::Decode(format!("{url}: {error}")))
    }

    fn apply_rate_limit(&self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        let mut last = self
            .last_request_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        *last = Some(Instant::now());
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl ContentApi for ConfluenceClient {
    fn fetch_document(&self, id: &str) -> Result<Document, ApiError> {
        let payload: ContentResponse = self.get_json(
            self.endpoint(&[id]),
            &[("expand", "body.storage,version,space".to_string())],
        )?;
        Ok(payload.into_document())
    }

    fn fetch_labels(&self, id: &str) -> Result<BTreeSet<String>, ApiError> {
        let url = self.endpoint(&[id, "label"]);
        let mut labels = BTreeSet::new();
        let mut start = 0usize;
        loop {
            let payload: LabelListResponse = self.get_json(
                url.clone(),
                &[
                    ("limit", LABEL_PAGE_SIZE.to_string()),
                    ("start", start.to_string()),
                ],
            )?;
            let fetched = payload.results.len();
            labels.extend(payload.results.into_iter().map(|label| label.name));
            if fetched == 0 || payload.links.next.is_none() {
                break;
            }
            start += fetched;
        }
        Ok(labels)
    }

    fn add_labels(&self, id: &str, labels: &BTreeSet<String>) -> Result<(), ApiError> {
        if labels.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&[id, "label"]);
        let body = labels
            .iter()
            .map(|name| json!({ "prefix": "global", "name": name }))
            .collect::<Vec<_>>();
        debug!(url = %url, count = labels.len(), "POST labels");
        self.send(|| self.client.post(url.clone()).json(&body), false)
            .map_err(label_add_error)?;
        Ok(())
    }

    fn remove_label(&self, id: &str, label: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&[id, "label"]);
        debug!(url = %url, label, "DELETE label");
        self.send(
            || self.client.delete(url.clone()).query(&[("name", label)]),
            false,
        )
        .map_err(HttpFailure::into_api_error)?;
        Ok(())
    }

    fn update_document(&self, update: &DocumentUpdate<'_>) -> Result<u64, ApiError> {
        let url = self.endpoint(&[update.id]);
        let next_version = update.expected_version + 1;
        let body = json!({
            "id": update.id,
            "type": "page",
            "title": update.title,
            "version": { "number": next_version },
            "body": {
                "storage": {
                    "value": update.markup,
                    "representation": "storage",
                }
            }
        });
        debug!(url = %url, version = next_version, "PUT content");
        let response = self
            .send(|| self.client.put(url.clone()).json(&body), false)
            .map_err(|failure| match failure.status {
                Some(StatusCode::CONFLICT) => ApiError::VersionConflict {
                    expected: update.expected_version,
                    detail: failure.detail,
                },
                _ => failure.into_api_error(),
            })?;
        let payload: ContentResponse = response
            .json()
            .map_err(|error| ApiError::Decode(format!("{url}: {error}")))?;
        Ok(payload.version.number)
    }

    fn search_page(&self, query: &str, cursor: Option<&str>) -> Result<SearchPage, ApiError> {
        let payload: SearchResponse = match cursor {
            Some(cursor) => {
                let url = self
                    .base
                    .join(cursor)
                    .map_err(|error| ApiError::Decode(format!("bad cursor {cursor}: {error}")))?;
                self.get_json(url, &[])?
            }
            None => self.get_json(
                self.endpoint(&["search"]),
                &[
                    ("cql", query.to_string()),
                    ("limit", self.config.page_size.to_string()),
                ],
            )?,
        };
        Ok(payload.into_search_page(&self.base))
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn content_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(CONTENT_PATH).extend(segments);
    }
    url
}

/// Any rejected label add other than auth or a missing page is reported as a conflict.
fn label_add_error(failure: HttpFailure) -> ApiError {
    let rejected = failure.status.is_some();
    match failure.into_api_error() {
        ApiError::Transport(detail) if rejected => ApiError::Conflict(detail),
        other => other,
    }
}

fn failure_detail(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.message)
        .unwrap_or_else(|| body.trim().to_string());
    let message = message.chars().take(ERROR_DETAIL_LIMIT).collect::<String>();
    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {message}")
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    version: VersionPayload,
    space: Option<SpacePayload>,
    body: Option<BodyPayload>,
}

impl ContentResponse {
    fn into_document(self) -> Document {
        Document {
            id: self.id,
            title: self.title,
            version: self.version.number,
            space_key: self.space.map(|space| space.key),
            markup: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct SpacePayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct BodyPayload {
    storage: Option<StoragePayload>,
}

#[derive(Debug, Deserialize)]
struct StoragePayload {
    value: String,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    #[serde(default)]
    results: Vec<LabelPayload>,
    #[serde(default, rename = "_links")]
    links: LinksPayload,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct LinksPayload {
    next: Option<String>,
    context: Option<String>,
    webui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchItem>,
    #[serde(default, rename = "_links")]
    links: LinksPayload,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: String,
    title: String,
    #[serde(default, rename = "_links")]
    links: LinksPayload,
}

impl SearchResponse {
    fn into_search_page(self, base: &Url) -> SearchPage {
        let context = self.links.context.unwrap_or_default();
        let results = self
            .results
            .into_iter()
            .map(|item| DocumentRef {
                web_url: item
                    .links
                    .webui
                    .and_then(|webui| base.join(&format!("{context}{webui}")).ok())
                    .map(String::from),
                id: item.id,
                title: item.title,
            })
            .collect();
        // `next` is relative to the wiki context path, e.g. `/wiki` + `/rest/api/...`.
        let next = self.links.next.map(|next| {
            if context.is_empty() || next.starts_with(&context) {
                next
            } else {
                format!("{context}{next}")
            }
        });
        SearchPage { results, next }
    }
}
