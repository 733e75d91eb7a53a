use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{
    HeaderMap, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use thiserror::Error;

use super::decoder::{decoder_for, sniff, DecodeError, FeedDecoder, FeedInfo};
use super::parser::RawEntry;
use crate::config::FetcherConfig;
use crate::storage::Feed;

/// Upper bound on a server-requested `Retry-After` delay.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while fetching one feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, body read)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx status that is not retried, or a 5xx after the last retry
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Server kept answering 429 after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e)
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::RateLimited(_)
            | FetchError::IncompleteResponse { .. } => true,
            FetchError::HttpStatus(status) => *status == 429 || *status >= 500,
            FetchError::ResponseTooLarge | FetchError::Decode(_) | FetchError::Client(_) => false,
        }
    }
}

/// Outcome of one fetch. Errors are carried in `error`, never returned.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub feed_id: i64,
    pub entries: Vec<RawEntry>,
    pub entries_count: usize,
    pub fetch_time_seconds: f64,
    pub error: Option<FetchError>,
    /// Status of the last response received, if any.
    pub status: Option<u16>,
    pub not_modified: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub feed_info: Option<FeedInfo>,
    /// Requests sent, including retries.
    pub attempts: u32,
}

impl FetchResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Copy)]
enum DecoderChoice {
    Auto,
    Fixed(&'static dyn FeedDecoder),
}

/// Conditional, retrying HTTP client for feeds.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    max_feed_size: usize,
    decoder: DecoderChoice,
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

impl Fetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.timeout_seconds.max(1));
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        let decoder = if config.decoder.trim().eq_ignore_ascii_case("auto") {
            DecoderChoice::Auto
        } else {
            DecoderChoice::Fixed(decoder_for(&config.decoder)?)
        };

        Ok(Self {
            client,
            timeout,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_feed_size: config.max_feed_size_bytes,
            decoder,
        })
    }

    /// Fetch and decode `feed`.
    ///
    /// Sends the stored validators so an unchanged feed costs one 304.
    /// Transient failures (timeouts, connection errors, 5xx, 429, truncated
    /// bodies) are retried with exponential backoff; anything else fails on
    /// the first attempt.
    pub async fn fetch_feed(&self, feed: &Feed) -> FetchResult {
        let started = Instant::now();
        let mut result = FetchResult {
            feed_id: feed.id,
            ..Default::default()
        };

        if let Err(e) = self.fetch_into(feed, &mut result).await {
            tracing::warn!(
                feed_id = feed.id,
                url = %feed.url,
                attempts = result.attempts,
                error = %e,
                "Feed fetch failed"
            );
            result.error = Some(e);
        }

        result.fetch_time_seconds = started.elapsed().as_secs_f64();
        result
    }

    async fn fetch_into(&self, feed: &Feed, result: &mut FetchResult) -> Result<(), FetchError> {
        let mut retry_count = 0;

        let (bytes, content_type) = loop {
            result.attempts = retry_count + 1;

            let mut request = self.client.get(&feed.url);
            if let Some(etag) = feed.etag.as_deref() {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = feed.last_modified.as_deref() {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            let sent = match tokio::time::timeout(self.timeout, request.send()).await {
                Err(_) => Err(FetchError::Timeout),
                Ok(sent) => sent.map_err(FetchError::from_reqwest),
            };
            let response = match sent {
                Ok(response) => response,
                Err(e) if retry_count < self.max_retries => {
                    self.back_off(feed, retry_count, None, &e).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            result.status = Some(status.as_u16());

            if status == StatusCode::NOT_MODIFIED {
                let headers = response.headers();
                result.not_modified = true;
                result.etag = header_string(headers, ETAG).or_else(|| feed.etag.clone());
                result.last_modified =
                    header_string(headers, LAST_MODIFIED).or_else(|| feed.last_modified.clone());
                tracing::debug!(feed_id = feed.id, "Feed not modified");
                return Ok(());
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= self.max_retries {
                    return Err(FetchError::RateLimited(self.max_retries));
                }
                let retry_after = retry_after(response.headers());
                self.back_off(feed, retry_count, retry_after, &FetchError::HttpStatus(429))
                    .await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                let e = FetchError::HttpStatus(status.as_u16());
                if retry_count >= self.max_retries {
                    return Err(e);
                }
                self.back_off(feed, retry_count, None, &e).await;
                retry_count += 1;
                continue;
            }

            // 4xx fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let headers = response.headers();
            let etag = header_string(headers, ETAG);
            let last_modified = header_string(headers, LAST_MODIFIED);
            let content_type = header_string(headers, CONTENT_TYPE);

            match read_limited_bytes(response, self.max_feed_size).await {
                Ok(bytes) => {
                    result.etag = etag;
                    result.last_modified = last_modified;
                    break (bytes, content_type);
                }
                Err(e) if e.is_transient() && retry_count < self.max_retries => {
                    self.back_off(feed, retry_count, None, &e).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let decoder = match self.decoder {
            DecoderChoice::Auto => sniff(content_type.as_deref(), &bytes),
            DecoderChoice::Fixed(decoder) => decoder,
        };
        let decoded = decoder.decode(&bytes)?;

        let mut entries = decoded.entries;
        if feed.max_entries_per_fetch > 0 {
            entries.truncate(feed.max_entries_per_fetch as usize);
        }

        tracing::debug!(
            feed_id = feed.id,
            decoder = decoder.name(),
            entries = entries.len(),
            bytes = bytes.len(),
            "Feed fetched"
        );

        result.entries_count = entries.len();
        result.entries = entries;
        result.feed_info = Some(decoded.info);
        Ok(())
    }

    async fn back_off(
        &self,
        feed: &Feed,
        retry_count: u32,
        retry_after: Option<Duration>,
        cause: &FetchError,
    ) {
        let delay = retry_after.unwrap_or_else(|| {
            self.retry_backoff
                .saturating_mul(2u32.saturating_pow(retry_count))
        });
        tracing::warn!(
            feed_id = feed.id,
            url = %feed.url,
            retry = retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Transient fetch failure, retrying after delay"
        );
        tokio::time::sleep(delay).await;
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `Retry-After` in delta-seconds form, capped at [`MAX_RETRY_AFTER`].
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = header_string(headers, RETRY_AFTER)?.parse().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: Content-Length already over the limit
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
