//! HTTP access with Basic authentication, timeouts, and fixed-backoff retry.
//!
//! The stages never talk to `reqwest` directly. They go through [`Transport`],
//! which keeps the crawl and fetch logic testable with an in-memory fake:
//! - [`Transport`]: one authenticated GET returning status, content type and body
//! - [`HttpTransport`]: the `reqwest` implementation, shared read-only by every worker
//! - [`RetryTransport`]: decorator that turns non-success statuses into errors
//!   and retries transient failures with a fixed backoff
//!
//! # Retry Strategy
//!
//! - 3 attempts per asset by default
//! - Fixed 2 second sleep between attempts
//! - Sleeps and in-flight requests end early when the run is cancelled

use crate::config::Credentials;
use crate::error::{HarvestError, Result};
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    /// Declared `Content-Type`, if any.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FetchedBody {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the declared content type names a zip container.
    pub fn is_zip(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("zip"))
    }

    /// The body decoded as (lossy) UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Trait for issuing a single GET.
///
/// Implementors must be usable from many concurrent workers through `&self`.
pub trait Transport {
    /// Fetch `url`. Non-success statuses are returned as a body, not an error;
    /// only failures to obtain a response at all are errors.
    async fn get(&self, url: &str) -> Result<FetchedBody>;
}

impl<T: Transport> Transport for &T {
    async fn get(&self, url: &str) -> Result<FetchedBody> {
        (**self).get(url).await
    }
}

/// `reqwest`-backed transport carrying the variant's Basic credentials.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    /// Build a client with explicit request and connect timeouts.
    pub fn new(
        credentials: Option<Credentials>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HarvestError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            credentials,
        })
    }
}

fn request_error(url: &str, e: reqwest::Error) -> HarvestError {
    if e.is_timeout() {
        HarvestError::Timeout {
            url: url.to_string(),
        }
    } else {
        HarvestError::Transport {
            url: url.to_string(),
            source: e,
        }
    }
}

impl Transport for HttpTransport {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn get(&self, url: &str) -> Result<FetchedBody> {
        let t0 = Instant::now();
        let mut request = self.client.get(url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(|e| request_error(url, e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error(url, e))?
            .to_vec();
        debug!(
            status,
            bytes = bytes.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "GET complete"
        );
        Ok(FetchedBody {
            status,
            content_type,
            bytes,
        })
    }
}

/// Attempt budget and backoff applied per asset.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Wrapper that adds fixed-backoff retry and cancellation to any [`Transport`].
///
/// Unlike the inner transport, a non-success status is an error here
/// ([`HarvestError::Status`]), so callers only ever see usable bodies.
#[derive(Debug)]
pub struct RetryTransport<T> {
    inner: T,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<T> RetryTransport<T>
where
    T: Transport,
{
    /// Create a retry wrapper around an existing [`Transport`].
    ///
    /// # Arguments
    ///
    /// * `inner` - The transport to wrap
    /// * `policy` - Total attempts and the fixed sleep between them
    /// * `cancel` - Interrupts both in-flight requests and backoff sleeps
    ///
    /// # Example
    ///
    /// ```ignore
    /// let retry = RetryTransport::new(&http, RetryPolicy::default(), cancel.child_token());
    /// let body = retry.get(url).await?;
    /// ```
    pub fn new(inner: T, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedBody> {
        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HarvestError::Cancelled),
            res = self.inner.get(url) => res?,
        };
        if body.is_success() {
            Ok(body)
        } else {
            Err(HarvestError::Status {
                url: url.to_string(),
                status: body.status,
            })
        }
    }
}

impl<T> Transport for RetryTransport<T>
where
    T: Transport,
{
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn get(&self, url: &str) -> Result<FetchedBody> {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            attempt += 1;
            match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.policy.max_attempts {
                        error!(
                            attempt,
                            max = self.policy.max_attempts,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "Download exhausted retries"
                        );
                        return Err(e);
                    }
                    warn!(
                        attempt,
                        max = self.policy.max_attempts,
                        backoff = ?self.policy.backoff,
                        error = %e,
                        "Download attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(HarvestError::Cancelled),
                        _ = sleep(self.policy.backoff) => {}
                    }
                }
            }
        }
    }
}
