//! Page fetcher used by source adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Bounded retry schedule: `max_retries` extra attempts, exponential delay capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Constant delay between attempts.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.base_delay.saturating_mul(1 << exp).min(self.max_delay)
    }
}

const BROWSER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 OPR/111.0.0.0",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Mobile Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Empty means the built-in browser agents.
    pub user_agents: Vec<String>,
    pub concurrency: usize,
    /// Minimum spacing between consecutive requests.
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agents: Vec::new(),
            concurrency: 2,
            min_interval: Duration::ZERO,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Closed => false,
        }
    }
}

/// HTTP GET with bounded concurrency, request pacing, rotating user agents and retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Semaphore,
    agents: Vec<String>,
    next_agent: AtomicUsize,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let agents = if config.user_agents.is_empty() {
            BROWSER_AGENTS.iter().map(|a| a.to_string()).collect()
        } else {
            config.user_agents
        };

        Ok(Self {
            client,
            permits: Semaphore::new(config.concurrency.max(1)),
            agents,
            next_agent: AtomicUsize::new(0),
            min_interval: config.min_interval,
            last_request: Mutex::new(None),
            backoff: config.backoff,
        })
    }

    /// Next user agent, round-robin.
    pub fn user_agent(&self) -> &str {
        let idx = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        &self.agents[idx]
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        async {
            let mut retry = 0;
            loop {
                match self.attempt(url).await {
                    Ok(page) => return Ok(page),
                    Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(retry);
                        debug!(retry, ?delay, error = %err, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(info_span!("fetch", url))
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.pace().await;
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await.map_err(request_error)?;
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }

    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            tokio::time::sleep_until(at + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::fixed(max_retries, Duration::from_millis(1)),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));

        let fixed = BackoffPolicy::fixed(3, Duration::from_secs(60));
        assert_eq!(fixed.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(fixed.delay_for_attempt(2), Duration::from_secs(60));
    }

    #[test]
    fn user_agents_rotate() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agents: vec!["a".into(), "b".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(fetcher.user_agent(), "a");
        assert_eq!(fetcher.user_agent(), "b");
        assert_eq!(fetcher.user_agent(), "a");

        let default = fast_fetcher(0);
        assert_ne!(default.user_agent(), default.user_agent());
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flats"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flats"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let page = fast_fetcher(2)
            .fetch_text(&format!("{}/flats", server.uri()))
            .await
            .unwrap();
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_fetcher(2).fetch_text(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 502, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_fetcher(3)
            .fetch_text(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn requests_are_paced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            min_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();

        let started = Instant::now();
        for _ in 0..3 {
            fetcher.fetch_text(&server.uri()).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
