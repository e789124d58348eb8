use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// The file is not on the server (yet); asking again will not help.
    NotPublished,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        RetryDisposition::NotPublished
    } else {
        RetryDisposition::Retryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Direct-download retry schedule: `max_attempts` tries, waiting
/// `delays[i]` after failed attempt `i` (the last delay repeats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub delays: Vec<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
        }
    }
}

impl BackoffPolicy {
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            delays: Vec::new(),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.delays
            .get(attempt_index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Honor `HTTP(S)_PROXY` from the environment for direct downloads.
    pub system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            system_proxy: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} is not published (http {status})")]
    NotPublished { status: u16, url: String },
    #[error("invalid proxy endpoint {proxy}: {source}")]
    InvalidProxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { .. } => RetryDisposition::Retryable,
            Self::NotPublished { .. } => RetryDisposition::NotPublished,
            Self::InvalidProxy { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = Self::client_builder(&config);
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("building reqwest client: {e}"))?;
        Ok(Self { client, config })
    }

    fn client_builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    /// GET `url` directly, retrying transient failures on the backoff schedule.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let max_attempts = self.config.backoff.max_attempts.max(1);
            let mut attempt = 0;

            loop {
                match Self::attempt(&self.client, url).await {
                    Ok(body) => return Ok(body),
                    Err(err) if err.disposition() != RetryDisposition::Retryable => {
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(attempt = attempt + 1, max_attempts, error = %err, "download attempt failed");
                        if attempt + 1 >= max_attempts {
                            return Err(err);
                        }
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Single GET of `url` routed through `proxy`.
    pub async fn fetch_via_proxy(&self, proxy: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let proxy_cfg = reqwest::Proxy::all(proxy).map_err(|source| FetchError::InvalidProxy {
            proxy: proxy.to_string(),
            source,
        })?;
        let client = Self::client_builder(&self.config)
            .proxy(proxy_cfg)
            .build()
            .map_err(|source| FetchError::InvalidProxy {
                proxy: proxy.to_string(),
                source,
            })?;
        Self::attempt(&client, url).await
    }

    /// Single GET returning the body as text; used for auxiliary lists.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let body = Self::attempt(&self.client, url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn attempt(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                url: final_url,
                source,
            })?;
            return Ok(body.to_vec());
        }

        Err(match classify_status(status) {
            RetryDisposition::NotPublished => FetchError::NotPublished {
                status: status.as_u16(),
                url: final_url,
            },
            _ => FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn fetcher(max_attempts: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("sinapi-test".into()),
            backoff: BackoffPolicy::immediate(max_attempts),
            system_proxy: false,
        })
        .expect("client")
    }

    #[test]
    fn backoff_follows_schedule_then_repeats_last_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(BackoffPolicy::immediate(3).delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn not_found_is_not_retried_but_blocking_statuses_are() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NotPublished);
        assert_eq!(classify_status(StatusCode::GONE), RetryDisposition::NotPublished);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let (base, hits) = test_server::serve(vec![
            (503, b"busy".to_vec()),
            (502, b"busy".to_vec()),
            (200, b"archive-bytes".to_vec()),
        ])
        .await;

        let body = fetcher(4)
            .fetch_bytes(Uuid::new_v4(), &format!("{base}/SINAPI.zip"))
            .await
            .expect("third attempt succeeds");

        assert_eq!(body, b"archive-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_published_stops_after_first_attempt() {
        let (base, hits) = test_server::serve(vec![
            (404, Vec::new()),
            (200, b"never reached".to_vec()),
        ])
        .await;

        let err = fetcher(4)
            .fetch_bytes(Uuid::new_v4(), &format!("{base}/SINAPI.zip"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NotPublished { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_status() {
        let (base, hits) =
            test_server::serve(vec![(500, Vec::new()), (500, Vec::new())]).await;

        let err = fetcher(2)
            .fetch_bytes(Uuid::new_v4(), &format!("{base}/SINAPI.zip"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
