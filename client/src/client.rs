use crate::{events::Stream, Error, Result};
use liftoff_execution::fair;
use liftoff_types::{api::Health, is_valid_address, Multiplier, RoundId, RoundRecord};
use reqwest::Client as HttpClient;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

/// Timeout for connections and requests
const TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for transient HTTP failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request (including the first attempt).
    pub max_attempts: usize,
    /// Initial backoff delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Liftoff gateway client
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    pub ws_url: Url,
    pub http_client: HttpClient,

    retry_policy: RetryPolicy,
}

impl Client {
    /// Create a new client
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        // Convert http(s) to ws(s) for WebSocket URL
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => {
                return Err(Error::InvalidScheme(scheme.to_string()));
            }
        };

        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            ws_url,
            http_client,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Returns a copy of the current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Returns a new client with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Every HTTP route is a read, so all of them may be retried.
    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            match self.http_client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                    debug!(%url, %status, attempt, "retrying request");
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                    debug!(%url, ?err, attempt, "retrying request");
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
    }

    pub async fn health(&self) -> Result<Health> {
        let url = self.base_url.join("health")?;
        let response = self.get_with_retry(url).await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Fetch a round's verification record. The seed is only present once it crashed.
    pub async fn round(&self, round_id: RoundId) -> Result<Option<RoundRecord>> {
        let url = self.base_url.join(&format!("rounds/{round_id}"))?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::Failed(status)),
        }
    }

    /// Fetch a revealed round and recompute its crash point locally.
    pub async fn verify_round(&self, round_id: RoundId) -> Result<Multiplier> {
        let record = self
            .round(round_id)
            .await?
            .ok_or(Error::RoundNotFound(round_id))?;
        let crash_point = fair::verify(&record)?;
        debug!(round_id, %crash_point, "round verified");
        Ok(crash_point)
    }

    /// Open the realtime channel for `user` and say hello.
    ///
    /// With `last_event_id` the server replays what was missed (or sends a snapshot if
    /// it no longer has those events); without it the stream starts from a snapshot.
    pub async fn connect(&self, user: &str, last_event_id: Option<u64>) -> Result<Stream> {
        self.connect_with_capacity(user, last_event_id, 0).await
    }

    /// Connect with a configurable channel capacity.
    ///
    /// A `channel_capacity` of `0` uses the default capacity.
    pub async fn connect_with_capacity(
        &self,
        user: &str,
        last_event_id: Option<u64>,
        channel_capacity: usize,
    ) -> Result<Stream> {
        if !is_valid_address(user) {
            return Err(Error::InvalidAddress(user.to_string()));
        }
        let mut ws_url = self.ws_url.join("ws")?;
        ws_url.query_pairs_mut().append_pair("user", user);
        info!(ws_url = %ws_url, ?last_event_id, "Connecting to realtime WebSocket");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("WebSocket connected");

        let stream = Stream::new_with_capacity(ws_stream, channel_capacity);
        stream.hello(last_event_id).await?;
        Ok(stream)
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    use reqwest::StatusCode;
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

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
