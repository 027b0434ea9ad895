use crate::{Error, Result};
use reqwest::Client as HttpClient;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use updraft_types::{
    ActiveBet, BetRejection, CashOutReceipt, OverrideStatus, PlaceBetReceipt, PlaceBetRequest,
    RoundId, SessionToken, Snapshot,
};
use url::Url;

pub use stream::EventStream;

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
    /// Whether non-idempotent requests (e.g., POST) may be retried. Bet
    /// intents are fire-and-forget single requests, so this defaults off.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Transport adapter for one authenticated session.
///
/// Owns the HTTP client used for snapshot polls and bet intents, and dials
/// the push-event WebSocket. Consumers hold an injected instance; there is
/// no ambient shared connection.
#[derive(Clone)]
pub struct Transport {
    pub base_url: Url,
    pub ws_url: Url,
    http_client: HttpClient,
    token: SessionToken,
    retry_policy: RetryPolicy,
}

impl Transport {
    /// Create a new transport for the given backend and session credential.
    pub fn new(base_url: &str, token: SessionToken) -> Result<Self> {
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
            token,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Returns a new transport with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Fetch the authoritative round snapshot.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let url = self.base_url.join("snapshot")?;
        let response = self.get_with_retry(url).await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Fetch the list of active bets for a round, used to restore the
    /// player's own bet after a reload. A round the server no longer knows
    /// simply has no bets.
    pub async fn active_bets(&self, round_id: RoundId) -> Result<Vec<ActiveBet>> {
        let url = self.base_url.join(&format!("rounds/{}/bets", round_id.0))?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(response.json().await?),
            reqwest::StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(Error::Failed(status)),
        }
    }

    /// Fetch the crash-override schedule, if an operator armed one.
    pub async fn override_status(&self) -> Result<Option<OverrideStatus>> {
        let url = self.base_url.join("admin/override")?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::Failed(status)),
        }
    }

    /// Stake `amount` on the current round. A refusal carries the server's
    /// reason; local state must not change on refusal.
    pub async fn place_bet(&self, request: PlaceBetRequest) -> Result<PlaceBetReceipt> {
        let url = self.base_url.join("bets")?;
        debug!(amount = request.amount, "submitting bet");
        self.post_intent(url, &request).await
    }

    /// Cash out the active bet at the server's current multiplier.
    pub async fn cash_out(&self) -> Result<CashOutReceipt> {
        let url = self.base_url.join("cashout")?;
        debug!("submitting cash-out");
        self.post_intent(url, &()).await
    }

    async fn post_intent<B, T>(&self, url: Url, body: &B) -> Result<T>
    where
        B: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http_client
            .post(url)
            .bearer_auth(&self.token.0)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status.is_client_error() {
            if let Ok(rejection) = response.json::<BetRejection>().await {
                return Err(Error::Rejected(rejection));
            }
        }
        Err(Error::Failed(status))
    }

    /// Subscribe to the push-event stream. One subscription per connection;
    /// dialing again after a drop re-subscribes with the same credential.
    pub async fn connect_events(&self) -> Result<EventStream> {
        let ws_url = self.ws_url.join(&format!("stream/{}", self.token.0))?;
        info!(ws_url = %ws_url, "connecting to event stream");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("event stream connected");

        Ok(EventStream::new(ws_stream))
    }

    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            let result = self.http_client.get(url.clone()).send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
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

mod stream {
    use crate::{Error, Result};
    use futures_util::{Stream as FutStream, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
    use tracing::{debug, error, warn};
    use updraft_types::ServerEvent;

    const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    /// Typed feed of [`ServerEvent`]s from one WebSocket connection.
    ///
    /// Delivery is at-most-once and lossy: nothing is buffered or replayed
    /// across a gap. A malformed frame is forwarded as an error item and the
    /// reader keeps going; the state machine drops it and the periodic
    /// snapshot poll heals whatever was missed.
    pub struct EventStream {
        receiver: mpsc::Receiver<Result<ServerEvent>>,
        _handle: tokio::task::JoinHandle<()>,
    }

    impl Drop for EventStream {
        fn drop(&mut self) {
            self._handle.abort();
        }
    }

    impl EventStream {
        pub(crate) fn new<S>(mut ws: WebSocketStream<S>) -> Self
        where
            S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
        {
            let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

            let handle = tokio::spawn(async move {
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(data)) => {
                            debug!("received frame: {} bytes", data.len());
                            match serde_json::from_str::<ServerEvent>(&data) {
                                Ok(event) => {
                                    if tx.send(Ok(event)).await.is_err() {
                                        break; // Receiver dropped
                                    }
                                }
                                Err(e) => {
                                    warn!("failed to decode event: {}", e);
                                    if tx.send(Err(Error::InvalidData(e))).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            debug!("event stream closed");
                            let _ = tx.send(Err(Error::ConnectionClosed)).await;
                            break;
                        }
                        Ok(_) => {} // Ignore pings/pongs/binary
                        Err(e) => {
                            error!("event stream error: {}", e);
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                    }
                }
            });

            Self {
                receiver: rx,
                _handle: handle,
            }
        }

        /// Receive the next event from the stream. `None` means the
        /// connection is gone and a redial is required.
        pub async fn next(&mut self) -> Option<Result<ServerEvent>> {
            self.receiver.recv().await
        }
    }

    impl FutStream for EventStream {
        type Item = Result<ServerEvent>;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            self.receiver.poll_recv(cx)
        }
    }
}
