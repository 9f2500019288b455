pub mod client;
pub mod events;

pub use client::Client;
pub use client::RetryPolicy;
pub use events::Stream;
use liftoff_execution::fair::VerifyError;
use liftoff_types::{api::WireError, RoundId};
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] WireError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{request} rejected ({code}): {message}")]
    Rejected {
        request: String,
        code: String,
        message: String,
    },
    #[error("round {0} not found")]
    RoundNotFound(RoundId),
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),
    #[error("not an address: {0}")]
    InvalidAddress(String),
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("dial timeout")]
    DialTimeout,
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
}

impl Error {
    /// Machine-readable code of a rejected request.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_execution::{
        fair,
        mocks::{create_address, CLIENT_SEED, SERVER_SEED},
        Round,
    };
    use liftoff_gateway::{Api, Backend, RealtimeHub, Rejection};
    use futures_util::{SinkExt, StreamExt};
    use liftoff_types::{
        api::{BetPlaced, Heartbeat, RoundStarted},
        ClientMessage, Event, Multiplier, Phase, RoundRecord, Wei,
    };
    use std::{
        collections::HashMap,
        net::SocketAddr,
        num::NonZeroU32,
        sync::{Arc, Mutex},
    };
    use tokio::time::{sleep, Duration};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    #[derive(Clone, Default)]
    struct Mock {
        rounds: Arc<Mutex<HashMap<RoundId, RoundRecord>>>,
        withdrawals: Arc<Mutex<Vec<(String, String, Wei)>>>,
    }

    impl Backend for Mock {
        async fn place_bet(
            &self,
            _user: &str,
            amount: Wei,
            _auto_cashout: Option<Multiplier>,
        ) -> std::result::Result<(), Rejection> {
            if amount == 0 {
                return Err(Rejection::new("invalid_amount", "amount must be positive"));
            }
            Ok(())
        }

        async fn cash_out(&self, _user: &str) -> std::result::Result<(), Rejection> {
            Err(Rejection::new("not_running", "round 1 is not running"))
        }

        async fn withdraw(
            &self,
            user: &str,
            to: &str,
            amount: Wei,
        ) -> std::result::Result<String, Rejection> {
            let mut withdrawals = self.withdrawals.lock().unwrap();
            withdrawals.push((user.to_string(), to.to_string(), amount));
            Ok(format!("payout-{}", withdrawals.len()))
        }

        async fn round(
            &self,
            round_id: RoundId,
        ) -> std::result::Result<Option<RoundRecord>, Rejection> {
            Ok(self.rounds.lock().unwrap().get(&round_id).cloned())
        }
    }

    struct TestContext {
        hub: Arc<RealtimeHub>,
        backend: Mock,
        base_url: String,
        server_handle: tokio::task::JoinHandle<()>,
    }

    impl TestContext {
        async fn new() -> Self {
            Self::with_config(Default::default()).await
        }

        async fn with_config(config: liftoff_gateway::Config) -> Self {
            let hub = Arc::new(RealtimeHub::new(16));
            let backend = Mock::default();
            let api = Api::new(config, hub.clone(), backend.clone());

            // Start server on random port
            let addr = SocketAddr::from(([127, 0, 0, 1], 0));
            let router = api.router().unwrap();
            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            let actual_addr = listener.local_addr().unwrap();
            let base_url = format!("http://{actual_addr}");

            let server_handle = tokio::spawn(async move {
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .await
                .unwrap();
            });

            // Give server time to start
            sleep(Duration::from_millis(100)).await;

            Self {
                hub,
                backend,
                base_url,
                server_handle,
            }
        }

        fn create_client(&self) -> Client {
            Client::new(&self.base_url).unwrap()
        }

        /// Store a crashed round played with the reference seeds.
        fn reveal_round(&self, round_id: RoundId) -> RoundRecord {
            let mut round = Round::commit(
                round_id,
                SERVER_SEED.to_string(),
                CLIENT_SEED.to_string(),
                Multiplier(10_000),
                0,
            );
            round.open_betting().unwrap();
            round.start().unwrap();
            round.crash(1).unwrap();
            let record = round.record();
            self.backend
                .rounds
                .lock()
                .unwrap()
                .insert(round_id, record.clone());
            record
        }

        fn start_round(&self, round_id: RoundId) {
            self.hub.publish(Event::RoundStarted(RoundStarted {
                round_id,
                seed_hash: fair::seed_hash(SERVER_SEED),
                client_seed: CLIENT_SEED.to_string(),
                nonce: round_id,
                betting_ms: 10_000,
            }));
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            self.server_handle.abort();
        }
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(matches!(
            Client::new("ftp://localhost"),
            Err(Error::InvalidScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_client_verifies_round() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();

        let record = ctx.reveal_round(1);
        assert_eq!(client.round(1).await.unwrap(), Some(record));
        assert_eq!(client.verify_round(1).await.unwrap(), Multiplier(169));

        // Unknown round
        assert!(client.round(2).await.unwrap().is_none());
        assert!(matches!(
            client.verify_round(2).await,
            Err(Error::RoundNotFound(2))
        ));
    }

    #[tokio::test]
    async fn test_client_detects_tampered_round() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();

        let mut record = ctx.reveal_round(1);
        record.crash_point = Some(Multiplier(500));
        ctx.backend.rounds.lock().unwrap().insert(1, record);
        assert!(matches!(
            client.verify_round(1).await,
            Err(Error::Verification(fair::VerifyError::CrashMismatch { .. }))
        ));

        // A committed but unrevealed round cannot be verified yet
        let mut hidden = ctx.reveal_round(2);
        hidden.server_seed = None;
        ctx.backend.rounds.lock().unwrap().insert(2, hidden);
        assert!(matches!(
            client.verify_round(2).await,
            Err(Error::Verification(fair::VerifyError::NotRevealed(2)))
        ));
    }

    #[tokio::test]
    async fn test_client_health() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        ctx.start_round(1);

        let health = client.health().await.unwrap();
        assert_eq!(health.last_event_id, 1);
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn test_client_stream_snapshot_then_live() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        ctx.start_round(1);

        let mut stream = client.connect(&create_address(1), None).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let Event::Snapshot(snapshot) = first.event else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.last_event_id, 1);
        assert_eq!(snapshot.round_id, Some(1));
        assert_eq!(snapshot.phase, Phase::Betting);
        assert_eq!(stream.last_event_id(), Some(1));

        ctx.hub.publish(Event::BetPlaced(BetPlaced {
            round_id: 1,
            player: create_address(2),
            amount: 1_000,
            auto_cashout: None,
        }));
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.id, 2);
        assert!(matches!(live.event, Event::BetPlaced(_)));
        assert_eq!(stream.last_event_id(), Some(2));
    }

    #[tokio::test]
    async fn test_client_replays_missed_events() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        for round_id in 1..=3 {
            ctx.start_round(round_id);
        }

        let mut stream = client.connect(&create_address(1), Some(1)).await.unwrap();
        for expected in [2, 3] {
            let envelope = stream.next().await.unwrap().unwrap();
            assert_eq!(envelope.id, expected);
            let Event::RoundStarted(started) = envelope.event else {
                panic!("expected round start");
            };
            assert_eq!(started.round_id, expected);
        }
        assert_eq!(stream.last_event_id(), Some(3));
    }

    #[tokio::test]
    async fn test_client_requests() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        let user = create_address(1);

        let mut stream = client.connect(&user, None).await.unwrap();
        stream.heartbeat().await.unwrap();
        stream.place_bet(1_000, Some(Multiplier(200))).await.unwrap();

        let rejected = stream.place_bet(0, None).await.unwrap_err();
        assert_eq!(rejected.code(), Some("invalid_amount"));
        let rejected = stream.cash_out().await.unwrap_err();
        assert_eq!(rejected.code(), Some("not_running"));

        let to = create_address(2);
        let id = stream.withdraw(&to, 5_000).await.unwrap();
        assert_eq!(id, "payout-1");
        assert_eq!(
            ctx.backend.withdrawals.lock().unwrap().as_slice(),
            &[(user, to, 5_000)]
        );

        let rejected = stream.withdraw("nowhere", 5_000).await.unwrap_err();
        assert_eq!(rejected.code(), Some("invalid_recipient"));

        // The snapshot that arrived before the replies is still delivered
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first.event, Event::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_client_rejects_bad_user() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        assert!(matches!(
            client.connect("alice", None).await,
            Err(Error::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_client_rate_limited_reply_names_request() {
        let ctx = TestContext::with_config(liftoff_gateway::Config {
            messages_per_second: NonZeroU32::MIN,
            ..Default::default()
        })
        .await;
        let client = ctx.create_client();

        let mut stream = client.connect(&create_address(1), None).await.unwrap();
        stream.heartbeat().await.unwrap();
        match stream.heartbeat().await {
            Err(Error::Rejected { request, code, .. }) => {
                assert_eq!(request, "heartbeat");
                assert_eq!(code, "rate_limited");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();
        ctx.start_round(1);

        let mut url = client.ws_url.join("ws").unwrap();
        url.query_pairs_mut().append_pair("user", &create_address(1));
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let heartbeat = serde_json::to_string(&ClientMessage::Heartbeat(Heartbeat {})).unwrap();
        ws.send(Message::Text(heartbeat)).await.unwrap();

        // Closed without a snapshot or reply
        assert!(matches!(ws.next().await, Some(Ok(Message::Close(_))) | None));
    }

    #[tokio::test]
    async fn test_client_lagging_stream_resyncs_with_snapshot() {
        let ctx = TestContext::new().await;
        let client = ctx.create_client();

        let mut stream = client.connect(&create_address(1), None).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first.event, Event::Snapshot(_)));

        // Overflow the 16-slot broadcast before the connection can drain it
        for round_id in 1..=40 {
            ctx.start_round(round_id);
        }
        let resync = stream.next().await.unwrap().unwrap();
        let Event::Snapshot(snapshot) = resync.event else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.last_event_id, 40);
        assert_eq!(snapshot.round_id, Some(40));
        assert_eq!(stream.last_event_id(), Some(40));
    }
}
