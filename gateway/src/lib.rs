//! HTTP and WebSocket surface for liftoff.
//!
//! `GET /ws?user=0x..` upgrades to the realtime channel: the first frame must be a
//! `hello`, after which the connection receives its replay (or a snapshot) followed by
//! the live stream, and may send bets, cashouts, heartbeats and withdrawals.
//! `GET /rounds/:id` serves verification records and `GET /health` a liveness summary.
//!
//! The gateway does not authenticate. `user` is taken as proven by whatever sits in front
//! of it (a session-checking proxy), and a connection may bet and withdraw that user's
//! balance to any address. Never expose `/ws` directly.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State as AxumState,
    },
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use liftoff_types::{
    api::{Health, Hello, Reply},
    is_valid_address, normalize_address, now_millis, ClientMessage, Envelope, Event,
    Multiplier, RoundId, RoundRecord, Wei,
};
use serde::Deserialize;
use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

mod connections;
mod hub;

pub use connections::Connections;
pub use hub::{RealtimeHub, Replay};

/// A request refused by the backend, relayed to the client as a [Reply].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: String,
    pub message: String,
}

impl Rejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Game operations the gateway forwards on behalf of a connected user.
pub trait Backend: Clone + Send + Sync + 'static {
    fn place_bet(
        &self,
        user: &str,
        amount: Wei,
        auto_cashout: Option<Multiplier>,
    ) -> impl Future<Output = Result<(), Rejection>> + Send;

    fn cash_out(&self, user: &str) -> impl Future<Output = Result<(), Rejection>> + Send;

    /// Returns the payout id.
    fn withdraw(
        &self,
        user: &str,
        to: &str,
        amount: Wei,
    ) -> impl Future<Output = Result<String, Rejection>> + Send;

    fn round(
        &self,
        round_id: RoundId,
    ) -> impl Future<Output = Result<Option<RoundRecord>, Rejection>> + Send;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid rate limit configuration")]
    RateLimit,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Expected interval between client heartbeats.
    pub heartbeat_interval: Duration,
    /// Connections silent for this many heartbeat intervals are evicted.
    pub heartbeat_timeout_multiple: u32,
    pub sync_interval: Duration,
    /// Milliseconds to replenish one request in the per-IP HTTP limiter.
    pub rate_limit_replenish_ms: u64,
    pub rate_limit_burst: u32,
    /// Client messages accepted per second on a single connection.
    pub messages_per_second: NonZeroU32,
}

impl Config {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_multiple
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout_multiple: 3,
            sync_interval: Duration::from_secs(5),
            rate_limit_replenish_ms: 10,
            rate_limit_burst: 200,
            messages_per_second: NonZeroU32::MIN.saturating_add(19),
        }
    }
}

struct Context<B: Backend> {
    config: Config,
    hub: Arc<RealtimeHub>,
    connections: Arc<Connections>,
    backend: B,
}

pub struct Api<B: Backend> {
    context: Arc<Context<B>>,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user: String,
}

impl<B: Backend> Api<B> {
    pub fn new(config: Config, hub: Arc<RealtimeHub>, backend: B) -> Self {
        Self {
            context: Arc::new(Context {
                config,
                hub,
                connections: Arc::new(Connections::default()),
                backend,
            }),
        }
    }

    pub fn connections(&self) -> Arc<Connections> {
        self.context.connections.clone()
    }

    pub fn router(&self) -> Result<Router, Error> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_millisecond(self.context.config.rate_limit_replenish_ms)
                .burst_size(self.context.config.rate_limit_burst)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or(Error::RateLimit)?,
        );

        Ok(Router::new()
            .route("/ws", get(connect::<B>))
            .route("/rounds/:id", get(query_round::<B>))
            .route("/health", get(health::<B>))
            .layer(cors)
            .layer(GovernorLayer {
                config: governor_conf,
            })
            .with_state(self.context.clone()))
    }

    /// Emit sync ticks and evict silent connections until `shutdown` flips.
    pub fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let context = self.context.clone();
        tokio::spawn(async move {
            let mut sync = interval(context.config.sync_interval);
            sync.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut reap = interval(context.config.heartbeat_interval);
            reap.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sync.tick() => {
                        context.hub.broadcast(Event::SyncTick(liftoff_types::api::SyncTick {
                            server_time: now_millis(),
                        }));
                    }
                    _ = reap.tick() => {
                        let evicted = context.connections.reap(context.config.heartbeat_timeout());
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "reaped connections");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("gateway maintenance stopped");
                        break;
                    }
                }
            }
        })
    }
}

async fn query_round<B: Backend>(
    AxumState(context): AxumState<Arc<Context<B>>>,
    Path(round_id): Path<RoundId>,
) -> impl IntoResponse {
    match context.backend.round(round_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(rejection) => {
            warn!(round_id, code = %rejection.code, "round lookup failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn health<B: Backend>(AxumState(context): AxumState<Arc<Context<B>>>) -> impl IntoResponse {
    Json(Health {
        connections: context.connections.len(),
        last_event_id: context.hub.last_event_id(),
    })
}

async fn connect<B: Backend>(
    AxumState(context): AxumState<Arc<Context<B>>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !is_valid_address(&params.user) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let user = normalize_address(&params.user);
    ws.on_upgrade(move |socket| handle_socket(socket, context, user))
        .into_response()
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, envelope: &Envelope) -> bool {
    let frame = match envelope.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(?e, "failed to encode envelope");
            return true;
        }
    };
    sender.send(Message::Text(frame)).await.is_ok()
}

async fn reply(sender: &mut Sender, reply: Reply) -> bool {
    let envelope = Envelope::new(
        liftoff_types::api::UNSEQUENCED,
        now_millis(),
        Event::Reply(reply),
    );
    send(sender, &envelope).await
}

/// Read frames until the client says hello.
async fn await_hello(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    wait: Duration,
) -> Option<Hello> {
    let frame = timeout(wait, receiver.next()).await.ok()??;
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Hello(hello)) => Some(hello),
            Ok(other) => {
                warn!(message = other.name(), "first frame was not hello");
                None
            }
            Err(e) => {
                warn!(?e, "malformed first frame");
                None
            }
        },
        _ => None,
    }
}

async fn handle_socket<B: Backend>(socket: WebSocket, context: Arc<Context<B>>, user: String) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut evicted) = context.connections.register(&user);
    info!(connection, user = %user, "websocket connected");

    let Some(hello) = await_hello(&mut receiver, context.config.heartbeat_timeout()).await else {
        context.connections.unregister(connection);
        let _ = sender.close().await;
        return;
    };
    context.connections.touch(connection);

    // Replay and live stream are taken together so nothing is missed between them
    let (replay, mut updates) = context.hub.connect(hello.last_event_id);
    let mut last_sent = hello.last_event_id.unwrap_or_default();
    let mut open = match replay {
        Replay::Events(events) => {
            debug!(connection, count = events.len(), "replaying events");
            let mut open = true;
            for envelope in &events {
                last_sent = envelope.id;
                if !send(&mut sender, envelope).await {
                    open = false;
                    break;
                }
            }
            open
        }
        Replay::Snapshot(envelope) => {
            if let Event::Snapshot(snapshot) = &envelope.event {
                last_sent = snapshot.last_event_id;
            }
            send(&mut sender, &envelope).await
        }
    };

    let limiter: DefaultDirectRateLimiter =
        RateLimiter::direct(Quota::per_second(context.config.messages_per_second));
    while open {
        tokio::select! {
            _ = &mut evicted => {
                info!(connection, "connection timed out");
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        context.connections.touch(connection);
                        let parsed = serde_json::from_str::<ClientMessage>(&text);
                        let request = parsed.as_ref().map_or("unknown", ClientMessage::name);
                        if limiter.check().is_err() {
                            open = reply(
                                &mut sender,
                                Reply::rejected(request, "rate_limited", "too many messages".into()),
                            )
                            .await;
                            continue;
                        }
                        open = match parsed {
                            Ok(message) => {
                                let outcome = dispatch(&context.backend, &user, &message).await;
                                reply(&mut sender, outcome).await
                            }
                            Err(e) => {
                                debug!(connection, ?e, "malformed client message");
                                reply(
                                    &mut sender,
                                    Reply::rejected("unknown", "bad_request", e.to_string()),
                                )
                                .await
                            }
                        };
                    }
                    Some(Ok(Message::Ping(data))) => {
                        context.connections.touch(connection);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection, "client closed websocket");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection, ?e, "websocket error");
                        break;
                    }
                    Some(Ok(_)) => context.connections.touch(connection),
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(envelope) => {
                        if envelope.is_sequenced() {
                            if envelope.id <= last_sent {
                                continue;
                            }
                            last_sent = envelope.id;
                        }
                        open = send(&mut sender, &envelope).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection, skipped, "client lagged, resyncing with snapshot");
                        let envelope = context.hub.snapshot();
                        if let Event::Snapshot(snapshot) = &envelope.event {
                            last_sent = snapshot.last_event_id;
                        }
                        open = send(&mut sender, &envelope).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(connection, "event stream closed");
                        break;
                    }
                }
            }
        }
    }

    context.connections.unregister(connection);
    let _ = sender.close().await;
    info!(connection, "websocket disconnected");
}

async fn dispatch<B: Backend>(backend: &B, user: &str, message: &ClientMessage) -> Reply {
    let request = message.name();
    let result = match message {
        ClientMessage::Hello(_) => Err(Rejection::new("already_connected", "hello already received")),
        ClientMessage::Heartbeat(_) => Ok(None),
        ClientMessage::PlaceBet(bet) => backend
            .place_bet(user, bet.amount, bet.auto_cashout)
            .await
            .map(|_| None),
        ClientMessage::CashOut(_) => backend.cash_out(user).await.map(|_| None),
        ClientMessage::Withdraw(withdraw) => {
            if !is_valid_address(&withdraw.to) {
                Err(Rejection::new("invalid_recipient", "recipient is not an address"))
            } else {
                backend
                    .withdraw(user, &normalize_address(&withdraw.to), withdraw.amount)
                    .await
                    .map(Some)
            }
        }
    };
    match result {
        Ok(message) => Reply {
            message,
            ..Reply::ok(request)
        },
        Err(rejection) => Reply::rejected(request, &rejection.code, rejection.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Rounds;

    impl Backend for Rounds {
        async fn place_bet(
            &self,
            _user: &str,
            amount: Wei,
            _auto_cashout: Option<Multiplier>,
        ) -> Result<(), Rejection> {
            if amount == 0 {
                return Err(Rejection::new("invalid_amount", "zero"));
            }
            Ok(())
        }

        async fn cash_out(&self, _user: &str) -> Result<(), Rejection> {
            Err(Rejection::new("not_running", "round 1 is not running"))
        }

        async fn withdraw(&self, _user: &str, _to: &str, _amount: Wei) -> Result<String, Rejection> {
            Ok("payout-1".into())
        }

        async fn round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, Rejection> {
            Ok((round_id == 1).then(|| RoundRecord {
                round_id: 1,
                seed_hash: "hash".into(),
                server_seed: Some("seed".into()),
                client_seed: "client".into(),
                nonce: 1,
                crash_point: Some(Multiplier(169)),
                started_at: 0,
                crashed_at: Some(1),
            }))
        }
    }

    fn api() -> Api<Rounds> {
        Api::new(Config::default(), Arc::new(RealtimeHub::new(16)), Rounds)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "127.0.0.1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_lookup() {
        let router = api().router().unwrap();
        let response = router.clone().oneshot(get("/rounds/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let record: RoundRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.crash_point, Some(Multiplier(169)));

        let response = router.oneshot(get("/rounds/2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let api = api();
        let response = api.router().unwrap().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.connections, 0);
        assert_eq!(health.last_event_id, 0);
    }

    #[tokio::test]
    async fn test_dispatch_replies() {
        let reply = dispatch(
            &Rounds,
            "0xabc",
            &ClientMessage::PlaceBet(liftoff_types::api::PlaceBet {
                amount: 0,
                auto_cashout: None,
            }),
        )
        .await;
        assert_eq!(reply.request, "placeBet");
        assert!(!reply.ok);
        assert_eq!(reply.code.as_deref(), Some("invalid_amount"));

        let reply = dispatch(
            &Rounds,
            "0xabc",
            &ClientMessage::Withdraw(liftoff_types::api::Withdraw {
                amount: 5,
                to: "0x00000000000000000000000000000000000000AA".into(),
            }),
        )
        .await;
        assert!(reply.ok);
        assert_eq!(reply.message.as_deref(), Some("payout-1"));

        let reply = dispatch(
            &Rounds,
            "0xabc",
            &ClientMessage::Withdraw(liftoff_types::api::Withdraw {
                amount: 5,
                to: "nope".into(),
            }),
        )
        .await;
        assert_eq!(reply.code.as_deref(), Some("invalid_recipient"));

        let reply = dispatch(&Rounds, "0xabc", &ClientMessage::Hello(Hello::default())).await;
        assert_eq!(reply.code.as_deref(), Some("already_connected"));
    }
}
