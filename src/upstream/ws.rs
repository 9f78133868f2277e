// =============================================================================
// Upstream WebSocket client — single-connection subscription multiplexer
// =============================================================================
//
// One long-lived connection per process. Consumers register subscriptions and
// receive a bounded per-subscription queue; inbound frames are demultiplexed
// by (channel, coin|user). The connection task owns the write half of the
// socket — every outbound frame goes through its command queue, so there is
// exactly one writer.
//
// Lifecycle: Disconnected -> Connecting -> Open -> {Reconnecting | Closing}
// -> Disconnected. On every (re)connect the full registry is replayed,
// staggered a few subscribes per tick so a reconnect storm cannot blow the
// rate budget. Heartbeat pings go out every 30 s; two missed pongs count as
// a disconnect.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::upstream::http::RetryPolicy;
use crate::upstream::messages::WsFrame;
use crate::upstream::rate_limit::{weight, RateBudget};

/// Upstream cap on distinct `userFills` subscriptions per connection.
pub const USER_FILLS_CAP: usize = 10;

/// Depth of each per-subscription queue. A slow consumer loses frames (with
/// a warning) rather than stalling the reader.
const SUBSCRIPTION_QUEUE_DEPTH: usize = 1024;

/// Subscribes replayed per stagger tick after (re)connect.
const REPLAY_BATCH: usize = 5;
const REPLAY_TICK: Duration = Duration::from_millis(250);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

// -----------------------------------------------------------------------------
// Subscriptions
// -----------------------------------------------------------------------------

/// One upstream subscription. Doubles as the demux key, so the enum derives
/// `Eq + Hash`. Addresses are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    UserFills { user: String },
    Trades { coin: String },
    AllMids,
    UserEvents { user: String },
}

impl Subscription {
    fn body(&self) -> serde_json::Value {
        match self {
            Self::UserFills { user } => json!({"type": "userFills", "user": user}),
            Self::Trades { coin } => json!({"type": "trades", "coin": coin}),
            Self::AllMids => json!({"type": "allMids"}),
            Self::UserEvents { user } => json!({"type": "userEvents", "user": user}),
        }
    }

    pub fn subscribe_frame(&self) -> String {
        json!({"method": "subscribe", "subscription": self.body()}).to_string()
    }

    pub fn unsubscribe_frame(&self) -> String {
        json!({"method": "unsubscribe", "subscription": self.body()}).to_string()
    }
}

/// Demux target derived from an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Pong,
    SubscriptionResponse,
    To(Subscription),
    /// userEvents frames that do not name a user fan out to every
    /// userEvents subscriber.
    AllUserEvents,
    Unknown,
}

/// Pure demux decision: which subscription does this frame belong to.
pub fn route_frame(frame: &WsFrame) -> Route {
    match frame.channel.as_str() {
        "pong" => Route::Pong,
        "subscriptionResponse" => Route::SubscriptionResponse,
        "allMids" => Route::To(Subscription::AllMids),
        "trades" => {
            let coin = frame
                .data
                .as_array()
                .and_then(|arr| arr.first())
                .and_then(|t| t.get("coin"))
                .and_then(|c| c.as_str());
            match coin {
                Some(coin) => Route::To(Subscription::Trades {
                    coin: coin.to_string(),
                }),
                None => Route::Unknown,
            }
        }
        "userFills" => {
            let user = frame.data.get("user").and_then(|u| u.as_str());
            match user {
                Some(user) => Route::To(Subscription::UserFills {
                    user: user.to_ascii_lowercase(),
                }),
                None => Route::Unknown,
            }
        }
        "userEvents" => {
            let user = frame.data.get("user").and_then(|u| u.as_str());
            match user {
                Some(user) => Route::To(Subscription::UserEvents {
                    user: user.to_ascii_lowercase(),
                }),
                None => Route::AllUserEvents,
            }
        }
        _ => Route::Unknown,
    }
}

// -----------------------------------------------------------------------------
// Connection state
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

enum Command {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

struct Shared {
    registry: Mutex<HashMap<Subscription, mpsc::Sender<serde_json::Value>>>,
    state: RwLock<ConnState>,
}

/// Handle shared by all subscribers. Cheap to clone.
#[derive(Clone)]
pub struct WsClient {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

/// Owns the connection loop; consumed by `run`.
pub struct WsRunner {
    url: String,
    budget: Arc<RateBudget>,
    cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    backoff: RetryPolicy,
}

impl WsClient {
    /// Build the client handle and its runner. The runner must be spawned
    /// (`tokio::spawn(runner.run(shutdown))`) before subscriptions deliver.
    pub fn new(url: &str, budget: Arc<RateBudget>) -> (Self, WsRunner) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            state: RwLock::new(ConnState::Disconnected),
        });

        let client = Self {
            cmd_tx,
            shared: shared.clone(),
        };
        let runner = WsRunner {
            url: url.to_string(),
            budget,
            cmd_rx,
            shared,
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
                jitter_fraction: 0.2,
            },
        };
        (client, runner)
    }

    /// Register a subscription and return its message queue. While the
    /// connection is not open the subscribe frame is queued implicitly: the
    /// registry is replayed on every connect.
    pub async fn subscribe(
        &self,
        sub: Subscription,
    ) -> Result<mpsc::Receiver<serde_json::Value>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        {
            let mut registry = self.shared.registry.lock();
            if registry.contains_key(&sub) {
                bail!("already subscribed: {sub:?}");
            }
            registry.insert(sub.clone(), tx);
        }
        self.cmd_tx
            .send(Command::Subscribe(sub))
            .await
            .context("ws connection task gone")?;
        Ok(rx)
    }

    /// Drop the subscription: its queue closes (terminating the reader) and
    /// an unsubscribe frame is sent if the connection is open.
    pub async fn unsubscribe(&self, sub: &Subscription) {
        let removed = self.shared.registry.lock().remove(sub).is_some();
        if removed {
            let _ = self.cmd_tx.send(Command::Unsubscribe(sub.clone())).await;
        }
    }

    /// Number of live `userFills` subscriptions (admission check input).
    pub fn user_fills_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .keys()
            .filter(|s| matches!(s, Subscription::UserFills { .. }))
            .count()
    }

    pub fn is_subscribed(&self, sub: &Subscription) -> bool {
        self.shared.registry.lock().contains_key(sub)
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.read()
    }
}

impl WsRunner {
    /// Connection loop: connect, replay registry, pump messages; reconnect
    /// with capped jittered backoff until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            *self.shared.state.write() = ConnState::Connecting;

            let stream = tokio::select! {
                conn = connect_async(&self.url) => conn,
                _ = shutdown.changed() => break,
            };

            match stream {
                Ok((ws, _resp)) => {
                    info!(url = %self.url, "websocket connected");
                    attempt = 0;
                    *self.shared.state.write() = ConnState::Open;

                    let closing = self.pump(ws, &mut shutdown).await;
                    if closing {
                        *self.shared.state.write() = ConnState::Closing;
                        break;
                    }
                    *self.shared.state.write() = ConnState::Reconnecting;
                }
                Err(e) => {
                    error!(url = %self.url, error = %e, "websocket connect failed");
                    *self.shared.state.write() = ConnState::Reconnecting;
                }
            }

            let delay = self.backoff.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            warn!(delay_ms = delay.as_millis() as u64, "websocket reconnecting");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        *self.shared.state.write() = ConnState::Disconnected;
        info!("websocket task stopped");
    }

    /// Drive one open connection. Returns true when shutdown was requested
    /// (no reconnect), false on a connection failure (reconnect).
    async fn pump(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let (mut write, mut read) = ws.split();

        // ── Replay registered subscriptions, staggered ──────────────────
        let pending: Vec<Subscription> =
            self.shared.registry.lock().keys().cloned().collect();
        for batch in pending.chunks(REPLAY_BATCH) {
            self.budget
                .acquire(weight::WS_SUBSCRIBE * batch.len() as u32)
                .await;
            for sub in batch {
                if let Err(e) = write.send(Message::Text(sub.subscribe_frame())).await {
                    error!(error = %e, "subscription replay failed");
                    return false;
                }
            }
            debug!(count = batch.len(), "subscriptions replayed");
            sleep(REPLAY_TICK).await;
        }

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // immediate first tick
        let mut missed_pongs: u32 = 0;

        // Branch outcomes are materialised before any handling so the
        // pending select futures are fully dropped by the time we touch the
        // registry or the budget.
        enum Step {
            Shutdown,
            Heartbeat,
            Cmd(Option<Command>),
            Inbound(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        }

        loop {
            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                _ = heartbeat.tick() => Step::Heartbeat,
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                msg = read.next() => Step::Inbound(msg),
            };

            match step {
                Step::Shutdown => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }

                Step::Heartbeat => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        warn!(missed_pongs, "heartbeat lost, dropping connection");
                        return false;
                    }
                    missed_pongs += 1;
                    if let Err(e) = write
                        .send(Message::Text(json!({"method": "ping"}).to_string()))
                        .await
                    {
                        error!(error = %e, "heartbeat send failed");
                        return false;
                    }
                }

                Step::Cmd(None) => return true,
                Step::Cmd(Some(cmd)) => {
                    let frame = match &cmd {
                        Command::Subscribe(sub) => {
                            // Replay may already have sent it if the command
                            // raced a reconnect; the upstream treats a repeat
                            // subscribe as a no-op.
                            self.budget.acquire(weight::WS_SUBSCRIBE).await;
                            sub.subscribe_frame()
                        }
                        Command::Unsubscribe(sub) => sub.unsubscribe_frame(),
                    };
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        error!(error = %e, "ws send failed");
                        return false;
                    }
                }

                Step::Inbound(Some(Ok(Message::Text(text)))) => {
                    if self.dispatch(&text).is_some() {
                        missed_pongs = 0;
                    }
                }
                Step::Inbound(Some(Ok(Message::Ping(payload)))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Step::Inbound(Some(Ok(Message::Close(_)))) => {
                    warn!("websocket closed by server");
                    return false;
                }
                Step::Inbound(Some(Ok(_))) => {}
                Step::Inbound(Some(Err(e))) => {
                    error!(error = %e, "websocket read error");
                    return false;
                }
                Step::Inbound(None) => {
                    warn!("websocket stream ended");
                    return false;
                }
            }
        }
    }

    /// Demultiplex one text frame into its subscription queue. Returns
    /// `Some(())` when the frame counts as liveness (any parseable frame).
    fn dispatch(&self, text: &str) -> Option<()> {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "unparseable ws frame");
                return None;
            }
        };

        match route_frame(&frame) {
            Route::Pong => {}
            Route::SubscriptionResponse => {
                debug!("subscription acknowledged");
            }
            Route::To(sub) => self.deliver(&sub, frame.data),
            Route::AllUserEvents => {
                let targets: Vec<Subscription> = self
                    .shared
                    .registry
                    .lock()
                    .keys()
                    .filter(|s| matches!(s, Subscription::UserEvents { .. }))
                    .cloned()
                    .collect();
                for sub in targets {
                    self.deliver(&sub, frame.data.clone());
                }
            }
            Route::Unknown => {
                debug!(channel = %frame.channel, "frame for unknown channel");
            }
        }
        Some(())
    }

    fn deliver(&self, sub: &Subscription, data: serde_json::Value) {
        let tx = {
            let registry = self.shared.registry.lock();
            registry.get(sub).cloned()
        };
        let Some(tx) = tx else {
            debug!(?sub, "frame for unregistered subscription dropped");
            return;
        };
        match tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(?sub, "subscription queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Reader went away without unsubscribing; reap the entry.
                self.shared.registry.lock().remove(sub);
                debug!(?sub, "subscription reaped after reader drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frames_match_upstream_shape() {
        let sub = Subscription::UserFills {
            user: "0xabc".into(),
        };
        let frame: serde_json::Value =
            serde_json::from_str(&sub.subscribe_frame()).unwrap();
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["subscription"]["type"], "userFills");
        assert_eq!(frame["subscription"]["user"], "0xabc");

        let unsub: serde_json::Value =
            serde_json::from_str(&sub.unsubscribe_frame()).unwrap();
        assert_eq!(unsub["method"], "unsubscribe");

        let trades = Subscription::Trades { coin: "BTC".into() };
        let frame: serde_json::Value =
            serde_json::from_str(&trades.subscribe_frame()).unwrap();
        assert_eq!(frame["subscription"]["coin"], "BTC");
    }

    #[test]
    fn frames_route_by_channel_and_identity() {
        let frame: WsFrame = serde_json::from_str(
            r#"{"channel": "trades", "data": [{"coin": "ETH", "side": "B",
                 "px": "1", "sz": "1", "time": 1, "tid": 2, "users": []}]}"#,
        )
        .unwrap();
        assert_eq!(
            route_frame(&frame),
            Route::To(Subscription::Trades { coin: "ETH".into() })
        );

        let frame: WsFrame = serde_json::from_str(
            r#"{"channel": "userFills", "data": {"user": "0xABC", "fills": []}}"#,
        )
        .unwrap();
        assert_eq!(
            route_frame(&frame),
            Route::To(Subscription::UserFills {
                user: "0xabc".into()
            })
        );

        let frame: WsFrame =
            serde_json::from_str(r#"{"channel": "pong"}"#).unwrap();
        assert_eq!(route_frame(&frame), Route::Pong);

        let frame: WsFrame =
            serde_json::from_str(r#"{"channel": "whatever", "data": {}}"#).unwrap();
        assert_eq!(route_frame(&frame), Route::Unknown);
    }

    #[tokio::test]
    async fn registry_tracks_user_fills_cap_input() {
        let budget = Arc::new(RateBudget::new());
        let (client, _runner) = WsClient::new("wss://example.invalid/ws", budget);

        for i in 0..3 {
            client
                .subscribe(Subscription::UserFills {
                    user: format!("0x{i:040x}"),
                })
                .await
                .unwrap();
        }
        client
            .subscribe(Subscription::Trades { coin: "BTC".into() })
            .await
            .unwrap();

        assert_eq!(client.user_fills_count(), 3);

        // Duplicate registration is refused.
        assert!(client
            .subscribe(Subscription::UserFills {
                user: format!("0x{:040x}", 0),
            })
            .await
            .is_err());

        client
            .unsubscribe(&Subscription::UserFills {
                user: format!("0x{:040x}", 0),
            })
            .await;
        assert_eq!(client.user_fills_count(), 2);
    }
}
