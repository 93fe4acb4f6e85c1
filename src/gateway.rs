//! Per-connection session handling for the WebSocket wire protocol.
//!
//! Each connection authenticates via its session token, receives a
//! `game_state` snapshot, and then multiplexes inbound client messages with
//! the engine's broadcast stream in one select loop. Inbound operations are
//! processed in send order; engine errors go back to the originating socket
//! only.

use crate::config::AppConfig;
use crate::engine::RoundEngine;
use crate::errors::GameError;
use crate::events::{ClientMessage, ServerEvent};
use crate::quotes::{crypto_to_usd, QuoteCache};
use crate::store::{SessionValidator, UserStore};
use crate::types::Wallet;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared state behind every connection
pub struct AppState {
    pub engine: Arc<RoundEngine>,
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionValidator>,
    pub quotes: Arc<QuoteCache>,
    pub config: AppConfig,
    /// connection id → user id, guarded; broadcast iteration never touches it
    connections: DashMap<u64, String>,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(
        engine: Arc<RoundEngine>,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionValidator>,
        quotes: Arc<QuoteCache>,
        config: AppConfig,
    ) -> Self {
        Self {
            engine,
            users,
            sessions,
            quotes,
            config,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: String,
}

/// WebSocket endpoint handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(state, socket, params.token))
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket, token: String) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match state.sessions.authenticate(&token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) | Err(_) => {
            let event = ServerEvent::error(&GameError::Unauthenticated);
            let _ = send_event(&mut sender, &event).await;
            let _ = sender.close().await;
            return;
        }
    };

    let connection_id = state.next_connection_id.fetch_add(1, Ordering::SeqCst);
    state.connections.insert(connection_id, user_id.clone());
    info!(connection_id, %user_id, total = state.connection_count(), "client connected");

    // Subscribe before the snapshot so no event between the two is missed.
    let mut events = state.engine.subscribe();
    let snapshot = ServerEvent::GameState {
        round: state.engine.snapshot().await,
    };
    if send_event(&mut sender, &snapshot).await.is_err() {
        state.connections.remove(&connection_id);
        return;
    }

    let mut limiter = RateLimiter::new(
        state.config.limits.rate_limit_per_min,
        Duration::from_secs(60),
    );

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.allow(Instant::now()) {
                            warn!(connection_id, %user_id, "rate limit exceeded, dropping connection");
                            let event = ServerEvent::error(&GameError::RateLimited);
                            let _ = send_event(&mut sender, &event).await;
                            let _ = sender.close().await;
                            break;
                        }
                        if let Some(reply) = handle_text(&state, &user_id, &text).await {
                            if send_event(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong frames
                    Some(Err(err)) => {
                        debug!(connection_id, %err, "socket error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection_id, skipped, "event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // In-flight bets stay in the round; only the socket goes away.
    state.connections.remove(&connection_id);
    info!(connection_id, %user_id, total = state.connection_count(), "client disconnected");
}

async fn handle_text(state: &AppState, user_id: &str, text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => dispatch(state, user_id, message).await,
        Err(err) => Some(ServerEvent::error(&GameError::BadRequest(err.to_string()))),
    }
}

/// Translate one inbound message into an engine call. Returns the
/// originator-only reply, if any; broadcasts flow through the event channel.
async fn dispatch(state: &AppState, user_id: &str, message: ClientMessage) -> Option<ServerEvent> {
    match message {
        ClientMessage::PlaceBet { usd_amount, currency, auto_cash_out } => {
            match state
                .engine
                .place_bet(user_id, usd_amount, &currency, auto_cash_out)
                .await
            {
                Ok(_) => None,
                Err(err) => Some(ServerEvent::error(&err)),
            }
        }
        ClientMessage::Cashout => match state.engine.cashout(user_id).await {
            Ok(_) => None,
            Err(err) => Some(ServerEvent::error(&err)),
        },
        ClientMessage::GetGameHistory { limit } => match state.engine.history(limit).await {
            Ok(rounds) => Some(ServerEvent::GameHistory { rounds }),
            Err(err) => Some(ServerEvent::error(&err)),
        },
        ClientMessage::GetUserStats => Some(user_stats(state, user_id).await),
        ClientMessage::Ping => Some(ServerEvent::Pong),
    }
}

async fn user_stats(state: &AppState, user_id: &str) -> ServerEvent {
    let user = match state.users.find_by_id(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return ServerEvent::error(&GameError::Store(format!("unknown user {user_id}"))),
        Err(err) => return ServerEvent::error(&GameError::from(err)),
    };

    // Advisory valuation at the current quotes
    let prices = state.quotes.get_all().await;
    let wallets: HashMap<_, _> = user
        .wallets
        .iter()
        .map(|(&currency, wallet)| {
            let price = prices.get(&currency).copied().unwrap_or(0.0);
            (
                currency,
                Wallet {
                    balance: wallet.balance,
                    usd_value: crypto_to_usd(wallet.balance, price),
                },
            )
        })
        .collect();

    ServerEvent::UserStats {
        username: user.username,
        wallets,
        total_bets: user.total_bets,
        total_wins: user.total_wins,
        total_profit: user.total_profit,
    }
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &ServerEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}

/// Sliding-window limiter over inbound operations
struct RateLimiter {
    window: Duration,
    max_ops: usize,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    fn new(max_ops_per_window: u32, window: Duration) -> Self {
        Self {
            window,
            max_ops: max_ops_per_window as usize,
            timestamps: VecDeque::new(),
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() >= self.max_ops {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }
}
