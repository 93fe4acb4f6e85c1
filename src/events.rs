//! Wire protocol: inbound client messages and outbound server events.
//!
//! Both directions are internally tagged on `event`. Outbound events split
//! into broadcasts (fanned out to every socket through the engine's channel)
//! and originator-only replies the gateway sends directly.

use crate::types::{Currency, RoundPublic, RoundStatus, Wallet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages a client may send over the socket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    PlaceBet {
        usd_amount: f64,
        currency: String,
        #[serde(default)]
        auto_cash_out: Option<f64>,
    },
    Cashout,
    GetGameHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
    GetUserStats,
    Ping,
}

/// Events the server emits, broadcast or originator-only
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Snapshot of the current round, sent to the originator on connect
    GameState {
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<RoundPublic>,
    },

    NewRound {
        round_id: String,
        round_number: u64,
        hash: String,
        status: RoundStatus,
    },

    GameStarted {
        round_id: String,
        started_at: DateTime<Utc>,
    },

    MultiplierUpdate {
        round_id: String,
        multiplier: f64,
        timestamp: DateTime<Utc>,
    },

    BetPlaced {
        round_id: String,
        username: String,
        usd_amount: f64,
        currency: Currency,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_cash_out: Option<f64>,
    },

    PlayerCashout {
        round_id: String,
        username: String,
        multiplier: f64,
        usd_payout: f64,
        profit: f64,
        is_auto: bool,
    },

    /// The seed is revealed here so clients can verify the commitment
    GameCrashed {
        round_id: String,
        crash_point: f64,
        seed: String,
        timestamp: DateTime<Utc>,
    },

    RoundAborted {
        round_id: String,
        reason: String,
    },

    GameHistory {
        rounds: Vec<RoundPublic>,
    },

    UserStats {
        username: String,
        wallets: HashMap<Currency, Wallet>,
        total_bets: u64,
        total_wins: u64,
        total_profit: f64,
    },

    Pong,

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &crate::errors::GameError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_tags() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"place_bet","usd_amount":10.0,"currency":"LTC","auto_cash_out":1.5}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PlaceBet { usd_amount, currency, auto_cash_out } => {
                assert_eq!(usd_amount, 10.0);
                assert_eq!(currency, "LTC");
                assert_eq!(auto_cash_out, Some(1.5));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"event":"cashout"}"#).unwrap(),
            ClientMessage::Cashout
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"event":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
    }

    #[test]
    fn test_outbound_tags() {
        let event = ServerEvent::MultiplierUpdate {
            round_id: "r1".into(),
            multiplier: 1.42,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "multiplier_update");
        assert_eq!(json["multiplier"], 1.42);

        let crash = ServerEvent::GameCrashed {
            round_id: "r1".into(),
            crash_point: 2.0,
            seed: "ab".repeat(32),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&crash).unwrap();
        assert_eq!(json["event"], "game_crashed");
        assert!(json["seed"].is_string());
    }

    #[test]
    fn test_error_event_carries_code() {
        let err = crate::errors::GameError::RoundNotOpen;
        let json = serde_json::to_value(ServerEvent::error(&err)).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["code"], "ROUND_NOT_OPEN");
    }
}
