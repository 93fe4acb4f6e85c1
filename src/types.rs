//! Core data model: currencies, rounds, bets, users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Supported wager currencies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Btc,
    Eth,
    Ltc,
    Ada,
    Dot,
}

impl Currency {
    pub const ALL: [Currency; 5] = [
        Currency::Btc,
        Currency::Eth,
        Currency::Ltc,
        Currency::Ada,
        Currency::Dot,
    ];

    /// Ticker code as it appears on the wire
    pub fn code(self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Ltc => "LTC",
            Currency::Ada => "ADA",
            Currency::Dot => "DOT",
        }
    }

    /// Parse a wire ticker code (case-insensitive)
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "BTC" => Some(Currency::Btc),
            "ETH" => Some(Currency::Eth),
            "LTC" => Some(Currency::Ltc),
            "ADA" => Some(Currency::Ada),
            "DOT" => Some(Currency::Dot),
            _ => None,
        }
    }

    /// Asset id used by the external quote API
    pub fn quote_id(self) -> &'static str {
        match self {
            Currency::Btc => "bitcoin",
            Currency::Eth => "ethereum",
            Currency::Ltc => "litecoin",
            Currency::Ada => "cardano",
            Currency::Dot => "polkadot",
        }
    }

    /// Last-resort USD price when the quote source and cache both fail
    pub fn fallback_price_usd(self) -> f64 {
        match self {
            Currency::Btc => 45_000.0,
            Currency::Eth => 3_000.0,
            Currency::Ltc => 100.0,
            Currency::Ada => 0.5,
            Currency::Dot => 7.0,
        }
    }

    /// Wallet balance seeded on first account creation
    pub fn starting_balance(self) -> f64 {
        match self {
            Currency::Btc => 0.001,
            Currency::Eth => 0.01,
            Currency::Ltc | Currency::Ada | Currency::Dot => 1.0,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Round lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundStatus {
    Waiting,
    Running,
    Crashed,
}

/// A single wager inside a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub user_id: String,
    pub username: String,
    pub usd_amount: f64,
    pub currency: Currency,
    /// USD per unit, snapshot at acceptance
    pub price_at_time: f64,
    pub crypto_amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cash_out: Option<f64>,
    pub cashed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashed_out_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_usd: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

/// One game cycle from WAITING through CRASHED
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub round_number: u64,
    /// Hex-encoded 256-bit seed, secret until the round crashes
    pub seed: String,
    /// SHA-256 of the seed, published at creation
    pub hash: String,
    pub crash_point: f64,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crashed_at: Option<DateTime<Utc>>,
    pub current_multiplier: f64,
    /// Acceptance order
    pub bets: Vec<Bet>,
}

impl Round {
    pub fn bet_for(&self, user_id: &str) -> Option<&Bet> {
        self.bets.iter().find(|b| b.user_id == user_id)
    }

    pub fn bet_for_mut(&mut self, user_id: &str) -> Option<&mut Bet> {
        self.bets.iter_mut().find(|b| b.user_id == user_id)
    }

    /// Broadcast view. The seed and crash point stay hidden until the
    /// round has crashed, otherwise the commitment would leak.
    pub fn public_view(&self) -> RoundPublic {
        let crashed = self.status == RoundStatus::Crashed;
        RoundPublic {
            round_id: self.round_id.clone(),
            round_number: self.round_number,
            hash: self.hash.clone(),
            seed: crashed.then(|| self.seed.clone()),
            crash_point: crashed.then_some(self.crash_point),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            crashed_at: self.crashed_at,
            current_multiplier: self.current_multiplier,
            bets: self.bets.clone(),
        }
    }
}

/// Client-facing round snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundPublic {
    pub round_id: String,
    pub round_number: u64,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<f64>,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crashed_at: Option<DateTime<Utc>>,
    pub current_multiplier: f64,
    pub bets: Vec<Bet>,
}

/// Per-currency balance held internally, not linked to any chain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Wallet {
    pub balance: f64,
    /// Advisory USD valuation at last quote
    pub usd_value: f64,
}

/// Player account with wallets and lifetime aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub wallets: HashMap<Currency, Wallet>,
    pub total_bets: u64,
    pub total_wins: u64,
    pub total_profit: f64,
}

impl User {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        email: &str,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            email: email.trim().to_ascii_lowercase(),
            password_hash: password_hash.into(),
            wallets: HashMap::new(),
            total_bets: 0,
            total_wins: 0,
            total_profit: 0.0,
        }
    }

    pub fn wallet_balance(&self, currency: Currency) -> f64 {
        self.wallets.get(&currency).map_or(0.0, |w| w.balance)
    }
}

/// Round half-up to whole cents
pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Truncate toward zero at two fractional digits
pub fn truncate_to_cents(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_codes_round_trip() {
        for currency in Currency::ALL {
            assert_eq!(Currency::from_code(currency.code()), Some(currency));
        }
        assert_eq!(Currency::from_code("btc"), Some(Currency::Btc));
        assert_eq!(Currency::from_code("DOGE"), None);
    }

    #[test]
    fn test_currency_quote_ids_and_fallbacks() {
        assert_eq!(Currency::Btc.quote_id(), "bitcoin");
        assert_eq!(Currency::Dot.quote_id(), "polkadot");
        assert_eq!(Currency::Eth.fallback_price_usd(), 3_000.0);
        assert_eq!(Currency::Ada.starting_balance(), 1.0);
    }

    #[test]
    fn test_public_view_hides_commitment_until_crash() {
        let mut round = Round {
            round_id: "17000000000001".to_string(),
            round_number: 1,
            seed: "aa".repeat(32),
            hash: "bb".repeat(32),
            crash_point: 2.5,
            status: RoundStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            crashed_at: None,
            current_multiplier: 1.0,
            bets: vec![],
        };

        let view = round.public_view();
        assert!(view.seed.is_none());
        assert!(view.crash_point.is_none());
        assert_eq!(view.hash, round.hash);

        round.status = RoundStatus::Crashed;
        let view = round.public_view();
        assert_eq!(view.seed.as_deref(), Some(round.seed.as_str()));
        assert_eq!(view.crash_point, Some(2.5));
    }

    #[test]
    fn test_bet_lookup_by_user() {
        let bet = Bet {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            usd_amount: 10.0,
            currency: Currency::Ltc,
            price_at_time: 100.0,
            crypto_amount: 0.1,
            auto_cash_out: None,
            cashed_out: false,
            cashed_out_at: None,
            payout_usd: None,
            profit_usd: None,
            placed_at: Utc::now(),
        };
        let mut round = Round {
            round_id: "r1".to_string(),
            round_number: 1,
            seed: "aa".repeat(32),
            hash: "bb".repeat(32),
            crash_point: 2.0,
            status: RoundStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            crashed_at: None,
            current_multiplier: 1.0,
            bets: vec![bet],
        };

        assert!(round.bet_for("u1").is_some());
        assert!(round.bet_for("u2").is_none());
        round.bet_for_mut("u1").unwrap().cashed_out = true;
        assert!(round.bet_for("u1").unwrap().cashed_out);
    }

    #[test]
    fn test_user_email_normalized() {
        let user = User::new("u1", "alice", "  Alice@Example.COM ", "hash");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.wallet_balance(Currency::Btc), 0.0);
    }

    #[test]
    fn test_cent_rounding() {
        assert_eq!(round_to_cents(19.999), 20.0);
        assert_eq!(round_to_cents(15.000000000000002), 15.0);
        assert_eq!(truncate_to_cents(1.999), 1.99);
        assert_eq!(truncate_to_cents(1.01), 1.01);
        assert_eq!(truncate_to_cents(1000.0), 1000.0);
    }
}
