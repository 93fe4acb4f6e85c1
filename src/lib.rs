//! Crashpoint - authoritative server for a real-time multiplayer crash
//! wagering game.
//!
//! A shared round drives a monotonically increasing multiplier that crashes
//! at a point committed cryptographically before bets open. Players wager
//! fiat amounts held in crypto-denominated wallets and must cash out before
//! the crash. The round engine serializes all state transitions; the
//! gateway fans engine events out to every connected client in one total
//! order.

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fair;
pub mod gateway;
pub mod ledger;
pub mod quotes;
pub mod server;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use engine::RoundEngine;
pub use errors::{GameError, GameResult};
pub use fair::{ProofGenerator, ProofSource};
pub use gateway::AppState;
pub use ledger::Ledger;
pub use quotes::QuoteCache;
pub use server::GameServer;
pub use types::{Bet, Currency, Round, RoundStatus, User};
