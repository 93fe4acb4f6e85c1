//! Repository seams for the user store, round store and session validation.
//!
//! The engine treats persistence as abstract interfaces; the compiled-in
//! backend lives in [`memory`]. Wallet and aggregate mutations are atomic at
//! the store level, the ledger adds per-user serialization on top.

pub mod memory;

use crate::errors::StoreResult;
use crate::types::{Currency, Round, RoundStatus, User};
use async_trait::async_trait;

/// Durable user accounts with atomic field updates
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> StoreResult<Option<User>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn create(&self, user: User) -> StoreResult<User>;

    /// Atomically add to the lifetime aggregates
    async fn increment_stats(
        &self,
        user_id: &str,
        bets: u64,
        wins: u64,
        profit_delta: f64,
    ) -> StoreResult<()>;

    /// Atomically apply `delta` to the wallet balance, failing when the
    /// resulting balance would be negative. Returns the new balance.
    async fn update_wallet_balance(
        &self,
        user_id: &str,
        currency: Currency,
        delta: f64,
    ) -> StoreResult<f64>;
}

/// Append-only log of completed rounds
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Idempotent on `round_id`
    async fn upsert(&self, round: &Round) -> StoreResult<()>;

    /// Newest first, optionally filtered by status
    async fn find_recent(
        &self,
        limit: usize,
        status: Option<RoundStatus>,
    ) -> StoreResult<Vec<Round>>;
}

/// Verifies the session token bound at connect
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Resolves a token to the authenticated user id, or `None` when the
    /// token is unknown or expired.
    async fn authenticate(&self, token: &str) -> StoreResult<Option<String>>;
}
