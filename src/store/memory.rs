//! In-memory repository backend.
//!
//! DashMap-backed implementations of the store traits. Mutations go through
//! the shard lock of the entry they touch, which gives the atomicity the
//! trait contracts require without a process-wide lock.

use super::{RoundStore, SessionValidator, UserStore};
use crate::errors::{StoreError, StoreResult};
use crate::types::{Currency, Round, RoundStatus, User, Wallet};
use async_trait::async_trait;
use dashmap::DashMap;

/// Smallest balance treated as non-negative; absorbs f64 accumulation noise.
const BALANCE_EPSILON: f64 = 1e-12;

#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<String, User>,
    ids_by_email: DashMap<String, String>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = email.trim().to_ascii_lowercase();
        match self.ids_by_email.get(&email) {
            Some(id) => self.find_by_id(&id).await,
            None => Ok(None),
        }
    }

    async fn create(&self, user: User) -> StoreResult<User> {
        if self.users.contains_key(&user.user_id) {
            return Err(StoreError::Duplicate(user.user_id));
        }
        if self.ids_by_email.contains_key(&user.email) {
            return Err(StoreError::Duplicate(user.email));
        }

        self.ids_by_email.insert(user.email.clone(), user.user_id.clone());
        self.users.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    async fn increment_stats(
        &self,
        user_id: &str,
        bets: u64,
        wins: u64,
        profit_delta: f64,
    ) -> StoreResult<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;

        user.total_bets += bets;
        user.total_wins += wins;
        user.total_profit += profit_delta;
        Ok(())
    }

    async fn update_wallet_balance(
        &self,
        user_id: &str,
        currency: Currency,
        delta: f64,
    ) -> StoreResult<f64> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;

        let wallet = user.wallets.entry(currency).or_insert_with(Wallet::default);
        let next = wallet.balance + delta;
        if next < -BALANCE_EPSILON {
            return Err(StoreError::NegativeBalance {
                user_id: user_id.to_string(),
                currency,
            });
        }

        wallet.balance = next.max(0.0);
        Ok(wallet.balance)
    }
}

#[derive(Default)]
pub struct InMemoryRoundStore {
    rounds: DashMap<String, Round>,
}

impl InMemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoundStore for InMemoryRoundStore {
    async fn upsert(&self, round: &Round) -> StoreResult<()> {
        self.rounds.insert(round.round_id.clone(), round.clone());
        Ok(())
    }

    async fn find_recent(
        &self,
        limit: usize,
        status: Option<RoundStatus>,
    ) -> StoreResult<Vec<Round>> {
        let mut rounds: Vec<Round> = self
            .rounds
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.clone())
            .collect();

        rounds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rounds.truncate(limit);
        Ok(rounds)
    }
}

/// Token-to-user map. Token issuance belongs to the external account
/// service; this validator only answers lookups.
#[derive(Default)]
pub struct InMemorySessions {
    tokens: DashMap<String, String>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl SessionValidator for InMemorySessions {
    async fn authenticate(&self, token: &str) -> StoreResult<Option<String>> {
        Ok(self.tokens.get(token).map(|id| id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user(id: &str) -> User {
        User::new(id, format!("player_{id}"), &format!("{id}@example.com"), "hash")
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = InMemoryUserStore::new();
        store.create(sample_user("u1")).await.unwrap();

        assert!(matches!(
            store.create(sample_user("u1")).await,
            Err(StoreError::Duplicate(_))
        ));

        let mut same_email = sample_user("u2");
        same_email.email = "u1@example.com".into();
        assert!(matches!(
            store.create(same_email).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_email_is_case_insensitive() {
        let store = InMemoryUserStore::new();
        store.create(sample_user("u1")).await.unwrap();

        let found = store.find_by_email("U1@Example.Com").await.unwrap();
        assert_eq!(found.unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn test_wallet_update_floors_at_zero() {
        let store = InMemoryUserStore::new();
        store.create(sample_user("u1")).await.unwrap();

        store.update_wallet_balance("u1", Currency::Btc, 0.5).await.unwrap();
        let err = store
            .update_wallet_balance("u1", Currency::Btc, -0.6)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NegativeBalance { .. }));

        // The failed debit left the balance untouched
        let user = store.find_by_id("u1").await.unwrap().unwrap();
        assert_eq!(user.wallet_balance(Currency::Btc), 0.5);
    }

    #[tokio::test]
    async fn test_increment_stats_accumulates() {
        let store = InMemoryUserStore::new();
        store.create(sample_user("u1")).await.unwrap();

        store.increment_stats("u1", 1, 1, 12.5).await.unwrap();
        store.increment_stats("u1", 1, 0, -5.0).await.unwrap();

        let user = store.find_by_id("u1").await.unwrap().unwrap();
        assert_eq!(user.total_bets, 2);
        assert_eq!(user.total_wins, 1);
        assert_eq!(user.total_profit, 7.5);
    }

    #[tokio::test]
    async fn test_round_store_upsert_idempotent() {
        use crate::types::RoundStatus;
        use chrono::Utc;

        let store = InMemoryRoundStore::new();
        let mut round = Round {
            round_id: "r1".into(),
            round_number: 1,
            seed: "aa".repeat(32),
            hash: "bb".repeat(32),
            crash_point: 1.5,
            status: RoundStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            crashed_at: None,
            current_multiplier: 1.0,
            bets: vec![],
        };

        store.upsert(&round).await.unwrap();
        round.status = RoundStatus::Crashed;
        store.upsert(&round).await.unwrap();

        let crashed = store.find_recent(10, Some(RoundStatus::Crashed)).await.unwrap();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].status, RoundStatus::Crashed);
    }

    #[tokio::test]
    async fn test_find_recent_orders_and_limits() {
        use chrono::{Duration as ChronoDuration, Utc};

        let store = InMemoryRoundStore::new();
        let base = Utc::now();
        for i in 0..5u64 {
            let round = Round {
                round_id: format!("r{i}"),
                round_number: i,
                seed: "aa".repeat(32),
                hash: "bb".repeat(32),
                crash_point: 1.5,
                status: RoundStatus::Crashed,
                created_at: base + ChronoDuration::seconds(i as i64),
                started_at: None,
                crashed_at: None,
                current_multiplier: 1.5,
                bets: vec![],
            };
            store.upsert(&round).await.unwrap();
        }

        let recent = store.find_recent(3, None).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].round_id, "r4");
        assert_eq!(recent[2].round_id, "r2");
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let sessions = InMemorySessions::new();
        sessions.insert("tok-1", "u1");

        assert_eq!(
            sessions.authenticate("tok-1").await.unwrap().as_deref(),
            Some("u1")
        );
        assert_eq!(sessions.authenticate("nope").await.unwrap(), None);

        sessions.revoke("tok-1");
        assert_eq!(sessions.authenticate("tok-1").await.unwrap(), None);
    }
}
