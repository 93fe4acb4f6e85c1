//! Balance mutations and lifetime aggregates over the user store.
//!
//! Every operation is serialized per user through a lock registry so a
//! debit/credit pair for the same player can never interleave. Store calls
//! run under the configured operation timeout; expiry surfaces as the
//! retryable STORE_TIMEOUT error.

use crate::errors::{GameError, GameResult, StoreResult};
use crate::store::UserStore;
use crate::types::Currency;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Ledger {
    users: Arc<dyn UserStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    op_timeout: Duration,
}

impl Ledger {
    pub fn new(users: Arc<dyn UserStore>, op_timeout: Duration) -> Self {
        Self {
            users,
            locks: DashMap::new(),
            op_timeout,
        }
    }

    /// Subtract `crypto_amount` from the user's wallet. Fails with
    /// INSUFFICIENT_BALANCE when the wallet is missing or short.
    pub async fn debit(
        &self,
        user_id: &str,
        currency: Currency,
        crypto_amount: f64,
    ) -> GameResult<f64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self
            .bounded(self.users.update_wallet_balance(user_id, currency, -crypto_amount))
            .await??;
        Ok(balance)
    }

    /// Add `crypto_amount` to the user's wallet
    pub async fn credit(
        &self,
        user_id: &str,
        currency: Currency,
        crypto_amount: f64,
    ) -> GameResult<f64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self
            .bounded(self.users.update_wallet_balance(user_id, currency, crypto_amount))
            .await??;
        Ok(balance)
    }

    /// Record one settled bet: `total_bets` +1, `total_wins` +1 iff won,
    /// `total_profit` accumulates `profit_usd`.
    pub async fn record_settlement(
        &self,
        user_id: &str,
        profit_usd: f64,
        won: bool,
    ) -> GameResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        self.bounded(self.users.increment_stats(user_id, 1, won as u64, profit_usd))
            .await??;
        Ok(())
    }

    /// Seed the starting balance of every supported currency. Called once
    /// when an account is created.
    pub async fn initialize_wallets(&self, user_id: &str) -> GameResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        for currency in Currency::ALL {
            self.bounded(self.users.update_wallet_balance(
                user_id,
                currency,
                currency.starting_balance(),
            ))
            .await??;
        }
        Ok(())
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = StoreResult<T>>,
    ) -> GameResult<StoreResult<T>> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| GameError::StoreTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryUserStore;
    use crate::types::User;

    async fn ledger_with_user(user_id: &str) -> Ledger {
        let store = Arc::new(InMemoryUserStore::new());
        store
            .create(User::new(
                user_id,
                format!("player_{user_id}"),
                &format!("{user_id}@example.com"),
                "hash",
            ))
            .await
            .unwrap();
        Ledger::new(store, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_initialize_wallets_seeds_all_currencies() {
        let ledger = ledger_with_user("u1").await;
        ledger.initialize_wallets("u1").await.unwrap();

        let user = ledger.users.find_by_id("u1").await.unwrap().unwrap();
        assert_eq!(user.wallet_balance(Currency::Btc), 0.001);
        assert_eq!(user.wallet_balance(Currency::Eth), 0.01);
        assert_eq!(user.wallet_balance(Currency::Ltc), 1.0);
        assert_eq!(user.wallet_balance(Currency::Ada), 1.0);
        assert_eq!(user.wallet_balance(Currency::Dot), 1.0);
    }

    #[tokio::test]
    async fn test_debit_requires_balance() {
        let ledger = ledger_with_user("u1").await;

        let err = ledger.debit("u1", Currency::Btc, 0.01).await.unwrap_err();
        assert_eq!(err, GameError::InsufficientBalance(Currency::Btc));

        ledger.credit("u1", Currency::Btc, 0.5).await.unwrap();
        let balance = ledger.debit("u1", Currency::Btc, 0.2).await.unwrap();
        assert!((balance - 0.3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_settlement_counters() {
        let ledger = ledger_with_user("u1").await;

        ledger.record_settlement("u1", 15.0, true).await.unwrap();
        ledger.record_settlement("u1", -5.0, false).await.unwrap();

        let user = ledger.users.find_by_id("u1").await.unwrap().unwrap();
        assert_eq!(user.total_bets, 2);
        assert_eq!(user.total_wins, 1);
        assert_eq!(user.total_profit, 10.0);
    }

    #[tokio::test]
    async fn test_concurrent_debits_cannot_overdraw() {
        let ledger = Arc::new(ledger_with_user("u1").await);
        ledger.credit("u1", Currency::Ltc, 1.0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.debit("u1", Currency::Ltc, 0.3).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }

        // 1.0 / 0.3 allows exactly three debits
        assert_eq!(successes, 3);
        let user = ledger.users.find_by_id("u1").await.unwrap().unwrap();
        assert!(user.wallet_balance(Currency::Ltc) < 0.3);
    }
}
