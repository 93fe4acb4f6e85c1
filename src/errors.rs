//! Error taxonomy shared by the engine, ledger, stores and gateway.
//!
//! Every engine entry point returns a typed error; the gateway converts it
//! into an `error` event carrying the stable code from [`GameError::code`].
//! Infrastructure errors are retryable inside the engine, validation and
//! state errors never are.

use crate::types::Currency;
use thiserror::Error;

/// Typed failure for every engine-facing operation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    #[error("bet amount must be between {min:.2} and {max:.2} USD")]
    InvalidAmount { min: f64, max: f64 },

    #[error("currency {0:?} is not supported")]
    UnsupportedCurrency(String),

    #[error("auto cash-out must be greater than 1.00 and at most 1000.00")]
    InvalidAutoCashout,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no round is accepting bets right now")]
    RoundNotOpen,

    #[error("no round is running")]
    RoundNotRunning,

    #[error("no active bet in the current round")]
    NoActiveBet,

    #[error("insufficient {0} balance")]
    InsufficientBalance(Currency),

    #[error("store operation timed out")]
    StoreTimeout,

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("authentication failed")]
    Unauthenticated,

    #[error("rate limit exceeded")]
    RateLimited,
}

impl GameError {
    /// Stable wire code for the client
    pub fn code(&self) -> &'static str {
        match self {
            GameError::InvalidAmount { .. } => "INVALID_AMOUNT",
            GameError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            GameError::InvalidAutoCashout => "INVALID_AUTO_CASHOUT",
            GameError::BadRequest(_) => "BAD_REQUEST",
            GameError::RoundNotOpen => "ROUND_NOT_OPEN",
            GameError::RoundNotRunning => "ROUND_NOT_RUNNING",
            GameError::NoActiveBet => "NO_ACTIVE_BET",
            GameError::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            GameError::StoreTimeout => "STORE_TIMEOUT",
            GameError::Store(_) => "STORE_ERROR",
            GameError::Unauthenticated => "UNAUTHENTICATED",
            GameError::RateLimited => "RATE_LIMITED",
        }
    }

    /// Whether the engine may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, GameError::StoreTimeout | GameError::Store(_))
    }
}

pub type GameResult<T> = Result<T, GameError>;

/// Failure inside a repository backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("wallet {currency} balance for user {user_id} would become negative")]
    NegativeBalance { user_id: String, currency: Currency },

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NegativeBalance { currency, .. } => {
                GameError::InsufficientBalance(currency)
            }
            other => GameError::Store(other.to_string()),
        }
    }
}
