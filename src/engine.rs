//! The round engine: a state machine sequencing rounds through
//! WAITING → RUNNING → CRASHED.
//!
//! One driver task owns the lifecycle (open round, betting window, tick
//! loop, crash settlement, pause, next round). Round state lives behind a
//! single mutex that is only ever held for synchronous decisions; every
//! event is emitted while holding it, so all subscribers observe the same
//! total order. Quote fetches, ledger writes and repository writes happen
//! outside the lock, with preconditions re-validated on re-entry.

use crate::config::AppConfig;
use crate::errors::{GameError, GameResult};
use crate::events::ServerEvent;
use crate::fair::{ProofSource, MAX_CRASH_POINT};
use crate::ledger::Ledger;
use crate::quotes::{crypto_to_usd, usd_to_crypto, QuoteCache};
use crate::store::{RoundStore, UserStore};
use crate::types::{
    round_to_cents, truncate_to_cents, Bet, Currency, Round, RoundPublic, RoundStatus,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Multiplier growth per millisecond of elapsed round time
const GROWTH_RATE_PER_MS: f64 = 0.000_06;

/// Gap between the post-crash pause and the next round opening
const ROUND_GAP: Duration = Duration::from_secs(1);

/// Base delay for settlement retry backoff (doubled per attempt)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub const HISTORY_DEFAULT_LIMIT: usize = 50;
pub const HISTORY_MAX_LIMIT: usize = 200;

/// Multiplier observed `elapsed_ms` after a round starts
pub fn multiplier_at(elapsed_ms: f64) -> f64 {
    truncate_to_cents((GROWTH_RATE_PER_MS * elapsed_ms).exp())
}

struct EngineState {
    round: Option<Round>,
    /// Monotonic instant of the RUNNING transition; drives tick arithmetic
    started: Option<Instant>,
    /// Last multiplier actually broadcast for this round
    last_broadcast: f64,
    round_number: u64,
}

/// Ledger work decided under the lock, executed after it is released
struct CashoutJob {
    user_id: String,
    currency: Currency,
    crypto_payout: f64,
    usd_payout: f64,
    profit_usd: f64,
}

struct LossJob {
    user_id: String,
    usd_amount: f64,
}

enum TickOutcome {
    /// Round gone or not running; stop ticking
    Idle,
    Running { cashouts: Vec<CashoutJob> },
    Crashed {
        cashouts: Vec<CashoutJob>,
        losses: Vec<LossJob>,
        finished: Round,
    },
}

pub struct RoundEngine {
    config: AppConfig,
    state: Mutex<EngineState>,
    events: broadcast::Sender<ServerEvent>,
    ledger: Arc<Ledger>,
    quotes: Arc<QuoteCache>,
    rounds: Arc<dyn RoundStore>,
    users: Arc<dyn UserStore>,
    proofs: Arc<dyn ProofSource>,
}

impl RoundEngine {
    pub fn new(
        config: AppConfig,
        ledger: Arc<Ledger>,
        quotes: Arc<QuoteCache>,
        rounds: Arc<dyn RoundStore>,
        users: Arc<dyn UserStore>,
        proofs: Arc<dyn ProofSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            state: Mutex::new(EngineState {
                round: None,
                started: None,
                last_broadcast: 1.0,
                round_number: 0,
            }),
            events,
            ledger,
            quotes,
            rounds,
            users,
            proofs,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Start the lifecycle driver
    pub fn spawn(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await });
    }

    async fn run(&self) {
        loop {
            let round_id = self.open_round().await;
            sleep(self.config.wait_delay()).await;

            if self.start_round(&round_id).await {
                self.drive_ticks().await;
                sleep(self.config.post_crash_delay() + ROUND_GAP).await;
            }
        }
    }

    /// Allocate the next committed round and open the betting window
    async fn open_round(&self) -> String {
        let snapshot = {
            let mut st = self.state.lock().await;
            st.round_number += 1;
            let fair = self.proofs.new_round(st.round_number);
            let round = Round {
                round_id: fair.round_id,
                round_number: st.round_number,
                seed: fair.seed,
                hash: fair.hash,
                crash_point: fair.crash_point,
                status: RoundStatus::Waiting,
                created_at: Utc::now(),
                started_at: None,
                crashed_at: None,
                current_multiplier: 1.0,
                bets: Vec::new(),
            };
            st.started = None;
            st.last_broadcast = 1.0;
            st.round = Some(round.clone());

            let _ = self.events.send(ServerEvent::NewRound {
                round_id: round.round_id.clone(),
                round_number: round.round_number,
                hash: round.hash.clone(),
                status: RoundStatus::Waiting,
            });
            info!(round_id = %round.round_id, round_number = round.round_number, "round open for bets");
            round
        };

        // The authoritative persist happens at the RUNNING transition; a
        // failure on the waiting snapshot is only worth a warning.
        if let Err(err) = self.persist(&snapshot).await {
            warn!(round_id = %snapshot.round_id, %err, "failed to persist waiting round");
        }
        snapshot.round_id
    }

    /// WAITING → RUNNING. Returns false when the round had to be aborted.
    async fn start_round(&self, round_id: &str) -> bool {
        // Persist the running snapshot before flipping the status, so an
        // aborted round never ran.
        let pending = {
            let st = self.state.lock().await;
            match st.round.as_ref() {
                Some(r) if r.round_id == round_id && r.status == RoundStatus::Waiting => {
                    let mut pending = r.clone();
                    pending.status = RoundStatus::Running;
                    pending.started_at = Some(Utc::now());
                    pending
                }
                _ => return false,
            }
        };

        if let Err(err) = self.persist(&pending).await {
            warn!(round_id, %err, "could not persist running round, aborting");
            self.abort_round(round_id, "round could not be persisted").await;
            return false;
        }

        let mut st = self.state.lock().await;
        match st.round.as_mut() {
            Some(round) if round.round_id == round_id && round.status == RoundStatus::Waiting => {
                round.status = RoundStatus::Running;
                round.started_at = pending.started_at;
                st.started = Some(Instant::now());

                let _ = self.events.send(ServerEvent::GameStarted {
                    round_id: round_id.to_string(),
                    started_at: pending.started_at.unwrap_or_else(Utc::now),
                });
                info!(round_id, "round running");
                true
            }
            _ => false,
        }
    }

    /// Tick at the configured cadence until the round crashes
    async fn drive_ticks(&self) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.apply_tick().await {
                TickOutcome::Idle => break,
                TickOutcome::Running { cashouts } => {
                    self.settle_cashouts(cashouts).await;
                }
                TickOutcome::Crashed { cashouts, losses, finished } => {
                    self.settle_cashouts(cashouts).await;
                    self.settle_crash(losses, finished).await;
                    break;
                }
            }
        }
    }

    /// One tick: advance the multiplier, fire due auto-cashouts in
    /// acceptance order, then evaluate the crash condition. The order
    /// guarantees a bet whose auto threshold is at or below the crash
    /// point always wins.
    async fn apply_tick(&self) -> TickOutcome {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let Some(started) = st.started else { return TickOutcome::Idle };
        let Some(round) = st.round.as_mut() else { return TickOutcome::Idle };
        if round.status != RoundStatus::Running {
            return TickOutcome::Idle;
        }

        // Real elapsed time, not an assumed tick width: ticks delayed by a
        // pause catch up to the true multiplier.
        let elapsed_ms = started.elapsed().as_millis() as f64;
        let raw = multiplier_at(elapsed_ms);
        let crashing = raw >= round.crash_point;
        // The stored multiplier never exceeds the crash point
        let mu = if crashing { round.crash_point } else { raw };
        let mu = mu.max(round.current_multiplier);
        round.current_multiplier = mu;

        let round_id = round.round_id.clone();
        let mut cashouts = Vec::new();
        for bet in round.bets.iter_mut() {
            if bet.cashed_out {
                continue;
            }
            let Some(auto) = bet.auto_cash_out else { continue };
            if auto <= mu {
                let job = settle_bet_fields(bet, mu);
                let _ = self.events.send(ServerEvent::PlayerCashout {
                    round_id: round_id.clone(),
                    username: bet.username.clone(),
                    multiplier: mu,
                    usd_payout: job.usd_payout,
                    profit: job.profit_usd,
                    is_auto: true,
                });
                cashouts.push(job);
            }
        }

        if crashing {
            let crashed_at = Utc::now();
            round.status = RoundStatus::Crashed;
            round.crashed_at = Some(crashed_at);

            let mut losses = Vec::new();
            for bet in round.bets.iter_mut() {
                if !bet.cashed_out {
                    bet.payout_usd = Some(0.0);
                    bet.profit_usd = Some(-bet.usd_amount);
                    losses.push(LossJob {
                        user_id: bet.user_id.clone(),
                        usd_amount: bet.usd_amount,
                    });
                }
            }

            let finished = round.clone();
            st.started = None;

            let _ = self.events.send(ServerEvent::GameCrashed {
                round_id,
                crash_point: finished.crash_point,
                seed: finished.seed.clone(),
                timestamp: crashed_at,
            });
            info!(
                round_id = %finished.round_id,
                crash_point = finished.crash_point,
                bets = finished.bets.len(),
                "round crashed"
            );
            TickOutcome::Crashed { cashouts, losses, finished }
        } else {
            // Broadcasts are strictly increasing; ticks that truncate to
            // the same two digits advance state silently.
            if mu > st.last_broadcast {
                st.last_broadcast = mu;
                let _ = self.events.send(ServerEvent::MultiplierUpdate {
                    round_id,
                    multiplier: mu,
                    timestamp: Utc::now(),
                });
            }
            TickOutcome::Running { cashouts }
        }
    }

    /// Accept a wager into the current WAITING round
    pub async fn place_bet(
        &self,
        user_id: &str,
        usd_amount: f64,
        currency_code: &str,
        auto_cash_out: Option<f64>,
    ) -> GameResult<Bet> {
        let currency = Currency::from_code(currency_code)
            .ok_or_else(|| GameError::UnsupportedCurrency(currency_code.to_string()))?;

        let (min, max) = (self.config.game.min_bet_usd, self.config.game.max_bet_usd);
        if !usd_amount.is_finite() || usd_amount < min || usd_amount > max {
            return Err(GameError::InvalidAmount { min, max });
        }
        if let Some(auto) = auto_cash_out {
            if !auto.is_finite() || auto <= 1.0 || auto > MAX_CRASH_POINT {
                return Err(GameError::InvalidAutoCashout);
            }
        }

        // The round must be open now; checked again after the wallet debit.
        let round_id = {
            let st = self.state.lock().await;
            let round = st
                .round
                .as_ref()
                .filter(|r| r.status == RoundStatus::Waiting)
                .ok_or(GameError::RoundNotOpen)?;
            if round.bet_for(user_id).is_some() {
                return Err(GameError::BadRequest(
                    "a bet is already active for this round".to_string(),
                ));
            }
            round.round_id.clone()
        };

        let username = self
            .bounded(self.users.find_by_id(user_id))
            .await??
            .ok_or_else(|| GameError::Store(format!("unknown user {user_id}")))?
            .username;

        let price = self.quotes.get(currency).await;
        let crypto_amount = usd_to_crypto(usd_amount, price);
        self.ledger.debit(user_id, currency, crypto_amount).await?;

        // Re-validate: the round may have started or gone away during I/O.
        let committed = {
            let mut st = self.state.lock().await;
            match st.round.as_mut() {
                Some(round)
                    if round.round_id == round_id
                        && round.status == RoundStatus::Waiting
                        && round.bet_for(user_id).is_none() =>
                {
                    let bet = Bet {
                        user_id: user_id.to_string(),
                        username: username.clone(),
                        usd_amount,
                        currency,
                        price_at_time: price,
                        crypto_amount,
                        auto_cash_out,
                        cashed_out: false,
                        cashed_out_at: None,
                        payout_usd: None,
                        profit_usd: None,
                        placed_at: Utc::now(),
                    };
                    round.bets.push(bet.clone());
                    let _ = self.events.send(ServerEvent::BetPlaced {
                        round_id,
                        username,
                        usd_amount,
                        currency,
                        auto_cash_out,
                    });
                    Some(bet)
                }
                _ => None,
            }
        };

        match committed {
            Some(bet) => Ok(bet),
            None => {
                // The debit was taken for a bet that can no longer join.
                self.with_retries("bet refund", || {
                    self.ledger.credit(user_id, currency, crypto_amount)
                })
                .await;
                Err(GameError::RoundNotOpen)
            }
        }
    }

    /// Cash the caller's bet out at the current multiplier
    pub async fn cashout(&self, user_id: &str) -> GameResult<Bet> {
        let (bet, job) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let round = st
                .round
                .as_mut()
                .filter(|r| r.status == RoundStatus::Running)
                .ok_or(GameError::RoundNotRunning)?;

            let multiplier = round.current_multiplier;
            let round_id = round.round_id.clone();
            let bet = round.bet_for_mut(user_id).ok_or(GameError::NoActiveBet)?;
            if bet.cashed_out {
                return Err(GameError::NoActiveBet);
            }

            let job = settle_bet_fields(bet, multiplier);
            let _ = self.events.send(ServerEvent::PlayerCashout {
                round_id,
                username: bet.username.clone(),
                multiplier,
                usd_payout: job.usd_payout,
                profit: job.profit_usd,
                is_auto: false,
            });
            (bet.clone(), job)
        };

        self.settle_cashouts(vec![job]).await;
        Ok(bet)
    }

    /// Last crashed rounds, newest first
    pub async fn history(&self, limit: Option<usize>) -> GameResult<Vec<RoundPublic>> {
        let limit = limit
            .unwrap_or(HISTORY_DEFAULT_LIMIT)
            .clamp(1, HISTORY_MAX_LIMIT);
        let rounds = self
            .bounded(self.rounds.find_recent(limit, Some(RoundStatus::Crashed)))
            .await??;
        Ok(rounds.iter().map(Round::public_view).collect())
    }

    /// Public view of the current round
    pub async fn snapshot(&self) -> Option<RoundPublic> {
        self.state.lock().await.round.as_ref().map(Round::public_view)
    }

    /// Credit and record each decided cashout. The bets are already marked,
    /// so failures here retry without risking a double settlement.
    async fn settle_cashouts(&self, jobs: Vec<CashoutJob>) {
        for job in jobs {
            self.with_retries("cashout credit", || {
                self.ledger.credit(&job.user_id, job.currency, job.crypto_payout)
            })
            .await;
            self.with_retries("cashout settlement", || {
                self.ledger.record_settlement(&job.user_id, job.profit_usd, true)
            })
            .await;
        }
    }

    /// Settle losers and persist the finished round. The engine stays in
    /// CRASHED (the next round blocked) while persistence retries.
    async fn settle_crash(&self, losses: Vec<LossJob>, finished: Round) {
        for loss in &losses {
            self.with_retries("loss settlement", || {
                self.ledger.record_settlement(&loss.user_id, -loss.usd_amount, false)
            })
            .await;
        }

        let persisted = self
            .with_retries("round persist", || self.persist(&finished))
            .await;
        if persisted.is_none() {
            error!(round_id = %finished.round_id, "abandoning round persistence");
            let _ = self.events.send(ServerEvent::RoundAborted {
                round_id: finished.round_id.clone(),
                reason: "settlement could not be persisted".to_string(),
            });
        }
    }

    /// Cancel the round and refund every accepted, un-cashed bet
    async fn abort_round(&self, round_id: &str, reason: &str) {
        let bets = {
            let mut st = self.state.lock().await;
            if st.round.as_ref().map_or(true, |r| r.round_id != round_id) {
                return;
            }
            let Some(round) = st.round.take() else { return };
            st.started = None;
            let _ = self.events.send(ServerEvent::RoundAborted {
                round_id: round_id.to_string(),
                reason: reason.to_string(),
            });
            warn!(round_id, reason, bets = round.bets.len(), "round aborted");
            round.bets
        };

        for bet in bets.iter().filter(|b| !b.cashed_out) {
            self.with_retries("abort refund", || {
                self.ledger.credit(&bet.user_id, bet.currency, bet.crypto_amount)
            })
            .await;
        }
    }

    async fn persist(&self, round: &Round) -> GameResult<()> {
        self.bounded(self.rounds.upsert(round)).await??;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = crate::errors::StoreResult<T>>,
    ) -> GameResult<crate::errors::StoreResult<T>> {
        tokio::time::timeout(self.config.store_timeout(), op)
            .await
            .map_err(|_| GameError::StoreTimeout)
    }

    /// Run a retryable operation with exponential backoff. Returns `None`
    /// after the configured attempts are exhausted or on a permanent error.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GameResult<T>>,
    {
        let attempts = self.config.limits.settle_retries.max(1);
        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    warn!(%err, attempt, "{what} failed, retrying");
                    sleep(delay).await;
                }
                Err(err) => {
                    error!(%err, "{what} failed permanently");
                    return None;
                }
            }
        }
        None
    }
}

/// Mark a bet cashed out at `multiplier` and derive its payout fields
fn settle_bet_fields(bet: &mut Bet, multiplier: f64) -> CashoutJob {
    bet.cashed_out = true;
    bet.cashed_out_at = Some(multiplier);

    let crypto_payout = bet.crypto_amount * multiplier;
    let usd_payout = round_to_cents(crypto_to_usd(crypto_payout, bet.price_at_time));
    let profit_usd = round_to_cents(usd_payout - bet.usd_amount);
    bet.payout_usd = Some(usd_payout);
    bet.profit_usd = Some(profit_usd);

    CashoutJob {
        user_id: bet.user_id.clone(),
        currency: bet.currency,
        crypto_payout,
        usd_payout,
        profit_usd,
    }
}
