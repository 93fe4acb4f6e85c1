//! Crashpoint server binary.

use crashpoint::config::AppConfig;
use crashpoint::engine::RoundEngine;
use crashpoint::fair::{ProofGenerator, ProofSource};
use crashpoint::gateway::AppState;
use crashpoint::ledger::Ledger;
use crashpoint::quotes::{HttpQuoteSource, QuoteCache};
use crashpoint::server::GameServer;
use crashpoint::store::memory::{InMemoryRoundStore, InMemorySessions, InMemoryUserStore};
use crashpoint::store::{RoundStore, SessionValidator, UserStore};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crashpoint=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    config.validate()?;

    if let Some(dsn) = &config.database_url {
        info!(%dsn, "external store configured; in-memory backend compiled in");
    } else {
        warn!("MONGODB_URI not set, using in-memory stores");
    }

    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
    let rounds: Arc<dyn RoundStore> = Arc::new(InMemoryRoundStore::new());
    let sessions: Arc<dyn SessionValidator> = Arc::new(InMemorySessions::new());

    let ledger = Arc::new(Ledger::new(users.clone(), config.store_timeout()));
    let quotes = Arc::new(QuoteCache::new(
        Box::new(HttpQuoteSource::new(
            config.quotes.api_url.clone(),
            config.quote_timeout(),
        )),
        config.quote_ttl(),
    ));
    let proofs: Arc<dyn ProofSource> = Arc::new(ProofGenerator::new(config.game.house_edge));

    let engine = RoundEngine::new(
        config.clone(),
        ledger,
        quotes.clone(),
        rounds,
        users.clone(),
        proofs,
    );
    engine.spawn();
    info!(
        tick_ms = config.game.tick_ms,
        wait_ms = config.game.wait_ms,
        house_edge = config.game.house_edge,
        "round engine started"
    );

    let state = Arc::new(AppState::new(engine, users, sessions, quotes, config));
    GameServer::new(state).run().await
}
