use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::{Config, LedgerBackend},
    error::AppResult,
    gateway::{LndGateway, PaymentGateway},
    ledger::{memory::InMemoryLedger, repository::LedgerRepository, PollLedger, VoteLedger},
    polls::PollService,
    settlement::Reconciler,
    votes::VoteService,
};

/// Build every component and start the reconciliation loops. The returned
/// handles finish once `shutdown` is cancelled.
pub async fn initialize_app_state(
    config: &Config,
    shutdown: CancellationToken,
) -> AppResult<(AppState, Vec<JoinHandle<()>>)> {
    info!("Initializing application components ...");

    let (polls_ledger, votes_ledger): (Arc<dyn PollLedger>, Arc<dyn VoteLedger>) =
        match config.ledger_backend {
            LedgerBackend::Postgres => {
                let pool = initialize_database(config).await?;
                let ledger = Arc::new(LedgerRepository::new(pool));
                (ledger.clone() as Arc<dyn PollLedger>, ledger as Arc<dyn VoteLedger>)
            }
            LedgerBackend::Memory => {
                warn!("⚠️  Using the in-memory ledger; polls and votes are lost on restart");
                let ledger = Arc::new(InMemoryLedger::new());
                (ledger.clone() as Arc<dyn PollLedger>, ledger as Arc<dyn VoteLedger>)
            }
        };

    let gateway: Arc<dyn PaymentGateway> = Arc::new(LndGateway::new(
        &config.lnd_rest_url,
        config.lnd_tls_cert_path.as_deref(),
        config.lnd_macaroon_path.as_deref(),
        config.rpc_timeout(),
    )?);
    info!("✅ LND gateway configured for {}", config.lnd_rest_url);

    let polls = Arc::new(PollService::new(
        polls_ledger.clone(),
        votes_ledger.clone(),
        gateway.clone(),
        config.poll_settings(),
    ));
    let votes = Arc::new(VoteService::new(
        polls_ledger.clone(),
        votes_ledger.clone(),
        gateway,
        shutdown.clone(),
    ));
    info!("✅ Poll and vote services initialized");

    let reconciler = Arc::new(Reconciler::new(
        polls.clone(),
        votes.clone(),
        polls_ledger,
        votes_ledger,
        config.reconciler_settings(),
        shutdown.clone(),
    ));
    let handles = reconciler.start();
    info!("✅ Reconciliation loops started");

    // force closes run under the same deadline as a reconciliation pass
    let request_timeout = Duration::from_secs(config.pass_timeout_secs);
    let state = AppState::new(polls, votes, shutdown, request_timeout);
    Ok((state, handles))
}

async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    info!(
        "✓ Database pool configured: {} max connections",
        config.db_max_connections
    );

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
