mod admission;
mod config;
mod db;
mod errors;
mod feed;
mod identity;
mod ledger;
mod llm_client;
mod models;
mod rankings;
mod routes;
mod scoring;
mod screening;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admission::AdmissionEngine;
use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::feed::DashboardFeed;
use crate::identity::FingerprintResolver;
use crate::ledger::{LedgerPolicy, QuotaLedger};
use crate::llm_client::LlmClient;
use crate::rankings::RankingStore;
use crate::routes::build_router;
use crate::scoring::{LlmResumeScorer, ResumeScorer};
use crate::screening::coordinator::{BatchCoordinator, CoordinatorDeps};
use crate::screening::BatchStore;
use crate::state::AppState;
use crate::store::memory::MemoryStore;
use crate::store::pg::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting HireAI API v{}", env!("CARGO_PKG_VERSION"));

    let policy = LedgerPolicy {
        readmit_after_limit_raise: config.readmit_after_limit_raise,
    };

    // Durable store, or the in-memory one in standalone mode
    let (ledger, batches, rankings) = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            let store = Arc::new(PgStore::new(pool, policy));
            (
                store.clone() as Arc<dyn QuotaLedger>,
                store.clone() as Arc<dyn BatchStore>,
                store as Arc<dyn RankingStore>,
            )
        }
        None => {
            warn!("DATABASE_URL not set; running standalone with the in-memory store (state does not survive restarts)");
            let store = Arc::new(MemoryStore::new(policy));
            (
                store.clone() as Arc<dyn QuotaLedger>,
                store.clone() as Arc<dyn BatchStore>,
                store as Arc<dyn RankingStore>,
            )
        }
    };

    // Initialize LLM client and the scoring seam
    let llm = LlmClient::new(config.anthropic_api_key.clone());
    info!("LLM client initialized (model: {})", llm_client::MODEL);
    let scorer: Arc<dyn ResumeScorer> = Arc::new(LlmResumeScorer::new(llm));

    // Dashboard feed and the batch coordinator task
    let feed = DashboardFeed::new();
    let coordinator = BatchCoordinator::spawn(
        config.screening_batch_capacity,
        CoordinatorDeps {
            ledger: ledger.clone(),
            batches: batches.clone(),
            rankings: rankings.clone(),
            scorer,
            feed: feed.clone(),
            dispatch_timeout: Duration::from_secs(config.dispatch_timeout_secs),
        },
    );

    let engine = AdmissionEngine::new(
        ledger.clone(),
        feed.clone(),
        coordinator.clone(),
        FingerprintResolver::new(config.fingerprint_window_hours),
    );

    // Build app state
    let state = AppState {
        engine,
        ledger,
        batches,
        rankings,
        coordinator,
        feed,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
