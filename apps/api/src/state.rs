use std::sync::Arc;

use crate::admission::AdmissionEngine;
use crate::config::Config;
use crate::feed::DashboardFeed;
use crate::ledger::QuotaLedger;
use crate::rankings::RankingStore;
use crate::screening::coordinator::CoordinatorHandle;
use crate::screening::BatchStore;

/// Shared application state injected into all route handlers via Axum
/// extractors. The store seams are trait objects so the Postgres and
/// in-memory backends are interchangeable without touching a handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: AdmissionEngine,
    pub ledger: Arc<dyn QuotaLedger>,
    pub batches: Arc<dyn BatchStore>,
    pub rankings: Arc<dyn RankingStore>,
    pub coordinator: CoordinatorHandle,
    pub feed: DashboardFeed,
    pub config: Config,
}
