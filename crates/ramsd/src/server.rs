//! HTTP server for ramsd

use crate::routes;
use anyhow::Result;
use axum::Router;
use rams_common::{
    AuditLogger, DispatchEngine, Notifier, RamsConfig, RamsStore, ServiceRequestLedger,
    TeamRegistry,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers. The engines all clone the same
/// store handle, so every request serializes through one connection.
pub struct AppState {
    pub store: RamsStore,
    pub ledger: ServiceRequestLedger,
    pub dispatch: DispatchEngine,
    pub teams: TeamRegistry,
    pub audit: AuditLogger,
    pub notifier: Notifier,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &RamsConfig) -> Result<Self> {
        let store = RamsStore::open(&config.db_path)?;
        let audit = AuditLogger::new(&config.audit_dir);
        let notifier = Notifier::new();
        Ok(Self::from_parts(store, audit, notifier))
    }

    /// Build state around existing handles; tests use this with an
    /// in-memory store.
    pub fn from_parts(store: RamsStore, audit: AuditLogger, notifier: Notifier) -> Self {
        Self {
            ledger: ServiceRequestLedger::new(store.clone(), audit.clone(), notifier.clone()),
            dispatch: DispatchEngine::new(store.clone(), audit.clone(), notifier.clone()),
            teams: TeamRegistry::new(store.clone(), audit.clone()),
            store,
            audit,
            notifier,
            start_time: Instant::now(),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::reference_routes())
        .merge(routes::animal_routes())
        .merge(routes::service_request_routes())
        .merge(routes::team_routes())
        .merge(routes::assignment_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run(state: AppState, addr: &str) -> Result<()> {
    let app = app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
