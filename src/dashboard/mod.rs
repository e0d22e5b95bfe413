//! HTTP surface of the dashboards.
//!
//! * `GET /api/crypto`: market rows for the configured coins
//! * `GET /api/history?coins=a,b`: seven daily prices per coin
//! * `GET /api/risk-metrics?days=30|90|365`: risk charts and table
//! * `GET /healthz`, `GET /metrics`
//!
//! Handlers always answer 200 with a (possibly stale or empty) payload.

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use crate::utils::types::MarketRecord;
use crate::{Error, Result};

mod service;

pub use service::{DashboardService, HistoryChart, RiskReport, RiskRow, RiskSeries, HISTORY_DAYS};

pub type SharedService = Arc<DashboardService>;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub coins: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RiskQuery {
    pub days: Option<String>,
}

/// Split a `coins=a,b,c` parameter into trimmed, lower-cased ids.
pub fn parse_coin_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

// --- Handlers ---
async fn crypto_handler(State(svc): State<SharedService>) -> Json<Arc<Vec<MarketRecord>>> {
    Json(svc.market_snapshot().await)
}

async fn history_handler(
    State(svc): State<SharedService>,
    Query(q): Query<HistoryQuery>,
) -> Json<HistoryChart> {
    let coins = parse_coin_list(q.coins.as_deref());
    Json(svc.history(&coins).await)
}

async fn risk_handler(State(svc): State<SharedService>, Query(q): Query<RiskQuery>) -> Json<Arc<RiskReport>> {
    let days = svc.config().risk.resolve_window(q.days.as_deref());
    Json(svc.risk_metrics(days).await)
}

async fn metrics_handler() -> String {
    crate::metrics::render()
}

pub fn router(service: SharedService) -> Router {
    Router::new()
        .route("/api/crypto", get(crypto_handler))
        .route("/api/history", get(history_handler))
        .route("/api/risk-metrics", get(risk_handler))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .with_state(service)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn run(service: SharedService, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)?;
    serve(service, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(service: SharedService, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "dashboard listening");
    axum::Server::from_tcp(listener)
        .map_err(|e| Error::Other(format!("dashboard listener: {e}")))?
        .serve(router(service).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Other(format!("dashboard server: {e}")))
}
