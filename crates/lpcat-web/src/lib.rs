//! Read-only JSON API over the run reports directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lpcat_core::GapReport;
use lpcat_reconcile::{page_id_for, Reconciler};
use lpcat_sync::{load_actions, load_gap_report, load_reconcile_rules, load_runs, SyncConfig, SyncRunSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpcat-web";

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            reports_dir: reports_dir.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.workspace_root.clone(), config.reports_dir.clone())
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct GapsQuery {
    /// `a` for source-of-record-only rows, `b` for warehouse-only rows.
    side: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct NormalizeQuery {
    url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeResponse {
    pub url: String,
    pub key: String,
    pub host: Option<String>,
    pub malformed: bool,
    pub page_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapReportResponse {
    pub run_id: Uuid,
    #[serde(flatten)]
    pub report: GapReport,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/data-gaps", get(latest_gaps_handler))
        .route("/api/runs/{run_id}/data-gaps", get(run_gaps_handler))
        .route("/api/actions", get(latest_actions_handler))
        .route("/api/normalize", get(normalize_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("LPCAT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_config(&SyncConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, reports = %state.reports_dir.display(), "serving reports api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match load_runs(&state.reports_dir, limit) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn latest_gaps_handler(State(state): State<Arc<AppState>>, Query(query): Query<GapsQuery>) -> Response {
    match latest_run(&state.reports_dir) {
        Ok(Some(run)) => gaps_response(&state.reports_dir, run.run_id, &query),
        Ok(None) => not_found("no runs recorded yet"),
        Err(err) => server_error(err),
    }
}

async fn run_gaps_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
    Query(query): Query<GapsQuery>,
) -> Response {
    match Uuid::parse_str(&run_id) {
        Ok(run_id) => gaps_response(&state.reports_dir, run_id, &query),
        Err(_) => not_found(&format!("unknown run '{run_id}'")),
    }
}

async fn latest_actions_handler(State(state): State<Arc<AppState>>) -> Response {
    let run = match latest_run(&state.reports_dir) {
        Ok(Some(run)) => run,
        Ok(None) => return not_found("no runs recorded yet"),
        Err(err) => return server_error(err),
    };
    match load_actions(&state.reports_dir, run.run_id) {
        Ok(Some(actions)) => Json(actions).into_response(),
        Ok(None) => not_found(&format!("run {} has no actions report", run.run_id)),
        Err(err) => server_error(err),
    }
}

async fn normalize_handler(State(state): State<Arc<AppState>>, Query(query): Query<NormalizeQuery>) -> Response {
    let rules = match load_reconcile_rules(&state.workspace_root).await {
        Ok(rules) => rules,
        Err(err) => return server_error(err),
    };
    if let Err(err) = rules.reconcile.validate() {
        return server_error(err.into());
    }
    let normalized = Reconciler::new(rules.reconcile).normalize(&query.url);
    Json(NormalizeResponse {
        page_id: page_id_for(&normalized.key),
        key: normalized.key.into_string(),
        host: normalized.host,
        malformed: normalized.malformed,
        url: query.url,
    })
    .into_response()
}

fn latest_run(reports_dir: &Path) -> anyhow::Result<Option<SyncRunSummary>> {
    Ok(load_runs(reports_dir, 1)?.into_iter().next())
}

fn gaps_response(reports_dir: &Path, run_id: Uuid, query: &GapsQuery) -> Response {
    match load_gap_report(reports_dir, run_id) {
        Ok(Some(mut report)) => {
            let limit = query.limit.unwrap_or(usize::MAX);
            match query.side.as_deref() {
                Some("a") => report.b_not_a.clear(),
                Some("b") => report.a_not_b.clear(),
                Some(other) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({ "error": format!("unknown side '{other}'; use 'a' or 'b'") })),
                    )
                        .into_response()
                }
                None => {}
            }
            report.a_not_b.truncate(limit);
            report.b_not_a.truncate(limit);
            Json(GapReportResponse { run_id, report }).into_response()
        }
        Ok(None) => not_found(&format!("unknown run '{run_id}'")),
        Err(err) => server_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
