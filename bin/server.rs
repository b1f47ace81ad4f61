// SAVI Billing - Web Server
// REST API with Axum: run billing batches, browse stored runs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use savi_billing::{
    BillingError, BillingOrchestrator, BillingResult, BillingRules, EligibilityRegistry, RecordFilter,
    RunMetadata, RunStore, RunSummary, ServiceRecord, StoredRun,
};

#[derive(Parser, Debug)]
#[command(name = "savi-server", version, about = "SAVI billing API server")]
struct ServerArgs {
    #[arg(long, env = "SAVI_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,

    /// Rules JSON; built-in rules when omitted
    #[arg(long, env = "SAVI_RULES")]
    rules: Option<PathBuf>,

    /// SQLite store for runs; runs are not persisted when omitted
    #[arg(long, env = "SAVI_STORE")]
    store: Option<PathBuf>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<BillingOrchestrator>,
    store: Option<Arc<Mutex<RunStore>>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    if status.is_server_error() {
        tracing::error!(%message, "request failed");
    } else {
        tracing::warn!(%message, "request rejected");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Input-shape problems are the caller's fault; anything else is ours
fn billing_error_response(err: BillingError) -> Response {
    let status = match &err {
        BillingError::EmptyInput
        | BillingError::MissingField { .. }
        | BillingError::MissingColumns { .. }
        | BillingError::InvalidFilter(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// POST /api/billing/run body
#[derive(Deserialize)]
struct RunRequest {
    records: Vec<ServiceRecord>,

    /// Patient ids with preferential pricing
    #[serde(default)]
    roster: Vec<String>,

    #[serde(default)]
    filter: Option<RecordFilter>,

    /// Label stored with the run
    #[serde(default)]
    source: Option<String>,
}

#[derive(Serialize)]
struct RunResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    result: BillingResult,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok(savi_billing::VERSION)
}

/// POST /api/billing/run - Bill a batch, saving it when a store is configured
async fn run_billing(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Response {
    let records = match request.filter {
        Some(filter) => match filter.apply(&request.records) {
            Ok(selected) => selected,
            Err(e) => return billing_error_response(e),
        },
        None => request.records,
    };

    let registry = EligibilityRegistry::from_ids(&request.roster);
    let result = match state.orchestrator.run(&records, &registry) {
        Ok(result) => result,
        Err(e) => return billing_error_response(e),
    };

    let run_id = match &state.store {
        Some(store) => {
            let metadata = RunMetadata::new(
                request.source.unwrap_or_else(|| "api".to_string()),
                None,
                &records,
            );
            let mut store = match store.lock() {
                Ok(store) => store,
                Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "run store lock poisoned"),
            };
            match store.save(&result, &metadata) {
                Ok(run_id) => Some(run_id),
                Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
            }
        }
        None => None,
    };

    ApiResponse::ok(RunResponse { run_id, result })
}

/// GET /api/runs - Stored runs, most recent first
async fn list_runs(State(state): State<AppState>) -> Response {
    with_store(&state, |store| store.list_runs().map(ApiResponse::<Vec<RunSummary>>::ok))
}

/// GET /api/runs/:id - One stored run with its full result
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    with_store(&state, |store| {
        Ok(match store.get_run(&run_id)? {
            Some(run) => ApiResponse::<StoredRun>::ok(run),
            None => error_response(StatusCode::NOT_FOUND, format!("run {} not found", run_id)),
        })
    })
}

fn with_store<F>(state: &AppState, f: F) -> Response
where
    F: FnOnce(&RunStore) -> anyhow::Result<Response>,
{
    let Some(store) = &state.store else {
        return error_response(StatusCode::NOT_FOUND, "no run store configured");
    };
    let store = match store.lock() {
        Ok(store) => store,
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "run store lock poisoned"),
    };
    match f(&store) {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();

    println!("🌐 SAVI Billing - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let rules = match &args.rules {
        Some(path) => BillingRules::from_file(path)?,
        None => BillingRules::builtin(),
    };
    println!("✓ Rules loaded: {}", rules.version);

    let store = match &args.store {
        Some(path) => {
            let store = RunStore::open(path)?;
            println!("✓ Run store opened: {:?}", path);
            Some(Arc::new(Mutex::new(store)))
        }
        None => None,
    };

    let state = AppState {
        orchestrator: Arc::new(BillingOrchestrator::new(rules)?),
        store,
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/billing/run", post(run_billing))
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;

    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/billing/run", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
