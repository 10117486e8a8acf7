// Assessment Tracker - Web Server
// JSON API over the unit registry, report intake and stagnation checks

use assessment_tracker::{
    check_stagnation_with, db, ingest, ingest_batch, parse_extraction, prior_history, BatchSummary,
    Config, Confidence, Event, IngestOutcome, IntakeOptions, MatchResult, PreviousImprovement, RegistryEntry, ReportType,
    StagnationVerdict, TrackerError, UnitType,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{error, info};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<Config>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Errors
// ============================================================================

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        let status = match err {
            TrackerError::UnitNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TrackerError>() {
            Ok(tracker) => tracker.into(),
            Err(other) => {
                error!("Request failed: {:#}", other);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: serde_json::Value::Null,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Second percent-decoding pass over an already decoded path segment
///
/// Lets clients that encode twice reach ids such as "SLO 1"; a literal
/// "%xx" inside an id is decoded too.
fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Deserialize)]
struct NewUnitRequest {
    canonical_name: String,
    #[serde(default)]
    college_division: String,
    unit_type: String,
    #[serde(default)]
    previous_names: Vec<String>,
}

#[derive(Deserialize)]
struct ResolveRequest {
    name: String,
    unit_type: String,
}

#[derive(Deserialize)]
struct ReportRequest {
    report_type: String,
    /// Answer text of the extraction call
    extraction: String,
    /// Accept medium/low confidence matches
    #[serde(default)]
    confirm: bool,
}

#[derive(Deserialize)]
struct BatchReportRequest {
    report_type: String,
    /// One extraction answer per report
    extractions: Vec<String>,
    #[serde(default)]
    confirm: bool,
}

#[derive(Serialize)]
struct BatchReportResponse {
    summary: String,
    #[serde(flatten)]
    batch: BatchSummary,
}

#[derive(Serialize)]
struct ReportResponse {
    #[serde(flatten)]
    outcome: IngestOutcome,
    stagnation_context: String,
}

#[derive(Deserialize)]
struct StagnationQuery {
    current_year: Option<String>,
}

#[derive(Serialize)]
struct StagnationResponse {
    unit_id: String,
    outcome_id: String,
    history_len: usize,
    #[serde(flatten)]
    verdict: StagnationVerdict,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/units/:unit_type - Registry entries of one namespace
async fn list_units(State(state): State<AppState>, Path(unit_type): Path<String>) -> ApiResult<Vec<RegistryEntry>> {
    let unit_type: UnitType = decode_segment(&unit_type).parse()?;
    let conn = state.conn()?;
    let registry = db::load_registry(&conn)?;

    Ok(Json(ApiResponse::ok(registry.entries(unit_type).to_vec())))
}

/// POST /api/units - Register a unit
async fn create_unit(State(state): State<AppState>, Json(req): Json<NewUnitRequest>) -> ApiResult<RegistryEntry> {
    let unit_type: UnitType = req.unit_type.parse()?;
    if req.canonical_name.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "canonical_name is required"));
    }

    let mut entry = RegistryEntry::new(&req.canonical_name, &req.college_division, unit_type);
    for alias in &req.previous_names {
        entry.add_previous_name(alias);
    }

    let conn = state.conn()?;
    let mut registry = db::load_registry(&conn)?;
    registry.register(entry.clone())?;
    db::upsert_unit(&conn, &entry)?;
    db::insert_event(
        &conn,
        &Event::new(
            "unit_registered",
            "unit",
            &entry.unit_id,
            serde_json::to_value(&entry).map_err(anyhow::Error::from)?,
            "api",
        ),
    )?;

    info!("Registered {} via API", entry.unit_id);
    Ok(Json(ApiResponse::ok(entry)))
}

/// POST /api/resolve - Resolve a free-text unit name
async fn resolve_unit(State(state): State<AppState>, Json(req): Json<ResolveRequest>) -> ApiResult<MatchResult> {
    let unit_type: UnitType = req.unit_type.parse()?;
    let conn = state.conn()?;
    let registry = db::load_registry(&conn)?;

    Ok(Json(ApiResponse::ok(registry.resolve(&req.name, unit_type))))
}

/// POST /api/reports - Ingest an extracted report
async fn submit_report(State(state): State<AppState>, Json(req): Json<ReportRequest>) -> ApiResult<ReportResponse> {
    let report_type: ReportType = req.report_type.parse()?;
    let report = parse_extraction(&req.extraction)?;

    let options = IntakeOptions {
        accept: if req.confirm { Confidence::Low } else { Confidence::High },
        policy: state.config.stagnation,
    };

    let mut conn = state.conn()?;
    let mut registry = db::load_registry(&conn)?;
    let outcome = ingest(&mut conn, &mut registry, &report, report_type, &options, "api")?;
    let stagnation_context = outcome.prepared.stagnation_context();

    Ok(Json(ApiResponse::ok(ReportResponse {
        outcome,
        stagnation_context,
    })))
}

/// POST /api/reports/batch - Ingest many answers of one report type, skipping failures
async fn submit_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchReportRequest>,
) -> ApiResult<BatchReportResponse> {
    let report_type: ReportType = req.report_type.parse()?;

    let options = IntakeOptions {
        accept: if req.confirm { Confidence::Low } else { Confidence::High },
        policy: state.config.stagnation,
    };

    let answers = req
        .extractions
        .into_iter()
        .enumerate()
        .map(|(i, answer)| (format!("extraction {}", i + 1), Ok(answer)));

    let mut conn = state.conn()?;
    let mut registry = db::load_registry(&conn)?;
    let batch = ingest_batch(&mut conn, &mut registry, answers, report_type, &options, "api");

    Ok(Json(ApiResponse::ok(BatchReportResponse {
        summary: batch.summary_line(),
        batch,
    })))
}

/// GET /api/stagnation/:unit_id/:outcome_id - Stagnation verdict from stored history
async fn get_stagnation(
    State(state): State<AppState>,
    Path((unit_id, outcome_id)): Path<(String, String)>,
    Query(query): Query<StagnationQuery>,
) -> ApiResult<StagnationResponse> {
    let unit_id = decode_segment(&unit_id);
    let outcome_id = decode_segment(&outcome_id);

    let conn = state.conn()?;
    if db::get_unit(&conn, &unit_id)?.is_none() {
        return Err(TrackerError::UnitNotFound(unit_id).into());
    }

    let records = db::history_for(&conn, &unit_id, &outcome_id)?;
    let history = prior_history(records, query.current_year.as_deref().unwrap_or(""));
    let verdict = check_stagnation_with(&state.config.stagnation, &history);

    Ok(Json(ApiResponse::ok(StagnationResponse {
        unit_id,
        outcome_id,
        history_len: history.len(),
        verdict,
    })))
}

/// GET /api/improvements/:unit_id - Previously proposed improvements
async fn get_improvements(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> ApiResult<Vec<PreviousImprovement>> {
    let unit_id = decode_segment(&unit_id);
    let conn = state.conn()?;
    if db::get_unit(&conn, &unit_id)?.is_none() {
        return Err(TrackerError::UnitNotFound(unit_id).into());
    }

    Ok(Json(ApiResponse::ok(db::previous_improvements(&conn, &unit_id)?)))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    let conn = db::open_database(&config.db_path)?;
    info!("Database opened: {}", config.db_path.display());

    let bind_addr = config.bind_addr.clone();

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        config: Arc::new(config),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/units", post(create_unit))
        .route("/units/:unit_type", get(list_units))
        .route("/resolve", post(resolve_unit))
        .route("/reports", post(submit_report))
        .route("/reports/batch", post(submit_batch))
        .route("/stagnation/:unit_id/:outcome_id", get(get_stagnation))
        .route("/improvements/:unit_id", get(get_improvements))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Server running on http://{}", bind_addr);
    info!("API: http://{}/api/health", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
