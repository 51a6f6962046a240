//! JSON HTTP API over the lead store, ingest queue and classifier.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use jobmon_ai::{AiClient, ClassificationPolicy};
use jobmon_core::{JobLead, NewLead};
use jobmon_storage::{ApplicationUpdate, HttpFetcher, LeadStore, ManualLead, SourceStore, StorageError};
use jobmon_sync::{run_all_fetchers, IngestQueue};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobmon-web";

/// Queue depth above which the health report flags a backlog.
const QUEUE_BACKLOG_WARNING: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub leads: LeadStore,
    pub sources: SourceStore,
    pub http: HttpFetcher,
    pub ingest: IngestQueue,
    pub ai: AiClient,
    pub policy: Arc<ClassificationPolicy>,
    /// When set, every request must present this key.
    pub api_key: Option<String>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/", get(index_handler))
        .route("/system/health", get(health_handler))
        .route("/leads", get(leads_handler))
        .route("/leads/refresh", get(refresh_handler))
        .route("/leads/ingest", post(ingest_handler))
        .route("/leads/manual", post(manual_lead_handler))
        .route("/leads/enrich", post(enrich_handler))
        .route("/leads/classify", post(classify_handler))
        .route("/leads/export-csv", get(export_csv_handler))
        .route("/leads/{id}/update-status", post(update_status_handler))
        .route("/leads/{id}/save-draft", post(save_draft_handler))
        .route("/leads/{id}/unapply", post(unapply_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

async fn require_api_key(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let from_query = Query::<ApiKeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.api_key);

    if bearer == Some(expected) || from_query.as_deref() == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid or missing API Key"})),
        )
            .into_response()
    }
}

fn storage_failure(context: &str, err: StorageError) -> Response {
    error!(error = %err, "{context} failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": err.to_string()})),
    )
        .into_response()
}

async fn index_handler() -> Json<JsonValue> {
    Json(json!({"status": "Job Monitor Active", "version": env!("CARGO_PKG_VERSION")}))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    if let Err(err) = state.leads.database().ping().await {
        return Json(json!({"status": "Error", "message": err.to_string()}));
    }

    let queue_length = state.ingest.depth();
    let pending = match state.leads.count_unscored().await {
        Ok(count) => count,
        Err(err) => return Json(json!({"status": "Error", "message": err.to_string()})),
    };
    let recommendation = if queue_length > QUEUE_BACKLOG_WARNING {
        "Ingest queue is backing up."
    } else if !state.ai.is_configured() {
        "No AI credentials configured; classification is paused."
    } else {
        "System running smoothly."
    };

    Json(json!({
        "status": "Healthy",
        "metrics": {
            "queue_length": queue_length,
            "pending_classification": pending,
            "ai_keys": state.ai.key_count(),
        },
        "recommendation": recommendation,
    }))
}

async fn leads_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobLead>> {
    match state.leads.list_new().await {
        Ok(leads) => Json(leads),
        Err(err) => {
            warn!(error = %err, "listing leads failed");
            Json(Vec::new())
        }
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let events = run_all_fetchers(state.sources.clone(), state.leads.clone(), state.http.clone())
        .map(|event| Ok::<_, Infallible>(format!("{event}\n")));
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(events),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    jobs: Vec<NewLead>,
}

async fn ingest_handler(State(state): State<Arc<AppState>>, Json(req): Json<IngestRequest>) -> Json<JsonValue> {
    let submitted = req.jobs.len();
    let count = req
        .jobs
        .into_iter()
        .map(|lead| state.ingest.enqueue(lead))
        .filter(|accepted| *accepted)
        .count();
    if count < submitted {
        error!(submitted, accepted = count, "ingest worker is not running; leads dropped");
    }
    Json(json!({"status": "queued", "count": count}))
}

#[derive(Debug, Deserialize)]
struct ManualLeadRequest {
    title: String,
    description: String,
    agency_match: String,
    #[serde(default = "default_manual_url")]
    url: String,
    #[serde(default = "default_manual_company")]
    company: String,
}

fn default_manual_url() -> String {
    "#".to_string()
}

fn default_manual_company() -> String {
    jobmon_core::DEFAULT_COMPANY.to_string()
}

async fn manual_lead_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualLeadRequest>,
) -> Response {
    let lead = ManualLead {
        title: req.title,
        description: req.description,
        agency_match: req.agency_match,
        url: req.url,
        company: req.company,
    };
    match state.leads.insert_manual(&lead).await {
        Ok(id) => Json(json!({"success": true, "id": id})).into_response(),
        Err(err) => storage_failure("manual lead insert", err),
    }
}

#[derive(Debug, Deserialize)]
struct EnrichRequest {
    external_id: String,
    #[serde(default)]
    client_signals: JsonValue,
}

async fn enrich_handler(State(state): State<Arc<AppState>>, Json(req): Json<EnrichRequest>) -> Response {
    match state.leads.enrich(&req.external_id, &req.client_signals).await {
        Ok(updated) => Json(json!({"success": true, "updated": updated})).into_response(),
        Err(err) => storage_failure("lead enrichment", err),
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    title: String,
    #[serde(default)]
    description: String,
}

async fn classify_handler(State(state): State<Arc<AppState>>, Json(req): Json<ClassifyRequest>) -> Json<JsonValue> {
    let result = state.policy.classify(&state.ai, &req.title, &req.description).await;
    Json(json!({
        "agency": result.label,
        "confidence": result.confidence,
        "score": result.score,
        "reasoning": result.reasoning,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StatusUpdateRequest {
    agency_match: Option<String>,
    client_proposal: Option<String>,
    client_plan: Option<String>,
    applied_by: Option<String>,
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StatusUpdateRequest>,
) -> Response {
    let update = ApplicationUpdate {
        agency_match: req.agency_match,
        client_proposal: req.client_proposal,
        client_plan: req.client_plan,
        applied_by: req.applied_by,
    };
    match state.leads.mark_applied(&id, &update).await {
        Ok(found) => Json(json!({"success": found})).into_response(),
        Err(err) => storage_failure("status update", err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DraftRequest {
    client_proposal: Option<String>,
    client_plan: Option<String>,
}

async fn save_draft_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DraftRequest>,
) -> Response {
    match state
        .leads
        .save_draft(&id, req.client_proposal.as_deref(), req.client_plan.as_deref())
        .await
    {
        Ok(found) => Json(json!({"success": found})).into_response(),
        Err(err) => storage_failure("draft save", err),
    }
}

async fn unapply_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.leads.unmark_applied(&id).await {
        Ok(found) => Json(json!({"success": found})).into_response(),
        Err(err) => storage_failure("unapply", err),
    }
}

const CSV_COLUMNS: [&str; 21] = [
    "id",
    "source",
    "external_id",
    "title",
    "description",
    "url",
    "budget",
    "company",
    "posted_at",
    "status",
    "agency_match",
    "match_score",
    "ai_confidence",
    "match_reasoning",
    "applied",
    "applied_at",
    "applied_by",
    "connect_score",
    "client_proposal",
    "client_plan",
    "created_at",
];

fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = fields
        .into_iter()
        .map(|f| csv_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

fn csv_row(lead: &JobLead) -> [String; 21] {
    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    [
        lead.id.clone(),
        lead.source.clone(),
        lead.external_id.clone(),
        lead.title.clone(),
        lead.description.clone(),
        lead.url.clone(),
        lead.budget.clone(),
        lead.company.clone(),
        lead.posted_at.to_rfc3339(),
        lead.status.clone(),
        lead.agency_match.as_ref().map(ToString::to_string).unwrap_or_default(),
        lead.match_score.to_string(),
        lead.ai_confidence.to_string(),
        opt(&lead.match_reasoning),
        u8::from(lead.applied).to_string(),
        lead.applied_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        opt(&lead.applied_by),
        lead.connect_score.to_string(),
        opt(&lead.client_proposal),
        opt(&lead.client_plan),
        lead.created_at.to_rfc3339(),
    ]
}

/// Applied leads as CSV, newest application first.
pub fn applied_leads_csv(leads: &[JobLead]) -> String {
    if leads.is_empty() {
        return csv_line(["No data"]);
    }
    let mut out = csv_line(CSV_COLUMNS);
    for lead in leads {
        out.push_str(&csv_line(csv_row(lead)));
    }
    out
}

async fn export_csv_handler(State(state): State<Arc<AppState>>) -> Response {
    let leads = match state.leads.list_applied().await {
        Ok(leads) => leads,
        Err(err) => {
            warn!(error = %err, "listing applied leads failed");
            Vec::new()
        }
    };
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=applied_jobs.csv"),
        ],
        applied_leads_csv(&leads),
    )
        .into_response()
}
