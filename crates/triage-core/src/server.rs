//! HTTP surface over the installed pipeline

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::pipeline::{Pipeline, Ticket};
use crate::signature::{FieldKind, CATEGORIES, PRIORITIES};

pub const MAX_BATCH_SIZE: usize = 50;
pub const BATCH_CONCURRENCY: usize = 10;

/// Shared state behind every route
pub struct AppState {
    pipeline: Arc<Pipeline>,
    optimized: bool,
    processed: AtomicU64,
    failed: AtomicU64,
    total_processing_ms: AtomicU64,
    batch_permits: Semaphore,
}

impl AppState {
    /// `optimized` reports whether a persisted optimized state was installed
    pub fn new(pipeline: Arc<Pipeline>, optimized: bool) -> Self {
        Self {
            pipeline,
            optimized,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
            batch_permits: Semaphore::new(BATCH_CONCURRENCY),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportTicket {
    pub subject: String,
    pub message: String,
    pub customer_email: String,
    #[serde(default)]
    pub priority_override: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchTickets {
    pub tickets: Vec<SupportTicket>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub ticket_id: String,
    pub response_quality: f64,
    pub was_helpful: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketResponse {
    pub ticket_id: String,
    pub category: String,
    pub priority: String,
    pub response_type: String,
    pub generated_response: String,
    pub quality_score: f64,
    pub escalation_needed: bool,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct BatchError {
    error: String,
    ticket: SupportTicket,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    total_tickets: usize,
    successful: usize,
    failed: usize,
    results: Vec<TicketResponse>,
    errors: Vec<BatchError>,
    total_processing_time_ms: u64,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Processing(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "{}", msg),
            ApiError::Processing(msg) => write!(f, "Processing failed: {}", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/process-ticket", post(process_ticket))
        .route("/process-batch", post(process_batch))
        .route("/feedback", post(feedback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Support ticket triage API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "process_ticket": "POST /process-ticket",
            "process_batch": "POST /process-batch",
            "feedback": "POST /feedback",
            "health": "GET /health",
            "metrics": "GET /metrics"
        }
    }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "optimized": state.optimized,
        "tickets_processed": state.processed.load(Ordering::Relaxed),
        "timestamp": Utc::now(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let processed = state.processed.load(Ordering::Relaxed);
    let total_ms = state.total_processing_ms.load(Ordering::Relaxed);
    let average = if processed > 0 {
        total_ms as f64 / processed as f64
    } else {
        0.0
    };
    Json(json!({
        "tickets_processed": processed,
        "tickets_failed": state.failed.load(Ordering::Relaxed),
        "average_processing_time_ms": average,
        "optimized": state.optimized,
        "demonstrations_installed": state.pipeline.state().demonstration_count(),
        "supported_categories": CATEGORIES,
        "supported_priorities": PRIORITIES,
    }))
}

fn next_ticket_id(state: &AppState) -> String {
    let n = state.processed.load(Ordering::Relaxed) + state.failed.load(Ordering::Relaxed) + 1;
    format!("API{:06}-{}", n, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

async fn handle_ticket(state: &AppState, ticket: &SupportTicket) -> Result<TicketResponse, ApiError> {
    if !ticket.customer_email.contains('@') {
        return Err(ApiError::BadRequest(format!(
            "invalid customer_email '{}'",
            ticket.customer_email
        )));
    }
    let priority_override = match &ticket.priority_override {
        Some(p) => Some(
            FieldKind::Choice(PRIORITIES)
                .coerce(&json!(p))
                .map_err(ApiError::BadRequest)?
                .as_str()
                .unwrap_or_default()
                .to_string(),
        ),
        None => None,
    };

    let ticket_id = next_ticket_id(state);
    let started = Instant::now();
    let run = state
        .pipeline
        .run(&Ticket::new(&ticket.subject, &ticket.message))
        .await;
    let elapsed = started.elapsed().as_millis() as u64;

    let run = match run {
        Ok(run) => run,
        Err(e) => {
            state.failed.fetch_add(1, Ordering::Relaxed);
            error!("Error processing ticket {}: {}", ticket_id, e);
            return Err(ApiError::Processing(e.to_string()));
        }
    };
    state.processed.fetch_add(1, Ordering::Relaxed);
    state.total_processing_ms.fetch_add(elapsed, Ordering::Relaxed);

    let output = run.output;
    let priority = priority_override.unwrap_or(output.priority);
    info!("Processed ticket {}: {}/{}", ticket_id, output.category, priority);

    Ok(TicketResponse {
        ticket_id,
        category: output.category,
        priority,
        response_type: output.response_type,
        generated_response: output.response,
        quality_score: output.quality_score,
        escalation_needed: output.escalation_needed,
        processing_time_ms: elapsed,
        timestamp: Utc::now(),
    })
}

async fn process_ticket(
    State(state): State<Arc<AppState>>,
    Json(ticket): Json<SupportTicket>,
) -> Result<Json<TicketResponse>, ApiError> {
    handle_ticket(&state, &ticket).await.map(Json)
}

async fn process_batch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<BatchTickets>,
) -> Result<Json<BatchResponse>, ApiError> {
    if batch.tickets.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!(
            "Batch size limited to {} tickets",
            MAX_BATCH_SIZE
        )));
    }

    let started = Instant::now();
    let outcomes = join_all(batch.tickets.into_iter().map(|ticket| {
        let state = &state;
        async move {
            let _permit = state.batch_permits.acquire().await;
            let outcome = handle_ticket(state, &ticket).await;
            (ticket, outcome)
        }
    }))
    .await;

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for (ticket, outcome) in outcomes {
        match outcome {
            Ok(response) => results.push(response),
            Err(e) => errors.push(BatchError {
                error: e.to_string(),
                ticket,
            }),
        }
    }

    Ok(Json(BatchResponse {
        total_tickets: results.len() + errors.len(),
        successful: results.len(),
        failed: errors.len(),
        results,
        errors,
        total_processing_time_ms: started.elapsed().as_millis() as u64,
    }))
}

async fn feedback(Json(feedback): Json<FeedbackRequest>) -> Json<serde_json::Value> {
    info!(
        "Feedback for {}: quality={:.2}, helpful={}, comments={}",
        feedback.ticket_id,
        feedback.response_quality,
        feedback.was_helpful,
        feedback.comments.as_deref().unwrap_or("-")
    );
    Json(json!({
        "message": "Feedback received",
        "ticket_id": feedback.ticket_id,
        "status": "recorded",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::RESPONSE_GENERATOR;
    use crate::retry::RetryPolicy;
    use crate::testing::{ScriptedGenerator, StaticRetriever};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_with(generator: ScriptedGenerator) -> (Router, Arc<AppState>) {
        let pipeline = Pipeline::new(Arc::new(generator), Arc::new(StaticRetriever::default()))
            .with_retry_policy(RetryPolicy::no_retries());
        let state = Arc::new(AppState::new(Arc::new(pipeline), false));
        (router(Arc::clone(&state)), state)
    }

    fn app() -> Router {
        app_with(ScriptedGenerator::default()).0
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn ticket_json(subject: &str) -> serde_json::Value {
        json!({
            "subject": subject,
            "message": "The app crashes when I upload a file",
            "customer_email": "user@example.com"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_process_ticket_with_override() {
        let mut body = ticket_json("Crash");
        body["priority_override"] = json!("critical");
        let (status, response) = post_json(app(), "/process-ticket", body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["category"], "Technical");
        assert_eq!(response["priority"], "Critical");
        assert!(response["ticket_id"].as_str().unwrap().starts_with("API000001"));
    }

    #[tokio::test]
    async fn test_invalid_override_rejected() {
        let mut body = ticket_json("Crash");
        body["priority_override"] = json!("whenever");
        let (status, _) = post_json(app(), "/process-ticket", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_500() {
        let (app, state) = app_with(ScriptedGenerator::default().failing_stage(RESPONSE_GENERATOR));
        let (status, response) = post_json(app, "/process-ticket", ticket_json("Crash")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response["detail"].as_str().unwrap().contains(RESPONSE_GENERATOR));
        assert_eq!(state.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_batch_reports_errors_separately() {
        let mut bad = ticket_json("Bad");
        bad["customer_email"] = json!("not-an-email");
        let body = json!({"tickets": [ticket_json("One"), bad, ticket_json("Three")]});

        let (status, response) = post_json(app(), "/process-batch", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["total_tickets"], 3);
        assert_eq!(response["successful"], 2);
        assert_eq!(response["failed"], 1);
        assert_eq!(response["errors"][0]["ticket"]["subject"], "Bad");
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let tickets: Vec<_> = (0..=MAX_BATCH_SIZE).map(|i| ticket_json(&i.to_string())).collect();
        let (status, _) = post_json(app(), "/process-batch", json!({ "tickets": tickets })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_feedback_and_metrics() {
        let (app, _) = app_with(ScriptedGenerator::default());
        let (status, response) = post_json(
            app.clone(),
            "/feedback",
            json!({"ticket_id": "API000001", "response_quality": 0.9, "was_helpful": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "recorded");

        post_json(app.clone(), "/process-ticket", ticket_json("Crash")).await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["tickets_processed"], 1);
        assert_eq!(body["supported_priorities"][0], "Critical");
    }
}
