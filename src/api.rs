//! REST API server for the report pipeline
//!
//! Triggers report runs over HTTP and serves archived reports.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::ReportArchive;
use crate::error::PipelineError;
use crate::pipeline::{ReportPipeline, RunRequest};
use crate::store::{collection_date_today, ArticleQuery};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ReportRequest {
    /// Single collection date. Takes precedence over `start`/`end`.
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub newest_first: bool,
    pub model: Option<String>,
}

impl ReportRequest {
    /// Missing dates fall back to today's collection date.
    pub fn into_run_request(self) -> RunRequest {
        let mut query = match (self.date, self.start, self.end) {
            (Some(date), _, _) => ArticleQuery::for_date(date),
            (None, Some(start), end) => ArticleQuery::range(start, end.unwrap_or(start)),
            (None, None, Some(end)) => ArticleQuery::for_date(end),
            (None, None, None) => ArticleQuery::for_date(collection_date_today()),
        }
        .with_sources(self.sources)
        .with_keywords(self.keywords);

        query.limit = self.limit;
        query.newest_first = self.newest_first;

        RunRequest {
            query,
            model_hint: self.model.filter(|m| !m.trim().is_empty()),
        }
    }
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::NoArticles(_) => StatusCode::NOT_FOUND,
        PipelineError::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<ReportPipeline>,
    pub archive: Option<Arc<ReportArchive>>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Report Endpoints
/// =============================

async fn create_report(
    State(state): State<ApiState>,
    Json(req): Json<ReportRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let request = req.into_run_request();
    info!(
        start = %request.query.start,
        end = %request.query.end,
        model = ?request.model_hint,
        "Received report request"
    );

    match state.pipeline.run(&request).await {
        Ok(envelope) => (StatusCode::OK, Json(ApiResponse::success(envelope))),
        Err(e) => {
            warn!(error = %e, "Report run failed");
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

async fn get_report(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(archive) = state.archive.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("report archive not enabled".into())),
        );
    };

    match archive.get(run_id).await {
        Some(envelope) => {
            let intact = archive.verify_integrity(run_id).await.unwrap_or(false);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "envelope": envelope,
                    "document": envelope.render_document(),
                    "integrity_ok": intact,
                }))),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no report for run {}", run_id))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(pipeline: Arc<ReportPipeline>, archive: Option<Arc<ReportArchive>>) -> Router {
    let state = ApiState { pipeline, archive };

    Router::new()
        .route("/health", get(health))
        .route("/api/reports", post(create_report))
        .route("/api/reports/:run_id", get(get_report))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    pipeline: Arc<ReportPipeline>,
    archive: Option<Arc<ReportArchive>>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(pipeline, archive);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::market::{InstrumentDictionary, StaticReferenceSource};
    use crate::models::Article;
    use crate::provider::{ModelCandidate, ScriptedBackend};
    use crate::store::InMemoryArticleStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn router(backend: ScriptedBackend) -> (Router, Arc<ReportArchive>) {
        let store = InMemoryArticleStore::with_articles(vec![Article {
            id: "1".to_string(),
            title: "美联储维持利率不变".to_string(),
            summary: "市场预期年内降息。".to_string(),
            body: None,
            source: "财新".to_string(),
            link: None,
            published_at: Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap(),
        }]);
        let pipeline = ReportPipeline::from_config(
            &PipelineConfig::default(),
            Arc::new(store),
            Arc::new(StaticReferenceSource::new()),
            vec![ModelCandidate::new(Arc::new(backend), "model-a")],
            Arc::new(InstrumentDictionary::builtin()),
        )
        .unwrap();

        let archive = Arc::new(ReportArchive::new());
        let pipeline = pipeline.with_sink(archive.clone());
        (create_router(Arc::new(pipeline), Some(archive.clone())), archive)
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/reports")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_request_date_precedence() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let req = ReportRequest {
            date: Some(day),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            model: Some("  ".to_string()),
            ..ReportRequest::default()
        };
        let run = req.into_run_request();
        assert_eq!(run.query.start, day);
        assert_eq!(run.query.end, day);
        assert!(run.model_hint.is_none());

        let req = ReportRequest {
            start: Some(day),
            ..ReportRequest::default()
        };
        assert_eq!(req.into_run_request().query.end, day);
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = router(ScriptedBackend::new("scripted"));
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_articles_is_404() {
        let (router, _) = router(ScriptedBackend::new("scripted"));
        let response = router.oneshot(post_json(r#"{"date": "2024-03-01"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_unreachable_providers_is_502() {
        let (router, _) = router(ScriptedBackend::new("scripted"));
        let response = router.oneshot(post_json(r#"{"date": "2024-01-15"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_report_is_returned_and_archived() {
        let backend = ScriptedBackend::new("scripted").with_fallback("## 市场概况\n市场平稳【新闻1】。");
        let (router, archive) = router(backend);

        let response = router
            .clone()
            .oneshot(post_json(r#"{"date": "2024-01-15", "sources": ["财新"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["metadata"]["terminal_state"], "exhausted");
        assert_eq!(archive.len().await, 1);

        let run_id = body["data"]["metadata"]["run_id"].as_str().unwrap().to_string();
        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/reports/{}", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["data"]["integrity_ok"], true);
    }
}
