//! End-to-end report pipeline
//!
//! ARTICLES → SNAPSHOT → RETRY CONTROLLER → ENVELOPE → SINK

pub mod controller;

pub use controller::{best_attempt, retry_feedback, AttemptState, ControllerOutcome, RetryController};

use crate::audit::{compute_report_digest, render_annotation, ReportSink};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::extraction::PatternExtractor;
use crate::market::{InstrumentDictionary, ReferenceDataSource, SnapshotFetcher};
use crate::models::{ReportEnvelope, ReportMetadata};
use crate::provider::{ModelCandidate, ModelProvider, PromptBuilder, DEFAULT_REPORT_TEMPLATE};
use crate::quality::QualityScorer;
use crate::store::{ArticleQuery, ArticleStore};
use crate::verification::ClaimVerifier;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub query: ArticleQuery,
    #[serde(default)]
    pub model_hint: Option<String>,
}

impl RunRequest {
    pub fn new(query: ArticleQuery) -> Self {
        Self {
            query,
            model_hint: None,
        }
    }
}

pub struct ReportPipeline {
    store: Arc<dyn ArticleStore>,
    fetcher: SnapshotFetcher,
    controller: RetryController,
    sink: Option<Arc<dyn ReportSink>>,
    template: String,
}

impl ReportPipeline {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        fetcher: SnapshotFetcher,
        controller: RetryController,
    ) -> Self {
        Self {
            store,
            fetcher,
            controller,
            sink: None,
            template: DEFAULT_REPORT_TEMPLATE.to_string(),
        }
    }

    /// Wire the default components from one configuration.
    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn ArticleStore>,
        source: Arc<dyn ReferenceDataSource>,
        candidates: Vec<ModelCandidate>,
        dictionary: Arc<InstrumentDictionary>,
    ) -> Result<Self> {
        config.validate()?;

        let fetcher = SnapshotFetcher::new(dictionary.clone(), source, &config.fetcher);
        let provider = ModelProvider::new(
            candidates,
            PromptBuilder::new(config.prompt.clone()),
            config.provider.call_timeout(),
        );
        let scorer = QualityScorer::new(config.scoring.clone(), config.controller.min_score)?;
        let controller = RetryController::new(
            config.controller.clone(),
            Arc::new(provider),
            Arc::new(PatternExtractor::new(dictionary)),
            ClaimVerifier::new(config.verifier.clone()),
            Arc::new(scorer),
        );

        Ok(Self::new(store, fetcher, controller))
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn controller(&self) -> &RetryController {
        &self.controller
    }

    /// Produce one annotated report for the requested date range.
    pub async fn run(&self, request: &RunRequest) -> Result<ReportEnvelope> {
        let started = Instant::now();
        let query = &request.query;
        let run_id = Uuid::new_v4();

        if !query.is_valid() {
            return Err(PipelineError::InvalidConfig(format!(
                "start date {} is after end date {}",
                query.start, query.end
            )));
        }

        info!(
            run_id = %run_id,
            start = %query.start,
            end = %query.end,
            model_hint = ?request.model_hint,
            "Report pipeline: starting"
        );

        // === INPUT ===
        let articles = self.store.query_articles(query).await?;
        if articles.is_empty() {
            return Err(PipelineError::NoArticles(format!(
                "no articles between {} and {}",
                query.start, query.end
            )));
        }

        // === SNAPSHOT ===
        let snapshot = self.fetcher.fetch(&articles).await;

        // === GENERATE / VERIFY / SCORE ===
        let outcome = self
            .controller
            .run(
                &self.template,
                &snapshot,
                &articles,
                request.model_hint.as_deref(),
            )
            .await?;

        let final_attempt = &outcome.final_attempt;
        let articles_used = self
            .controller
            .provider()
            .prompt_builder()
            .included_articles(&articles);

        let metadata = ReportMetadata {
            run_id,
            date_start: query.start,
            date_end: query.end,
            articles_used,
            terminal_state: outcome.terminal_state,
            accepted: outcome.accepted,
            attempts_used: outcome.attempts_used,
            max_attempts: self.controller.max_attempts(),
            score: final_attempt.quality.score,
            min_score: self.controller.config().min_score,
            claim_stats: final_attempt.quality.claim_stats,
            usage: final_attempt.usage.clone(),
            snapshot_taken_at: snapshot.taken_at,
            snapshot_size: snapshot.len(),
            report_digest: compute_report_digest(&final_attempt.report_text),
            generated_at: Utc::now(),
        };

        let envelope = ReportEnvelope {
            annotation_block: render_annotation(&metadata, final_attempt),
            report_text: final_attempt.report_text.clone(),
            metadata,
        };

        // === EMIT ===
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.emit(&envelope).await {
                warn!(run_id = %run_id, error = %e, "Report sink failed");
            }
        }

        info!(
            run_id = %run_id,
            terminal_state = %envelope.metadata.terminal_state,
            score = envelope.metadata.score,
            attempts_used = envelope.metadata.attempts_used,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report pipeline: complete"
        );

        Ok(envelope)
    }
}
