//! Retry controller
//!
//! GENERATING → VERIFYING → SCORING → ACCEPTED | RETRYING | EXHAUSTED
//!
//! Snapshot and articles stay fixed across attempts; only the model output
//! changes, so scores are comparable between attempts.

use crate::config::ControllerConfig;
use crate::error::PipelineError;
use crate::extraction::ClaimExtractor;
use crate::models::{
    Article, GenerationAttempt, QualityResult, ReferenceSnapshot, TerminalState,
};
use crate::provider::ModelProvider;
use crate::quality::ReportScorer;
use crate::verification::ClaimVerifier;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Generating,
    Verifying,
    Scoring,
    Accepted,
    Retrying,
    Exhausted,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptState::Generating => "GENERATING",
            AttemptState::Verifying => "VERIFYING",
            AttemptState::Scoring => "SCORING",
            AttemptState::Accepted => "ACCEPTED",
            AttemptState::Retrying => "RETRYING",
            AttemptState::Exhausted => "EXHAUSTED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOutcome {
    pub final_attempt: GenerationAttempt,
    pub accepted: bool,
    /// Generation calls made, failed ones included.
    pub attempts_used: u32,
    pub terminal_state: TerminalState,
    /// Every attempt that produced text, in order.
    pub attempts: Vec<GenerationAttempt>,
    pub generation_failures: Vec<String>,
    pub trace: Vec<String>,
}

pub struct RetryController {
    config: ControllerConfig,
    provider: Arc<ModelProvider>,
    extractor: Arc<dyn ClaimExtractor>,
    verifier: ClaimVerifier,
    scorer: Arc<dyn ReportScorer>,
}

impl RetryController {
    pub fn new(
        config: ControllerConfig,
        provider: Arc<ModelProvider>,
        extractor: Arc<dyn ClaimExtractor>,
        verifier: ClaimVerifier,
        scorer: Arc<dyn ReportScorer>,
    ) -> Self {
        Self {
            config,
            provider,
            extractor,
            verifier,
            scorer,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn provider(&self) -> &ModelProvider {
        &self.provider
    }

    pub fn max_attempts(&self) -> u32 {
        if self.config.skip_verification {
            1
        } else {
            self.config.max_retries.max(1)
        }
    }

    /// Run the bounded attempt loop.
    ///
    /// Fails only when no attempt produced any text. Running out of attempts
    /// without passing is a normal outcome carrying the best attempt.
    pub async fn run(
        &self,
        template: &str,
        snapshot: &ReferenceSnapshot,
        articles: &[Article],
        model_hint: Option<&str>,
    ) -> Result<ControllerOutcome> {
        let max_attempts = self.max_attempts();
        let mut trace = Vec::new();
        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut generation_failures = Vec::new();
        let mut feedback: Option<String> = None;
        let mut attempts_used = 0;

        info!(
            max_attempts = max_attempts,
            articles = articles.len(),
            snapshot_size = snapshot.len(),
            skip_verification = self.config.skip_verification,
            "Retry controller: starting"
        );

        for index in 0..max_attempts {
            attempts_used = index + 1;

            // === GENERATING ===
            trace.push(format!(
                "{}: attempt {}/{}",
                AttemptState::Generating,
                index + 1,
                max_attempts
            ));

            let generated = self
                .provider
                .generate_with_feedback(template, snapshot, articles, model_hint, feedback.as_deref())
                .await;

            let (report_text, usage) = match generated {
                Ok(output) => output,
                Err(e) => {
                    let reasons = match e {
                        PipelineError::AllProvidersFailed { failures } => failures,
                        other => vec![other.to_string()],
                    };
                    warn!(
                        attempt = index + 1,
                        failures = ?reasons,
                        "Generation failed on every candidate"
                    );
                    trace.push(format!(
                        "{}: attempt {} failed at generation",
                        AttemptState::Exhausted,
                        index + 1
                    ));
                    generation_failures.extend(
                        reasons
                            .into_iter()
                            .map(|r| format!("attempt {}: {}", index + 1, r)),
                    );
                    continue;
                }
            };

            if self.config.skip_verification {
                trace.push("SKIPPED: verification disabled, returning report".to_string());
                info!(model = %usage.model, "Verification skipped - returning first report");

                let attempt = GenerationAttempt {
                    index,
                    report_text,
                    usage,
                    quality: QualityResult::unverified(),
                    verified_claims: Vec::new(),
                };
                return Ok(ControllerOutcome {
                    final_attempt: attempt.clone(),
                    accepted: false,
                    attempts_used,
                    terminal_state: TerminalState::Skipped,
                    attempts: vec![attempt],
                    generation_failures,
                    trace,
                });
            }

            // === VERIFYING ===
            let claims = self.extractor.extract(&report_text);
            let verified_claims = self.verifier.verify(&claims, snapshot);
            debug!(
                attempt = index + 1,
                extractor = self.extractor.name(),
                claims = claims.len(),
                "Claims extracted and verified"
            );
            trace.push(format!(
                "{}: {} claim(s) extracted",
                AttemptState::Verifying,
                claims.len()
            ));

            // === SCORING ===
            let quality = self.scorer.score(&report_text, &verified_claims, snapshot);
            trace.push(format!(
                "{}: score {:.2} ({} verified, {} contradicted, {} unmatched)",
                AttemptState::Scoring,
                quality.score,
                quality.claim_stats.verified,
                quality.claim_stats.contradicted,
                quality.claim_stats.unmatched
            ));

            let attempt = GenerationAttempt {
                index,
                report_text,
                usage,
                quality,
                verified_claims,
            };

            if attempt.quality.passed {
                trace.push(format!(
                    "{}: attempt {} passed",
                    AttemptState::Accepted,
                    index + 1
                ));
                info!(
                    attempt = index + 1,
                    score = attempt.quality.score,
                    model = %attempt.usage.model,
                    "Report accepted"
                );

                attempts.push(attempt.clone());
                return Ok(ControllerOutcome {
                    final_attempt: attempt,
                    accepted: true,
                    attempts_used,
                    terminal_state: TerminalState::Accepted,
                    attempts,
                    generation_failures,
                    trace,
                });
            }

            warn!(
                attempt = index + 1,
                score = attempt.quality.score,
                issues = ?attempt.quality.issues,
                "Report below quality gate"
            );

            feedback = if self.config.retry_feedback {
                Some(retry_feedback(&attempt.quality))
            } else {
                None
            };
            attempts.push(attempt);

            if index + 1 < max_attempts {
                trace.push(format!(
                    "{}: {} attempt(s) left",
                    AttemptState::Retrying,
                    max_attempts - index - 1
                ));
            }
        }

        // === EXHAUSTED ===
        let Some(best) = best_attempt(&attempts).cloned() else {
            return Err(PipelineError::AllProvidersFailed {
                failures: generation_failures,
            });
        };

        trace.push(format!(
            "{}: returning attempt {} (score {:.2}) as best effort",
            AttemptState::Exhausted,
            best.index + 1,
            best.quality.score
        ));
        info!(
            attempts_used = attempts_used,
            best_attempt = best.index + 1,
            score = best.quality.score,
            "Retries exhausted - returning best-effort report"
        );

        Ok(ControllerOutcome {
            final_attempt: best,
            accepted: false,
            attempts_used,
            terminal_state: TerminalState::Exhausted,
            attempts,
            generation_failures,
            trace,
        })
    }
}

/// Highest score wins; the earliest attempt wins a tie.
pub fn best_attempt(attempts: &[GenerationAttempt]) -> Option<&GenerationAttempt> {
    attempts.iter().fold(None, |best: Option<&GenerationAttempt>, a| match best {
        Some(b) if b.quality.score >= a.quality.score => Some(b),
        _ => Some(a),
    })
}

/// Improvement notes for the next attempt, one issue per line.
pub fn retry_feedback(quality: &QualityResult) -> String {
    let mut out = format!("上一版本得分 {:.1}。\n", quality.score);
    for issue in &quality.issues {
        out.push_str("- ");
        out.push_str(issue);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierConfig;
    use crate::models::{ClaimStats, Claim, UsageMetadata, VerifiedClaim};
    use crate::provider::{ModelCandidate, PromptBuilder, ScriptedBackend, DEFAULT_REPORT_TEMPLATE};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct NoClaims;

    impl ClaimExtractor for NoClaims {
        fn name(&self) -> &str {
            "none"
        }

        fn extract(&self, _report_text: &str) -> Vec<Claim> {
            Vec::new()
        }
    }

    /// Reads the score from a `SCORE:<n>` line in the report.
    struct ScoreFromText {
        min_score: f64,
    }

    impl ReportScorer for ScoreFromText {
        fn score_at(
            &self,
            report_text: &str,
            _claims: &[VerifiedClaim],
            _snapshot: &ReferenceSnapshot,
            _now: DateTime<Utc>,
        ) -> QualityResult {
            let score = report_text
                .lines()
                .find_map(|l| l.strip_prefix("SCORE:"))
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            QualityResult {
                score,
                passed: score >= self.min_score,
                dimension_scores: BTreeMap::new(),
                claim_stats: ClaimStats::default(),
                issues: vec![format!("score {} too low", score)],
                score_cap: None,
                unverified: false,
            }
        }
    }

    fn controller(backend: Arc<ScriptedBackend>, config: ControllerConfig) -> RetryController {
        let provider = ModelProvider::new(
            vec![ModelCandidate::new(backend, "model-a")],
            PromptBuilder::default(),
            Duration::from_secs(1),
        );
        RetryController::new(
            config,
            Arc::new(provider),
            Arc::new(NoClaims),
            ClaimVerifier::new(VerifierConfig::default()),
            Arc::new(ScoreFromText { min_score: 80.0 }),
        )
    }

    fn snapshot() -> ReferenceSnapshot {
        ReferenceSnapshot::empty(Utc::now())
    }

    fn attempt(index: u32, score: f64) -> GenerationAttempt {
        let mut quality = QualityResult::unverified();
        quality.score = score;
        GenerationAttempt {
            index,
            report_text: String::new(),
            usage: UsageMetadata::default(),
            quality,
            verified_claims: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_accepts_on_second_attempt() {
        let backend = Arc::new(
            ScriptedBackend::new("scripted")
                .push_text("SCORE:65")
                .push_text("SCORE:85"),
        );
        let controller = controller(backend.clone(), ControllerConfig::default());

        let outcome = controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.terminal_state, TerminalState::Accepted);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(outcome.final_attempt.quality.score, 85.0);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_returns_best_attempt() {
        let backend = Arc::new(
            ScriptedBackend::new("scripted")
                .push_text("SCORE:60")
                .push_text("SCORE:72")
                .push_text("SCORE:55"),
        );
        let controller = controller(backend.clone(), ControllerConfig::default());

        let outcome = controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal_state, TerminalState::Exhausted);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(outcome.final_attempt.index, 1);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_prompt_carries_feedback() {
        let backend = Arc::new(
            ScriptedBackend::new("scripted")
                .push_text("SCORE:40")
                .push_text("SCORE:90"),
        );
        let controller = controller(backend.clone(), ControllerConfig::default());

        controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap();

        let user = backend.last_user_prompt().unwrap();
        assert!(user.contains("上一版本的问题"));
        assert!(user.contains("score 40 too low"));
    }

    #[tokio::test]
    async fn test_failed_generation_counts_as_attempt() {
        let backend = Arc::new(
            ScriptedBackend::new("scripted")
                .push_error("503")
                .push_text("SCORE:90"),
        );
        let controller = controller(backend, ControllerConfig::default());

        let outcome = controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(outcome.final_attempt.index, 1);
        assert_eq!(outcome.generation_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_every_generation_failing_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new("scripted"));
        let config = ControllerConfig {
            max_retries: 2,
            ..ControllerConfig::default()
        };
        let controller = controller(backend.clone(), config);

        let err = controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap_err();

        match err {
            PipelineError::AllProvidersFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_verification_single_pass() {
        let backend = Arc::new(
            ScriptedBackend::new("scripted")
                .push_text("SCORE:10")
                .push_text("SCORE:95"),
        );
        let config = ControllerConfig {
            skip_verification: true,
            ..ControllerConfig::default()
        };
        let controller = controller(backend.clone(), config);

        let outcome = controller
            .run(DEFAULT_REPORT_TEMPLATE, &snapshot(), &[], None)
            .await
            .unwrap();

        assert_eq!(outcome.terminal_state, TerminalState::Skipped);
        assert_eq!(outcome.attempts_used, 1);
        assert!(outcome.final_attempt.quality.unverified);
        assert!(outcome.final_attempt.verified_claims.is_empty());
        assert_eq!(backend.calls().len(), 1);
    }

    #[test]
    fn test_best_attempt_tie_keeps_earliest() {
        let attempts = vec![attempt(0, 60.0), attempt(1, 60.0)];
        assert_eq!(best_attempt(&attempts).unwrap().index, 0);

        let attempts = vec![attempt(0, 50.0), attempt(1, 70.0), attempt(2, 65.0)];
        assert_eq!(best_attempt(&attempts).unwrap().index, 1);

        assert!(best_attempt(&[]).is_none());
    }

    #[test]
    fn test_retry_feedback_lists_issues() {
        let mut quality = QualityResult::unverified();
        quality.issues = vec!["missing section: risks".to_string()];
        let feedback = retry_feedback(&quality);
        assert!(feedback.contains("- missing section: risks"));
    }
}
