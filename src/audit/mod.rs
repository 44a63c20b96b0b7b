//! Report audit trail
//!
//! Annotation block appended to every report, report digests, and the
//! report sink seam with an in-memory archive.

use crate::error::PipelineError;
use crate::models::{
    ClaimStatus, Dimension, GenerationAttempt, ReportEnvelope, ReportMetadata, TerminalState,
};
use crate::Result;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const MAX_ANNOTATED_CONTRADICTIONS: usize = 10;

pub const UNVERIFIED_BANNER: &str = "> ⚠️ **质量警告 / Quality warning:** 本报告未通过自动事实核查，\
仅为尽力生成的版本，请结合文末核查说明审慎使用。This report did NOT pass automated verification.";

pub const SKIPPED_BANNER: &str = "> ⚠️ **未核查 / Unverified:** 本报告跳过了自动事实核查。\
Verification was skipped for this report.";

// ===== Annotation =====

/// Human-readable verification summary for the final attempt.
pub fn render_annotation(metadata: &ReportMetadata, attempt: &GenerationAttempt) -> String {
    let quality = &attempt.quality;
    let stats = &metadata.claim_stats;
    let mut out = String::new();

    out.push_str("---\n\n## 核查说明 / Verification\n\n");

    let status = match metadata.terminal_state {
        TerminalState::Accepted => format!(
            "Accepted on verification (attempt {} of {})",
            attempt.index + 1,
            metadata.max_attempts
        ),
        TerminalState::Exhausted => format!(
            "NOT VERIFIED: best-effort report after {} attempt(s); quality gate not passed",
            metadata.attempts_used
        ),
        TerminalState::Skipped => {
            "Verification skipped: claims were not checked against reference data".to_string()
        }
    };
    let _ = writeln!(out, "- **Status:** {}", status);

    if metadata.terminal_state == TerminalState::Skipped {
        out.push_str("- **Quality score:** n/a\n");
    } else {
        let _ = writeln!(
            out,
            "- **Quality score:** {:.2} / 100 (minimum {:.0})",
            metadata.score, metadata.min_score
        );
        let _ = writeln!(
            out,
            "- **Claims:** {} total, {} verified, {} contradicted, {} unmatched",
            stats.total, stats.verified, stats.contradicted, stats.unmatched
        );
    }

    let _ = writeln!(
        out,
        "- **Reference data:** {} quote(s) as of {}",
        metadata.snapshot_size,
        metadata.snapshot_taken_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(
        out,
        "- **Model:** {}/{}",
        metadata.usage.provider, metadata.usage.model
    );

    if !quality.dimension_scores.is_empty() {
        out.push_str("\n| Dimension | Score |\n|---|---|\n");
        for dimension in Dimension::ALL {
            if let Some(value) = quality.dimension(dimension) {
                let _ = writeln!(out, "| {} | {:.1} |", dimension, value);
            }
        }
        if let Some(cap) = quality.score_cap {
            let _ = writeln!(out, "\nScore capped at {:.1}.", cap);
        }
    }

    let contradicted: Vec<_> = attempt
        .verified_claims
        .iter()
        .filter(|c| c.status == ClaimStatus::Contradicted)
        .collect();
    if !contradicted.is_empty() {
        out.push_str("\n**Contradicted claims**\n\n");
        for claim in contradicted.iter().take(MAX_ANNOTATED_CONTRADICTIONS) {
            let _ = writeln!(out, "- \"{}\": {}", claim.claim.span.text, claim.evidence);
        }
        if contradicted.len() > MAX_ANNOTATED_CONTRADICTIONS {
            let _ = writeln!(
                out,
                "- … {} more",
                contradicted.len() - MAX_ANNOTATED_CONTRADICTIONS
            );
        }
    }

    if !quality.issues.is_empty() && metadata.terminal_state != TerminalState::Skipped {
        out.push_str("\n**Issues**\n\n");
        for issue in &quality.issues {
            let _ = writeln!(out, "- {}", issue);
        }
    }

    let _ = writeln!(
        out,
        "\nRun {} · digest {}",
        metadata.run_id,
        short_digest(&metadata.report_digest)
    );

    out
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

impl ReportEnvelope {
    /// Banner (unless accepted), report, annotation.
    pub fn render_document(&self) -> String {
        let mut out = String::new();
        match self.metadata.terminal_state {
            TerminalState::Accepted => {}
            TerminalState::Exhausted => {
                out.push_str(UNVERIFIED_BANNER);
                out.push_str("\n\n");
            }
            TerminalState::Skipped => {
                out.push_str(SKIPPED_BANNER);
                out.push_str("\n\n");
            }
        }
        out.push_str(self.report_text.trim_end());
        out.push_str("\n\n");
        out.push_str(&self.annotation_block);
        out
    }
}

// ===== Digest =====

/// SHA-256 of the report text, hex encoded.
pub fn compute_report_digest(report_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(report_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 over the JSON form of the metadata.
/// Streams the serialization straight into the hasher.
pub fn compute_metadata_digest(metadata: &ReportMetadata) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), metadata).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ===== Sink =====

/// Receives the finished report. Persistence and placement are the sink's
/// business.
#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn emit(&self, envelope: &ReportEnvelope) -> Result<()>;
}

struct ArchivedReport {
    envelope: ReportEnvelope,
    metadata_digest: String,
}

/// In-memory report archive keyed by run id
pub struct ReportArchive {
    reports: Arc<RwLock<HashMap<Uuid, ArchivedReport>>>,
}

impl ReportArchive {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, run_id: Uuid) -> Option<ReportEnvelope> {
        let reports = self.reports.read().await;
        reports.get(&run_id).map(|r| r.envelope.clone())
    }

    /// Run ids of reports overlapping the date range, oldest first.
    pub async fn list_for_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<Uuid> {
        let reports = self.reports.read().await;

        let mut items: Vec<_> = reports
            .iter()
            .filter(|(_, r)| r.envelope.metadata.date_start <= end && r.envelope.metadata.date_end >= start)
            .map(|(id, r)| (*id, r.envelope.metadata.generated_at))
            .collect();

        items.sort_by_key(|(_, generated_at)| *generated_at);

        items.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    /// Recompute both digests and compare with the stored ones.
    pub async fn verify_integrity(&self, run_id: Uuid) -> Result<bool> {
        let reports = self.reports.read().await;

        if let Some(report) = reports.get(&run_id) {
            let envelope = &report.envelope;
            let text_ok = compute_report_digest(&envelope.report_text)
                == envelope.metadata.report_digest;
            let metadata_ok = compute_metadata_digest(&envelope.metadata) == report.metadata_digest;
            Ok(text_ok && metadata_ok)
        } else {
            Ok(false)
        }
    }

    #[cfg(test)]
    async fn tamper(&self, run_id: Uuid, report_text: &str) {
        if let Some(report) = self.reports.write().await.get_mut(&run_id) {
            report.envelope.report_text = report_text.to_string();
        }
    }
}

impl Default for ReportArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReportSink for ReportArchive {
    async fn emit(&self, envelope: &ReportEnvelope) -> Result<()> {
        let run_id = envelope.metadata.run_id;
        let mut reports = self.reports.write().await;
        if reports.contains_key(&run_id) {
            return Err(PipelineError::Sink(format!("run {} already archived", run_id)));
        }
        reports.insert(
            run_id,
            ArchivedReport {
                metadata_digest: compute_metadata_digest(&envelope.metadata),
                envelope: envelope.clone(),
            },
        );
        Ok(())
    }
}
