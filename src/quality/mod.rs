//! Report quality scoring
//!
//! Weighted dimensions, hard per-dimension floors and score caps. Pure:
//! the only clock input is the `now` passed to `score_at`.

use crate::config::{ScoringConfig, SectionRule};
use crate::models::{
    ClaimStats, ClaimStatus, Dimension, QualityResult, ReferenceSnapshot, VerifiedClaim,
};
use crate::Result;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    static ref HEADING_RE: Regex = Regex::new(
        r"^\s*(?:#{1,6}\s*(.+?)\s*#*\s*$|\*\*(.+?)\*\*\s*[:：]?\s*$|[一二三四五六七八九十]+[、.．]\s*(.+?)\s*$)"
    )
    .unwrap();

    static ref FABRICATION_RE: Regex =
        Regex::new(r"(?i)目标价|目标涨幅|目标价位|\btarget price\b|\bprice target\b").unwrap();

    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"N/A|待定|\bTBD\b|\[使用的具体模型名称\]|\{\{MODEL\}\}").unwrap();
}

const MAX_LISTED_CONTRADICTIONS: usize = 5;

pub trait ReportScorer: Send + Sync {
    fn score_at(
        &self,
        report_text: &str,
        claims: &[VerifiedClaim],
        snapshot: &ReferenceSnapshot,
        now: DateTime<Utc>,
    ) -> QualityResult;

    fn score(
        &self,
        report_text: &str,
        claims: &[VerifiedClaim],
        snapshot: &ReferenceSnapshot,
    ) -> QualityResult {
        self.score_at(report_text, claims, snapshot, Utc::now())
    }
}

pub struct QualityScorer {
    config: ScoringConfig,
    min_score: f64,
    citation_re: Regex,
}

impl QualityScorer {
    pub fn new(config: ScoringConfig, min_score: f64) -> Result<Self> {
        let citation_re = Regex::new(&config.citation_pattern)?;
        Ok(Self {
            config,
            min_score,
            citation_re,
        })
    }

    pub fn min_score(&self) -> f64 {
        self.min_score
    }

    fn accuracy(&self, stats: &ClaimStats) -> f64 {
        let matched = stats.matched();
        if matched == 0 {
            self.config.no_claim_accuracy
        } else {
            100.0 * stats.verified as f64 / matched as f64
        }
    }

    fn timeliness(&self, snapshot: &ReferenceSnapshot, now: DateTime<Utc>) -> f64 {
        if snapshot.is_empty() {
            return 0.0;
        }
        let minutes = snapshot.age_at(now).num_minutes().max(0);
        match minutes {
            m if m <= 60 => 100.0,
            m if m <= 4 * 60 => 75.0,
            m if m <= 24 * 60 => 50.0,
            _ => 25.0,
        }
    }

    fn missing_sections<'a>(&'a self, report_text: &str) -> Vec<&'a SectionRule> {
        let headings = headings(report_text);
        self.config
            .required_sections
            .iter()
            .filter(|rule| !section_present(rule, &headings, report_text))
            .collect()
    }

    /// (sections citing a source, sections with content)
    fn attribution_counts(&self, report_text: &str) -> (usize, usize) {
        let sections = split_sections(report_text);
        let cited = sections
            .iter()
            .filter(|s| self.citation_re.is_match(s))
            .count();
        (cited, sections.len())
    }

    fn compliance(&self, report_text: &str) -> (f64, usize, bool) {
        let fabrications = FABRICATION_RE.find_iter(report_text).count();
        let placeholder = PLACEHOLDER_RE.is_match(report_text);

        let mut score = 100.0 - self.config.fabrication_penalty * fabrications as f64;
        if placeholder {
            score -= self.config.placeholder_penalty;
        }
        (score.clamp(0.0, 100.0), fabrications, placeholder)
    }
}

impl ReportScorer for QualityScorer {
    fn score_at(
        &self,
        report_text: &str,
        claims: &[VerifiedClaim],
        snapshot: &ReferenceSnapshot,
        now: DateTime<Utc>,
    ) -> QualityResult {
        let stats = ClaimStats::from_claims(claims);
        let mut issues = Vec::new();

        // accuracy
        let accuracy = self.accuracy(&stats);
        let contradicted: Vec<&VerifiedClaim> = claims
            .iter()
            .filter(|c| c.status == ClaimStatus::Contradicted)
            .collect();
        for c in contradicted.iter().take(MAX_LISTED_CONTRADICTIONS) {
            issues.push(format!(
                "contradicted claim \"{}\" ({})",
                c.claim.span.text, c.evidence
            ));
        }
        if contradicted.len() > MAX_LISTED_CONTRADICTIONS {
            issues.push(format!(
                "{} more contradicted claims",
                contradicted.len() - MAX_LISTED_CONTRADICTIONS
            ));
        }

        // timeliness
        let timeliness = self.timeliness(snapshot, now);
        if snapshot.is_empty() {
            issues.push("no reference data available".to_string());
        }

        // structure
        let missing = self.missing_sections(report_text);
        let required = self.config.required_sections.len();
        let structure = if required == 0 {
            100.0
        } else {
            100.0 * (required - missing.len()) as f64 / required as f64
        };
        for rule in &missing {
            issues.push(format!("missing section: {}", rule.name));
        }

        // attribution
        let (cited, sections) = self.attribution_counts(report_text);
        let attribution = if sections == 0 {
            0.0
        } else {
            100.0 * cited as f64 / sections as f64
        };
        if cited < sections {
            issues.push(format!(
                "{} of {} sections cite no source article",
                sections - cited,
                sections
            ));
        }

        // compliance
        let (compliance, fabrications, placeholder) = self.compliance(report_text);
        if fabrications > 0 {
            issues.push(format!(
                "fabricated target price or gain ({} occurrence(s))",
                fabrications
            ));
        }
        if placeholder {
            issues.push("placeholder text left in report".to_string());
        }

        let dimension_scores = BTreeMap::from([
            (Dimension::Accuracy, accuracy),
            (Dimension::Timeliness, timeliness),
            (Dimension::Structure, structure),
            (Dimension::Attribution, attribution),
            (Dimension::Compliance, compliance),
        ]);

        let total_weight: f64 = Dimension::ALL.iter().map(|d| self.config.weight(*d)).sum();
        let weighted = if total_weight > 0.0 {
            dimension_scores
                .iter()
                .map(|(d, v)| self.config.weight(*d) * v)
                .sum::<f64>()
                / total_weight
        } else {
            0.0
        };

        // caps
        let mut caps = Vec::new();
        if stats.unmatched > 0 {
            caps.push(100.0 - self.config.coverage_penalty * stats.unmatched_ratio());
            issues.push(format!(
                "{} of {} claims had no reference data",
                stats.unmatched, stats.total
            ));
        }
        let age_hours = snapshot.age_at(now).num_hours();
        if !snapshot.is_empty() && age_hours > self.config.stale_after_hours {
            caps.push(self.config.stale_score_cap);
            issues.push(format!("reference data is {}h old", age_hours));
        }
        let score_cap = caps.into_iter().reduce(f64::min);
        let score = score_cap
            .map_or(weighted, |cap| weighted.min(cap))
            .clamp(0.0, 100.0);
        let score = (score * 100.0).round() / 100.0;

        let mut passed = score >= self.min_score;
        for (dimension, value) in &dimension_scores {
            let floor = self.config.floor(*dimension);
            if *value < floor {
                passed = false;
                issues.push(format!(
                    "{} score {:.0} is below its floor of {:.0}",
                    dimension, value, floor
                ));
            }
        }
        if score < self.min_score {
            issues.push(format!(
                "score {:.1} is below the minimum of {:.0}",
                score, self.min_score
            ));
        }

        QualityResult {
            score,
            passed,
            dimension_scores,
            claim_stats: stats,
            issues,
            score_cap,
            unverified: false,
        }
    }
}

//
// ================= Section Detection =================
//

fn headings(report_text: &str) -> Vec<String> {
    report_text
        .lines()
        .filter_map(|line| {
            let caps = HEADING_RE.captures(line)?;
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

fn section_present(rule: &SectionRule, headings: &[String], report_text: &str) -> bool {
    rule.markers.iter().any(|marker| {
        let marker = marker.to_lowercase();
        headings.iter().any(|h| h.to_lowercase().contains(&marker))
            || report_text.lines().any(|line| {
                line.trim_start()
                    .trim_start_matches(|c: char| c == '#' || c == '*' || c.is_whitespace())
                    .to_lowercase()
                    .starts_with(&marker)
            })
    })
}

/// Report split at heading lines. Blank chunks are dropped.
fn split_sections(report_text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for line in report_text.lines() {
        if HEADING_RE.is_match(line) && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        } else if HEADING_RE.is_match(line) {
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }

    // A heading with nothing under it is not a section.
    let has_body = |s: &String| s.lines().any(|l| !l.trim().is_empty() && !HEADING_RE.is_match(l));
    if has_body(&current) {
        sections.push(current);
    }
    sections.retain(has_body);
    sections
}
