//! Core data models for the report verification pipeline

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentClass {
    Equity,
    Commodity,
    Fx,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
    None,
}

/// What the asserted value of a claim measures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClaimUnit {
    Price,
    Percent,
    /// Purely directional claim, no magnitude.
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Verified,
    Contradicted,
    Unmatched,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Accuracy,
    Timeliness,
    Structure,
    Attribution,
    Compliance,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Accuracy,
        Dimension::Timeliness,
        Dimension::Structure,
        Dimension::Attribution,
        Dimension::Compliance,
    ];
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Accepted,
    Exhausted,
    /// Verification bypassed by configuration.
    Skipped,
}

//
// ================= Articles =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub body: Option<String>,
    pub source: String,
    #[serde(default)]
    pub link: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl Article {
    /// Title, summary and body joined for subject recognition.
    pub fn searchable_text(&self) -> String {
        let mut text = String::with_capacity(
            self.title.len() + self.summary.len() + self.body.as_ref().map_or(0, |b| b.len()) + 2,
        );
        text.push_str(&self.title);
        text.push('\n');
        text.push_str(&self.summary);
        if let Some(body) = &self.body {
            text.push('\n');
            text.push_str(body);
        }
        text
    }

    /// Text used for prompt excerpts: the summary, falling back to the body.
    pub fn excerpt_text(&self) -> &str {
        if !self.summary.trim().is_empty() {
            &self.summary
        } else {
            self.body.as_deref().unwrap_or("")
        }
    }
}

//
// ================= Reference Snapshot =================
//

/// Normalize an instrument key: trimmed, upper-case, no whitespace.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    #[serde(default)]
    pub name: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub change_percent: Option<f64>,
    pub currency: String,
    pub as_of: DateTime<Utc>,
}

impl Quote {
    /// A quote is usable as ground truth only with a finite, positive price.
    pub fn is_usable(&self) -> bool {
        self.price.is_finite()
            && self.price > 0.0
            && self.change_percent.map_or(true, f64::is_finite)
    }
}

/// Point-in-time ground truth. A missing key means "no data", never zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferenceSnapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub instruments: BTreeMap<String, Quote>,
    #[serde(default)]
    pub commodities: BTreeMap<String, Quote>,
    #[serde(default)]
    pub fx_pairs: BTreeMap<String, Quote>,
}

/// Borrowed view of one snapshot entry.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotEntry<'a> {
    pub class: InstrumentClass,
    pub key: &'a str,
    pub quote: &'a Quote,
}

impl ReferenceSnapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            instruments: BTreeMap::new(),
            commodities: BTreeMap::new(),
            fx_pairs: BTreeMap::new(),
        }
    }

    /// Insert a quote under its normalized key. Unusable quotes are dropped
    /// and `false` is returned.
    pub fn insert(&mut self, class: InstrumentClass, key: &str, quote: Quote) -> bool {
        if !quote.is_usable() {
            return false;
        }
        let key = normalize_key(key);
        match class {
            InstrumentClass::Equity => self.instruments.insert(key, quote),
            InstrumentClass::Commodity => self.commodities.insert(key, quote),
            InstrumentClass::Fx => self.fx_pairs.insert(key, quote),
        };
        true
    }

    pub fn with_quote(mut self, class: InstrumentClass, key: &str, quote: Quote) -> Self {
        self.insert(class, key, quote);
        self
    }

    pub fn get(&self, key: &str) -> Option<SnapshotEntry<'_>> {
        let key = normalize_key(key);
        self.entries().find(|entry| entry.key == key)
    }

    /// Entries in deterministic order: equities, commodities, fx; by key.
    pub fn entries(&self) -> impl Iterator<Item = SnapshotEntry<'_>> {
        self.instruments
            .iter()
            .map(|(key, quote)| (InstrumentClass::Equity, key, quote))
            .chain(
                self.commodities
                    .iter()
                    .map(|(key, quote)| (InstrumentClass::Commodity, key, quote)),
            )
            .chain(
                self.fx_pairs
                    .iter()
                    .map(|(key, quote)| (InstrumentClass::Fx, key, quote)),
            )
            .map(|(class, key, quote)| SnapshotEntry {
                class,
                key: key.as_str(),
                quote,
            })
    }

    pub fn len(&self) -> usize {
        self.instruments.len() + self.commodities.len() + self.fx_pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.taken_at
    }
}

//
// ================= Claims =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSpan {
    /// Byte offsets into the report text.
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub id: Uuid,
    pub subject_text: String,
    pub subject_key_guess: String,
    pub asserted_value: Option<f64>,
    pub unit: ClaimUnit,
    pub direction: Direction,
    /// Percentage stated alongside a price ("15.23元，涨幅2.5%").
    #[serde(default)]
    pub companion_percent: Option<f64>,
    pub span: SourceSpan,
}

impl Claim {
    /// Signed percentage asserted by this claim, if any.
    pub fn asserted_percent(&self) -> Option<f64> {
        match self.unit {
            ClaimUnit::Percent => self.asserted_value,
            _ => self.companion_percent,
        }
    }

    pub fn asserted_price(&self) -> Option<f64> {
        match self.unit {
            ClaimUnit::Price => self.asserted_value,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiedClaim {
    #[serde(flatten)]
    pub claim: Claim,
    pub status: ClaimStatus,
    pub resolved_key: Option<String>,
    pub reference_value: Option<f64>,
    /// Asserted minus reference, in the claim's unit.
    pub delta: Option<f64>,
    /// Relative deviation for price parts (0.026 = 2.6%).
    pub relative_delta: Option<f64>,
    pub evidence: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimStats {
    pub total: usize,
    pub verified: usize,
    pub contradicted: usize,
    pub unmatched: usize,
}

impl ClaimStats {
    pub fn from_claims(claims: &[VerifiedClaim]) -> Self {
        claims.iter().fold(ClaimStats::default(), |mut stats, c| {
            stats.total += 1;
            match c.status {
                ClaimStatus::Verified => stats.verified += 1,
                ClaimStatus::Contradicted => stats.contradicted += 1,
                ClaimStatus::Unmatched => stats.unmatched += 1,
            }
            stats
        })
    }

    /// Claims that had a reference entry to compare against.
    pub fn matched(&self) -> usize {
        self.verified + self.contradicted
    }

    pub fn unmatched_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.unmatched as f64 / self.total as f64
        }
    }
}

//
// ================= Quality =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityResult {
    pub score: f64,
    pub passed: bool,
    pub dimension_scores: BTreeMap<Dimension, f64>,
    pub claim_stats: ClaimStats,
    #[serde(default)]
    pub issues: Vec<String>,
    /// Upper bound applied by the coverage or staleness caps.
    #[serde(default)]
    pub score_cap: Option<f64>,
    /// Sentinel: verification was skipped, the score carries no meaning.
    #[serde(default)]
    pub unverified: bool,
}

impl QualityResult {
    pub fn unverified() -> Self {
        Self {
            score: 0.0,
            passed: false,
            dimension_scores: BTreeMap::new(),
            claim_stats: ClaimStats::default(),
            issues: vec!["verification skipped".to_string()],
            score_cap: None,
            unverified: true,
        }
    }

    pub fn dimension(&self, dimension: Dimension) -> Option<f64> {
        self.dimension_scores.get(&dimension).copied()
    }
}

//
// ================= Generation =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageMetadata {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationAttempt {
    pub index: u32,
    pub report_text: String,
    pub usage: UsageMetadata,
    pub quality: QualityResult,
    pub verified_claims: Vec<VerifiedClaim>,
}

//
// ================= Report Output =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMetadata {
    pub run_id: Uuid,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub articles_used: usize,
    pub terminal_state: TerminalState,
    pub accepted: bool,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub score: f64,
    pub min_score: f64,
    pub claim_stats: ClaimStats,
    pub usage: UsageMetadata,
    pub snapshot_taken_at: DateTime<Utc>,
    pub snapshot_size: usize,
    pub report_digest: String,
    pub generated_at: DateTime<Utc>,
}

/// The triple handed to a report sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportEnvelope {
    pub report_text: String,
    pub annotation_block: String,
    pub metadata: ReportMetadata,
}

impl fmt::Display for InstrumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstrumentClass::Equity => "equity",
            InstrumentClass::Commodity => "commodity",
            InstrumentClass::Fx => "fx",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Flat => "flat",
            Direction::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Verified => "verified",
            ClaimStatus::Contradicted => "contradicted",
            ClaimStatus::Unmatched => "unmatched",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dimension::Accuracy => "Accuracy",
            Dimension::Timeliness => "Timeliness",
            Dimension::Structure => "Structure",
            Dimension::Attribution => "Attribution",
            Dimension::Compliance => "Compliance",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::Accepted => "accepted",
            TerminalState::Exhausted => "exhausted",
            TerminalState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}
