//! Claim verification against the reference snapshot
//!
//! Deterministic: no network, no randomness, no state carried between
//! claims. Each claim resolves to a snapshot entry (exact key, then fuzzy
//! name match) and is then run through independent field checks.

use crate::config::VerifierConfig;
use crate::models::{
    normalize_key, Claim, ClaimStatus, Direction, Quote, ReferenceSnapshot, SnapshotEntry,
    VerifiedClaim,
};
use tracing::debug;

/// One field comparison between a claim and a reference quote.
pub trait ClaimCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the claim or the quote lacks the field this check needs.
    fn check(&self, claim: &Claim, quote: &Quote, config: &VerifierConfig) -> Option<CheckOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reference_value: f64,
    pub delta: Option<f64>,
    pub relative_delta: Option<f64>,
    pub details: String,
}

pub struct ClaimVerifier {
    config: VerifierConfig,
    checks: Vec<Box<dyn ClaimCheck>>,
}

impl ClaimVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            checks: vec![
                Box::new(PriceCheck),
                Box::new(PercentCheck),
                Box::new(DirectionCheck),
            ],
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Label every claim. Output order follows input order; each label
    /// depends only on its own claim and the snapshot.
    pub fn verify(&self, claims: &[Claim], snapshot: &ReferenceSnapshot) -> Vec<VerifiedClaim> {
        let verified: Vec<VerifiedClaim> = claims
            .iter()
            .map(|claim| self.verify_claim(claim, snapshot))
            .collect();

        debug!(claims = verified.len(), snapshot = snapshot.len(), "Claims verified");
        verified
    }

    pub fn verify_claim(&self, claim: &Claim, snapshot: &ReferenceSnapshot) -> VerifiedClaim {
        let Some(entry) = self.resolve(claim, snapshot) else {
            return unmatched(
                claim,
                None,
                format!("no reference data for {}", claim.subject_key_guess),
            );
        };

        let outcomes: Vec<(&'static str, CheckOutcome)> = self
            .checks
            .iter()
            .filter_map(|check| {
                let outcome = check.check(claim, entry.quote, &self.config)?;
                debug!(check = check.name(), key = %entry.key, passed = outcome.passed, "Claim check");
                Some((check.name(), outcome))
            })
            .collect();

        if outcomes.is_empty() {
            return unmatched(
                claim,
                Some(entry.key.to_string()),
                format!("{} has no reference field for this claim", entry.key),
            );
        }

        // A verifiable part that fails outweighs any that pass; parts the
        // snapshot cannot check never downgrade the claim.
        let failed = outcomes.iter().find(|(_, o)| !o.passed);
        let status = if failed.is_some() {
            ClaimStatus::Contradicted
        } else {
            ClaimStatus::Verified
        };
        let (_, primary) = failed.unwrap_or(&outcomes[0]);

        let evidence = outcomes
            .iter()
            .map(|(name, o)| {
                let mark = if o.passed { "ok" } else { "FAILED" };
                format!("[{} {}] {}", name, mark, o.details)
            })
            .collect::<Vec<_>>()
            .join("; ");

        VerifiedClaim {
            claim: claim.clone(),
            status,
            resolved_key: Some(entry.key.to_string()),
            reference_value: Some(primary.reference_value),
            delta: primary.delta,
            relative_delta: primary.relative_delta,
            evidence: format!("{}: {}", entry.key, evidence),
        }
    }

    /// Exact normalized key first, then the most similar key or quote name
    /// above the fuzzy threshold. Ties keep the earlier entry.
    pub fn resolve<'a>(
        &self,
        claim: &Claim,
        snapshot: &'a ReferenceSnapshot,
    ) -> Option<SnapshotEntry<'a>> {
        if let Some(entry) = snapshot.get(&claim.subject_key_guess) {
            return Some(entry);
        }

        let guesses = [
            normalize_key(&claim.subject_key_guess),
            normalize_key(&claim.subject_text),
        ];

        let mut best: Option<(f64, SnapshotEntry<'a>)> = None;
        for entry in snapshot.entries() {
            let name = entry.quote.name.as_deref().map(normalize_key);
            let score = guesses
                .iter()
                .filter(|g| !g.is_empty())
                .flat_map(|g| {
                    std::iter::once(similarity(g, entry.key))
                        .chain(name.as_deref().map(|n| similarity(g, n)))
                })
                .fold(0.0_f64, f64::max);

            if score >= self.config.fuzzy_threshold
                && best.as_ref().map_or(true, |(top, _)| score > *top)
            {
                best = Some((score, entry));
            }
        }

        best.map(|(_, entry)| entry)
    }
}

impl Default for ClaimVerifier {
    fn default() -> Self {
        Self::new(VerifierConfig::default())
    }
}

fn unmatched(claim: &Claim, resolved_key: Option<String>, evidence: String) -> VerifiedClaim {
    VerifiedClaim {
        claim: claim.clone(),
        status: ClaimStatus::Unmatched,
        resolved_key,
        reference_value: None,
        delta: None,
        relative_delta: None,
        evidence,
    }
}

//
// ================= Field Checks =================
//

/// Price level within a relative band of the reference price.
pub struct PriceCheck;

impl ClaimCheck for PriceCheck {
    fn name(&self) -> &'static str {
        "price"
    }

    fn check(&self, claim: &Claim, quote: &Quote, config: &VerifierConfig) -> Option<CheckOutcome> {
        let asserted = claim.asserted_price()?;
        let reference = quote.price;
        let delta = asserted - reference;
        let relative = delta / reference;
        let passed = relative.abs() * 100.0 <= config.price_tolerance_pct + f64::EPSILON;

        Some(CheckOutcome {
            passed,
            reference_value: reference,
            delta: Some(delta),
            relative_delta: Some(relative),
            details: format!(
                "price {:.2} {} vs asserted {:.2} ({:+.2}%, tolerance ±{}%)",
                reference,
                quote.currency,
                asserted,
                relative * 100.0,
                config.price_tolerance_pct
            ),
        })
    }
}

/// Signed percentage change within an absolute band, in percentage points.
pub struct PercentCheck;

impl ClaimCheck for PercentCheck {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn check(&self, claim: &Claim, quote: &Quote, config: &VerifierConfig) -> Option<CheckOutcome> {
        let asserted = claim.asserted_percent()?;
        let reference = quote.change_percent?;
        let delta = asserted - reference;
        let passed = delta.abs() <= config.percent_tolerance_points + f64::EPSILON;

        Some(CheckOutcome {
            passed,
            reference_value: reference,
            delta: Some(delta),
            relative_delta: None,
            details: format!(
                "change {:+.2}% vs asserted {:+.2}% (tolerance ±{}pp)",
                reference, asserted, config.percent_tolerance_points
            ),
        })
    }
}

/// Sign of the reference change. Skipped when a percentage is asserted,
/// since the percentage check already covers the sign.
pub struct DirectionCheck;

impl ClaimCheck for DirectionCheck {
    fn name(&self) -> &'static str {
        "direction"
    }

    fn check(&self, claim: &Claim, quote: &Quote, config: &VerifierConfig) -> Option<CheckOutcome> {
        if claim.direction == Direction::None || claim.asserted_percent().is_some() {
            return None;
        }
        let change = quote.change_percent?;
        let actual = direction_of_change(change, config.flat_band_points);

        Some(CheckOutcome {
            passed: actual == claim.direction,
            reference_value: change,
            delta: None,
            relative_delta: None,
            details: format!(
                "moved {} ({:+.2}%), asserted {}",
                actual, change, claim.direction
            ),
        })
    }
}

pub fn direction_of_change(change_percent: f64, flat_band: f64) -> Direction {
    if change_percent.abs() <= flat_band {
        Direction::Flat
    } else if change_percent > 0.0 {
        Direction::Up
    } else {
        Direction::Down
    }
}

//
// ================= Fuzzy Matching =================
//

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity in 0..=1, `1 - distance / longer length`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

//
// ================= Tests =================
//
