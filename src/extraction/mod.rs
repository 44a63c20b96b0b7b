//! Claim extraction
//!
//! Turns generated report text into discrete, checkable claims. Extractors
//! are pluggable; the pattern-based one is the default.

pub mod pattern;

pub use pattern::PatternExtractor;

use crate::models::Claim;

/// Strategy for pulling claims out of report text. Must be a pure function
/// of the text.
pub trait ClaimExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, report_text: &str) -> Vec<Claim>;
}
