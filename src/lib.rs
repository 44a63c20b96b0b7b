//! Market Report Verifier
//!
//! A quality-gated generation pipeline for daily market reports that:
//! - Builds a point-in-time reference snapshot of quotes mentioned in the news
//! - Generates the report with a prioritized list of candidate models
//! - Extracts price/percentage/direction claims from the generated text
//! - Verifies each claim against the snapshot under configurable tolerances
//! - Scores the report and retries until it passes or attempts run out
//! - Annotates every report with its own verification summary
//!
//! UNIFIED LOOP:
//! ARTICLES → SNAPSHOT → GENERATE → EXTRACT → VERIFY → SCORE → ACCEPT | RETRY | EXHAUST

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod extraction;
pub mod market;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod quality;
pub mod store;
pub mod verification;

pub use error::{PipelineError, Result};

// Re-export common types
pub use config::PipelineConfig;
pub use models::*;
pub use pipeline::{ReportPipeline, RunRequest};
