//! Reference snapshot fetching
//!
//! Recognizes the instruments a batch of articles talks about and asks a
//! market-data source for point-in-time quotes. Never fails: anything that
//! cannot be looked up is simply absent from the snapshot.

pub mod dictionary;
pub mod sina;

pub use dictionary::{InstrumentDictionary, InstrumentEntry, Mention};
pub use sina::SinaQuoteSource;

use crate::config::FetcherConfig;
use crate::models::{normalize_key, Article, InstrumentClass, Quote, ReferenceSnapshot};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentRef {
    pub key: String,
    pub class: InstrumentClass,
}

impl InstrumentRef {
    pub fn new(key: &str, class: InstrumentClass) -> Self {
        Self {
            key: normalize_key(key),
            class,
        }
    }
}

/// Point-in-time market data lookup. May return a subset of the requested keys.
#[async_trait]
pub trait ReferenceDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, instruments: &[InstrumentRef]) -> Result<HashMap<String, Quote>>;
}

/// Fixed quotes, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceSource {
    quotes: HashMap<String, Quote>,
}

impl StaticReferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(mut self, key: &str, quote: Quote) -> Self {
        self.quotes.insert(normalize_key(key), quote);
        self
    }
}

#[async_trait]
impl ReferenceDataSource for StaticReferenceSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn lookup(&self, instruments: &[InstrumentRef]) -> Result<HashMap<String, Quote>> {
        Ok(instruments
            .iter()
            .filter_map(|i| self.quotes.get(&i.key).map(|q| (i.key.clone(), q.clone())))
            .collect())
    }
}

pub struct SnapshotFetcher {
    dictionary: Arc<InstrumentDictionary>,
    source: Arc<dyn ReferenceDataSource>,
    timeout: Duration,
    batch_size: usize,
    max_subjects: usize,
}

impl SnapshotFetcher {
    pub fn new(
        dictionary: Arc<InstrumentDictionary>,
        source: Arc<dyn ReferenceDataSource>,
        config: &FetcherConfig,
    ) -> Self {
        Self {
            dictionary,
            source,
            timeout: config.timeout(),
            batch_size: config.batch_size.max(1),
            max_subjects: config.max_subjects,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Instruments mentioned across the articles, most-mentioned first.
    pub fn subjects(&self, articles: &[Article]) -> Vec<InstrumentRef> {
        let mut counts: HashMap<InstrumentRef, (usize, usize)> = HashMap::new();
        let mut order = 0usize;

        for article in articles {
            let mut seen_here = HashSet::new();
            for instrument in self.dictionary.recognize(&article.searchable_text()) {
                if !seen_here.insert(instrument.key.clone()) {
                    continue;
                }
                let next = order;
                let slot = counts.entry(instrument).or_insert_with(|| {
                    order += 1;
                    (0, next)
                });
                slot.0 += 1;
            }
        }

        let mut ranked: Vec<(InstrumentRef, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked
            .into_iter()
            .take(self.max_subjects)
            .map(|(instrument, _)| instrument)
            .collect()
    }

    /// Build the snapshot for this batch. Lookup failures and timeouts only
    /// shrink the snapshot.
    pub async fn fetch(&self, articles: &[Article]) -> ReferenceSnapshot {
        let subjects = self.subjects(articles);
        let mut snapshot = ReferenceSnapshot::empty(Utc::now());

        if subjects.is_empty() {
            debug!("No trackable instruments mentioned");
            return snapshot;
        }

        for batch in subjects.chunks(self.batch_size) {
            let quotes = match tokio::time::timeout(self.timeout, self.source.lookup(batch)).await {
                Ok(Ok(quotes)) => quotes,
                Ok(Err(e)) => {
                    warn!(source = self.source.name(), error = %e, "Reference lookup failed");
                    continue;
                }
                Err(_) => {
                    warn!(
                        source = self.source.name(),
                        timeout_secs = self.timeout.as_secs(),
                        "Reference lookup timed out"
                    );
                    continue;
                }
            };

            for instrument in batch {
                let Some(quote) = quotes.get(&instrument.key) else {
                    debug!(key = %instrument.key, "No quote available");
                    continue;
                };
                let mut quote = quote.clone();
                if quote.name.is_none() {
                    quote.name = self
                        .dictionary
                        .entry(&instrument.key)
                        .map(|e| e.name.clone());
                }
                if !snapshot.insert(instrument.class, &instrument.key, quote) {
                    debug!(key = %instrument.key, "Dropped unusable quote");
                }
            }
        }

        info!(
            requested = subjects.len(),
            resolved = snapshot.len(),
            "Reference snapshot ready"
        );

        snapshot
    }
}
