//! Sina Finance quote feed (`hq.sinajs.cn`)
//!
//! Response lines look like `var hq_str_sh601899="紫金矿业,15.23,15.12,...";`
//! and are GBK encoded.

use super::{InstrumentRef, ReferenceDataSource};
use crate::error::PipelineError;
use crate::models::{InstrumentClass, Quote};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

lazy_static! {
    static ref HQ_LINE_RE: Regex = Regex::new(r#"var hq_str_([A-Za-z0-9_]+)="([^"]*)""#).unwrap();
}

const DEFAULT_BASE_URL: &str = "https://hq.sinajs.cn/list=";
const REFERER: &str = "https://finance.sina.com.cn";

/// Exchange timestamps are Beijing time.
const BEIJING_OFFSET_SECS: i32 = 8 * 3600;

pub struct SinaQuoteSource {
    client: Client,
    base_url: String,
}

impl SinaQuoteSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ReferenceDataSource for SinaQuoteSource {
    fn name(&self) -> &str {
        "sina"
    }

    async fn lookup(&self, instruments: &[InstrumentRef]) -> Result<HashMap<String, Quote>> {
        let requested: HashMap<String, &InstrumentRef> = instruments
            .iter()
            .filter_map(|i| sina_code(i).map(|code| (code, i)))
            .collect();

        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let mut codes: Vec<&str> = requested.keys().map(String::as_str).collect();
        codes.sort_unstable();
        let url = format!("{}{}", self.base_url, codes.join(","));

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::REFERER, REFERER)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PipelineError::ReferenceData(format!(
                "sina returned HTTP {}",
                response.status()
            )));
        }

        let body = response.text_with_charset("gbk").await?;
        let quotes = parse_quotes(&body, &requested, Utc::now());

        info!(requested = requested.len(), received = quotes.len(), "Sina quotes fetched");
        Ok(quotes)
    }
}

/// Feed symbol for an instrument key, if the feed carries it.
pub fn sina_code(instrument: &InstrumentRef) -> Option<String> {
    let key = instrument.key.as_str();
    match instrument.class {
        InstrumentClass::Equity => {
            let is_a_share = (key.starts_with("SH") || key.starts_with("SZ"))
                && key.len() == 8
                && key[2..].chars().all(|c| c.is_ascii_digit());
            if is_a_share {
                Some(key.to_ascii_lowercase())
            } else if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphabetic()) {
                Some(format!("gb_{}", key.to_ascii_lowercase()))
            } else {
                None
            }
        }
        InstrumentClass::Commodity => match key {
            "XAU" => Some("hf_GC".to_string()),
            "XAG" => Some("hf_SI".to_string()),
            _ => None,
        },
        InstrumentClass::Fx => {
            let (base, quote) = key.split_once('/')?;
            Some(format!(
                "fx_s{}{}",
                base.to_ascii_lowercase(),
                quote.to_ascii_lowercase()
            ))
        }
    }
}

/// Parse a feed body into quotes keyed by instrument key. Lines that are
/// empty, unknown or malformed are skipped.
pub fn parse_quotes(
    body: &str,
    requested: &HashMap<String, &InstrumentRef>,
    now: DateTime<Utc>,
) -> HashMap<String, Quote> {
    let mut quotes = HashMap::new();

    for caps in HQ_LINE_RE.captures_iter(body) {
        let code = &caps[1];
        let Some(instrument) = requested.get(code) else {
            continue;
        };
        let fields: Vec<&str> = caps[2].split(',').collect();

        let quote = if code.starts_with("gb_") {
            parse_us_stock(&fields, now)
        } else if code.starts_with("hf_") {
            parse_future(&fields, now)
        } else if code.starts_with("fx_") {
            parse_fx(&fields, now)
        } else {
            parse_a_share(&fields, now)
        };

        match quote {
            Some(quote) => {
                quotes.insert(instrument.key.clone(), quote);
            }
            None => debug!(code = code, "Unparseable or empty quote line"),
        }
    }

    quotes
}

fn field(fields: &[&str], idx: usize) -> Option<f64> {
    fields.get(idx)?.trim().parse::<f64>().ok()
}

fn change_percent(price: f64, previous: f64) -> Option<f64> {
    if previous > 0.0 {
        Some((price - previous) / previous * 100.0)
    } else {
        None
    }
}

fn beijing_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(BEIJING_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// name, open, prev close, price, high, low, ..., date (30), time (31)
fn parse_a_share(fields: &[&str], now: DateTime<Utc>) -> Option<Quote> {
    if fields.len() < 32 {
        return None;
    }
    let previous = field(fields, 2)?;
    let price = field(fields, 3)?;
    let as_of = beijing_time(&format!("{} {}", fields[30], fields[31])).unwrap_or(now);

    Some(Quote {
        name: Some(fields[0].to_string()).filter(|n| !n.is_empty()),
        price,
        change_percent: change_percent(price, previous),
        currency: "CNY".to_string(),
        as_of,
    })
}

/// name, price, change %, timestamp, ...
fn parse_us_stock(fields: &[&str], now: DateTime<Utc>) -> Option<Quote> {
    if fields.len() < 4 {
        return None;
    }
    Some(Quote {
        name: Some(fields[0].to_string()).filter(|n| !n.is_empty()),
        price: field(fields, 1)?,
        change_percent: field(fields, 2),
        currency: "USD".to_string(),
        as_of: beijing_time(fields[3]).unwrap_or(now),
    })
}

/// Futures: price at 1, previous settlement at 2.
fn parse_future(fields: &[&str], now: DateTime<Utc>) -> Option<Quote> {
    let price = field(fields, 1)?;
    let previous = field(fields, 2).unwrap_or(0.0);
    Some(Quote {
        name: None,
        price,
        change_percent: change_percent(price, previous),
        currency: "USD".to_string(),
        as_of: now,
    })
}

/// FX: rate at 1.
fn parse_fx(fields: &[&str], now: DateTime<Utc>) -> Option<Quote> {
    Some(Quote {
        name: None,
        price: field(fields, 1)?,
        change_percent: None,
        currency: "CNY".to_string(),
        as_of: now,
    })
}
