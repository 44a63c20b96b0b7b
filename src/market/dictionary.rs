//! Instrument dictionary and subject recognition
//!
//! Maps human-readable names ("紫金矿业", "Apple", "金价") and exchange codes
//! ("601899.SS", "sz000001") onto normalized instrument keys.

use super::InstrumentRef;
use crate::models::{normalize_key, InstrumentClass};
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

lazy_static! {
    /// `601899.SS`, `sh601899`, `000001.SZ`, or a bare six-digit code that
    /// is accepted only inside brackets.
    static ref CODE_RE: Regex =
        Regex::new(r"(?i)(sh|sz)?(\d{6})(?:\.(ss|sh|sz))?").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentEntry {
    pub key: String,
    pub class: InstrumentClass,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub currency: String,
}

impl InstrumentEntry {
    pub fn new(
        key: &str,
        class: InstrumentClass,
        name: &str,
        aliases: &[&str],
        currency: &str,
    ) -> Self {
        Self {
            key: normalize_key(key),
            class,
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            currency: currency.to_string(),
        }
    }
}

/// One recognized subject occurrence, byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub start: usize,
    pub end: usize,
    pub key: String,
    pub class: InstrumentClass,
    pub text: String,
}

pub struct InstrumentDictionary {
    entries: Vec<InstrumentEntry>,
    by_key: HashMap<String, usize>,
    /// (ascii-lowercased alias, entry index), longest alias first.
    aliases: Vec<(String, usize)>,
}

impl InstrumentDictionary {
    pub fn new(entries: Vec<InstrumentEntry>) -> Self {
        let entries: Vec<InstrumentEntry> = entries
            .into_iter()
            .map(|mut e| {
                e.key = normalize_key(&e.key);
                e
            })
            .collect();

        let by_key = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.key.clone(), idx))
            .collect();

        let mut seen = HashSet::new();
        let mut aliases: Vec<(String, usize)> = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            let names = std::iter::once(&entry.key)
                .chain(std::iter::once(&entry.name))
                .chain(entry.aliases.iter());
            for alias in names {
                let alias = alias.trim().to_ascii_lowercase();
                if !alias.is_empty() && seen.insert(alias.clone()) {
                    aliases.push((alias, idx));
                }
            }
        }
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            entries,
            by_key,
            aliases,
        }
    }

    /// Built-in coverage: a few A-shares, US large caps, gold and CNY crosses.
    pub fn builtin() -> Self {
        use InstrumentClass::*;
        Self::new(vec![
            InstrumentEntry::new("SH601899", Equity, "紫金矿业", &["Zijin Mining"], "CNY"),
            InstrumentEntry::new("SH600519", Equity, "贵州茅台", &["茅台", "Kweichow Moutai"], "CNY"),
            InstrumentEntry::new("SH601318", Equity, "中国平安", &["Ping An Insurance"], "CNY"),
            InstrumentEntry::new("SZ300750", Equity, "宁德时代", &["CATL"], "CNY"),
            InstrumentEntry::new("SZ000001", Equity, "平安银行", &["Ping An Bank"], "CNY"),
            InstrumentEntry::new("AAPL", Equity, "Apple", &["苹果公司", "苹果"], "USD"),
            InstrumentEntry::new("TSLA", Equity, "Tesla", &["特斯拉"], "USD"),
            InstrumentEntry::new("NVDA", Equity, "Nvidia", &["英伟达"], "USD"),
            InstrumentEntry::new("MSFT", Equity, "Microsoft", &["微软"], "USD"),
            InstrumentEntry::new("XAU", Commodity, "黄金", &["金价", "现货黄金", "COMEX黄金", "gold"], "USD"),
            InstrumentEntry::new("USD/CNY", Fx, "美元兑人民币", &["USDCNY", "美元汇率", "人民币汇率"], "CNY"),
            InstrumentEntry::new("EUR/CNY", Fx, "欧元兑人民币", &["EURCNY", "欧元汇率"], "CNY"),
            InstrumentEntry::new("JPY/CNY", Fx, "日元兑人民币", &["JPYCNY", "日元汇率"], "CNY"),
        ])
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<InstrumentEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn entries(&self) -> &[InstrumentEntry] {
        &self.entries
    }

    pub fn entry(&self, key: &str) -> Option<&InstrumentEntry> {
        self.by_key
            .get(&normalize_key(key))
            .map(|idx| &self.entries[*idx])
    }

    /// All non-overlapping subject mentions in `text`, in text order.
    /// Longer aliases win over shorter ones at the same position.
    pub fn find_mentions(&self, text: &str) -> Vec<Mention> {
        let lowered = text.to_ascii_lowercase();
        let mut mentions: Vec<Mention> = Vec::new();

        for (alias, idx) in &self.aliases {
            for (start, matched) in lowered.match_indices(alias.as_str()) {
                let end = start + matched.len();
                if !has_ascii_boundary(text, start, end) || overlaps(&mentions, start, end) {
                    continue;
                }
                let entry = &self.entries[*idx];
                mentions.push(Mention {
                    start,
                    end,
                    key: entry.key.clone(),
                    class: entry.class,
                    text: text[start..end].to_string(),
                });
            }
        }

        for caps in CODE_RE.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if !has_ascii_boundary(text, whole.start(), whole.end())
                || overlaps(&mentions, whole.start(), whole.end())
            {
                continue;
            }
            let code = &caps[2];
            let exchange = caps
                .get(1)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_ascii_uppercase());
            // "成交额300000元" is an amount, "紫金矿业(601899)" is a code
            if exchange.is_none() && !is_bracketed(text, whole.start(), whole.end()) {
                continue;
            }
            let Some(key) = a_share_key(code, exchange.as_deref()) else {
                continue;
            };
            let class = self
                .entry(&key)
                .map(|e| e.class)
                .unwrap_or(InstrumentClass::Equity);
            mentions.push(Mention {
                start: whole.start(),
                end: whole.end(),
                key,
                class,
                text: whole.as_str().to_string(),
            });
        }

        mentions.sort_by_key(|m| m.start);
        mentions
    }

    /// Distinct instruments mentioned in `text`, first occurrence first.
    pub fn recognize(&self, text: &str) -> Vec<InstrumentRef> {
        let mut seen = HashSet::new();
        self.find_mentions(text)
            .into_iter()
            .filter(|m| seen.insert(m.key.clone()))
            .map(|m| InstrumentRef {
                key: m.key,
                class: m.class,
            })
            .collect()
    }
}

impl Default for InstrumentDictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Normalized A-share key for a six-digit code. Bare codes must fall in a
/// known Shanghai or Shenzhen range.
fn a_share_key(code: &str, exchange: Option<&str>) -> Option<String> {
    let market = match exchange {
        Some("SH") | Some("SS") => "SH",
        Some("SZ") => "SZ",
        Some(_) => return None,
        None => {
            if ["600", "601", "603", "688"].iter().any(|p| code.starts_with(p)) {
                "SH"
            } else if ["000", "001", "002", "003", "300"].iter().any(|p| code.starts_with(p)) {
                "SZ"
            } else {
                return None;
            }
        }
    };
    Some(format!("{}{}", market, code))
}

/// ASCII words must not continue past the match ("gold" inside "goldman").
/// CJK text has no word separators, so only ASCII neighbours are checked.
fn has_ascii_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let first = text[start..end].chars().next();
    let last = text[start..end].chars().next_back();

    let joins = |edge: Option<char>, neighbour: Option<char>| match (edge, neighbour) {
        (Some(e), Some(n)) => e.is_ascii_alphanumeric() && (n.is_ascii_alphanumeric() || n == '_'),
        _ => false,
    };

    !joins(first, before) && !joins(last, after)
}

fn is_bracketed(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    matches!(before, Some('(') | Some('（') | Some('[') | Some('【'))
        && matches!(after, Some(')') | Some('）') | Some(']') | Some('】'))
}

fn overlaps(mentions: &[Mention], start: usize, end: usize) -> bool {
    mentions.iter().any(|m| start < m.end && m.start < end)
}
