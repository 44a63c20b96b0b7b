//! Pattern-based claim extraction
//!
//! A claim is a recognized subject followed, within the same clause, by a
//! price level, a percentage change or a direction word. Numbers only count
//! when a cue ties them to a price or a move; anything else is ignored.

use super::ClaimExtractor;
use crate::market::{InstrumentDictionary, Mention};
use crate::models::{Claim, ClaimUnit, Direction, SourceSpan};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const WINDOW_CHARS: usize = 60;

const UP_WORDS: &str = r"上涨|涨幅|上升|攀升|走高|大涨|拉升|反弹|回升|涨|\b(?:rose|rise|rises|gained|gains|climbed|up|higher|rallied|rebounded|jumped)\b";

const DOWN_WORDS: &str = r"下跌|跌幅|下挫|下滑|回落|走低|下降|大跌|跌|\b(?:fell|falls|dropped|declined|lost|down|lower|slid|slipped)\b";

const NEUTRAL_WORDS: &str = r"涨跌幅|涨跌|升降幅|升跌幅";

lazy_static! {
    static ref NUMBER_RE: Regex = Regex::new(r"([+-])?(\d+(?:,\d{3})*(?:\.\d+)?)").unwrap();

    static ref PERCENT_AFTER_RE: Regex = Regex::new(r"^\s*[%％]").unwrap();

    /// Cue immediately before a price level.
    static ref PRICE_CUE_RE: Regex = Regex::new(
        r"(?i)(?:现价|股价|报价|收于|收报|收盘价|收盘|报|价格|价|至|到|突破|跌破|站上|为|\bat|\bto|[¥￥$])\s*$"
    )
    .unwrap();

    static ref CURRENCY_AFTER_RE: Regex =
        Regex::new(r"^\s*(?:元|美元|港元|美金|块|(?i:usd|cny|rmb|dollars?)\b)").unwrap();

    /// Quantities that are never price levels.
    static ref MAGNITUDE_AFTER_RE: Regex =
        Regex::new(r"(?i)^\s*(?:亿|万|千|百|手|股|倍|年|月|日|号|家|只|个|bp\b|基点|[:：])").unwrap();

    static ref UP_RE: Regex = Regex::new(&format!("(?i){}", UP_WORDS)).unwrap();

    static ref DOWN_RE: Regex = Regex::new(&format!("(?i){}", DOWN_WORDS)).unwrap();

    /// Nearest move word before a figure. "涨跌幅" names the change
    /// without a direction and must be tried before its parts.
    static ref MOVE_CUE_RE: Regex = Regex::new(&format!(
        "(?i)(?P<neutral>{})|(?P<down>{})|(?P<up>{})",
        NEUTRAL_WORDS, DOWN_WORDS, UP_WORDS
    ))
    .unwrap();

    static ref FLAT_RE: Regex = Regex::new(r"(?i)持平|平盘|横盘|\b(?:flat|unchanged)\b").unwrap();

    static ref CHANGE_CUE_RE: Regex = Regex::new(r"(?i)幅|变动|\bchange[sd]?\b").unwrap();

    static ref FORWARD_RE: Regex = Regex::new(
        r"(?i)目标|预计|预期|有望|或将|展望|\b(?:target|expected|expects?|forecasts?|projected|outlook)\b"
    )
    .unwrap();

    /// One figure shared out over several subjects cannot be attributed.
    static ref AMBIGUOUS_RE: Regex = Regex::new(r"(?i)分别|各自|\brespectively\b").unwrap();
}

pub struct PatternExtractor {
    dictionary: Arc<InstrumentDictionary>,
}

impl PatternExtractor {
    pub fn new(dictionary: Arc<InstrumentDictionary>) -> Self {
        Self { dictionary }
    }

    fn window_end(&self, text: &str, mention: &Mention, next_start: Option<usize>) -> usize {
        let limit = next_start.unwrap_or(text.len());
        let mut chars = text[mention.end..].char_indices().peekable();
        let mut taken = 0;

        while let Some((offset, c)) = chars.next() {
            let pos = mention.end + offset;
            if pos >= limit || taken >= WINDOW_CHARS {
                return pos.min(limit);
            }
            let next = chars.peek().map(|(_, n)| *n);
            if is_terminator(c, next) {
                return pos;
            }
            taken += 1;
        }

        limit
    }

    fn claim_for(&self, text: &str, mention: &Mention, clause_start: usize, end: usize) -> Option<Claim> {
        let window = &text[mention.end..end];

        if FORWARD_RE.is_match(&text[clause_start..end]) {
            debug!(subject = %mention.text, "Skipping forward-looking statement");
            return None;
        }
        if AMBIGUOUS_RE.is_match(window) {
            return None;
        }

        let parts = scan_quantities(window);
        let word_direction = direction_of(window);

        let (unit, asserted_value, companion_percent) = match (parts.price, parts.percent) {
            (Some(price), percent) => (ClaimUnit::Price, Some(price), percent),
            (None, Some(percent)) => (ClaimUnit::Percent, Some(percent), None),
            (None, None) if word_direction != Direction::None => (ClaimUnit::None, None, None),
            (None, None) => return None,
        };

        // a signed figure outranks any earlier move word in the clause
        let direction = match parts.percent {
            Some(p) if p > 0.0 => Direction::Up,
            Some(p) if p < 0.0 => Direction::Down,
            _ => word_direction,
        };

        let span_text = text[mention.start..end].trim_end();
        Some(Claim {
            id: Uuid::new_v4(),
            subject_text: mention.text.clone(),
            subject_key_guess: mention.key.clone(),
            asserted_value,
            unit,
            direction,
            companion_percent,
            span: SourceSpan {
                start: mention.start,
                end: mention.start + span_text.len(),
                text: span_text.to_string(),
            },
        })
    }
}

impl ClaimExtractor for PatternExtractor {
    fn name(&self) -> &str {
        "pattern"
    }

    fn extract(&self, report_text: &str) -> Vec<Claim> {
        let mentions = self.dictionary.find_mentions(report_text);
        let mut claims = Vec::new();

        for (i, mention) in mentions.iter().enumerate() {
            let next_start = mentions.get(i + 1).map(|m| m.start);
            let end = self.window_end(report_text, mention, next_start);

            let previous_end = if i > 0 { mentions[i - 1].end } else { 0 };
            let clause_start = clause_start(report_text, mention.start).max(previous_end);

            if let Some(claim) = self.claim_for(report_text, mention, clause_start, end) {
                claims.push(claim);
            }
        }

        debug!(mentions = mentions.len(), claims = claims.len(), "Claims extracted");
        claims
    }
}

#[derive(Debug, Default)]
struct Quantities {
    price: Option<f64>,
    percent: Option<f64>,
}

/// First cued price and first cued percentage in the window.
fn scan_quantities(window: &str) -> Quantities {
    let mut found = Quantities::default();
    let mut segment_start = 0;

    for caps in NUMBER_RE.captures_iter(window) {
        let Some(whole) = caps.get(0) else { continue };
        let before = &window[segment_start..whole.start()];
        let after = &window[whole.end()..];
        segment_start = whole.end();

        let Ok(magnitude) = caps[2].replace(',', "").parse::<f64>() else {
            continue;
        };
        let sign = caps.get(1).map(|m| m.as_str());

        if PERCENT_AFTER_RE.is_match(after) {
            if found.percent.is_some() {
                continue;
            }
            let cued = sign.is_some()
                || UP_RE.is_match(before)
                || DOWN_RE.is_match(before)
                || CHANGE_CUE_RE.is_match(before);
            if !cued {
                continue;
            }
            let negative = match sign {
                Some("-") => true,
                Some(_) => false,
                None => nearest_move(before) == Direction::Down,
            };
            found.percent = Some(if negative { -magnitude } else { magnitude });
        } else if found.price.is_none() && sign.is_none() {
            if MAGNITUDE_AFTER_RE.is_match(after) {
                continue;
            }
            if PRICE_CUE_RE.is_match(before) || CURRENCY_AFTER_RE.is_match(after) {
                found.price = Some(magnitude);
            }
        }
    }

    found
}

/// Direction of the last move word in `before`; `None` when that word is
/// neutral or there is none.
fn nearest_move(before: &str) -> Direction {
    match MOVE_CUE_RE.captures_iter(before).last() {
        Some(caps) if caps.name("down").is_some() => Direction::Down,
        Some(caps) if caps.name("up").is_some() => Direction::Up,
        _ => Direction::None,
    }
}

/// Direction of the earliest direction word in the window. Neutral change
/// terms are skipped.
fn direction_of(window: &str) -> Direction {
    let moved = MOVE_CUE_RE.captures_iter(window).find_map(|caps| {
        let start = caps.get(0)?.start();
        if caps.name("down").is_some() {
            Some((start, Direction::Down))
        } else if caps.name("up").is_some() {
            Some((start, Direction::Up))
        } else {
            None
        }
    });
    let flat = FLAT_RE.find(window).map(|m| (m.start(), Direction::Flat));

    [moved, flat]
        .into_iter()
        .flatten()
        .min_by_key(|(start, _)| *start)
        .map(|(_, d)| d)
        .unwrap_or(Direction::None)
}

fn is_terminator(c: char, next: Option<char>) -> bool {
    match c {
        '。' | '；' | ';' | '！' | '!' | '？' | '?' | '\n' => true,
        '.' => next.map_or(true, char::is_whitespace),
        _ => false,
    }
}

/// Byte offset just past the last terminator before `pos`.
fn clause_start(text: &str, pos: usize) -> usize {
    let head = &text[..pos];
    let mut iter = head.char_indices().peekable();
    let mut start = 0;
    while let Some((offset, c)) = iter.next() {
        let next = iter.peek().map(|(_, n)| *n).or_else(|| text[pos..].chars().next());
        if is_terminator(c, next) {
            start = offset + c.len_utf8();
        }
    }
    start
}
